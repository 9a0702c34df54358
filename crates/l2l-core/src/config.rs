// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{OptimizerForOptType, Regime};
use crate::error::{MetaError, Result};

/// Construction parameters of a meta-optimizer and its graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaOptimizerConfig {
    pub num_exercises: usize,
    pub num_lstm_nodes: usize,
    pub num_optimizer_unrollings: usize,
    /// Steps between permutation regenerations; `None` keeps them fixed.
    pub perm_period: Option<usize>,
    /// Steps between optimizer-state and pupil-snapshot resets.
    pub reset_period: usize,
    /// Number of shards the exercises are spread over.
    pub num_gpus: usize,
    pub regime: Regime,
    pub optimizer_for_opt_type: OptimizerForOptType,
    pub permute: bool,
    pub clip_norm: Option<f32>,
    pub optimizer_init_parameter: f32,
    pub seed: Option<u64>,
}

impl Default for MetaOptimizerConfig {
    fn default() -> Self {
        Self {
            num_exercises: 10,
            num_lstm_nodes: 256,
            num_optimizer_unrollings: 10,
            perm_period: None,
            reset_period: 1,
            num_gpus: 1,
            regime: Regime::Train,
            optimizer_for_opt_type: OptimizerForOptType::Adam,
            permute: false,
            clip_norm: None,
            optimizer_init_parameter: 0.1,
            seed: None,
        }
    }
}

impl MetaOptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("num_exercises", self.num_exercises),
            ("num_lstm_nodes", self.num_lstm_nodes),
            ("num_optimizer_unrollings", self.num_optimizer_unrollings),
            ("reset_period", self.reset_period),
            ("num_gpus", self.num_gpus),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(MetaError::config(format!("{name} must be positive")));
        }
        if self.num_exercises < self.num_gpus {
            return Err(MetaError::config(format!(
                "num_exercises ({}) must be at least num_gpus ({})",
                self.num_exercises, self.num_gpus
            )));
        }
        if self.perm_period == Some(0) {
            return Err(MetaError::config("perm_period must be positive when set"));
        }
        if !(self.optimizer_init_parameter.is_finite() && self.optimizer_init_parameter > 0.0) {
            return Err(MetaError::config(format!(
                "optimizer_init_parameter must be positive, got {}",
                self.optimizer_init_parameter
            )));
        }
        if let Some(clip) = self.clip_norm {
            if !(clip.is_finite() && clip > 0.0) {
                return Err(MetaError::config(format!(
                    "clip_norm must be positive, got {clip}"
                )));
            }
        }
        Ok(())
    }

    /// Parses and validates a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            MetaError::config(format!("cannot open {}: {err}", path.display()))
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Exercises driven by graphs of the configured regime.
    pub fn active_exercises(&self) -> usize {
        match self.regime {
            Regime::Train => self.num_exercises,
            Regime::Inference => 1,
        }
    }

    /// Shards used by graphs of the configured regime.
    pub fn active_shards(&self) -> usize {
        match self.regime {
            Regime::Train => self.num_gpus,
            Regime::Inference => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MetaOptimizerConfig::default();
        assert_eq!(config.num_exercises, 10);
        assert_eq!(config.num_lstm_nodes, 256);
        assert_eq!(config.regime, Regime::Train);
        assert_eq!(config.optimizer_for_opt_type, OptimizerForOptType::Adam);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = MetaOptimizerConfig::from_json_str(
            r#"{"num_exercises": 17, "num_gpus": 4, "regime": "inference", "optimizer_for_opt_type": "sgd"}"#,
        )
        .unwrap();
        assert_eq!(config.num_exercises, 17);
        assert_eq!(config.regime, Regime::Inference);
        assert_eq!(config.optimizer_for_opt_type, OptimizerForOptType::Sgd);
        assert_eq!(config.reset_period, 1);
        assert_eq!(config.active_shards(), 1);
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let too_many_shards = MetaOptimizerConfig {
            num_exercises: 2,
            num_gpus: 3,
            ..MetaOptimizerConfig::default()
        };
        assert!(matches!(
            too_many_shards.validate(),
            Err(MetaError::Configuration(_))
        ));
        let zero_period = MetaOptimizerConfig {
            perm_period: Some(0),
            ..MetaOptimizerConfig::default()
        };
        assert!(zero_period.validate().is_err());
        assert!(MetaOptimizerConfig::from_json_str(r#"{"regime": "eval"}"#).is_err());
        assert!(MetaOptimizerConfig::from_json_str(r#"{"clip_norm": -1.0}"#).is_err());
    }
}

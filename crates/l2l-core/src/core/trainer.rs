// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Update rule for the meta-optimizer's own trainables.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MetaError, Result};

/// Gradients of named meta-optimizer trainables.
pub type MetaGradients = BTreeMap<String, ArrayD<f32>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerForOptType {
    Adam,
    Sgd,
}

impl fmt::Display for OptimizerForOptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerForOptType::Adam => f.write_str("adam"),
            OptimizerForOptType::Sgd => f.write_str("sgd"),
        }
    }
}

impl FromStr for OptimizerForOptType {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerForOptType::Adam),
            "sgd" => Ok(OptimizerForOptType::Sgd),
            other => Err(MetaError::config(format!(
                "unknown optimizer_for_opt_type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct Moments {
    m: ArrayD<f32>,
    v: ArrayD<f32>,
}

/// Adam or plain SGD over a named parameter map, with optional global-norm clipping.
#[derive(Debug, Clone)]
pub struct MetaTrainer {
    kind: OptimizerForOptType,
    clip_norm: Option<f32>,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    moments: HashMap<String, Moments>,
    t: u32,
}

impl MetaTrainer {
    pub fn new(kind: OptimizerForOptType, clip_norm: Option<f32>) -> Result<Self> {
        if let Some(norm) = clip_norm {
            if !(norm.is_finite() && norm > 0.0) {
                return Err(MetaError::config(format!(
                    "clip_norm must be positive and finite, got {norm}"
                )));
            }
        }
        Ok(Self {
            kind,
            clip_norm,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            moments: HashMap::new(),
            t: 0,
        })
    }

    pub fn kind(&self) -> OptimizerForOptType {
        self.kind
    }

    pub fn steps(&self) -> u32 {
        self.t
    }

    /// Updates `params` in place and returns the pre-clipping global gradient norm.
    ///
    /// Every gradient must name an existing parameter of the same shape.
    pub fn step(
        &mut self,
        params: &mut BTreeMap<String, ArrayD<f32>>,
        gradients: &MetaGradients,
        learning_rate: f32,
    ) -> Result<f32> {
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            return Err(MetaError::argument(format!(
                "meta learning rate must be positive and finite, got {learning_rate}"
            )));
        }
        for (name, grad) in gradients {
            let param = params
                .get(name)
                .ok_or_else(|| MetaError::argument(format!("unknown trainable '{name}'")))?;
            if param.shape() != grad.shape() {
                return Err(MetaError::shape("meta gradient", param.shape(), grad.shape()));
            }
        }

        let norm = gradients
            .values()
            .flat_map(|g| g.iter())
            .map(|&g| g * g)
            .sum::<f32>()
            .sqrt();
        let scale = match self.clip_norm {
            Some(clip) if norm > clip => clip / norm,
            _ => 1.0,
        };

        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t as i32);
        let bias2 = 1.0 - self.beta2.powi(self.t as i32);
        for (name, grad) in gradients {
            let Some(param) = params.get_mut(name) else {
                continue;
            };
            match self.kind {
                OptimizerForOptType::Sgd => {
                    Zip::from(param)
                        .and(grad)
                        .for_each(|p, &g| *p -= learning_rate * g * scale);
                }
                OptimizerForOptType::Adam => {
                    let (beta1, beta2, eps) = (self.beta1, self.beta2, self.epsilon);
                    let moments = self.moments.entry(name.clone()).or_insert_with(|| Moments {
                        m: ArrayD::zeros(grad.raw_dim()),
                        v: ArrayD::zeros(grad.raw_dim()),
                    });
                    Zip::from(param)
                        .and(&mut moments.m)
                        .and(&mut moments.v)
                        .and(grad)
                        .for_each(|p, m, v, &g| {
                            let g = g * scale;
                            *m = beta1 * *m + (1.0 - beta1) * g;
                            *v = beta2 * *v + (1.0 - beta2) * g * g;
                            let m_hat = *m / bias1;
                            let v_hat = *v / bias2;
                            *p -= learning_rate * m_hat / (v_hat.sqrt() + eps);
                        });
                }
            }
        }
        debug!(kind = %self.kind, step = self.t, norm, scale, "meta-optimizer update");
        Ok(norm)
    }

    pub fn reset(&mut self) {
        self.moments.clear();
        self.t = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn params() -> BTreeMap<String, ArrayD<f32>> {
        [("w".to_string(), ArrayD::from_elem(IxDyn(&[2]), 1.0))]
            .into_iter()
            .collect()
    }

    #[test]
    fn sgd_clips_by_global_norm() {
        let mut trainer = MetaTrainer::new(OptimizerForOptType::Sgd, Some(1.0)).unwrap();
        let mut p = params();
        let grads: MetaGradients = [(
            "w".to_string(),
            ArrayD::from_shape_vec(IxDyn(&[2]), vec![3.0, 4.0]).unwrap(),
        )]
        .into_iter()
        .collect();
        let norm = trainer.step(&mut p, &grads, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        let w = &p["w"];
        assert!((w[[0]] - 0.4).abs() < 1e-6);
        assert!((w[[1]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() {
        let mut trainer = MetaTrainer::new(OptimizerForOptType::Adam, None).unwrap();
        let mut p = params();
        let grads: MetaGradients = [("w".to_string(), ArrayD::from_elem(IxDyn(&[2]), 0.5))]
            .into_iter()
            .collect();
        trainer.step(&mut p, &grads, 0.01).unwrap();
        assert!(p["w"].iter().all(|&w| (w - 0.99).abs() < 1e-4));
        trainer.reset();
        assert_eq!(trainer.steps(), 0);
    }

    #[test]
    fn unknown_or_misshaped_gradients_are_rejected() {
        let mut trainer = MetaTrainer::new(OptimizerForOptType::Sgd, None).unwrap();
        let mut p = params();
        let missing: MetaGradients = [("b".to_string(), ArrayD::zeros(IxDyn(&[2])))]
            .into_iter()
            .collect();
        assert!(trainer.step(&mut p, &missing, 0.1).is_err());
        let wrong: MetaGradients = [("w".to_string(), ArrayD::zeros(IxDyn(&[3])))]
            .into_iter()
            .collect();
        assert!(matches!(
            trainer.step(&mut p, &wrong, 0.1),
            Err(MetaError::ShapeMismatch { .. })
        ));
        assert!(MetaTrainer::new(OptimizerForOptType::Adam, Some(0.0)).is_err());
    }

    #[test]
    fn optimizer_type_parses() {
        assert_eq!("ADAM".parse::<OptimizerForOptType>().unwrap(), OptimizerForOptType::Adam);
        assert!("rmsprop".parse::<OptimizerForOptType>().is_err());
    }
}

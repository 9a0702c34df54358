// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Meta-optimizer cores and their lifecycle.

pub mod empty;
pub mod resnet;
pub mod trainer;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};
use crate::shard::ShardId;
use crate::signal::{OptimizerIns, OptimizerOuts};
use crate::state::OptimizerStateStore;

pub use empty::EmptyOptimizer;
pub use resnet::ResNet4Lstm;
pub use trainer::{MetaGradients, MetaTrainer, OptimizerForOptType};

/// Whether a core is built to be trained or only to drive a pupil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Train,
    Inference,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Train => "train",
            Regime::Inference => "inference",
        }
    }

    /// State-store scope used by graphs of this regime.
    pub fn scope(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Regime {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Regime::Train),
            "inference" => Ok(Regime::Inference),
            other => Err(MetaError::config(format!("unknown regime '{other}'"))),
        }
    }
}

/// Construction phase of a core.
///
/// `Uninitialized → StatesCreated → (TrainGraphBuilt | InferenceGraphBuilt) → Ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorePhase {
    Uninitialized,
    StatesCreated,
    TrainGraphBuilt,
    InferenceGraphBuilt,
    Ready,
}

impl CorePhase {
    /// Validates `self → next` for a core of `regime`.
    pub fn advance(self, next: CorePhase, regime: Regime) -> Result<CorePhase> {
        use CorePhase::*;
        let allowed = match (self, next) {
            (Uninitialized, StatesCreated) | (StatesCreated, StatesCreated) => true,
            (StatesCreated, TrainGraphBuilt) => regime == Regime::Train,
            (StatesCreated, InferenceGraphBuilt) => regime == Regime::Inference,
            (TrainGraphBuilt, Ready) | (InferenceGraphBuilt, Ready) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(MetaError::config(format!(
                "cannot move a {regime} core from {self:?} to {next:?}"
            )))
        }
    }

    /// Phase reached once the graph for `regime` has been assembled.
    pub fn graph_built(regime: Regime) -> CorePhase {
        match regime {
            Regime::Train => CorePhase::TrainGraphBuilt,
            Regime::Inference => CorePhase::InferenceGraphBuilt,
        }
    }
}

/// A meta-optimizer core: owns its recurrent state and turns optimizer inputs
/// into per-layer update signals.
pub trait MetaOptimizer {
    /// Variant name used in errors and traces.
    fn name(&self) -> &'static str;

    fn regime(&self) -> Regime;

    fn phase(&self) -> CorePhase;

    fn states(&self) -> &OptimizerStateStore;

    /// Width of the recurrent state rows.
    fn hidden_size(&self) -> usize;

    /// Moves the lifecycle to `next`.
    fn advance(&mut self, next: CorePhase) -> Result<()>;

    /// Creates the recurrent state of `(scope, shard)` for `exercises` exercises.
    fn create_states(&mut self, scope: &str, shard: ShardId, exercises: usize) -> Result<()>;

    /// Zeroes every state of `scope`.
    fn reset_states(&mut self, scope: &str) -> Result<()>;

    /// One core step on the exercises of `shard`.
    fn optimizer_core(
        &mut self,
        ins: OptimizerIns,
        scope: &str,
        shard: ShardId,
        learning_rate: f32,
    ) -> Result<OptimizerOuts>;

    fn permutes(&self) -> bool {
        false
    }

    fn create_permutations(&mut self, _shard: ShardId, _exercises: usize) -> Result<()> {
        Ok(())
    }

    fn reset_permutations(&mut self) -> Result<()> {
        Ok(())
    }

    fn permutation_reset_due(&self, _step: usize) -> bool {
        false
    }

    /// Applies externally computed gradients of the core's trainables.
    fn apply_meta_gradients(
        &mut self,
        _gradients: &MetaGradients,
        _learning_rate: f32,
    ) -> Result<()> {
        Err(MetaError::NotImplemented {
            variant: self.name(),
            regime: Regime::Train,
        })
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use tracing::trace;

use super::{CorePhase, MetaOptimizer, Regime};
use crate::error::{MetaError, Result};
use crate::shard::ShardId;
use crate::signal::{LayerUpdate, OptimizerIns, OptimizerOuts};
use crate::state::OptimizerStateStore;

/// Baseline core: plain SGD on the pupil, `delta = learning_rate * sigma`.
///
/// Has no trainables and no recurrent state, so only the inference regime exists.
#[derive(Debug)]
pub struct EmptyOptimizer {
    phase: CorePhase,
    states: OptimizerStateStore,
}

impl EmptyOptimizer {
    pub const NAME: &'static str = "empty";

    pub fn new(regime: Regime) -> Result<Self> {
        if regime != Regime::Inference {
            return Err(MetaError::NotImplemented {
                variant: Self::NAME,
                regime,
            });
        }
        Ok(Self {
            phase: CorePhase::Uninitialized,
            states: OptimizerStateStore::new(),
        })
    }
}

impl MetaOptimizer for EmptyOptimizer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn regime(&self) -> Regime {
        Regime::Inference
    }

    fn phase(&self) -> CorePhase {
        self.phase
    }

    fn states(&self) -> &OptimizerStateStore {
        &self.states
    }

    fn hidden_size(&self) -> usize {
        0
    }

    fn advance(&mut self, next: CorePhase) -> Result<()> {
        self.phase = self.phase.advance(next, Regime::Inference)?;
        Ok(())
    }

    fn create_states(&mut self, scope: &str, shard: ShardId, exercises: usize) -> Result<()> {
        self.advance(CorePhase::StatesCreated)?;
        self.states.create(scope, shard, exercises, 0);
        Ok(())
    }

    fn reset_states(&mut self, scope: &str) -> Result<()> {
        self.states.reset_scope(scope)
    }

    fn optimizer_core(
        &mut self,
        ins: OptimizerIns,
        scope: &str,
        shard: ShardId,
        learning_rate: f32,
    ) -> Result<OptimizerOuts> {
        self.states.get(scope, shard)?;
        trace!(shard, scope, learning_rate, layers = ins.len(), "empty core step");
        let mut ins = ins;
        ins.scale_sigma(learning_rate);
        Ok(ins
            .into_layers()
            .map(|(key, layer)| {
                (
                    key,
                    LayerUpdate {
                        o: layer.o,
                        delta: layer.sigma,
                    },
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{LayerIns, Signal};
    use crate::topology::LayerKey;
    use ndarray::Array3;

    #[test]
    fn training_regime_is_not_implemented() {
        let err = EmptyOptimizer::new(Regime::Train).unwrap_err();
        assert_eq!(
            err,
            MetaError::NotImplemented {
                variant: "empty",
                regime: Regime::Train
            }
        );
    }

    #[test]
    fn deltas_are_sigma_scaled_by_learning_rate() {
        let mut core = EmptyOptimizer::new(Regime::Inference).unwrap();
        core.create_states("inference", 0, 1).unwrap();
        let sigma = Array3::from_shape_vec((1, 1, 2), vec![2.0f32, -1.0]).unwrap();
        let ins: OptimizerIns = [(
            LayerKey::Output(0),
            LayerIns::new(Signal::Single(Array3::ones((1, 1, 3))), Signal::Single(sigma)),
        )]
        .into_iter()
        .collect();
        let outs = core.optimizer_core(ins, "inference", 0, 0.1).unwrap();
        let delta = &outs[&LayerKey::Output(0)].delta.parts()[0];
        assert!((delta[[0, 0, 0]] - 0.2).abs() < 1e-6);
        assert!((delta[[0, 0, 1]] + 0.1).abs() < 1e-6);

        let state = core.states().get("inference", 0).unwrap();
        assert_eq!(state.h.dim(), (1, 0));
        assert!(state.is_zero());
    }

    #[test]
    fn core_step_needs_state_for_the_shard() {
        let mut core = EmptyOptimizer::new(Regime::Inference).unwrap();
        let ins: OptimizerIns = [(
            LayerKey::Output(0),
            LayerIns::new(
                Signal::Single(Array3::ones((1, 1, 3))),
                Signal::Single(Array3::ones((1, 1, 2))),
            ),
        )]
        .into_iter()
        .collect();
        let err = core
            .optimizer_core(ins.clone(), "inference", 7, 0.1)
            .unwrap_err();
        assert!(matches!(err, MetaError::StateNotFound { shard: 7, .. }));

        core.create_states("inference", 7, 1).unwrap();
        assert!(core.optimizer_core(ins, "inference", 7, 0.1).is_ok());
    }
}

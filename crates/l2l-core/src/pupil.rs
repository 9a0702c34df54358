// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Contracts for the network being optimized and per-exercise parameter snapshots.

use std::collections::BTreeMap;

use ndarray::{Array2, Axis};
use tracing::debug;

use crate::error::{MetaError, Result};
use crate::signal::{LayerSignals, OptimizerOuts};
use crate::topology::{LayerKey, NetSize};

/// One trainable weight matrix of the pupil, `[in, out]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PupilVariable {
    pub layer: LayerKey,
    pub value: Array2<f32>,
}

/// Mini-batch fed to a pupil: `inputs` is `[batch, features]`, `labels` is
/// one-hot `[batch, vocabulary]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Array2<f32>,
    pub labels: Array2<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.inputs.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of running a pupil on one batch with one set of variables.
#[derive(Debug, Clone, PartialEq)]
pub struct PupilEvaluation {
    /// Probabilities, `[batch, vocabulary]`.
    pub predictions: Array2<f32>,
    /// Single-exercise optimizer inputs per layer.
    pub layers: BTreeMap<LayerKey, LayerSignals>,
}

/// The network trained by the meta-optimizer.
pub trait Pupil {
    fn net_size(&self) -> NetSize;

    /// Initial values of every trainable variable, in a stable order.
    fn trainable_variables(&self) -> Vec<PupilVariable>;

    /// Forward pass plus the per-layer signals the optimizer consumes.
    fn evaluate(&self, variables: &[PupilVariable], batch: &Batch) -> Result<PupilEvaluation>;
}

/// Finite, restartable source of batches.
pub trait BatchGenerator {
    fn next_batch(&mut self) -> Option<Batch>;

    fn restart(&mut self);
}

/// Per-exercise copies of the pupil variables.
#[derive(Debug, Clone, Default)]
pub struct PupilStorage {
    snapshots: Vec<Vec<PupilVariable>>,
}

impl PupilStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reloads `exercises` snapshots from the pupil's initial variables.
    pub fn reset_from(&mut self, pupil: &dyn Pupil, exercises: usize) {
        let initial = pupil.trainable_variables();
        self.snapshots = vec![initial; exercises];
        debug!(exercises, "pupil storage reset");
    }

    pub fn exercises(&self) -> usize {
        self.snapshots.len()
    }

    pub fn variables(&self, exercise: usize) -> Result<&[PupilVariable]> {
        self.snapshots
            .get(exercise)
            .map(Vec::as_slice)
            .ok_or_else(|| self.out_of_range(exercise))
    }

    pub fn save(&self, exercise: usize) -> Result<Vec<PupilVariable>> {
        self.variables(exercise).map(<[PupilVariable]>::to_vec)
    }

    /// Replaces the snapshot of `exercise`; layers and shapes must match the stored ones.
    pub fn restore(&mut self, exercise: usize, variables: Vec<PupilVariable>) -> Result<()> {
        let current = self.variables(exercise)?;
        if current.len() != variables.len() {
            return Err(MetaError::shape(
                "pupil restore",
                &[current.len()],
                &[variables.len()],
            ));
        }
        for (old, new) in current.iter().zip(&variables) {
            if old.layer != new.layer {
                return Err(MetaError::argument(format!(
                    "restore expected {} but got {}",
                    old.layer, new.layer
                )));
            }
            if old.value.dim() != new.value.dim() {
                return Err(MetaError::shape(
                    "pupil restore",
                    old.value.shape(),
                    new.value.shape(),
                ));
            }
        }
        self.snapshots[exercise] = variables;
        Ok(())
    }

    /// Adds the weight deltas of `outs` to the snapshots of exercises
    /// `first_exercise..first_exercise + E`.
    ///
    /// Every delta is checked before any snapshot is written, so an error
    /// leaves the storage untouched.
    pub fn apply_deltas(&mut self, first_exercise: usize, outs: &OptimizerOuts) -> Result<()> {
        let mut pending = Vec::with_capacity(outs.len());
        for (&layer, update) in outs {
            let weights = update.weight_delta()?;
            let last = first_exercise + weights.len_of(Axis(0));
            if last > self.snapshots.len() {
                return Err(self.out_of_range(last - 1));
            }
            for (offset, delta) in weights.outer_iter().enumerate() {
                let snapshot = &self.snapshots[first_exercise + offset];
                let variable = snapshot
                    .iter()
                    .position(|v| v.layer == layer)
                    .ok_or_else(|| MetaError::Pupil(format!("pupil has no variable for {layer}")))?;
                let current = &snapshot[variable].value;
                if current.dim() != delta.dim() {
                    return Err(MetaError::shape(
                        "pupil apply_deltas",
                        current.shape(),
                        delta.shape(),
                    ));
                }
            }
            pending.push((layer, weights));
        }

        for (layer, weights) in pending {
            for (offset, delta) in weights.outer_iter().enumerate() {
                let snapshot = &mut self.snapshots[first_exercise + offset];
                if let Some(variable) = snapshot.iter_mut().find(|v| v.layer == layer) {
                    variable.value += &delta;
                }
            }
        }
        Ok(())
    }

    fn out_of_range(&self, exercise: usize) -> MetaError {
        MetaError::argument(format!(
            "exercise {exercise} out of range for {} stored snapshots",
            self.snapshots.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{LayerUpdate, Signal};
    use ndarray::array;

    struct Fixed;

    impl Pupil for Fixed {
        fn net_size(&self) -> NetSize {
            NetSize {
                num_nodes: vec![1],
                num_output_nodes: vec![],
                embedding_size: None,
            }
        }

        fn trainable_variables(&self) -> Vec<PupilVariable> {
            vec![
                PupilVariable {
                    layer: LayerKey::Output(0),
                    value: Array2::zeros((2, 1)),
                },
                PupilVariable {
                    layer: LayerKey::Output(1),
                    value: Array2::zeros((1, 1)),
                },
            ]
        }

        fn evaluate(&self, _: &[PupilVariable], _: &Batch) -> Result<PupilEvaluation> {
            Err(MetaError::Pupil("not used".into()))
        }
    }

    #[test]
    fn deltas_land_on_the_right_exercise() {
        let mut storage = PupilStorage::new();
        storage.reset_from(&Fixed, 3);
        let update = LayerUpdate {
            o: Signal::Single(array![[[1.0, 0.0]], [[0.0, 1.0]]]),
            delta: Signal::Single(array![[[0.5]], [[-0.5]]]),
        };
        let outs: OptimizerOuts = [(LayerKey::Output(0), update)].into_iter().collect();
        storage.apply_deltas(1, &outs).unwrap();

        assert_eq!(storage.variables(0).unwrap()[0].value, array![[0.0], [0.0]]);
        assert_eq!(storage.variables(1).unwrap()[0].value, array![[0.5], [0.0]]);
        assert_eq!(storage.variables(2).unwrap()[0].value, array![[0.0], [-0.5]]);
    }

    #[test]
    fn rejected_deltas_leave_every_snapshot_untouched() {
        let mut storage = PupilStorage::new();
        storage.reset_from(&Fixed, 2);
        let before = storage.save(0).unwrap();
        let good = LayerUpdate {
            o: Signal::Single(array![[[1.0, 0.0]], [[0.0, 1.0]]]),
            delta: Signal::Single(array![[[0.5]], [[-0.5]]]),
        };
        let misshaped = LayerUpdate {
            o: Signal::Single(array![[[1.0, 1.0, 1.0]], [[1.0, 1.0, 1.0]]]),
            delta: Signal::Single(array![[[1.0]], [[1.0]]]),
        };
        let outs: OptimizerOuts = [
            (LayerKey::Output(0), good),
            (LayerKey::Output(1), misshaped),
        ]
        .into_iter()
        .collect();
        assert!(matches!(
            storage.apply_deltas(0, &outs),
            Err(MetaError::ShapeMismatch { .. })
        ));
        assert_eq!(storage.save(0).unwrap(), before);
        assert_eq!(storage.save(1).unwrap(), before);
    }

    #[test]
    fn restore_checks_shapes_and_save_round_trips() {
        let mut storage = PupilStorage::new();
        storage.reset_from(&Fixed, 1);
        let mut saved = storage.save(0).unwrap();
        saved[0].value.fill(3.0);
        storage.restore(0, saved.clone()).unwrap();
        assert_eq!(storage.save(0).unwrap(), saved);

        let wrong = vec![PupilVariable {
            layer: LayerKey::Output(0),
            value: Array2::zeros((3, 1)),
        }];
        assert!(matches!(
            storage.restore(0, wrong),
            Err(MetaError::ShapeMismatch { .. })
        ));
        assert!(storage.save(4).is_err());
    }
}

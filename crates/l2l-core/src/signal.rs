// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Optimizer-input records: per-layer activations `o` and target signals `sigma`.

use std::collections::btree_map;
use std::collections::BTreeMap;

use ndarray::{Array, Array2, Array3, ArrayView2, Axis, Dimension, Ix2, Ix3};

use crate::error::{MetaError, Result};
use crate::topology::LayerKey;

/// A layer signal: one tensor, or a list of tensors handled element-wise.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal<D: Dimension> {
    Single(Array<f32, D>),
    List(Vec<Array<f32, D>>),
}

/// One exercise: `[batch, features]`.
pub type ExerciseSignal = Signal<Ix2>;
/// Exercise-batched: `[exercises, batch, features]`.
pub type BatchedSignal = Signal<Ix3>;

impl<D: Dimension> Signal<D> {
    pub fn parts(&self) -> &[Array<f32, D>] {
        match self {
            Signal::Single(tensor) => std::slice::from_ref(tensor),
            Signal::List(tensors) => tensors.as_slice(),
        }
    }

    pub fn parts_mut(&mut self) -> &mut [Array<f32, D>] {
        match self {
            Signal::Single(tensor) => std::slice::from_mut(tensor),
            Signal::List(tensors) => tensors.as_mut_slice(),
        }
    }

    /// Applies `f` to every tensor, keeping the single/list tag.
    pub fn try_map<E, F>(&self, mut f: F) -> Result<Signal<E>>
    where
        E: Dimension,
        F: FnMut(&Array<f32, D>) -> Result<Array<f32, E>>,
    {
        Ok(match self {
            Signal::Single(tensor) => Signal::Single(f(tensor)?),
            Signal::List(tensors) => {
                Signal::List(tensors.iter().map(f).collect::<Result<Vec<_>>>()?)
            }
        })
    }

    pub fn scale(&mut self, factor: f32) {
        for part in self.parts_mut() {
            part.mapv_inplace(|v| v * factor);
        }
    }
}

impl BatchedSignal {
    /// Stacks per-exercise signals along a new leading exercise axis.
    pub fn stack(signals: &[&ExerciseSignal]) -> Result<BatchedSignal> {
        let first = signals
            .first()
            .ok_or_else(|| MetaError::argument("cannot stack zero exercise signals"))?;
        match first {
            Signal::Single(_) => {
                let mut views = Vec::with_capacity(signals.len());
                for signal in signals {
                    match signal {
                        Signal::Single(tensor) => views.push(tensor.view()),
                        Signal::List(_) => {
                            return Err(MetaError::argument(
                                "exercise signals mix single and list layouts",
                            ))
                        }
                    }
                }
                Ok(Signal::Single(ndarray::stack(Axis(0), &views)?))
            }
            Signal::List(first_parts) => {
                let len = first_parts.len();
                let mut stacked = Vec::with_capacity(len);
                for idx in 0..len {
                    let mut views: Vec<ArrayView2<'_, f32>> = Vec::with_capacity(signals.len());
                    for signal in signals {
                        match signal {
                            Signal::List(parts) if parts.len() == len => {
                                views.push(parts[idx].view())
                            }
                            _ => {
                                return Err(MetaError::argument(
                                    "exercise signals disagree on their list layout",
                                ))
                            }
                        }
                    }
                    stacked.push(ndarray::stack(Axis(0), &views)?);
                }
                Ok(Signal::List(stacked))
            }
        }
    }

    pub fn exercises(&self) -> usize {
        self.parts()
            .first()
            .map(|part| part.len_of(Axis(0)))
            .unwrap_or(0)
    }

    /// Signal of exercise `index` alone.
    pub fn exercise(&self, index: usize) -> ExerciseSignal {
        match self {
            Signal::Single(tensor) => Signal::Single(tensor.index_axis(Axis(0), index).to_owned()),
            Signal::List(tensors) => Signal::List(
                tensors
                    .iter()
                    .map(|t| t.index_axis(Axis(0), index).to_owned())
                    .collect(),
            ),
        }
    }
}

/// Single-exercise inputs of one layer as produced by the pupil.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSignals {
    pub o: ExerciseSignal,
    pub sigma: ExerciseSignal,
}

/// Exercise-batched inputs of one layer, with optional coordinate permutations.
///
/// `in_perm` acts on the `o` feature axis, `out_perm` on the `sigma` feature
/// axis; both are `[exercises, width, width]` one-hot tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerIns {
    pub o: BatchedSignal,
    pub sigma: BatchedSignal,
    pub in_perm: Option<Array3<f32>>,
    pub out_perm: Option<Array3<f32>>,
}

impl LayerIns {
    pub fn new(o: BatchedSignal, sigma: BatchedSignal) -> Self {
        Self {
            o,
            sigma,
            in_perm: None,
            out_perm: None,
        }
    }

    pub fn exercises(&self) -> usize {
        self.sigma.exercises()
    }
}

/// Optimizer-input record keyed by pupil layer, built fresh for every step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizerIns {
    layers: BTreeMap<LayerKey, LayerIns>,
}

impl OptimizerIns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: LayerKey, ins: LayerIns) -> Option<LayerIns> {
        self.layers.insert(key, ins)
    }

    pub fn get(&self, key: LayerKey) -> Option<&LayerIns> {
        self.layers.get(&key)
    }

    pub fn get_mut(&mut self, key: LayerKey) -> Option<&mut LayerIns> {
        self.layers.get_mut(&key)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, LayerKey, LayerIns> {
        self.layers.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, LayerKey, LayerIns> {
        self.layers.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = LayerKey> + '_ {
        self.layers.keys().copied()
    }

    pub fn into_layers(self) -> btree_map::IntoIter<LayerKey, LayerIns> {
        self.layers.into_iter()
    }

    /// Number of exercises carried by the record; every layer must agree.
    pub fn exercises(&self) -> Result<usize> {
        let mut counts = self.layers.values().map(LayerIns::exercises);
        let first = counts.next().unwrap_or(0);
        if counts.any(|count| count != first) {
            return Err(MetaError::argument(
                "optimizer inputs disagree on the number of exercises",
            ));
        }
        Ok(first)
    }

    /// Multiplies every layer's `sigma` by `factor`.
    pub fn scale_sigma(&mut self, factor: f32) {
        for ins in self.layers.values_mut() {
            ins.sigma.scale(factor);
        }
    }

    /// Stacks per-exercise pupil records (in exercise order) into one batched record.
    pub fn from_exercises(exercises: &[BTreeMap<LayerKey, LayerSignals>]) -> Result<Self> {
        let first = exercises
            .first()
            .ok_or_else(|| MetaError::argument("no exercise inputs to stack"))?;
        let mut record = OptimizerIns::new();
        for &key in first.keys() {
            let mut os = Vec::with_capacity(exercises.len());
            let mut sigmas = Vec::with_capacity(exercises.len());
            for layers in exercises {
                let signals = layers.get(&key).ok_or_else(|| {
                    MetaError::argument(format!("an exercise is missing inputs for {key}"))
                })?;
                os.push(&signals.o);
                sigmas.push(&signals.sigma);
            }
            record.insert(
                key,
                LayerIns::new(BatchedSignal::stack(&os)?, BatchedSignal::stack(&sigmas)?),
            );
        }
        Ok(record)
    }
}

impl FromIterator<(LayerKey, LayerIns)> for OptimizerIns {
    fn from_iter<I: IntoIterator<Item = (LayerKey, LayerIns)>>(iter: I) -> Self {
        Self {
            layers: iter.into_iter().collect(),
        }
    }
}

/// Per-layer output of a core step: the `o` it saw and the produced delta signal.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerUpdate {
    pub o: BatchedSignal,
    pub delta: BatchedSignal,
}

impl LayerUpdate {
    /// Per-exercise weight update `Σ_parts o[e]ᵀ · delta[e]`, shaped `[exercises, in, out]`.
    pub fn weight_delta(&self) -> Result<Array3<f32>> {
        let o_parts = self.o.parts();
        let d_parts = self.delta.parts();
        if o_parts.len() != d_parts.len() || o_parts.is_empty() {
            return Err(MetaError::argument(format!(
                "o has {} parts but delta has {}",
                o_parts.len(),
                d_parts.len()
            )));
        }
        let (ex, batch, inputs) = o_parts[0].dim();
        let outputs = d_parts[0].len_of(Axis(2));
        let mut total = Array3::<f32>::zeros((ex, inputs, outputs));
        for (o, d) in o_parts.iter().zip(d_parts.iter()) {
            if o.dim() != (ex, batch, inputs) || d.dim() != (ex, batch, outputs) {
                return Err(MetaError::shape(
                    "weight_delta",
                    &[ex, batch, outputs],
                    d.shape(),
                ));
            }
            for ((mut acc, o_e), d_e) in total
                .outer_iter_mut()
                .zip(o.outer_iter())
                .zip(d.outer_iter())
            {
                let contribution: Array2<f32> = o_e.t().dot(&d_e);
                acc += &contribution;
            }
        }
        Ok(total)
    }
}

/// Output of a core step keyed by pupil layer.
pub type OptimizerOuts = BTreeMap<LayerKey, LayerUpdate>;

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn stacking_keeps_exercise_order() {
        let a = Signal::Single(array![[1.0f32, 2.0]]);
        let b = Signal::Single(array![[3.0f32, 4.0]]);
        let stacked = BatchedSignal::stack(&[&a, &b]).unwrap();
        assert_eq!(stacked.exercises(), 2);
        assert_eq!(stacked.exercise(1), b);
    }

    #[test]
    fn stacking_rejects_mixed_layouts() {
        let a = Signal::Single(array![[1.0f32]]);
        let b = Signal::List(vec![array![[1.0f32]]]);
        assert!(BatchedSignal::stack(&[&a, &b]).is_err());
    }

    #[test]
    fn weight_delta_contracts_over_batch_and_sums_list_parts() {
        let o = Signal::List(vec![
            Array3::from_shape_vec((1, 1, 2), vec![1.0f32, 2.0]).unwrap(),
            Array3::from_shape_vec((1, 1, 2), vec![1.0f32, 0.0]).unwrap(),
        ]);
        let delta = Signal::List(vec![
            Array3::from_shape_vec((1, 1, 1), vec![3.0f32]).unwrap(),
            Array3::from_shape_vec((1, 1, 1), vec![1.0f32]).unwrap(),
        ]);
        let update = LayerUpdate { o, delta };
        let weights = update.weight_delta().unwrap();
        assert_eq!(weights.dim(), (1, 2, 1));
        assert_eq!(weights.as_slice().unwrap(), &[4.0, 6.0]);
    }

    #[test]
    fn scale_sigma_touches_every_layer() {
        let ins = LayerIns::new(
            Signal::Single(Array3::zeros((1, 1, 1))),
            Signal::Single(Array3::from_elem((1, 1, 2), 2.0)),
        );
        let mut record: OptimizerIns = [(LayerKey::Lstm(0), ins)].into_iter().collect();
        record.scale_sigma(0.5);
        let sigma = &record.get(LayerKey::Lstm(0)).unwrap().sigma;
        assert!(sigma.parts()[0].iter().all(|&v| v == 1.0));
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Recurrent meta-optimizer with a residual read-out.
//!
//! Each exercise is summarised by permutation-invariant statistics of every
//! layer's `o` and `sigma`, encoded with [`log_and_sign`]. One LSTM cell step
//! advances the exercise's recurrent state, and the hidden state modulates the
//! layer signals:
//! `delta = lr * sigma * (1 + tanh(h · w_layer))`.

use std::collections::BTreeMap;

use ndarray::{s, Array1, Array2, ArrayD, ArrayView1, ArrayView2, Axis, Ix1, Ix2, IxDyn};
use tracing::{debug, trace};

use super::trainer::{MetaGradients, MetaTrainer};
use super::{CorePhase, MetaOptimizer, Regime};
use crate::config::MetaOptimizerConfig;
use crate::error::{MetaError, Result};
use crate::ops::log_and_sign;
use crate::permutation::PermutationManager;
use crate::shard::ShardId;
use crate::signal::{BatchedSignal, LayerIns, LayerUpdate, OptimizerIns, OptimizerOuts};
use crate::state::OptimizerStateStore;
use crate::topology::{LayerKey, NetSize, Topology};

/// Summary statistics per layer.
const STATS_PER_LAYER: usize = 3;
/// Cell inputs per layer once every statistic is log/sign encoded.
const FEATURES_PER_LAYER: usize = 2 * STATS_PER_LAYER;
/// Sharpness of the log/sign encoding.
const LOG_SIGN_P: f32 = 10.0;

const WEIGHT_IH: &str = "lstm::weight_ih";
const WEIGHT_HH: &str = "lstm::weight_hh";
const BIAS: &str = "lstm::bias";

fn sigmoid(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

fn readout_name(key: LayerKey) -> String {
    format!("readout::{key}")
}

#[derive(Debug)]
pub struct ResNet4Lstm {
    regime: Regime,
    phase: CorePhase,
    hidden: usize,
    layers: Vec<LayerKey>,
    params: Params,
    states: OptimizerStateStore,
    permutations: Option<PermutationManager>,
    trainer: Option<MetaTrainer>,
}

impl ResNet4Lstm {
    pub const NAME: &'static str = "resnet4lstm";

    pub fn new(config: &MetaOptimizerConfig, net_size: &NetSize) -> Result<Self> {
        config.validate()?;
        let topology = Topology::from_net_size(net_size)?;
        let hidden = config.num_lstm_nodes;
        let init = config.optimizer_init_parameter;
        let layers: Vec<LayerKey> = topology.layers().iter().map(|spec| spec.key).collect();
        let features = FEATURES_PER_LAYER * layers.len();

        let mut params = BTreeMap::new();
        let weight_ih = Array2::from_shape_fn((features, 4 * hidden), |(row, col)| {
            (((row * 13 + col * 7) % 17) as f32 - 8.0) / 8.0 * init
        });
        let weight_hh = Array2::from_shape_fn((hidden, 4 * hidden), |(row, col)| {
            (((row * 11 + col * 5) % 23) as f32 - 11.0) / 11.0 * init
        });
        params.insert(WEIGHT_IH.to_string(), weight_ih.into_dyn());
        params.insert(WEIGHT_HH.to_string(), weight_hh.into_dyn());
        params.insert(BIAS.to_string(), ArrayD::zeros(IxDyn(&[4 * hidden])));
        for (li, &key) in layers.iter().enumerate() {
            let readout = Array1::from_shape_fn(hidden, |unit| {
                (((unit * 7 + li * 3) % 11) as f32 - 5.0) / 5.0 * init
            });
            params.insert(readout_name(key), readout.into_dyn());
        }

        let permutations = if config.permute {
            Some(PermutationManager::new(topology, config.perm_period, config.seed)?)
        } else {
            None
        };
        let trainer = match config.regime {
            Regime::Train => Some(MetaTrainer::new(
                config.optimizer_for_opt_type,
                config.clip_norm,
            )?),
            Regime::Inference => None,
        };

        debug!(
            hidden,
            layers = layers.len(),
            permute = config.permute,
            regime = %config.regime,
            "built resnet4lstm core"
        );
        Ok(Self {
            regime: config.regime,
            phase: CorePhase::Uninitialized,
            hidden,
            layers,
            params,
            states: OptimizerStateStore::new(),
            permutations,
            trainer,
        })
    }

    pub fn trainables(&self) -> &Params {
        &self.params
    }

    pub fn permutations(&self) -> Option<&PermutationManager> {
        self.permutations.as_ref()
    }

    /// `[exercises, 6 * layers]`: mean `|o|`, mean `sigma` and RMS `sigma` per
    /// layer, each as a `[log-magnitude, sign]` pair.
    fn features(&self, ins: &OptimizerIns, exercises: usize) -> Result<Array2<f32>> {
        let width = STATS_PER_LAYER * self.layers.len();
        let mut stats = Array2::<f32>::zeros((exercises, width));
        for (li, key) in self.layers.iter().enumerate() {
            let Some(layer) = ins.get(*key) else {
                continue;
            };
            for e in 0..exercises {
                let (abs_o, n_o) = summarise(&layer.o, e, |v| v.abs());
                let (sum_s, n_s) = summarise(&layer.sigma, e, |v| v);
                let (sq_s, _) = summarise(&layer.sigma, e, |v| v * v);
                let base = li * STATS_PER_LAYER;
                stats[[e, base]] = mean(abs_o, n_o);
                stats[[e, base + 1]] = mean(sum_s, n_s);
                stats[[e, base + 2]] = mean(sq_s, n_s).sqrt();
            }
        }
        let encoded = log_and_sign(stats.view().into_dyn(), LOG_SIGN_P)?;
        Ok(encoded.into_shape((exercises, 2 * width))?)
    }
}

fn summarise(signal: &BatchedSignal, exercise: usize, f: impl Fn(f32) -> f32) -> (f32, usize) {
    signal.parts().iter().fold((0.0, 0), |(acc, n), part| {
        let slice = part.index_axis(Axis(0), exercise);
        (acc + slice.iter().map(|&v| f(v)).sum::<f32>(), n + slice.len())
    })
}

fn mean(total: f32, count: usize) -> f32 {
    if count == 0 {
        0.0
    } else {
        total / count as f32
    }
}

type Params = BTreeMap<String, ArrayD<f32>>;

fn param<'a>(params: &'a Params, name: &str) -> Result<&'a ArrayD<f32>> {
    params
        .get(name)
        .ok_or_else(|| MetaError::argument(format!("missing trainable '{name}'")))
}

fn param2<'a>(params: &'a Params, name: &str) -> Result<ArrayView2<'a, f32>> {
    Ok(param(params, name)?.view().into_dimensionality::<Ix2>()?)
}

fn param1<'a>(params: &'a Params, name: &str) -> Result<ArrayView1<'a, f32>> {
    Ok(param(params, name)?.view().into_dimensionality::<Ix1>()?)
}

impl MetaOptimizer for ResNet4Lstm {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn regime(&self) -> Regime {
        self.regime
    }

    fn phase(&self) -> CorePhase {
        self.phase
    }

    fn states(&self) -> &OptimizerStateStore {
        &self.states
    }

    fn hidden_size(&self) -> usize {
        self.hidden
    }

    fn advance(&mut self, next: CorePhase) -> Result<()> {
        self.phase = self.phase.advance(next, self.regime)?;
        Ok(())
    }

    fn create_states(&mut self, scope: &str, shard: ShardId, exercises: usize) -> Result<()> {
        self.advance(CorePhase::StatesCreated)?;
        self.states.create(scope, shard, exercises, self.hidden);
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
        let expected = self.states.get(scope, shard)?.exercises();
        let exercises = ins.exercises()?;
        if !ins.is_empty() && exercises != expected {
            return Err(MetaError::shape("optimizer_core exercises", &[expected], &[exercises]));
        }
        for key in ins.keys() {
            if !self.layers.contains(&key) {
                return Err(MetaError::argument(format!("core has no read-out for {key}")));
            }
        }

        let mut ins = ins;
        if let Some(perms) = &self.permutations {
            perms.extend_with_permutations(&mut ins, shard)?;
            PermutationManager::forward_permute(&mut ins)?;
        }

        let features = self.features(&ins, expected)?;
        let weight_ih = param2(&self.params, WEIGHT_IH)?;
        let weight_hh = param2(&self.params, WEIGHT_HH)?;
        let bias = param1(&self.params, BIAS)?;
        let hidden = self.hidden;

        let state = self.states.get_mut(scope, shard)?;
        let gates = features.dot(&weight_ih) + state.h.dot(&weight_hh) + &bias;
        let input = gates.slice(s![.., 0..hidden]).mapv(sigmoid);
        let forget = gates.slice(s![.., hidden..2 * hidden]).mapv(sigmoid);
        let candidate = gates.slice(s![.., 2 * hidden..3 * hidden]).mapv(f32::tanh);
        let output = gates.slice(s![.., 3 * hidden..4 * hidden]).mapv(sigmoid);
        let cell = &forget * &state.c + &input * &candidate;
        let h = &output * &cell.mapv(f32::tanh);
        state.c.assign(&cell);
        state.h.assign(&h);

        let mut outs = OptimizerIns::new();
        for (key, layer) in ins.into_layers() {
            let readout = param1(&self.params, &readout_name(key))?;
            let gain = h.dot(&readout).mapv(|v| learning_rate * (1.0 + v.tanh()));
            let mut delta = layer.sigma;
            for part in delta.parts_mut() {
                for (mut slice, &g) in part.outer_iter_mut().zip(gain.iter()) {
                    slice *= g;
                }
            }
            outs.insert(
                key,
                LayerIns {
                    o: layer.o,
                    sigma: delta,
                    in_perm: layer.in_perm,
                    out_perm: layer.out_perm,
                },
            );
        }
        if self.permutations.is_some() {
            PermutationManager::backward_permute(&mut outs)?;
        }
        trace!(shard, scope, exercises = expected, "resnet4lstm core step");

        Ok(outs
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

    fn permutes(&self) -> bool {
        self.permutations.is_some()
    }

    fn create_permutations(&mut self, shard: ShardId, exercises: usize) -> Result<()> {
        if let Some(perms) = &mut self.permutations {
            perms.create(exercises, shard);
        }
        Ok(())
    }

    fn reset_permutations(&mut self) -> Result<()> {
        match &mut self.permutations {
            Some(perms) => perms.reset_all(),
            None => Ok(()),
        }
    }

    fn permutation_reset_due(&self, step: usize) -> bool {
        self.permutations
            .as_ref()
            .map_or(false, |perms| perms.reset_due(step))
    }

    fn apply_meta_gradients(
        &mut self,
        gradients: &MetaGradients,
        learning_rate: f32,
    ) -> Result<()> {
        let trainer = self.trainer.as_mut().ok_or(MetaError::NotImplemented {
            variant: Self::NAME,
            regime: self.regime,
        })?;
        let norm = trainer.step(&mut self.params, gradients, learning_rate)?;
        debug!(norm, learning_rate, "applied meta gradients");
        Ok(())
    }
}

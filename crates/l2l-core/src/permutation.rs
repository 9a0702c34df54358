// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-exercise random coordinate permutations.
//!
//! Every shard keeps one `[exercises, n, n]` one-hot tensor per coordinate
//! group of the pupil topology. Layer permutations are block-diagonal
//! compositions of those group tensors, so a permutation applied on a layer's
//! output axis is matched by the same permutation on the next layer's input.

use std::collections::{BTreeMap, HashMap};

use ndarray::{Array2, Array3, ArrayView3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use crate::error::{MetaError, Result};
use crate::ops::{batched_matmul, batched_matmul_transposed, block_diagonal_batched};
use crate::shard::ShardId;
use crate::signal::{BatchedSignal, OptimizerIns};
use crate::topology::{GroupKey, Topology};

const PERMUTATION_SCOPE: &str = "permutations";

/// Samples a uniformly random `n × n` permutation matrix.
pub fn random_permutation_matrix<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Array2<f32> {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);
    let mut matrix = Array2::<f32>::zeros((n, n));
    for (row, &col) in order.iter().enumerate() {
        matrix[[row, col]] = 1.0;
    }
    matrix
}

fn random_permutation_batch<R: Rng + ?Sized>(
    exercises: usize,
    n: usize,
    rng: &mut R,
) -> Array3<f32> {
    let mut batch = Array3::<f32>::zeros((exercises, n, n));
    for mut slot in batch.outer_iter_mut() {
        slot.assign(&random_permutation_matrix(n, rng));
    }
    batch
}

#[derive(Debug, Clone)]
struct ShardPermutations {
    exercises: usize,
    groups: BTreeMap<GroupKey, Array3<f32>>,
}

/// Owns the permutation tensors of every shard.
#[derive(Debug)]
pub struct PermutationManager {
    topology: Topology,
    perm_period: Option<usize>,
    rng: StdRng,
    shards: HashMap<ShardId, ShardPermutations>,
}

impl PermutationManager {
    /// `seed` pins the permutation stream; without it the process determinism
    /// configuration decides.
    pub fn new(topology: Topology, perm_period: Option<usize>, seed: Option<u64>) -> Result<Self> {
        if perm_period == Some(0) {
            return Err(MetaError::config("perm_period must be positive when set"));
        }
        Ok(Self {
            topology,
            perm_period,
            rng: l2l_config::rng_from_optional(seed, "l2l.permutation"),
            shards: HashMap::new(),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn perm_period(&self) -> Option<usize> {
        self.perm_period
    }

    fn sample(&mut self, exercises: usize) -> ShardPermutations {
        let groups = self
            .topology
            .groups()
            .iter()
            .map(|group| {
                (
                    group.key,
                    random_permutation_batch(exercises, group.size, &mut self.rng),
                )
            })
            .collect();
        ShardPermutations { exercises, groups }
    }

    /// Allocates the permutations of `shard` once; later calls are no-ops.
    pub fn create(&mut self, exercises: usize, shard: ShardId) {
        if self.shards.contains_key(&shard) {
            return;
        }
        let fresh = self.sample(exercises);
        debug!(
            shard,
            exercises,
            groups = fresh.groups.len(),
            "creating permutation matrices"
        );
        self.shards.insert(shard, fresh);
    }

    /// Regenerates every group of `shard`. The new set is built completely
    /// before it replaces the old one.
    pub fn reset(&mut self, shard: ShardId) -> Result<()> {
        let exercises = self
            .shards
            .get(&shard)
            .map(|perms| perms.exercises)
            .ok_or_else(|| MetaError::state_not_found(PERMUTATION_SCOPE, shard))?;
        let fresh = self.sample(exercises);
        self.shards.insert(shard, fresh);
        info!(shard, "permutation matrices regenerated");
        Ok(())
    }

    pub fn reset_all(&mut self) -> Result<()> {
        let mut shards: Vec<ShardId> = self.shards.keys().copied().collect();
        shards.sort_unstable();
        for shard in shards {
            self.reset(shard)?;
        }
        Ok(())
    }

    /// Whether permutations are scheduled for regeneration at `step`.
    pub fn reset_due(&self, step: usize) -> bool {
        match self.perm_period {
            Some(period) => step % period == 0,
            None => false,
        }
    }

    pub fn group(&self, shard: ShardId, key: GroupKey) -> Result<&Array3<f32>> {
        let perms = self
            .shards
            .get(&shard)
            .ok_or_else(|| MetaError::state_not_found(PERMUTATION_SCOPE, shard))?;
        perms
            .groups
            .get(&key)
            .ok_or_else(|| MetaError::argument(format!("topology has no group {key}")))
    }

    fn compose(&self, shard: ShardId, keys: &[GroupKey]) -> Result<Option<Array3<f32>>> {
        match keys {
            [] => Ok(None),
            [single] => Ok(Some(self.group(shard, *single)?.clone())),
            many => {
                let views: Vec<ArrayView3<'_, f32>> = many
                    .iter()
                    .map(|&key| self.group(shard, key).map(|t| t.view()))
                    .collect::<Result<_>>()?;
                Ok(Some(block_diagonal_batched(&views)?))
            }
        }
    }

    /// Attaches `in_perm`/`out_perm` of `shard` to every layer of `ins`
    /// following the topology chain. Layers without a topology entry are left
    /// untouched.
    pub fn extend_with_permutations(&self, ins: &mut OptimizerIns, shard: ShardId) -> Result<()> {
        let exercises = self
            .shards
            .get(&shard)
            .map(|perms| perms.exercises)
            .ok_or_else(|| MetaError::state_not_found(PERMUTATION_SCOPE, shard))?;
        let record_exercises = ins.exercises()?;
        if !ins.is_empty() && record_exercises != exercises {
            return Err(MetaError::shape(
                "extend_with_permutations",
                &[exercises],
                &[record_exercises],
            ));
        }
        for (key, layer) in ins.iter_mut() {
            let Some(spec) = self.topology.layer(*key) else {
                continue;
            };
            layer.in_perm = self.compose(shard, &spec.in_groups)?;
            layer.out_perm = self.compose(shard, &spec.out_groups)?;
        }
        Ok(())
    }

    /// `o := o · in_perm`, `sigma := sigma · out_perm`.
    pub fn forward_permute(ins: &mut OptimizerIns) -> Result<()> {
        for (_, layer) in ins.iter_mut() {
            if let Some(perm) = &layer.in_perm {
                layer.o = apply(&layer.o, perm, batched_matmul)?;
            }
            if let Some(perm) = &layer.out_perm {
                layer.sigma = apply(&layer.sigma, perm, batched_matmul)?;
            }
        }
        Ok(())
    }

    /// Undoes [`forward_permute`](Self::forward_permute) using the transposed matrices.
    pub fn backward_permute(ins: &mut OptimizerIns) -> Result<()> {
        for (_, layer) in ins.iter_mut() {
            if let Some(perm) = &layer.in_perm {
                layer.o = apply(&layer.o, perm, batched_matmul_transposed)?;
            }
            if let Some(perm) = &layer.out_perm {
                layer.sigma = apply(&layer.sigma, perm, batched_matmul_transposed)?;
            }
        }
        Ok(())
    }
}

fn apply<F>(signal: &BatchedSignal, perm: &Array3<f32>, product: F) -> Result<BatchedSignal>
where
    F: Fn(ArrayView3<'_, f32>, ArrayView3<'_, f32>) -> Result<Array3<f32>>,
{
    signal.try_map(|part| product(part.view(), perm.view()))
}

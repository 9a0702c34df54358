// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Static partition of exercises across compute shards.

use std::fmt;
use std::ops::Range;

use crate::error::{MetaError, Result};

pub type ShardId = usize;

/// Where a shard's work (or the optimizer's own trainables) is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionContext {
    Cpu,
    Gpu(usize),
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionContext::Cpu => write!(f, "cpu:0"),
            ExecutionContext::Gpu(idx) => write!(f, "gpu:{idx}"),
        }
    }
}

/// Contiguous exercise ranges per shard; any remainder lands on the last shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    num_exercises: usize,
    exercise_shard_map: Vec<ShardId>,
    counts: Vec<usize>,
    contexts: Vec<ExecutionContext>,
}

impl ShardPlan {
    pub fn new(num_exercises: usize, num_shards: usize) -> Result<Self> {
        if num_shards == 0 {
            return Err(MetaError::config("at least one shard is required"));
        }
        if num_exercises < num_shards {
            return Err(MetaError::config(format!(
                "{num_exercises} exercises cannot be spread over {num_shards} shards"
            )));
        }
        let ex_per_shard = num_exercises / num_shards;
        let remainder = num_exercises - num_shards * ex_per_shard;

        let mut counts = vec![ex_per_shard; num_shards];
        counts[num_shards - 1] += remainder;

        let exercise_shard_map = counts
            .iter()
            .enumerate()
            .flat_map(|(shard, &count)| std::iter::repeat(shard).take(count))
            .collect();

        let contexts = (0..num_shards).map(ExecutionContext::Gpu).collect();

        Ok(Self {
            num_exercises,
            exercise_shard_map,
            counts,
            contexts,
        })
    }

    pub fn num_exercises(&self) -> usize {
        self.num_exercises
    }

    pub fn num_shards(&self) -> usize {
        self.counts.len()
    }

    /// Shard id of every exercise, indexed by exercise.
    pub fn exercise_shard_map(&self) -> &[ShardId] {
        &self.exercise_shard_map
    }

    pub fn num_exercises_on_shards(&self) -> &[usize] {
        &self.counts
    }

    pub fn shard_of(&self, exercise: usize) -> Option<ShardId> {
        self.exercise_shard_map.get(exercise).copied()
    }

    /// Half-open exercise range owned by `shard`.
    pub fn exercise_range(&self, shard: ShardId) -> Option<Range<usize>> {
        let count = *self.counts.get(shard)?;
        let start: usize = self.counts[..shard].iter().sum();
        Some(start..start + count)
    }

    /// Inclusive `(first, last)` exercise indices per shard.
    pub fn borders(&self) -> Vec<(usize, usize)> {
        (0..self.num_shards())
            .filter_map(|shard| self.exercise_range(shard))
            .map(|range| (range.start, range.end - 1))
            .collect()
    }

    pub fn context(&self, shard: ShardId) -> Option<ExecutionContext> {
        self.contexts.get(shard).copied()
    }

    /// Placement of the optimizer's shared trainables: the only device when
    /// there is one shard, host memory otherwise.
    pub fn base_context(&self) -> ExecutionContext {
        if self.num_shards() == 1 {
            ExecutionContext::Gpu(0)
        } else {
            ExecutionContext::Cpu
        }
    }

    pub fn shards(&self) -> Range<ShardId> {
        0..self.num_shards()
    }
}

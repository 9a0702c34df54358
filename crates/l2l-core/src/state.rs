// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Persistent recurrent state of the meta-optimizer, keyed by scope and shard.

use std::collections::HashMap;

use ndarray::Array2;
use tracing::debug;

use crate::error::{MetaError, Result};
use crate::shard::ShardId;

/// LSTM hidden and cell state for the exercises of one shard, `[exercises, hidden]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentState {
    pub h: Array2<f32>,
    pub c: Array2<f32>,
}

impl RecurrentState {
    pub fn zeros(exercises: usize, hidden: usize) -> Self {
        Self {
            h: Array2::zeros((exercises, hidden)),
            c: Array2::zeros((exercises, hidden)),
        }
    }

    pub fn exercises(&self) -> usize {
        self.h.nrows()
    }

    pub fn hidden(&self) -> usize {
        self.h.ncols()
    }

    /// Zeroes both tensors in place, keeping their shapes.
    pub fn reset(&mut self) {
        self.h.fill(0.0);
        self.c.fill(0.0);
    }

    pub fn is_zero(&self) -> bool {
        self.h.iter().chain(self.c.iter()).all(|&v| v == 0.0)
    }
}

/// Store of recurrent states. Creation is idempotent and resets keep shapes.
#[derive(Debug, Default)]
pub struct OptimizerStateStore {
    states: HashMap<(String, ShardId), RecurrentState>,
}

impl OptimizerStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates zero state for `(scope, shard)` unless it already exists.
    ///
    /// A shard with zero exercises gets a `[0, hidden]` state.
    pub fn create(
        &mut self,
        scope: &str,
        shard: ShardId,
        exercises: usize,
        hidden: usize,
    ) -> &RecurrentState {
        self.states
            .entry((scope.to_string(), shard))
            .or_insert_with(|| {
                debug!(scope, shard, exercises, hidden, "creating optimizer state");
                RecurrentState::zeros(exercises, hidden)
            })
    }

    pub fn contains(&self, scope: &str, shard: ShardId) -> bool {
        self.states.contains_key(&(scope.to_string(), shard))
    }

    pub fn get(&self, scope: &str, shard: ShardId) -> Result<&RecurrentState> {
        self.states
            .get(&(scope.to_string(), shard))
            .ok_or_else(|| MetaError::state_not_found(scope, shard))
    }

    pub fn get_mut(&mut self, scope: &str, shard: ShardId) -> Result<&mut RecurrentState> {
        self.states
            .get_mut(&(scope.to_string(), shard))
            .ok_or_else(|| MetaError::state_not_found(scope, shard))
    }

    /// Zeroes the state of `(scope, shard)`.
    pub fn reset(&mut self, scope: &str, shard: ShardId) -> Result<()> {
        self.get_mut(scope, shard)?.reset();
        Ok(())
    }

    /// Zeroes every shard of `scope`; the scope must have been created.
    pub fn reset_scope(&mut self, scope: &str) -> Result<()> {
        let mut touched = 0usize;
        for ((owner, _), state) in self.states.iter_mut() {
            if owner == scope {
                state.reset();
                touched += 1;
            }
        }
        if touched == 0 {
            return Err(MetaError::ScopeNotFound {
                scope: scope.to_string(),
            });
        }
        debug!(scope, shards = touched, "optimizer state reset");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

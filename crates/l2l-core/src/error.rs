// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use thiserror::Error;

use crate::core::Regime;
use crate::shard::ShardId;

/// Errors surfaced while assembling or stepping a meta-optimizer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MetaError {
    /// Invalid shard/exercise counts, periods, or lifecycle misuse.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Reset or core step issued before the state was created.
    #[error("optimizer state '{scope}' was never created on shard {shard}")]
    StateNotFound { scope: String, shard: ShardId },
    /// Scope-wide reset of a scope no shard has created state for.
    #[error("optimizer state scope '{scope}' has no shards")]
    ScopeNotFound { scope: String },
    /// Malformed arguments to a metric or helper.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The optimizer variant does not implement the requested regime.
    #[error("{variant} does not support the {regime} regime")]
    NotImplemented {
        variant: &'static str,
        regime: Regime,
    },
    /// Tensors that must agree on shape did not.
    #[error("shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// Failure reported by the pupil collaborator.
    #[error("pupil failure: {0}")]
    Pupil(String),
}

impl MetaError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        MetaError::Configuration(message.into())
    }

    pub(crate) fn argument(message: impl Into<String>) -> Self {
        MetaError::InvalidArgument(message.into())
    }

    pub(crate) fn state_not_found(scope: &str, shard: ShardId) -> Self {
        MetaError::StateNotFound {
            scope: scope.to_string(),
            shard,
        }
    }

    pub(crate) fn shape(context: &'static str, expected: &[usize], got: &[usize]) -> Self {
        MetaError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

impl From<ndarray::ShapeError> for MetaError {
    fn from(err: ndarray::ShapeError) -> Self {
        MetaError::InvalidArgument(format!("ndarray shape error: {err}"))
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(err: serde_json::Error) -> Self {
        MetaError::Configuration(format!("malformed configuration: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, MetaError>;

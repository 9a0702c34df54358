// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Core of an LSTM meta-optimizer trained across many pupil exercises.
//!
//! The crate keeps the optimizer's recurrent state per scope and shard,
//! samples per-exercise coordinate permutations, splits exercises over
//! shards and assembles train/inference graphs around a [`Pupil`].

pub mod config;
pub mod core;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod ops;
pub mod permutation;
pub mod pupil;
pub mod shard;
pub mod signal;
pub mod state;
pub mod telemetry;
pub mod topology;

pub use crate::config::MetaOptimizerConfig;
pub use crate::core::{
    CorePhase, EmptyOptimizer, MetaGradients, MetaOptimizer, MetaTrainer, OptimizerForOptType,
    Regime, ResNet4Lstm,
};
pub use crate::error::{MetaError, Result};
pub use crate::graph::{GraphHook, MetaGraph};
pub use crate::metrics::{
    compute_metrics, compute_metrics_raw_labels, MetricInputs, MetricKind, MetricValue,
    MetricsReport,
};
pub use crate::permutation::{random_permutation_matrix, PermutationManager};
pub use crate::pupil::{Batch, BatchGenerator, Pupil, PupilEvaluation, PupilStorage, PupilVariable};
pub use crate::shard::{ExecutionContext, ShardId, ShardPlan};
pub use crate::signal::{
    BatchedSignal, ExerciseSignal, LayerIns, LayerSignals, LayerUpdate, OptimizerIns,
    OptimizerOuts, Signal,
};
pub use crate::state::{OptimizerStateStore, RecurrentState};
pub use crate::telemetry::StepMetrics;
pub use crate::topology::{GroupKey, LayerKey, NetSize, Topology};

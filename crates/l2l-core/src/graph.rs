// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Train and inference graphs wiring pupil snapshots, the core and metrics.
//!
//! A train step unrolls the pupil `num_optimizer_unrollings` times. Each
//! unrolling walks the shards in order: every exercise of the shard evaluates
//! its pupil snapshot on its next batch, the per-exercise records are stacked,
//! the core turns them into deltas and the deltas are written back into the
//! snapshots. Metrics are reduced over shards once all of them have run.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use ndarray::{stack, Array2, ArrayView2, Axis};
use tracing::{debug, info, info_span, trace, warn};

use crate::config::MetaOptimizerConfig;
use crate::core::{CorePhase, MetaGradients, MetaOptimizer, Regime};
use crate::error::{MetaError, Result};
use crate::metrics::{compute_metrics, MetricInputs, MetricKind, MetricValue, MetricsReport};
use crate::pupil::{Batch, BatchGenerator, Pupil, PupilStorage};
use crate::shard::{ShardId, ShardPlan};
use crate::signal::OptimizerIns;
use crate::telemetry::{register_step_descriptors, StepMetrics};
use crate::topology::Topology;

/// Named entry points exposed by a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphHook {
    Loss,
    Bpc,
    Perplexity,
    Accuracy,
    TrainOp,
    LearningRate,
    ResetOptimizerStates,
    ResetPermutations,
    ResetPupilStorage,
}

impl GraphHook {
    pub fn as_str(self) -> &'static str {
        match self {
            GraphHook::Loss => "loss",
            GraphHook::Bpc => "bpc",
            GraphHook::Perplexity => "perplexity",
            GraphHook::Accuracy => "accuracy",
            GraphHook::TrainOp => "train_op",
            GraphHook::LearningRate => "learning_rate",
            GraphHook::ResetOptimizerStates => "reset_optimizer_states_op",
            GraphHook::ResetPermutations => "reset_permutations_op",
            GraphHook::ResetPupilStorage => "reset_pupil_storage_op",
        }
    }

    fn metric(self) -> Option<MetricKind> {
        match self {
            GraphHook::Loss => Some(MetricKind::Loss),
            GraphHook::Bpc => Some(MetricKind::Bpc),
            GraphHook::Perplexity => Some(MetricKind::Perplexity),
            GraphHook::Accuracy => Some(MetricKind::Accuracy),
            _ => None,
        }
    }
}

impl fmt::Display for GraphHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GraphHook {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self> {
        const ALL: [GraphHook; 9] = [
            GraphHook::Loss,
            GraphHook::Bpc,
            GraphHook::Perplexity,
            GraphHook::Accuracy,
            GraphHook::TrainOp,
            GraphHook::LearningRate,
            GraphHook::ResetOptimizerStates,
            GraphHook::ResetPermutations,
            GraphHook::ResetPupilStorage,
        ];
        ALL.into_iter()
            .find(|hook| hook.as_str() == s)
            .ok_or_else(|| MetaError::argument(format!("unknown hook '{s}'")))
    }
}

/// Train or inference graph around one core and one pupil.
pub struct MetaGraph<'p> {
    pupil: &'p dyn Pupil,
    optimizer: Box<dyn MetaOptimizer>,
    config: MetaOptimizerConfig,
    plan: ShardPlan,
    topology: Topology,
    storage: PupilStorage,
    step: usize,
    last: Option<StepMetrics>,
}

impl<'p> fmt::Debug for MetaGraph<'p> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaGraph")
            .field("optimizer", &self.optimizer.name())
            .field("regime", &self.config.regime)
            .field("plan", &self.plan)
            .field("step", &self.step)
            .finish()
    }
}

impl<'p> MetaGraph<'p> {
    /// Validates `config`, creates states (and permutations) per shard and
    /// brings the core to [`CorePhase::Ready`].
    pub fn new(
        pupil: &'p dyn Pupil,
        mut optimizer: Box<dyn MetaOptimizer>,
        config: MetaOptimizerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let regime = config.regime;
        if optimizer.regime() != regime {
            return Err(MetaError::config(format!(
                "{} core was built for {} but the graph is {regime}",
                optimizer.name(),
                optimizer.regime()
            )));
        }
        let topology = Topology::from_net_size(&pupil.net_size())?;
        let plan = ShardPlan::new(config.active_exercises(), config.active_shards())?;

        for shard in plan.shards() {
            let exercises = plan.num_exercises_on_shards()[shard];
            optimizer.create_states(regime.scope(), shard, exercises)?;
            if config.permute {
                optimizer.create_permutations(shard, exercises)?;
            }
        }
        if config.permute && !optimizer.permutes() {
            warn!(
                optimizer = optimizer.name(),
                "permutations requested but the core does not permute"
            );
        }
        optimizer.advance(CorePhase::graph_built(regime))?;
        optimizer.advance(CorePhase::Ready)?;

        let mut storage = PupilStorage::new();
        storage.reset_from(pupil, plan.num_exercises());
        register_step_descriptors();

        info!(
            optimizer = optimizer.name(),
            %regime,
            exercises = plan.num_exercises(),
            shards = plan.num_shards(),
            base = %plan.base_context(),
            "meta graph ready"
        );
        Ok(Self {
            pupil,
            optimizer,
            config,
            plan,
            topology,
            storage,
            step: 0,
            last: None,
        })
    }

    pub fn regime(&self) -> Regime {
        self.config.regime
    }

    pub fn config(&self) -> &MetaOptimizerConfig {
        &self.config
    }

    pub fn plan(&self) -> &ShardPlan {
        &self.plan
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn optimizer(&self) -> &dyn MetaOptimizer {
        self.optimizer.as_ref()
    }

    pub fn storage(&self) -> &PupilStorage {
        &self.storage
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn last_metrics(&self) -> Option<&StepMetrics> {
        self.last.as_ref()
    }

    /// Hooks available for this graph's regime.
    pub fn hooks(&self) -> Vec<GraphHook> {
        let mut hooks = vec![
            GraphHook::Loss,
            GraphHook::Bpc,
            GraphHook::Perplexity,
            GraphHook::Accuracy,
        ];
        if self.regime() == Regime::Train {
            hooks.push(GraphHook::TrainOp);
        }
        hooks.push(GraphHook::LearningRate);
        hooks.push(GraphHook::ResetOptimizerStates);
        if self.optimizer.permutes() {
            hooks.push(GraphHook::ResetPermutations);
        }
        hooks.push(GraphHook::ResetPupilStorage);
        hooks
    }

    /// Value of a metric hook from the last completed step.
    pub fn read_hook(&self, hook: GraphHook) -> Option<f32> {
        let kind = hook.metric()?;
        self.last.as_ref()?.metric(kind)
    }

    /// Runs a reset hook.
    pub fn fire(&mut self, hook: GraphHook) -> Result<()> {
        match hook {
            GraphHook::ResetOptimizerStates => self.reset_states(),
            GraphHook::ResetPermutations => self.reset_permutations(),
            GraphHook::ResetPupilStorage => {
                self.reset_pupil_storage();
                Ok(())
            }
            other => Err(MetaError::argument(format!("hook '{other}' cannot be fired"))),
        }
    }

    pub fn reset_states(&mut self) -> Result<()> {
        self.optimizer.reset_states(self.config.regime.scope())?;
        info!(regime = %self.config.regime, "optimizer states reset");
        Ok(())
    }

    pub fn reset_permutations(&mut self) -> Result<()> {
        self.optimizer.reset_permutations()
    }

    /// Reloads every exercise snapshot from the pupil's initial variables.
    pub fn reset_pupil_storage(&mut self) {
        self.storage.reset_from(self.pupil, self.plan.num_exercises());
    }

    /// Restarts the single inference exercise from the pupil's initial variables.
    pub fn reset_inference_pupil_storage(&mut self) -> Result<()> {
        self.require_regime(Regime::Inference)?;
        self.reset_pupil_storage();
        Ok(())
    }

    /// The `train_op` hook: applies meta-gradients to the core's trainables.
    pub fn apply_meta_gradients(
        &mut self,
        gradients: &MetaGradients,
        learning_rate: f32,
    ) -> Result<()> {
        self.require_regime(Regime::Train)?;
        self.optimizer.apply_meta_gradients(gradients, learning_rate)
    }

    /// One optimizer-training step. `generators` holds one batch source per exercise.
    pub fn train_step<G: BatchGenerator>(
        &mut self,
        generators: &mut [G],
        learning_rate: f32,
    ) -> Result<StepMetrics> {
        self.require_regime(Regime::Train)?;
        self.require_ready()?;
        if generators.len() != self.plan.num_exercises() {
            return Err(MetaError::argument(format!(
                "expected {} batch generators, got {}",
                self.plan.num_exercises(),
                generators.len()
            )));
        }
        let span = info_span!("train_step", step = self.step);
        let _guard = span.enter();

        let resets = self.scheduled_resets()?;
        let mut partials = Vec::new();
        for unrolling in 0..self.config.num_optimizer_unrollings {
            for shard in self.plan.shards() {
                let range = self.shard_range(shard)?;
                let shard_generators = &mut generators[range.clone()];
                let report =
                    self.run_shard(shard, range.clone(), shard_generators, learning_rate)?;
                debug!(unrolling, shard, exercises = range.len(), "shard step done");
                partials.push((report, range.len()));
            }
        }
        self.finish_step(partials, resets)
    }

    /// One pupil step on the inference exercise, driven by the core.
    pub fn inference_step<G: BatchGenerator>(
        &mut self,
        generator: &mut G,
        learning_rate: f32,
    ) -> Result<StepMetrics> {
        self.require_regime(Regime::Inference)?;
        self.require_ready()?;
        let span = info_span!("inference_step", step = self.step);
        let _guard = span.enter();

        let report = self.run_shard(0, 0..1, std::slice::from_mut(generator), learning_rate)?;
        self.finish_step(vec![(report, 1)], 0)
    }

    fn require_regime(&self, regime: Regime) -> Result<()> {
        if self.config.regime == regime {
            Ok(())
        } else {
            Err(MetaError::config(format!(
                "operation needs a {regime} graph, this one is {}",
                self.config.regime
            )))
        }
    }

    fn require_ready(&self) -> Result<()> {
        match self.optimizer.phase() {
            CorePhase::Ready => Ok(()),
            phase => Err(MetaError::config(format!(
                "core is {phase:?}, expected Ready"
            ))),
        }
    }

    fn shard_range(&self, shard: ShardId) -> Result<Range<usize>> {
        self.plan
            .exercise_range(shard)
            .ok_or_else(|| MetaError::argument(format!("unknown shard {shard}")))
    }

    /// Resets due at the current step; they complete before any shard runs.
    fn scheduled_resets(&mut self) -> Result<usize> {
        let mut resets = 0;
        if self.step % self.config.reset_period == 0 {
            self.optimizer.reset_states(self.config.regime.scope())?;
            self.reset_pupil_storage();
            resets += 1;
        }
        if self.optimizer.permutation_reset_due(self.step) {
            self.optimizer.reset_permutations()?;
            resets += 1;
        }
        if resets > 0 {
            info!(step = self.step, resets, "scheduled resets");
        }
        Ok(resets)
    }

    fn run_shard<G: BatchGenerator>(
        &mut self,
        shard: ShardId,
        range: Range<usize>,
        generators: &mut [G],
        learning_rate: f32,
    ) -> Result<MetricsReport> {
        let mut layers = Vec::with_capacity(range.len());
        let mut predictions = Vec::with_capacity(range.len());
        let mut labels = Vec::with_capacity(range.len());
        for (exercise, generator) in range.clone().zip(generators.iter_mut()) {
            let batch = next_batch(generator, exercise)?;
            let evaluation = self
                .pupil
                .evaluate(self.storage.variables(exercise)?, &batch)?;
            layers.push(evaluation.layers);
            predictions.push(evaluation.predictions);
            labels.push(batch.labels);
        }

        let ins = OptimizerIns::from_exercises(&layers)?;
        let outs = self
            .optimizer
            .optimizer_core(ins, self.config.regime.scope(), shard, learning_rate)?;
        self.storage.apply_deltas(range.start, &outs)?;

        let predictions = stack_views(&predictions)?;
        let labels = stack_views(&labels)?;
        let inputs = MetricInputs {
            predictions: Some(predictions.view().into_dyn()),
            labels: Some(labels.view().into_dyn()),
            loss: None,
        };
        compute_metrics(&MetricKind::ALL, inputs, false)
    }

    fn finish_step(
        &mut self,
        partials: Vec<(MetricsReport, usize)>,
        resets: usize,
    ) -> Result<StepMetrics> {
        let exercises = self.plan.num_exercises();
        let metrics = reduce_reports(&partials);
        let summary = StepMetrics {
            step: self.step,
            exercises,
            resets,
            metrics,
        };
        info!(
            step = self.step,
            loss = summary.metric(MetricKind::Loss).unwrap_or(f32::NAN),
            accuracy = summary.metric(MetricKind::Accuracy).unwrap_or(f32::NAN),
            "step finished"
        );
        for gauge in summary.to_values() {
            trace!(gauge = gauge.name, value = gauge.value, "step gauge");
        }
        self.step += 1;
        self.last = Some(summary.clone());
        Ok(summary)
    }
}

fn next_batch<G: BatchGenerator>(generator: &mut G, exercise: usize) -> Result<Batch> {
    if let Some(batch) = generator.next_batch() {
        return Ok(batch);
    }
    warn!(exercise, "batch generator exhausted, restarting");
    generator.restart();
    generator
        .next_batch()
        .ok_or_else(|| MetaError::Pupil(format!("exercise {exercise} has no batches")))
}

fn stack_views(tensors: &[Array2<f32>]) -> Result<ndarray::Array3<f32>> {
    let views: Vec<ArrayView2<'_, f32>> = tensors.iter().map(|t| t.view()).collect();
    Ok(stack(Axis(0), &views)?)
}

/// Exercise-weighted mean of per-shard reports.
fn reduce_reports(partials: &[(MetricsReport, usize)]) -> MetricsReport {
    let mut reduced = MetricsReport::new();
    for kind in MetricKind::ALL {
        let (total, weight) = partials
            .iter()
            .filter_map(|(report, n)| report.get(&kind).map(|v| (v.mean() * *n as f32, *n)))
            .fold((0.0f32, 0usize), |(t, w), (v, n)| (t + v, w + n));
        if weight > 0 {
            reduced.insert(kind, MetricValue::Scalar(total / weight as f32));
        }
    }
    reduced
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Telemetry descriptors and gauge values emitted by meta-optimizer graphs.

use std::sync::{PoisonError, RwLock};

use once_cell::sync::Lazy;

use crate::metrics::{MetricKind, MetricsReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "report-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MetricUnit {
    /// Losses, ratios and other dimensionless readings.
    Scalar,
    /// Steps, exercises and resets.
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub name: &'static str,
    pub unit: MetricUnit,
    pub description: &'static str,
}

/// Reading paired with a descriptor name.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "report-serde", derive(serde::Serialize))]
pub struct GaugeValue {
    pub name: &'static str,
    pub value: f32,
    pub unit: MetricUnit,
}

static REGISTRY: Lazy<RwLock<Vec<MetricDescriptor>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Registers descriptors, ignoring names already present.
pub fn register_descriptors(descriptors: &[MetricDescriptor]) {
    let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    for descriptor in descriptors {
        if registry.iter().all(|existing| existing.name != descriptor.name) {
            registry.push(*descriptor);
        }
    }
}

pub fn descriptors() -> Vec<MetricDescriptor> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub const STEP_DESCRIPTORS: &[MetricDescriptor] = &[
    MetricDescriptor {
        name: "l2l.step.loss",
        unit: MetricUnit::Scalar,
        description: "Exercise-weighted mean pupil loss of the step.",
    },
    MetricDescriptor {
        name: "l2l.step.bpc",
        unit: MetricUnit::Scalar,
        description: "Bits per character derived from the step loss.",
    },
    MetricDescriptor {
        name: "l2l.step.perplexity",
        unit: MetricUnit::Scalar,
        description: "Mean perplexity of the pupil predictions.",
    },
    MetricDescriptor {
        name: "l2l.step.accuracy",
        unit: MetricUnit::Scalar,
        description: "Share of positions predicted correctly.",
    },
    MetricDescriptor {
        name: "l2l.step.exercises",
        unit: MetricUnit::Count,
        description: "Exercises that contributed to the step.",
    },
    MetricDescriptor {
        name: "l2l.step.resets",
        unit: MetricUnit::Count,
        description: "Scheduled resets executed before the step.",
    },
];

pub fn register_step_descriptors() {
    register_descriptors(STEP_DESCRIPTORS);
}

fn metric_gauge(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Loss => "l2l.step.loss",
        MetricKind::Bpc => "l2l.step.bpc",
        MetricKind::Perplexity => "l2l.step.perplexity",
        MetricKind::Accuracy => "l2l.step.accuracy",
    }
}

/// Summary of one train or inference step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepMetrics {
    pub step: usize,
    pub exercises: usize,
    pub resets: usize,
    pub metrics: MetricsReport,
}

impl StepMetrics {
    pub fn metric(&self, kind: MetricKind) -> Option<f32> {
        self.metrics.get(&kind).map(|value| value.mean())
    }

    pub fn to_values(&self) -> Vec<GaugeValue> {
        let mut values: Vec<GaugeValue> = self
            .metrics
            .iter()
            .map(|(&kind, value)| GaugeValue {
                name: metric_gauge(kind),
                value: value.mean(),
                unit: MetricUnit::Scalar,
            })
            .collect();
        values.push(GaugeValue {
            name: "l2l.step.exercises",
            value: self.exercises as f32,
            unit: MetricUnit::Count,
        });
        values.push(GaugeValue {
            name: "l2l.step.resets",
            value: self.resets as f32,
            unit: MetricUnit::Count,
        });
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValue;

    #[test]
    fn registering_is_idempotent() {
        register_step_descriptors();
        register_step_descriptors();
        let registered = descriptors();
        let count = registered
            .iter()
            .filter(|d| d.name == "l2l.step.loss")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn every_gauge_has_a_descriptor() {
        let metrics: MetricsReport = MetricKind::ALL
            .iter()
            .map(|&kind| (kind, MetricValue::Scalar(1.5)))
            .collect();
        let step = StepMetrics {
            step: 3,
            exercises: 4,
            resets: 1,
            metrics,
        };
        let values = step.to_values();
        assert_eq!(values.len(), 6);
        for value in values {
            assert!(STEP_DESCRIPTORS.iter().any(|d| d.name == value.name));
        }
        assert_eq!(step.metric(MetricKind::Bpc), Some(1.5));
    }
}

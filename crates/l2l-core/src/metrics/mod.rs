// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Stateless metric computations shared by every optimizer variant.
//!
//! Predictions and labels are laid out with the class axis last. All other
//! axes are averaged away, except the leading (exercise) axis when
//! `keep_first_dim` is requested.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};

/// Probabilities below this floor are lifted before taking logarithms.
pub const PROBABILITY_FLOOR: f32 = 1e-10;

/// Metric names understood by [`compute_metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Loss,
    Bpc,
    Perplexity,
    Accuracy,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Loss,
        MetricKind::Bpc,
        MetricKind::Perplexity,
        MetricKind::Accuracy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Loss => "loss",
            MetricKind::Bpc => "bpc",
            MetricKind::Perplexity => "perplexity",
            MetricKind::Accuracy => "accuracy",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "loss" => Ok(MetricKind::Loss),
            "bpc" => Ok(MetricKind::Bpc),
            "perplexity" => Ok(MetricKind::Perplexity),
            "accuracy" => Ok(MetricKind::Accuracy),
            other => Err(MetaError::argument(format!("unknown metric '{other}'"))),
        }
    }
}

/// Reduced metric: a scalar, or one value per exercise with `keep_first_dim`.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Scalar(f32),
    PerExercise(Array1<f32>),
}

impl MetricValue {
    /// Applies `f` to every reduced value.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> MetricValue {
        match self {
            MetricValue::Scalar(v) => MetricValue::Scalar(f(*v)),
            MetricValue::PerExercise(values) => MetricValue::PerExercise(values.mapv(f)),
        }
    }

    /// Collapses per-exercise values to their mean.
    pub fn mean(&self) -> f32 {
        match self {
            MetricValue::Scalar(v) => *v,
            MetricValue::PerExercise(values) => values.mean().unwrap_or(0.0),
        }
    }
}

/// Optional tensors a metric request may draw from.
#[derive(Debug, Clone, Default)]
pub struct MetricInputs<'a> {
    pub predictions: Option<ArrayViewD<'a, f32>>,
    pub labels: Option<ArrayViewD<'a, f32>>,
    pub loss: Option<&'a MetricValue>,
}

/// Results of [`compute_metrics`], keyed by metric.
pub type MetricsReport = BTreeMap<MetricKind, MetricValue>;

fn reduce_mean(values: ArrayD<f32>, keep_first_dim: bool, label: &str) -> Result<MetricValue> {
    if values.is_empty() {
        return Err(MetaError::argument(format!("{label}: nothing to average")));
    }
    if keep_first_dim && values.ndim() >= 1 {
        let rows = values.len_of(Axis(0));
        let cols = values.len() / rows;
        let flat = values
            .as_standard_layout()
            .into_owned()
            .into_shape((rows, cols))?;
        let per_row = flat
            .mean_axis(Axis(1))
            .ok_or_else(|| MetaError::argument(format!("{label}: empty trailing axes")))?;
        return Ok(MetricValue::PerExercise(per_row));
    }
    let mean = values
        .mean()
        .ok_or_else(|| MetaError::argument(format!("{label}: nothing to average")))?;
    Ok(MetricValue::Scalar(mean))
}

fn class_axis(tensor: &ArrayViewD<'_, f32>, label: &str) -> Result<Axis> {
    if tensor.ndim() == 0 {
        return Err(MetaError::argument(format!(
            "{label}: tensors need a class axis"
        )));
    }
    Ok(Axis(tensor.ndim() - 1))
}

fn ensure_same_shape(
    predictions: &ArrayViewD<'_, f32>,
    labels: &ArrayViewD<'_, f32>,
    context: &'static str,
) -> Result<()> {
    if predictions.shape() != labels.shape() {
        return Err(MetaError::shape(context, predictions.shape(), labels.shape()));
    }
    Ok(())
}

fn argmax_last(tensor: &ArrayViewD<'_, f32>, axis: Axis) -> ArrayD<usize> {
    tensor.map_axis(axis, |lane| {
        let mut best = 0usize;
        let mut best_value = f32::NEG_INFINITY;
        for (idx, &value) in lane.iter().enumerate() {
            if value > best_value {
                best = idx;
                best_value = value;
            }
        }
        best
    })
}

/// Cross entropy `Σ -labels · ln(max(p, 1e-10))` over the class axis, averaged.
pub fn loss(
    predictions: ArrayViewD<'_, f32>,
    labels: ArrayViewD<'_, f32>,
    keep_first_dim: bool,
) -> Result<MetricValue> {
    ensure_same_shape(&predictions, &labels, "loss")?;
    let axis = class_axis(&predictions, "loss")?;
    let log_predictions = predictions.mapv(|p| p.max(PROBABILITY_FLOOR).ln());
    let per_position = (&labels * &log_predictions).sum_axis(axis).mapv(|v| -v);
    reduce_mean(per_position, keep_first_dim, "loss")
}

/// Bits per character: `loss / ln 2`.
pub fn bpc(loss: &MetricValue) -> MetricValue {
    loss.map(|value| value / std::f32::consts::LN_2)
}

/// `2^H` with `H` the entropy (in bits) of each predicted distribution, averaged.
pub fn perplexity(probabilities: ArrayViewD<'_, f32>, keep_first_dim: bool) -> Result<MetricValue> {
    let axis = class_axis(&probabilities, "perplexity")?;
    let ln2 = std::f32::consts::LN_2;
    let clamped = probabilities.mapv(|p| p.max(PROBABILITY_FLOOR));
    let entropy = clamped
        .mapv(|p| -p * (p.ln() / ln2))
        .sum_axis(axis);
    let per_position = entropy.mapv(|h| (ln2 * h).exp());
    reduce_mean(per_position, keep_first_dim, "perplexity")
}

/// Share of positions whose predicted argmax matches the label argmax.
pub fn accuracy(
    predictions: ArrayViewD<'_, f32>,
    labels: ArrayViewD<'_, f32>,
    keep_first_dim: bool,
) -> Result<MetricValue> {
    ensure_same_shape(&predictions, &labels, "accuracy")?;
    let axis = class_axis(&predictions, "accuracy")?;
    let predicted = argmax_last(&predictions, axis);
    let expected = argmax_last(&labels, axis);
    let hits = Zip::from(&predicted)
        .and(&expected)
        .map_collect(|p, e| if p == e { 1.0f32 } else { 0.0 });
    reduce_mean(hits, keep_first_dim, "accuracy")
}

fn require<'a>(
    tensor: Option<ArrayViewD<'a, f32>>,
    what: &str,
    metric: MetricKind,
) -> Result<ArrayViewD<'a, f32>> {
    tensor.ok_or_else(|| {
        MetaError::argument(format!("cannot compute {metric}: {what} were not provided"))
    })
}

/// Computes every metric in `requested`.
///
/// `bpc` prefers the supplied `loss`, then a loss computed in the same call,
/// then predictions + labels; with none of them it is an `InvalidArgument`.
pub fn compute_metrics(
    requested: &[MetricKind],
    inputs: MetricInputs<'_>,
    keep_first_dim: bool,
) -> Result<MetricsReport> {
    let mut report = MetricsReport::new();
    let computed_loss = if requested.contains(&MetricKind::Loss) {
        let predictions = require(inputs.predictions.clone(), "predictions", MetricKind::Loss)?;
        let labels = require(inputs.labels.clone(), "labels", MetricKind::Loss)?;
        let value = loss(predictions, labels, keep_first_dim)?;
        report.insert(MetricKind::Loss, value.clone());
        Some(value)
    } else {
        None
    };

    if requested.contains(&MetricKind::Bpc) {
        let value = match (inputs.loss, computed_loss.as_ref()) {
            (Some(supplied), _) => bpc(supplied),
            (None, Some(fresh)) => bpc(fresh),
            (None, None) => match (inputs.predictions.clone(), inputs.labels.clone()) {
                (Some(predictions), Some(labels)) => {
                    bpc(&loss(predictions, labels, keep_first_dim)?)
                }
                _ => {
                    return Err(MetaError::argument(
                        "could not compute bpc: at least loss or predictions and labels must be provided",
                    ))
                }
            },
        };
        report.insert(MetricKind::Bpc, value);
    }

    if requested.contains(&MetricKind::Accuracy) {
        let predictions = require(inputs.predictions.clone(), "predictions", MetricKind::Accuracy)?;
        let labels = require(inputs.labels.clone(), "labels", MetricKind::Accuracy)?;
        report.insert(
            MetricKind::Accuracy,
            accuracy(predictions, labels, keep_first_dim)?,
        );
    }

    if requested.contains(&MetricKind::Perplexity) {
        let predictions = require(inputs.predictions.clone(), "predictions", MetricKind::Perplexity)?;
        report.insert(
            MetricKind::Perplexity,
            perplexity(predictions, keep_first_dim)?,
        );
    }

    Ok(report)
}

/// Like [`compute_metrics`] but with integer class ids instead of one-hot labels.
///
/// `labels` must hold one id per prediction position; it is one-hot encoded to
/// the prediction vocabulary before the metrics run.
pub fn compute_metrics_raw_labels(
    requested: &[MetricKind],
    predictions: ArrayViewD<'_, f32>,
    labels: ArrayViewD<'_, usize>,
    loss: Option<&MetricValue>,
    keep_first_dim: bool,
) -> Result<MetricsReport> {
    let axis = class_axis(&predictions, "compute_metrics_raw_labels")?;
    let vocabulary = predictions.len_of(axis);
    let positions = predictions.len() / vocabulary.max(1);
    if labels.len() != positions {
        return Err(MetaError::shape(
            "compute_metrics_raw_labels",
            &[positions],
            &[labels.len()],
        ));
    }
    let mut one_hot = ArrayD::<f32>::zeros(IxDyn(predictions.shape()));
    {
        let mut rows = one_hot
            .view_mut()
            .into_shape((positions, vocabulary))
            .map_err(MetaError::from)?;
        for (row, &label) in labels.iter().enumerate() {
            if label >= vocabulary {
                return Err(MetaError::argument(format!(
                    "label id {label} is outside the vocabulary of size {vocabulary}"
                )));
            }
            rows[[row, label]] = 1.0;
        }
    }
    compute_metrics(
        requested,
        MetricInputs {
            predictions: Some(predictions.view()),
            labels: Some(one_hot.view()),
            loss,
        },
        keep_first_dim,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn bpc_is_loss_over_ln2() {
        let value = bpc(&MetricValue::Scalar(1.5));
        assert_eq!(value, MetricValue::Scalar(1.5 / std::f32::consts::LN_2));
    }

    #[test]
    fn loss_matches_manual_cross_entropy() {
        let predictions = array![[0.1f32, 0.6, 0.3], [0.8, 0.1, 0.1]].into_dyn();
        let labels = array![[0.0f32, 1.0, 0.0], [1.0, 0.0, 0.0]].into_dyn();
        let value = loss(predictions.view(), labels.view(), false).unwrap();
        let expected = (-0.6f32.ln() - 0.8f32.ln()) / 2.0;
        assert!((value.mean() - expected).abs() < 1e-6);
    }

    #[test]
    fn zero_probabilities_are_floored() {
        let predictions = array![[0.0f32, 1.0]].into_dyn();
        let labels = array![[1.0f32, 0.0]].into_dyn();
        let value = loss(predictions.view(), labels.view(), false).unwrap();
        assert!((value.mean() + PROBABILITY_FLOOR.ln()).abs() < 1e-3);
    }

    #[test]
    fn accuracy_of_labels_against_themselves_is_one() {
        let labels = array![[[0.0f32, 1.0], [1.0, 0.0]], [[1.0, 0.0], [0.0, 1.0]]].into_dyn();
        let value = accuracy(labels.view(), labels.view(), true).unwrap();
        assert_eq!(value, MetricValue::PerExercise(array![1.0, 1.0]));
    }

    #[test]
    fn uniform_distribution_has_perplexity_of_vocabulary() {
        let probabilities = array![[0.25f32, 0.25, 0.25, 0.25]].into_dyn();
        let value = perplexity(probabilities.view(), false).unwrap();
        assert!((value.mean() - 4.0).abs() < 1e-4);
    }

    #[test]
    fn bpc_without_sources_is_invalid() {
        let err = compute_metrics(&[MetricKind::Bpc], MetricInputs::default(), false).unwrap_err();
        assert!(matches!(err, MetaError::InvalidArgument(_)));
    }

    #[test]
    fn bpc_prefers_supplied_loss() {
        let predictions = array![[0.5f32, 0.5]].into_dyn();
        let labels = array![[1.0f32, 0.0]].into_dyn();
        let supplied = MetricValue::Scalar(2.0);
        let report = compute_metrics(
            &[MetricKind::Loss, MetricKind::Bpc],
            MetricInputs {
                predictions: Some(predictions.view()),
                labels: Some(labels.view()),
                loss: Some(&supplied),
            },
            false,
        )
        .unwrap();
        assert_eq!(report[&MetricKind::Bpc], bpc(&supplied));
        assert!((report[&MetricKind::Loss].mean() - 2.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn raw_labels_are_one_hot_encoded() {
        let predictions = array![[0.7f32, 0.2, 0.1], [0.1, 0.1, 0.8]].into_dyn();
        let labels = array![0usize, 2].into_dyn();
        let report = compute_metrics_raw_labels(
            &[MetricKind::Accuracy],
            predictions.view(),
            labels.view(),
            None,
            false,
        )
        .unwrap();
        assert_eq!(report[&MetricKind::Accuracy], MetricValue::Scalar(1.0));
    }

    #[test]
    fn raw_labels_outside_vocabulary_are_rejected() {
        let predictions = array![[0.5f32, 0.5]].into_dyn();
        let labels = array![3usize].into_dyn();
        assert!(compute_metrics_raw_labels(
            &[MetricKind::Loss],
            predictions.view(),
            labels.view(),
            None,
            false
        )
        .is_err());
    }

    #[test]
    fn metric_names_round_trip_through_strings() {
        for kind in MetricKind::ALL {
            assert_eq!(kind.as_str().parse::<MetricKind>().unwrap(), kind);
        }
        assert!("entropy".parse::<MetricKind>().is_err());
    }
}

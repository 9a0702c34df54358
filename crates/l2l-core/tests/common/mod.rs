#![allow(dead_code)]

use std::collections::BTreeMap;

use l2l_core::{
    Batch, BatchGenerator, LayerKey, LayerSignals, NetSize, Pupil, PupilEvaluation, PupilVariable,
    Result, Signal,
};
use ndarray::{s, Array2, Axis};

pub const INPUTS: usize = 3;
pub const CELLS: usize = 3;
pub const VOCAB: usize = 2;

/// Routes library events through the shared subscriber; safe to call from every test.
pub fn init_tracing() {
    l2l_config::ensure_tracing().unwrap();
}

/// One tanh layer laid out like an LSTM layer (4 gate blocks, only the first
/// one used) followed by a softmax read-out.
pub struct ToyPupil;

fn variable(variables: &[PupilVariable], layer: LayerKey) -> &Array2<f32> {
    &variables
        .iter()
        .find(|v| v.layer == layer)
        .expect("toy pupil variable")
        .value
}

fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let total = row.sum();
        row.mapv_inplace(|v| v / total);
    }
    out
}

impl Pupil for ToyPupil {
    fn net_size(&self) -> NetSize {
        NetSize {
            num_nodes: vec![CELLS],
            num_output_nodes: vec![],
            embedding_size: None,
        }
    }

    fn trainable_variables(&self) -> Vec<PupilVariable> {
        vec![
            PupilVariable {
                layer: LayerKey::Lstm(0),
                value: Array2::from_shape_fn((INPUTS, 4 * CELLS), |(r, c)| {
                    ((r * 5 + c * 3) % 7) as f32 * 0.05 - 0.15
                }),
            },
            PupilVariable {
                layer: LayerKey::Output(0),
                value: Array2::from_shape_fn((CELLS, VOCAB), |(r, c)| {
                    ((r + 2 * c) % 3) as f32 * 0.1 - 0.1
                }),
            },
        ]
    }

    fn evaluate(&self, variables: &[PupilVariable], batch: &Batch) -> Result<PupilEvaluation> {
        let w_lstm = variable(variables, LayerKey::Lstm(0));
        let w_out = variable(variables, LayerKey::Output(0));

        let pre = batch.inputs.dot(w_lstm);
        let hidden = pre.slice(s![.., 0..CELLS]).mapv(f32::tanh);
        let predictions = softmax_rows(&hidden.dot(w_out));

        let sigma_out = &batch.labels - &predictions;
        let back = sigma_out.dot(&w_out.t()) * hidden.mapv(|h| 1.0 - h * h);
        let mut sigma_lstm = Array2::<f32>::zeros((batch.len(), 4 * CELLS));
        sigma_lstm.slice_mut(s![.., 0..CELLS]).assign(&back);

        let mut layers = BTreeMap::new();
        layers.insert(
            LayerKey::Lstm(0),
            LayerSignals {
                o: Signal::Single(batch.inputs.clone()),
                sigma: Signal::Single(sigma_lstm),
            },
        );
        layers.insert(
            LayerKey::Output(0),
            LayerSignals {
                o: Signal::Single(hidden),
                sigma: Signal::Single(sigma_out),
            },
        );
        Ok(PupilEvaluation {
            predictions,
            layers,
        })
    }
}

/// Replays a fixed list of batches; `restart` rewinds it.
#[derive(Debug, Clone)]
pub struct ReplayBatches {
    batches: Vec<Batch>,
    cursor: usize,
    pub restarts: usize,
}

impl ReplayBatches {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches,
            cursor: 0,
            restarts: 0,
        }
    }
}

impl BatchGenerator for ReplayBatches {
    fn next_batch(&mut self) -> Option<Batch> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        batch
    }

    fn restart(&mut self) {
        self.cursor = 0;
        self.restarts += 1;
    }
}

/// Four rows whose class is the sign of the first input.
pub fn batch(offset: usize) -> Batch {
    let inputs = Array2::from_shape_fn((4, INPUTS), |(r, c)| {
        let sign = if (r + offset) % 2 == 0 { 1.0 } else { -1.0 };
        sign * (1.0 + c as f32 * 0.5) * 0.5
    });
    let mut labels = Array2::<f32>::zeros((4, VOCAB));
    for (row, mut label) in labels.axis_iter_mut(Axis(0)).enumerate() {
        let class = if inputs[[row, 0]] > 0.0 { 0 } else { 1 };
        label[class] = 1.0;
    }
    Batch { inputs, labels }
}

pub fn generators(count: usize, batches_each: usize) -> Vec<ReplayBatches> {
    (0..count)
        .map(|ex| ReplayBatches::new((0..batches_each).map(|b| batch(ex + b)).collect()))
        .collect()
}

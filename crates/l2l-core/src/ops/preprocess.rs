// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};

use crate::error::{MetaError, Result};

/// Log-magnitude / sign encoding of optimizer inputs.
///
/// Appends a channel axis of size 2. Entries with `|x| > e^-p` become
/// `[ln|x| / p, sign(x)]`; smaller entries become `[-1, e^p · x]`.
pub fn log_and_sign(input: ArrayViewD<'_, f32>, p: f32) -> Result<ArrayD<f32>> {
    if !(p.is_finite() && p > 0.0) {
        return Err(MetaError::argument(format!(
            "log_and_sign needs a positive finite p, got {p}"
        )));
    }
    let edge = (-p).exp();
    let scale = p.exp();
    let mut shape = input.shape().to_vec();
    shape.push(2);
    let mut out = ArrayD::<f32>::zeros(IxDyn(&shape));
    let channel_axis = Axis(shape.len() - 1);
    for (mut pair, &x) in out.lanes_mut(channel_axis).into_iter().zip(input.iter()) {
        if x.abs() > edge {
            pair[0] = x.abs().ln() / p;
            pair[1] = x.signum();
        } else {
            pair[0] = -1.0;
            pair[1] = scale * x;
        }
    }
    Ok(out)
}

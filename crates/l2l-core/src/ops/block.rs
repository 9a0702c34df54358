// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};

use crate::error::{MetaError, Result};

/// Places `blocks` along the diagonal of one zero-filled matrix.
///
/// Blocks do not have to be square; the output is `[Σ rows, Σ cols]`.
pub fn block_diagonal(blocks: &[ArrayView2<'_, f32>]) -> Result<Array2<f32>> {
    if blocks.is_empty() {
        return Err(MetaError::argument("block_diagonal needs at least one block"));
    }
    let rows: usize = blocks.iter().map(|b| b.nrows()).sum();
    let cols: usize = blocks.iter().map(|b| b.ncols()).sum();
    let mut out = Array2::<f32>::zeros((rows, cols));
    let (mut r0, mut c0) = (0usize, 0usize);
    for block in blocks {
        let (r, c) = block.dim();
        out.slice_mut(s![r0..r0 + r, c0..c0 + c]).assign(block);
        r0 += r;
        c0 += c;
    }
    Ok(out)
}

/// Exercise-batched [`block_diagonal`]: every block is `[exercises, r_i, c_i]`
/// and exercise `e` of the output is the block diagonal of the blocks' `e`-th slices.
pub fn block_diagonal_batched(blocks: &[ArrayView3<'_, f32>]) -> Result<Array3<f32>> {
    let first = blocks
        .first()
        .ok_or_else(|| MetaError::argument("block_diagonal_batched needs at least one block"))?;
    let exercises = first.len_of(Axis(0));
    for block in blocks {
        if block.len_of(Axis(0)) != exercises {
            return Err(MetaError::shape(
                "block_diagonal_batched",
                &[exercises],
                &[block.len_of(Axis(0))],
            ));
        }
    }
    let rows: usize = blocks.iter().map(|b| b.len_of(Axis(1))).sum();
    let cols: usize = blocks.iter().map(|b| b.len_of(Axis(2))).sum();
    let mut out = Array3::<f32>::zeros((exercises, rows, cols));
    let (mut r0, mut c0) = (0usize, 0usize);
    for block in blocks {
        let (_, r, c) = block.dim();
        out.slice_mut(s![.., r0..r0 + r, c0..c0 + c]).assign(block);
        r0 += r;
        c0 += c;
    }
    Ok(out)
}

/// Per-exercise product `x[e] · m[e]` for `x: [E, rows, n]`, `m: [E, n, k]`.
pub fn batched_matmul(x: ArrayView3<'_, f32>, m: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
    let (ex, rows, n) = x.dim();
    let (mex, mn, k) = m.dim();
    if ex != mex || n != mn {
        return Err(MetaError::shape("batched_matmul", &[ex, n], &[mex, mn]));
    }
    let mut out = Array3::<f32>::zeros((ex, rows, k));
    Zip::from(out.outer_iter_mut())
        .and(x.outer_iter())
        .and(m.outer_iter())
        .for_each(|mut dst, lhs, rhs| dst.assign(&lhs.dot(&rhs)));
    Ok(out)
}

/// Per-exercise product `x[e] · m[e]ᵀ` for `x: [E, rows, k]`, `m: [E, n, k]`.
///
/// With a permutation `m` this is the inverse of [`batched_matmul`].
pub fn batched_matmul_transposed(
    x: ArrayView3<'_, f32>,
    m: ArrayView3<'_, f32>,
) -> Result<Array3<f32>> {
    let (ex, rows, k) = x.dim();
    let (mex, n, mk) = m.dim();
    if ex != mex || k != mk {
        return Err(MetaError::shape(
            "batched_matmul_transposed",
            &[ex, k],
            &[mex, mk],
        ));
    }
    let mut out = Array3::<f32>::zeros((ex, rows, n));
    Zip::from(out.outer_iter_mut())
        .and(x.outer_iter())
        .and(m.outer_iter())
        .for_each(|mut dst, lhs, rhs| dst.assign(&lhs.dot(&rhs.t())));
    Ok(out)
}

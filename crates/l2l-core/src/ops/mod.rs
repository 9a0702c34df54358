// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Tensor-algebra helpers shared by the permutation manager and the cores.

pub mod block;
pub mod preprocess;

pub use block::{batched_matmul, batched_matmul_transposed, block_diagonal, block_diagonal_batched};
pub use preprocess::log_and_sign;

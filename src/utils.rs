// Copyright 2026 The SparseCache Developers. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Utility helpers to support the sparse storage engine.

/// Round up `n` to the next multiple of `d`, divided by `d`.
pub fn div_round_up(n: u64, d: u64) -> u64 {
    debug_assert!(d != 0);
    (n + d - 1) / d
}

/// Round `n` down to a multiple of `d`.
pub fn round_down(n: u64, d: u64) -> u64 {
    debug_assert!(d != 0 && d.is_power_of_two());
    n & !(d - 1)
}

/// Allocate a zeroed buffer of `size` bytes.
pub fn alloc_buf(size: usize) -> Vec<u8> {
    vec![0u8; size]
}

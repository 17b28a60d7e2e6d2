// iota.rs — CPU reference for the index-stamping kernel.
//
// The GPU kernel in gpu/iota.rs writes `buffer[i] = i` for every i in
// [0, N). This module is the authoritative version of that behaviour: the
// GPU output is checked against it element for element, and `verify_iota`
// is the comparison used by the tests, the demo and the benchmarks.
//
// EXACTNESS
// ─────────
// f32 has a 24-bit significand, so every integer in [0, 2^24] is exactly
// representable. Below that bound `i as f32` round-trips and equality is
// exact. Above it the CPU and the GPU both apply round-to-nearest to the
// same u32 index, so the comparison is still exact: both sides hold
// `i as f32`, not `i`.

use thiserror::Error;

/// Largest length for which every stamped value equals its index exactly.
pub const EXACT_F32_LIMIT: usize = 1 << 24;

/// First element of a buffer that does not hold its own index.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("element {index} holds {found}, expected {expected}")]
pub struct IotaMismatch {
    pub index: usize,
    pub expected: f32,
    pub found: f32,
}

/// Write each element's index into `out`.
pub fn fill(out: &mut [f32]) {
    for (i, v) in out.iter_mut().enumerate() {
        *v = i as f32;
    }
}

/// Allocate and fill a reference buffer of `len` elements.
pub fn iota_vec(len: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; len];
    fill(&mut out);
    out
}

/// Check that `buffer[i] == i` for every element.
///
/// Stops at the first mismatch. A NaN never compares equal, so a buffer
/// the device never wrote (if it came back as NaN garbage) is reported at
/// its first element.
pub fn verify_iota(buffer: &[f32]) -> Result<(), IotaMismatch> {
    match buffer
        .iter()
        .enumerate()
        .find(|&(i, &v)| v != i as f32)
    {
        Some((index, &found)) => Err(IotaMismatch {
            index,
            expected: index as f32,
            found,
        }),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

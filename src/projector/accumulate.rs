//! Shared voxel arena for concurrent back-projection.
//!
//! Every LOR adds its contribution directly into one arena, through
//! compare-and-swap loops on the bit patterns of the floats. The order in
//! which threads land their additions is not fixed, so results may differ in
//! the last bits between runs.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Deserialize;

use crate::error::Warning;

/// Width of the floats accumulated in the arena
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit: faster, loses precision once sums exceed 2^24
    Single,
    #[default]
    Double,
}

/// Largest magnitude up to which `f32` represents every integer
const F32_EXACT: f64 = (1_u64 << 24) as f64;

impl Precision {
    /// Warn if data totalling `total` counts are about to be accumulated in
    /// single precision
    pub fn overflow_warning(self, total: f64) -> Option<Warning> {
        (self == Precision::Single && total.abs() > F32_EXACT)
            .then_some(Warning::NumericOverflow { total, max: F32_EXACT })
    }
}

pub enum Accumulator {
    Single(Vec<AtomicU32>),
    Double(Vec<AtomicU64>),
}

impl Accumulator {

    pub fn zeros(precision: Precision, n: usize) -> Self {
        match precision {
            Precision::Single => Self::Single((0..n).map(|_| AtomicU32::new(0.0_f32.to_bits())).collect()),
            Precision::Double => Self::Double((0..n).map(|_| AtomicU64::new(0.0_f64.to_bits())).collect()),
        }
    }

    #[inline]
    pub fn add(&self, i: usize, x: f32) {
        // The closures never return `None`, so neither can `fetch_update` fail
        match self {
            Self::Single(cells) => {
                let _ = cells[i].fetch_update(Ordering::Relaxed, Ordering::Relaxed,
                                              |bits| Some((f32::from_bits(bits) + x).to_bits()));
            }
            Self::Double(cells) => {
                let _ = cells[i].fetch_update(Ordering::Relaxed, Ordering::Relaxed,
                                              |bits| Some((f64::from_bits(bits) + x as f64).to_bits()));
            }
        }
    }

    pub fn len(&self) -> usize {
        match self { Self::Single(c) => c.len(), Self::Double(c) => c.len() }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn into_vec(self) -> Vec<f32> {
        match self {
            Self::Single(cells) => cells.into_iter().map(|c| f32::from_bits(c.into_inner())).collect(),
            Self::Double(cells) => cells.into_iter().map(|c| f64::from_bits(c.into_inner()) as f32).collect(),
        }
    }
}

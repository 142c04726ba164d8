//! Advisory density checks
//!
//! Warns when a source is already so densely compressed that shrinking it
//! further is unlikely to help, and when an output came out larger than its
//! input. Neither check ever blocks the workflow.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Nominal frame rate assumed by the bits-per-pixel estimate; the probe does not report one
const NOMINAL_FPS: f64 = 30.0;

/// Below this many bits per pixel further compression is judged counterproductive
pub const HIGHLY_COMPRESSED_BPP: f64 = 0.06;

/// Estimated bits per pixel per frame, or `None` for degenerate input
pub fn estimated_bits_per_pixel(
    size_bytes: u64,
    duration_secs: f64,
    width: u32,
    height: u32,
) -> Option<f64> {
    if duration_secs.is_nan() || duration_secs <= 0.0 || width == 0 || height == 0 {
        return None;
    }
    let bitrate_kbps = size_bytes as f64 * 8.0 / (duration_secs * 1000.0);
    Some((bitrate_kbps * 1000.0) / (width as f64 * height as f64 * NOMINAL_FPS))
}

/// Whether the source already looks highly compressed
///
/// Returns false for a non-positive duration or a zero dimension.
pub fn is_highly_compressed(size_bytes: u64, duration_secs: f64, width: u32, height: u32) -> bool {
    estimated_bits_per_pixel(size_bytes, duration_secs, width, height)
        .is_some_and(|bpp| bpp < HIGHLY_COMPRESSED_BPP)
}

/// Outcome of comparing output size with input size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SizeOutcome {
    /// Output is smaller than the input
    Reduced { saved_bytes: u64, ratio: f32 },
    /// Output is exactly as large as the input
    Unchanged,
    /// Output is larger; still a successful result
    Increased { extra_bytes: u64, ratio: f32 },
}

impl SizeOutcome {
    pub fn is_increase(&self) -> bool {
        matches!(self, SizeOutcome::Increased { .. })
    }
}

/// Compare output bytes against the original
pub fn compare_sizes(original_bytes: u64, output_bytes: u64) -> SizeOutcome {
    let ratio = if original_bytes > 0 {
        output_bytes as f32 / original_bytes as f32
    } else {
        f32::INFINITY
    };

    match output_bytes.cmp(&original_bytes) {
        Ordering::Less => SizeOutcome::Reduced {
            saved_bytes: original_bytes - output_bytes,
            ratio,
        },
        Ordering::Equal => SizeOutcome::Unchanged,
        Ordering::Greater => SizeOutcome::Increased {
            extra_bytes: output_bytes - original_bytes,
            ratio,
        },
    }
}

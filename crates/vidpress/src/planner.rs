//! Bitrate planning module for vidpress
//!
//! Derives encoder parameters from the source size, duration, resolution and
//! the user's target-size ratio.

use serde::{Deserialize, Serialize};

/// Lowest video bitrate the planner will ever emit (kbps)
pub const MIN_VIDEO_KBPS: u32 = 100;

/// Share of the target bitrate given to video; the rest covers audio and container overhead
const VIDEO_SHARE: f64 = 0.9;

/// Fixed encoder preset
pub const ENCODER_PRESET: &str = "ultrafast";

/// Fixed output pixel format
pub const PIXEL_FORMAT: &str = "yuv420p";

/// Resolution cap applied to the longer edge of the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirective {
    /// Keep the source resolution
    None,
    /// Longer edge capped at 1280 pixels
    Cap1280,
    /// Longer edge capped at 1920 pixels
    Cap1920,
}

impl ScaleDirective {
    /// Longer-edge cap in pixels, if any
    pub fn max_edge(&self) -> Option<u32> {
        match self {
            ScaleDirective::None => None,
            ScaleDirective::Cap1280 => Some(1280),
            ScaleDirective::Cap1920 => Some(1920),
        }
    }

    /// Scale filter expression for the engine.
    ///
    /// Caps whichever edge is longer, keeps the aspect ratio and lets the
    /// encoder pick an even size for the other edge (`-2`).
    pub fn filter(&self, width: u32, height: u32) -> Option<String> {
        let edge = self.max_edge()?;
        if width >= height {
            Some(format!("scale={}:-2", edge))
        } else {
            Some(format!("scale=-2:{}", edge))
        }
    }

    /// Output dimensions produced by [`ScaleDirective::filter`]
    pub fn output_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let Some(edge) = self.max_edge() else {
            return (width, height);
        };
        if width == 0 || height == 0 {
            return (width, height);
        }
        if width >= height {
            (edge, even_scaled(height, edge, width))
        } else {
            (even_scaled(width, edge, height), edge)
        }
    }
}

/// `short * edge / long`, rounded to the nearest even value (at least 2)
fn even_scaled(short: u32, edge: u32, long: u32) -> u32 {
    let exact = short as f64 * edge as f64 / long as f64;
    let even = ((exact / 2.0).round() * 2.0) as u32;
    even.max(2)
}

/// How audio is handled in the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioHandling {
    /// Audio streams are copied without re-encoding
    Passthrough,
}

/// Encoder parameters produced by [`plan`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeParameters {
    /// Target video bitrate in kbps
    pub video_bitrate_kbps: u32,
    /// Rate-control buffer size in kbps (2x bitrate)
    pub buffer_size_kbps: u32,
    /// Peak bitrate in kbps (1.2x bitrate, floored)
    pub max_rate_kbps: u32,
    /// Resolution cap
    pub scale: ScaleDirective,
    pub preset: &'static str,
    pub pixel_format: &'static str,
    pub audio: AudioHandling,
}

/// Duration-aware upper bound for the video bitrate (kbps)
///
/// - ≤ 30s: 30000
/// - ≤ 120s: 20000
/// - ≤ 300s: 10000
/// - otherwise: 5000
pub fn bitrate_cap_kbps(duration_secs: f64) -> u32 {
    if duration_secs <= 30.0 {
        30_000
    } else if duration_secs <= 120.0 {
        20_000
    } else if duration_secs <= 300.0 {
        10_000
    } else {
        5_000
    }
}

/// Select the resolution cap for a ratio and source resolution
///
/// Aggressive ratios (< 40%) cap at 1280, moderate ones (< 60%) at 1920;
/// sources already within the cap are left alone.
pub fn select_scale(ratio_percent: u8, width: u32, height: u32) -> ScaleDirective {
    let longer = width.max(height);
    if ratio_percent < 40 && longer > 1280 {
        ScaleDirective::Cap1280
    } else if ratio_percent < 60 && longer > 1920 {
        ScaleDirective::Cap1920
    } else {
        ScaleDirective::None
    }
}

/// Plan encoder parameters for a target-size ratio
///
/// `duration_secs` must be positive; [`crate::SourceAsset`] guarantees it.
pub fn plan(
    original_size_bytes: u64,
    duration_secs: f64,
    ratio_percent: u8,
    width: u32,
    height: u32,
) -> EncodeParameters {
    let target_bits = original_size_bytes as f64 * 8.0 * (ratio_percent as f64 / 100.0);
    let target_bps = target_bits / duration_secs;
    let video_kbps = (target_bps * VIDEO_SHARE / 1000.0).floor();

    let cap = bitrate_cap_kbps(duration_secs);
    // NaN and infinities collapse onto the bounds here
    let video_bitrate_kbps = if video_kbps.is_nan() {
        MIN_VIDEO_KBPS
    } else {
        video_kbps.clamp(MIN_VIDEO_KBPS as f64, cap as f64) as u32
    };

    EncodeParameters {
        video_bitrate_kbps,
        buffer_size_kbps: video_bitrate_kbps * 2,
        max_rate_kbps: (video_bitrate_kbps as f64 * 1.2).floor() as u32,
        scale: select_scale(ratio_percent, width, height),
        preset: ENCODER_PRESET,
        pixel_format: PIXEL_FORMAT,
        audio: AudioHandling::Passthrough,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MB: u64 = 1_000_000;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_bitrate_within_bounds(
            size in 1u64..=20_000 * MB,
            duration in 0.01f64..20_000.0,
            ratio in 1u8..=100,
            width in 1u32..8192,
            height in 1u32..8192,
        ) {
            let params = plan(size, duration, ratio, width, height);
            prop_assert!(params.video_bitrate_kbps >= MIN_VIDEO_KBPS);
            prop_assert!(params.video_bitrate_kbps <= bitrate_cap_kbps(duration));
        }

        #[test]
        fn prop_buffer_and_max_rate(
            size in 1u64..=20_000 * MB,
            duration in 0.01f64..20_000.0,
            ratio in 1u8..=100,
        ) {
            let params = plan(size, duration, ratio, 1920, 1080);
            prop_assert_eq!(params.buffer_size_kbps, params.video_bitrate_kbps * 2);
            prop_assert_eq!(
                params.max_rate_kbps,
                (params.video_bitrate_kbps as f64 * 1.2).floor() as u32
            );
            prop_assert!(params.max_rate_kbps >= params.video_bitrate_kbps);
        }

        #[test]
        fn prop_cap_table(duration in 0.001f64..100_000.0) {
            let cap = bitrate_cap_kbps(duration);
            let expected = if duration <= 30.0 {
                30_000
            } else if duration <= 120.0 {
                20_000
            } else if duration <= 300.0 {
                10_000
            } else {
                5_000
            };
            prop_assert_eq!(cap, expected);
        }

        #[test]
        fn prop_scale_monotonic_in_ratio(
            low in 1u8..=100,
            high in 1u8..=100,
            longer in 1921u32..8192,
            shorter in 1u32..1921,
            portrait in proptest::bool::ANY,
        ) {
            prop_assume!(low <= high);
            let (w, h) = if portrait { (shorter, longer) } else { (longer, shorter) };

            fn rank(s: ScaleDirective) -> u8 {
                match s {
                    ScaleDirective::Cap1280 => 0,
                    ScaleDirective::Cap1920 => 1,
                    ScaleDirective::None => 2,
                }
            }

            // a higher ratio never scales more aggressively
            prop_assert!(rank(select_scale(low, w, h)) <= rank(select_scale(high, w, h)));
        }

        #[test]
        fn prop_scaled_output_is_even_and_capped(
            width in 2u32..8192,
            height in 2u32..8192,
            ratio in 1u8..=100,
        ) {
            let scale = select_scale(ratio, width, height);
            let (ow, oh) = scale.output_dimensions(width, height);
            if let Some(edge) = scale.max_edge() {
                prop_assert_eq!(ow.max(oh), edge);
                prop_assert_eq!(ow % 2, 0);
                prop_assert_eq!(oh % 2, 0);
            } else {
                prop_assert_eq!((ow, oh), (width, height));
            }
        }
    }

    #[test]
    fn test_scale_regions_for_4k() {
        assert_eq!(select_scale(10, 3840, 2160), ScaleDirective::Cap1280);
        assert_eq!(select_scale(39, 3840, 2160), ScaleDirective::Cap1280);
        assert_eq!(select_scale(40, 3840, 2160), ScaleDirective::Cap1920);
        assert_eq!(select_scale(59, 3840, 2160), ScaleDirective::Cap1920);
        assert_eq!(select_scale(60, 3840, 2160), ScaleDirective::None);
        assert_eq!(select_scale(100, 3840, 2160), ScaleDirective::None);
    }

    #[test]
    fn test_small_sources_never_scale() {
        assert_eq!(select_scale(1, 1280, 720), ScaleDirective::None);
        assert_eq!(select_scale(50, 1920, 1080), ScaleDirective::None);
        assert_eq!(select_scale(50, 1080, 1920), ScaleDirective::None);
    }

    #[test]
    fn test_scenario_ratio_70_unclamped() {
        // 100MB, 100s, 70% -> 5.6 Mbps total, 5040 kbps video
        let params = plan(100 * MB, 100.0, 70, 1920, 1080);
        assert_eq!(params.video_bitrate_kbps, 5040);
        assert_eq!(params.buffer_size_kbps, 10080);
        assert_eq!(params.max_rate_kbps, 6048);
        assert_eq!(params.scale, ScaleDirective::None);
        assert_eq!(params.preset, "ultrafast");
        assert_eq!(params.pixel_format, "yuv420p");
        assert_eq!(params.audio, AudioHandling::Passthrough);
    }

    #[test]
    fn test_scenario_ratio_10_scales_to_1280() {
        // 100MB, 100s, 10% -> 0.8 Mbps total, 720 kbps video
        let params = plan(100 * MB, 100.0, 10, 1920, 1080);
        assert_eq!(params.video_bitrate_kbps, 720);
        assert_eq!(params.scale, ScaleDirective::Cap1280);
        assert_eq!(params.scale.output_dimensions(1920, 1080), (1280, 720));
    }

    #[test]
    fn test_clamped_to_floor_and_cap() {
        let tiny = plan(10_000, 600.0, 1, 640, 360);
        assert_eq!(tiny.video_bitrate_kbps, MIN_VIDEO_KBPS);

        let huge = plan(4_000 * MB, 10.0, 100, 640, 360);
        assert_eq!(huge.video_bitrate_kbps, 30_000);
    }

    #[test]
    fn test_filter_expression_follows_orientation() {
        assert_eq!(
            ScaleDirective::Cap1280.filter(1920, 1080).as_deref(),
            Some("scale=1280:-2")
        );
        assert_eq!(
            ScaleDirective::Cap1920.filter(2160, 3840).as_deref(),
            Some("scale=-2:1920")
        );
        assert_eq!(ScaleDirective::None.filter(1920, 1080), None);
    }

    #[test]
    fn test_portrait_output_dimensions() {
        assert_eq!(
            ScaleDirective::Cap1280.output_dimensions(1080, 1920),
            (720, 1280)
        );
        // 1366x768 -> 1280x719.6 -> even 720
        assert_eq!(
            ScaleDirective::Cap1280.output_dimensions(1366, 768),
            (1280, 720)
        );
    }
}

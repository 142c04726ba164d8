//! Engine argument construction
//!
//! Builds the argument vector for one compression job from planned
//! parameters. The order is fixed so logs are comparable between runs.

use crate::planner::{AudioHandling, EncodeParameters};

/// Video codec used for every output
pub const VIDEO_CODEC: &str = "libx264";

/// Muxing queue size; avoids "too many packets buffered" on sparse audio
const MAX_MUXING_QUEUE_SIZE: u32 = 1024;

/// Build the engine argument vector for one job
///
/// Produces, in order:
/// `-i <input> -c:v libx264 -b:v <N>k -bufsize <2N>k -maxrate <M>k
/// -preset ultrafast -pix_fmt yuv420p -threads <T> -max_muxing_queue_size 1024
/// -c:a copy [-vf <scale>] <output>`
///
/// `width` and `height` are the source dimensions; they only decide the
/// orientation of the scale filter.
pub fn build_exec_args(
    params: &EncodeParameters,
    input: &str,
    output: &str,
    threads: usize,
    width: u32,
    height: u32,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(24);

    args.push("-i".into());
    args.push(input.into());

    args.push("-c:v".into());
    args.push(VIDEO_CODEC.into());

    args.push("-b:v".into());
    args.push(format!("{}k", params.video_bitrate_kbps));
    args.push("-bufsize".into());
    args.push(format!("{}k", params.buffer_size_kbps));
    args.push("-maxrate".into());
    args.push(format!("{}k", params.max_rate_kbps));

    args.push("-preset".into());
    args.push(params.preset.into());
    args.push("-pix_fmt".into());
    args.push(params.pixel_format.into());

    args.push("-threads".into());
    args.push(threads.max(1).to_string());

    args.push("-max_muxing_queue_size".into());
    args.push(MAX_MUXING_QUEUE_SIZE.to_string());

    match params.audio {
        AudioHandling::Passthrough => {
            args.push("-c:a".into());
            args.push("copy".into());
        }
    }

    if let Some(filter) = params.scale.filter(width, height) {
        args.push("-vf".into());
        args.push(filter);
    }

    args.push(output.into());
    args
}

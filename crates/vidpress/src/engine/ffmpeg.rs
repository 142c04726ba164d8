//! ffmpeg process engine
//!
//! Runs the encoder as a child process inside a private temporary working
//! directory. Progress comes from `-progress pipe:1` key/value lines on
//! stdout; stderr lines are forwarded as logs and scanned for the input
//! duration so a fraction can be reported.

use super::{CoreSource, CoreVariant, Engine, EngineError, EngineFactory, EventSink, FileData, LogKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Arguments placed before every job's own arguments
const JOB_PREAMBLE: &[&str] = &["-hide_banner", "-nostats", "-progress", "pipe:1", "-y"];

/// Stderr lines kept for the failure message
const STDERR_TAIL_LINES: usize = 20;

/// Major version from an `ffmpeg -version` banner
///
/// Release banners read `ffmpeg version 6.1.1`, tagged git builds
/// `ffmpeg version n7.0-...`. Snapshot builds (`N-112233-g...`) carry no
/// version and are refused.
pub fn banner_major_version(banner: &str) -> Option<u32> {
    banner.lines().find_map(|line| {
        let (_, rest) = line.split_once("ffmpeg version ")?;
        let tag = rest.split_whitespace().next()?;
        let tag = tag.strip_prefix('n').unwrap_or(tag);
        let digits: String = tag.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    })
}

/// Input duration from an ffmpeg stderr line such as
/// `  Duration: 00:01:40.00, start: 0.000000, bitrate: 8000 kb/s`
pub fn parse_duration_line(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix("Duration:")?;
    let stamp = rest.split(',').next()?.trim();
    let mut parts = stamp.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total > 0.0).then_some(total)
}

/// Accumulates `-progress` key/value pairs until a `progress=` line closes a block
#[derive(Debug, Default)]
struct ProgressState {
    out_time_secs: f64,
    complete: bool,
}

impl ProgressState {
    /// Returns true when the line ends a progress block
    fn update(&mut self, key: &str, value: &str) -> bool {
        match key {
            // out_time_ms is in microseconds too, despite the name
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.trim().parse::<f64>() {
                    self.out_time_secs = (us / 1_000_000.0).max(0.0);
                }
                false
            }
            "progress" => {
                self.complete = value.trim() == "end";
                true
            }
            _ => false,
        }
    }

    fn fraction(&self, total_secs: Option<f64>) -> f64 {
        if self.complete {
            return 1.0;
        }
        match total_secs {
            Some(total) if total > 0.0 => (self.out_time_secs / total).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}

/// Resolve a storage name inside the working directory
fn storage_path(dir: &Path, name: &str) -> Result<PathBuf, EngineError> {
    let escapes = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(|c| c == '/' || c == '\\');
    if escapes {
        return Err(EngineError::InvalidName(name.to_string()));
    }
    Ok(dir.join(name))
}

#[derive(Default)]
struct Loaded {
    program: Option<PathBuf>,
    workdir: Option<TempDir>,
}

/// [`Engine`] backed by an ffmpeg binary
pub struct FfmpegEngine {
    variant: CoreVariant,
    sink: EventSink,
    loaded: Mutex<Loaded>,
    terminated: watch::Sender<bool>,
}

impl FfmpegEngine {
    pub fn new(variant: CoreVariant, sink: EventSink) -> Self {
        let (terminated, _) = watch::channel(false);
        Self {
            variant,
            sink,
            loaded: Mutex::new(Loaded::default()),
            terminated,
        }
    }

    fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    fn program_and_dir(&self) -> Result<(PathBuf, PathBuf), EngineError> {
        if self.is_terminated() {
            return Err(EngineError::Terminated);
        }
        let loaded = self.loaded.lock();
        match (&loaded.program, &loaded.workdir) {
            (Some(program), Some(dir)) => Ok((program.clone(), dir.path().to_path_buf())),
            _ => Err(EngineError::NotLoaded),
        }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, EngineError> {
        let (_, dir) = self.program_and_dir()?;
        storage_path(&dir, name)
    }
}

#[async_trait]
impl Engine for FfmpegEngine {
    async fn load(&self, core: &CoreSource) -> Result<(), EngineError> {
        if self.is_terminated() {
            return Err(EngineError::Terminated);
        }

        let output = Command::new(&core.location)
            .arg("-version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::CoreUnavailable(format!("{}: {}", core.location, e)))?;

        if !output.status.success() {
            return Err(EngineError::CoreUnavailable(format!(
                "{} -version exited with {}",
                core.location, output.status
            )));
        }

        let banner = String::from_utf8_lossy(&output.stdout);
        let major = banner_major_version(&banner).ok_or_else(|| {
            EngineError::CoreUnavailable(format!(
                "could not parse ffmpeg version from: {}",
                banner.lines().next().unwrap_or("(empty)")
            ))
        })?;

        let workdir = tempfile::Builder::new().prefix("vidpress-").tempdir()?;
        {
            let mut loaded = self.loaded.lock();
            if self.is_terminated() {
                return Err(EngineError::Terminated);
            }
            loaded.program = Some(PathBuf::from(&core.location));
            loaded.workdir = Some(workdir);
        }

        info!(core = %core.location, major, variant = self.variant.as_str(), "ffmpeg core loaded");
        self.sink.log(
            LogKind::Info,
            format!("ffmpeg {} loaded ({})", major, self.variant.as_str()),
        );
        Ok(())
    }

    async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), EngineError> {
        let path = self.path_for(name)?;
        tokio::fs::write(&path, data).await?;
        debug!(name, bytes = data.len(), "wrote engine file");
        Ok(())
    }

    async fn exec(&self, args: &[String]) -> Result<(), EngineError> {
        // subscribe before the terminated check so a concurrent terminate is seen
        let mut terminated = self.terminated.subscribe();
        let (program, dir) = self.program_and_dir()?;

        let mut cmd = Command::new(&program);
        cmd.args(JOB_PREAMBLE)
            .args(args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %program.display(), ?args, "starting ffmpeg job");
        let mut child = cmd.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "ffmpeg stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "ffmpeg stderr not captured"))?;

        let total_secs = Arc::new(Mutex::new(None));
        let stderr_task = tokio::spawn(forward_stderr(stderr, self.sink.clone(), Arc::clone(&total_secs)));
        let progress_task = tokio::spawn(forward_progress(stdout, self.sink.clone(), total_secs));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = terminated.changed() => {
                warn!("ffmpeg job interrupted by terminate");
                let _ = child.kill().await;
                progress_task.abort();
                stderr_task.abort();
                return Err(EngineError::Terminated);
            }
        };

        let _ = progress_task.await;
        let tail = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            Err(EngineError::ExecFailed {
                code: status.code(),
                detail: tail.into_iter().collect::<Vec<_>>().join("\n"),
            })
        }
    }

    async fn read_file(&self, name: &str) -> Result<FileData, EngineError> {
        let path = self.path_for(name)?;
        Ok(FileData::Owned(tokio::fs::read(&path).await?))
    }

    async fn delete_file(&self, name: &str) -> Result<(), EngineError> {
        let path = self.path_for(name)?;
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    fn terminate(&self) {
        self.terminated.send_replace(true);
        let workdir = {
            let mut loaded = self.loaded.lock();
            loaded.program = None;
            loaded.workdir.take()
        };
        if let Some(dir) = workdir {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "failed to remove engine working directory");
            }
        }
    }
}

async fn forward_progress<R: AsyncRead + Unpin>(
    stdout: R,
    sink: EventSink,
    total_secs: Arc<Mutex<Option<f64>>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut state = ProgressState::default();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if state.update(key.trim(), value) {
            let total = *total_secs.lock();
            sink.progress(state.fraction(total), state.out_time_secs);
        }
    }
}

async fn forward_stderr<R: AsyncRead + Unpin>(
    stderr: R,
    sink: EventSink,
    total_secs: Arc<Mutex<Option<f64>>>,
) -> VecDeque<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        {
            let mut total = total_secs.lock();
            if total.is_none() {
                *total = parse_duration_line(&line);
            }
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.clone());
        sink.log(LogKind::Stderr, line);
    }
    tail
}

/// Creates [`FfmpegEngine`] instances
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegFactory;

impl EngineFactory for FfmpegFactory {
    fn create(&self, variant: CoreVariant, events: EventSink) -> Arc<dyn Engine> {
        Arc::new(FfmpegEngine::new(variant, events))
    }
}

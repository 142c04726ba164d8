//! vidpress terminal UI
//!
//! Pick a video, choose how small it should get, compress it with ffmpeg and
//! save the result. Logs go to the configured log file so the terminal stays
//! clean.

mod app;
mod ui;

use anyhow::{Context, Result};
use app::App;
use clap::Parser;
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::fs::OpenOptions;
use std::io::{self, Stdout};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vidpress::config::LogConfig;
use vidpress::{
    BlobStore, Config, EngineManager, EngineSettings, FfmpegFactory, FfprobeProbe, NativeHost,
    SessionController, Workflow,
};

/// vidpress - shrink a video to a target share of its size
#[derive(Parser, Debug)]
#[command(name = "vidpress")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "vidpress.toml")]
    config: PathBuf,

    /// Directory compressed files are saved into
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Video to open on start
    file: Option<PathBuf>,
}

fn init_logging(cfg: &LogConfig) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.file)
        .with_context(|| format!("opening log file {}", cfg.file.display()))?;

    let filter = EnvFilter::try_new(&cfg.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("initializing logging: {}", e))
}

/// Initialize the terminal for TUI rendering
fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restore terminal to normal state
fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load_or_default(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    init_logging(&config.log)?;
    info!(config = %args.config.display(), "vidpress starting");

    let manager = Arc::new(EngineManager::new(
        Arc::new(FfmpegFactory),
        Arc::new(NativeHost),
        EngineSettings::from_config(&config.engine),
    ));
    let controller = Arc::new(SessionController::new(
        Arc::clone(&manager),
        Arc::new(BlobStore::new()),
    ));
    let probe = Arc::new(FfprobeProbe::from_config(&config.probe));
    let workflow = Workflow::new(controller, probe, config.compression.default_ratio);

    let mut app = App::new(workflow, args.output_dir);
    app.load_engine();
    if let Some(file) = args.file {
        app.open(file);
    }

    let mut terminal = setup_terminal()?;
    let result = app.run(&mut terminal).await;
    restore_terminal(&mut terminal)?;

    manager.terminate();
    info!("vidpress exiting");
    result
}

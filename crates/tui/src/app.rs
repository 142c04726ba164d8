//! Application state and input handling

use crate::ui;
use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::collections::VecDeque;
use std::io::Stdout;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use vidpress::{
    AcceptError, CompressionResult, EngineEvent, EngineManager, EngineState, LoadError, LogKind,
    SessionError, SourceAsset, Workflow, WorkflowState,
};

const MAX_EVENT_LOG_ENTRIES: usize = 200;
const INPUT_POLL: Duration = Duration::from_millis(50);

/// Results of background work, delivered back to the UI loop
pub enum Message {
    EngineLoaded(Result<(), LoadError>),
    /// Tagged with the open it answers; only the latest one is applied
    Opened(u64, Result<SourceAsset, AcceptError>),
    Finished(u64, Result<CompressionResult, SessionError>),
}

/// What keystrokes currently edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Path(String),
    ExportName(String),
}

pub struct App {
    pub workflow: Workflow,
    pub output_dir: PathBuf,
    pub mode: InputMode,
    /// Engine log lines and app notices, newest last
    pub event_log: VecDeque<String>,
    /// One-line status shown above the key help
    pub notice: Option<String>,
    /// A file is being read and probed
    pub opening: bool,
    /// Id of the most recent open
    open_seq: u64,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    engine_events: broadcast::Receiver<EngineEvent>,
    should_quit: bool,
}

impl App {
    pub fn new(workflow: Workflow, output_dir: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine_events = workflow.controller().manager().subscribe();
        Self {
            workflow,
            output_dir,
            mode: InputMode::Normal,
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG_ENTRIES),
            notice: None,
            opening: false,
            open_seq: 0,
            tx,
            rx,
            engine_events,
            should_quit: false,
        }
    }

    fn manager(&self) -> Arc<EngineManager> {
        Arc::clone(self.workflow.controller().manager())
    }

    pub fn engine_state(&self) -> EngineState {
        self.workflow.controller().manager().state()
    }

    pub fn log_event(&mut self, event: impl Into<String>) {
        if self.event_log.len() >= MAX_EVENT_LOG_ENTRIES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event.into());
    }

    fn notify(&mut self, notice: impl Into<String>) {
        let notice = notice.into();
        self.log_event(notice.clone());
        self.notice = Some(notice);
    }

    /// Load the engine in the background
    pub fn load_engine(&mut self) {
        let manager = self.manager();
        let tx = self.tx.clone();
        self.log_event("Loading compression engine...");
        tokio::spawn(async move {
            let result = manager.load().await;
            let _ = tx.send(Message::EngineLoaded(result));
        });
    }

    /// Terminate and load again, e.g. after a cancel
    fn reload_engine(&mut self) {
        let manager = self.manager();
        let tx = self.tx.clone();
        self.log_event("Reloading compression engine...");
        tokio::spawn(async move {
            let result = manager.reload().await;
            let _ = tx.send(Message::EngineLoaded(result));
        });
    }

    /// Read and probe a file in the background
    pub fn open(&mut self, path: PathBuf) {
        if self.workflow.state() == WorkflowState::Running {
            self.notify("Cannot open a file while compressing");
            return;
        }
        let probe = Arc::clone(self.workflow.probe());
        let tx = self.tx.clone();
        let id = self.begin_open();
        self.notice = Some(format!("Opening {}...", path.display()));
        tokio::spawn(async move {
            let opened = SourceAsset::open(&path, None, probe.as_ref()).await;
            let _ = tx.send(Message::Opened(id, opened));
        });
    }

    /// Supersede any open still in flight
    fn begin_open(&mut self) -> u64 {
        self.open_seq += 1;
        self.opening = true;
        self.open_seq
    }

    fn start(&mut self) {
        match self.workflow.start() {
            Ok(ticket) => {
                let tx = self.tx.clone();
                self.notice = None;
                self.log_event(format!(
                    "Compressing to {}% of the original size",
                    self.workflow.ratio_percent()
                ));
                tokio::spawn(async move {
                    let outcome = ticket.run().await;
                    let _ = tx.send(Message::Finished(ticket.id(), outcome));
                });
            }
            Err(e) => self.notify(e.to_string()),
        }
    }

    fn cancel(&mut self) {
        if self.workflow.cancel().is_ok() {
            self.notify("Compression cancelled; reloading engine");
            self.reload_engine();
        }
    }

    async fn save(&mut self) {
        match self.workflow.save(&self.output_dir).await {
            Ok(path) => self.notify(format!("Saved {}", path.display())),
            Err(e) => self.notify(format!("Save failed: {}", e)),
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::EngineLoaded(Ok(())) => {
                let variant = self
                    .workflow
                    .controller()
                    .manager()
                    .variant()
                    .map(|v| v.as_str())
                    .unwrap_or("unknown");
                self.log_event(format!("Engine ready ({})", variant));
            }
            Message::EngineLoaded(Err(LoadError::Superseded)) => {}
            Message::EngineLoaded(Err(e)) => {
                warn!(error = %e, "engine load failed");
                self.notify(e.user_message());
            }
            Message::Opened(id, _) if id != self.open_seq => {
                debug!(open = id, latest = self.open_seq, "dropping result of a superseded open");
            }
            Message::Opened(_, opened) => {
                self.opening = false;
                self.notice = None;
                if let Err(e) = self.workflow.accept(opened) {
                    self.notify(e.to_string());
                } else if let Some(failure) = self.workflow.failure() {
                    let message = failure.message.clone();
                    self.log_event(message);
                } else if let Some(asset) = self.workflow.asset() {
                    let line = format!("Opened {}", asset.name());
                    self.log_event(line);
                }
            }
            Message::Finished(id, outcome) => {
                self.workflow.finish(id, outcome);
                match self.workflow.state() {
                    WorkflowState::Succeeded => {
                        let warning = if self.workflow.size_increase_warning() {
                            " (output is larger than the input)"
                        } else {
                            ""
                        };
                        self.log_event(format!("Compression finished{}", warning));
                    }
                    WorkflowState::Failed => {
                        if let Some(failure) = self.workflow.failure() {
                            let message = failure.message.clone();
                            self.log_event(message);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn drain_messages(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.handle_message(message);
        }
    }

    fn drain_engine_events(&mut self) {
        loop {
            match self.engine_events.try_recv() {
                Ok(EngineEvent::Log { kind, message }) => {
                    if kind != LogKind::Stdout {
                        self.log_event(message);
                    }
                }
                Ok(EngineEvent::Progress { .. }) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    async fn handle_key(&mut self, code: KeyCode) {
        match std::mem::replace(&mut self.mode, InputMode::Normal) {
            InputMode::Path(mut buffer) => match code {
                KeyCode::Enter => {
                    let path = buffer.trim().to_string();
                    if !path.is_empty() {
                        self.open(PathBuf::from(path));
                    }
                }
                KeyCode::Esc => {}
                KeyCode::Backspace => {
                    buffer.pop();
                    self.mode = InputMode::Path(buffer);
                }
                KeyCode::Char(c) => {
                    buffer.push(c);
                    self.mode = InputMode::Path(buffer);
                }
                _ => self.mode = InputMode::Path(buffer),
            },
            InputMode::ExportName(mut buffer) => match code {
                KeyCode::Enter => {
                    if let Err(e) = self.workflow.set_export_name(&buffer) {
                        self.notify(e.to_string());
                    }
                }
                KeyCode::Esc => {}
                KeyCode::Backspace => {
                    buffer.pop();
                    self.mode = InputMode::ExportName(buffer);
                }
                KeyCode::Char(c) => {
                    buffer.push(c);
                    self.mode = InputMode::ExportName(buffer);
                }
                _ => self.mode = InputMode::ExportName(buffer),
            },
            InputMode::Normal => self.handle_normal_key(code).await,
        }
    }

    async fn handle_normal_key(&mut self, code: KeyCode) {
        let state = self.workflow.state();
        match code {
            KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => {
                if state == WorkflowState::Running {
                    let _ = self.workflow.cancel();
                }
                self.should_quit = true;
            }
            KeyCode::Char('o') if state != WorkflowState::Running => {
                self.mode = InputMode::Path(String::new());
            }
            KeyCode::Left => self.adjust_ratio(-1),
            KeyCode::Right => self.adjust_ratio(1),
            KeyCode::Down => self.adjust_ratio(-10),
            KeyCode::Up => self.adjust_ratio(10),
            KeyCode::Char(c @ '1'..='4') if state == WorkflowState::Configuring => {
                let index = c as usize - '1' as usize;
                let _ = self.workflow.apply_preset(index);
            }
            KeyCode::Enter | KeyCode::Char('s') if state == WorkflowState::Configuring => {
                self.start()
            }
            KeyCode::Char('c') if state == WorkflowState::Running => self.cancel(),
            KeyCode::Char('p') if state == WorkflowState::Succeeded => {
                let _ = self.workflow.toggle_preview();
            }
            KeyCode::Char('n') if state == WorkflowState::Succeeded => {
                self.mode = InputMode::ExportName(self.workflow.export_name().to_string());
            }
            KeyCode::Char('w') if state == WorkflowState::Succeeded => self.save().await,
            KeyCode::Char('r') => {
                if self.engine_state() == EngineState::Error {
                    self.reload_engine();
                } else if let Err(e) = self.workflow.retry() {
                    self.notify(e.to_string());
                }
            }
            KeyCode::Char('d') => match self.workflow.discard() {
                Ok(()) => self.notice = None,
                Err(e) => self.notify(e.to_string()),
            },
            _ => {}
        }
    }

    fn adjust_ratio(&mut self, delta: i16) {
        if self.workflow.state() == WorkflowState::Configuring {
            let _ = self.workflow.adjust_ratio(delta);
        }
    }

    /// Main application loop
    pub async fn run(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        info!("ui loop started");
        loop {
            self.drain_messages();
            self.drain_engine_events();

            terminal.draw(|f| ui::draw(f, self))?;

            // Short timeout keeps progress and the ticker moving
            if event::poll(INPUT_POLL)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_key(key.code).await;
                    }
                }
            }

            if self.should_quit {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidpress::{
        BlobStore, EngineSettings, FfmpegFactory, FfprobeProbe, NativeHost, SessionController,
        UnsupportedFormat,
    };

    fn app() -> App {
        let manager = Arc::new(EngineManager::new(
            Arc::new(FfmpegFactory),
            Arc::new(NativeHost),
            EngineSettings::default(),
        ));
        let controller = Arc::new(SessionController::new(manager, Arc::new(BlobStore::new())));
        let probe = Arc::new(FfprobeProbe::new("ffprobe", Duration::from_secs(1)));
        App::new(Workflow::new(controller, probe, 70), PathBuf::from("."))
    }

    fn rejected(name: &str) -> Result<SourceAsset, AcceptError> {
        Err(AcceptError::Unsupported(UnsupportedFormat {
            name: name.to_string(),
        }))
    }

    #[test]
    fn test_late_result_of_an_earlier_open_is_dropped() {
        let mut app = app();
        let first = app.begin_open();
        let second = app.begin_open();

        app.handle_message(Message::Opened(second, rejected("second.txt")));
        assert!(!app.opening);
        let message = app.workflow.failure().map(|f| f.message.clone()).unwrap();
        assert!(message.contains("second.txt"));

        app.handle_message(Message::Opened(first, rejected("first.txt")));
        let message = app.workflow.failure().map(|f| f.message.clone()).unwrap();
        assert!(message.contains("second.txt"));
    }

    #[test]
    fn test_opening_stays_set_until_the_latest_open_answers() {
        let mut app = app();
        let first = app.begin_open();
        let _second = app.begin_open();

        app.handle_message(Message::Opened(first, rejected("first.txt")));
        assert!(app.opening);
        assert!(app.workflow.failure().is_none());
    }
}

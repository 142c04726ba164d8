//! Widget rendering

use crate::app::{App, InputMode};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Gauge, Paragraph, Row, Table, Wrap},
    Frame,
};
use std::time::Duration;
use vidpress::{plan, EngineState, PreviewMode, SizeOutcome, WorkflowState, RATIO_PRESETS};

/// Format a byte count using binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Format duration in seconds to human-readable string
pub fn format_duration(secs: f64) -> String {
    let total_secs = if secs.is_finite() && secs > 0.0 {
        secs as u64
    } else {
        0
    };
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.1}s", elapsed.as_secs_f64())
}

fn engine_label(state: EngineState) -> (&'static str, Color) {
    match state {
        EngineState::Idle => ("engine idle", Color::Gray),
        EngineState::Loading => ("engine loading", Color::Yellow),
        EngineState::Ready => ("engine ready", Color::Green),
        EngineState::Error => ("engine error", Color::Red),
    }
}

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let (engine, color) = engine_label(app.engine_state());
    let line = Line::from(vec![
        Span::styled(" vidpress ", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("| "),
        Span::styled(engine, Style::default().fg(color)),
        Span::raw(" | "),
        Span::raw(app.workflow.state().as_str()),
    ]);
    f.render_widget(
        Paragraph::new(line).style(Style::default().bg(Color::DarkGray)),
        area,
    );
}

fn render_source(f: &mut Frame, area: Rect, app: &App) {
    let mut lines = Vec::new();
    match app.workflow.asset() {
        Some(asset) => {
            lines.push(Line::from(format!("File:       {}", asset.name())));
            lines.push(Line::from(format!(
                "Size:       {}",
                format_bytes(asset.size_bytes())
            )));
            lines.push(Line::from(format!(
                "Duration:   {}",
                format_duration(asset.duration_secs())
            )));
            lines.push(Line::from(format!(
                "Resolution: {}x{}",
                asset.width(),
                asset.height()
            )));
            if app.workflow.highly_compressed_warning() {
                lines.push(Line::from(Span::styled(
                    "This video is already highly compressed; it may not get much smaller.",
                    Style::default().fg(Color::Yellow),
                )));
            }
        }
        None if app.opening => lines.push(Line::from("Reading file...")),
        None => lines.push(Line::from("No file. Press 'o' to open one.")),
    }

    if let Some(failure) = app.workflow.failure() {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            failure.message.clone(),
            Style::default().fg(Color::Red),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(" Source "))
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn render_settings(f: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)])
        .split(area);

    let ratio = app.workflow.ratio_percent();
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Target size "))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(ratio as f64 / 100.0)
        .label(format!("{}% of original", ratio));
    f.render_widget(gauge, chunks[0]);

    let presets = RATIO_PRESETS
        .iter()
        .enumerate()
        .map(|(i, p)| format!("[{}] {}%", i + 1, p))
        .collect::<Vec<_>>()
        .join("  ");

    let mut rows = vec![Row::new(vec![Cell::from("Presets"), Cell::from(presets)])];
    if let Some(asset) = app.workflow.asset() {
        let params = plan(
            asset.size_bytes(),
            asset.duration_secs(),
            ratio,
            asset.width(),
            asset.height(),
        );
        let (w, h) = params.scale.output_dimensions(asset.width(), asset.height());
        let estimate = asset.size_bytes() * ratio as u64 / 100;
        rows.push(Row::new(vec![
            Cell::from("Video bitrate"),
            Cell::from(format!("{} kbps", params.video_bitrate_kbps)),
        ]));
        rows.push(Row::new(vec![
            Cell::from("Output"),
            Cell::from(format!("{}x{}", w, h)),
        ]));
        rows.push(Row::new(vec![
            Cell::from("Estimate"),
            Cell::from(format!("~{}", format_bytes(estimate))),
        ]));
    }

    let widths = [Constraint::Length(14), Constraint::Min(10)];
    let table = Table::new(rows, widths)
        .block(Block::default().borders(Borders::ALL).title(" Settings "));
    f.render_widget(table, chunks[1]);
}

fn render_progress(f: &mut Frame, area: Rect, app: &App) {
    let controller = app.workflow.controller();
    let (percent, label) = match app.workflow.state() {
        WorkflowState::Running => {
            let percent = app.workflow.progress_percent();
            (
                percent,
                format!(
                    "{}% | {}",
                    percent,
                    format_elapsed(controller.display_elapsed())
                ),
            )
        }
        WorkflowState::Succeeded => (100, "done".to_string()),
        _ => (0, String::new()),
    };

    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Progress "))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(percent as u16)
        .label(label);
    f.render_widget(gauge, area);
}

fn render_result(f: &mut Frame, area: Rect, app: &App) {
    let mut lines = Vec::new();
    if let Some(result) = app.workflow.result() {
        let outcome = match result.size_outcome() {
            SizeOutcome::Reduced { saved_bytes, ratio } => Span::styled(
                format!(
                    "saved {} ({:.0}% of original)",
                    format_bytes(saved_bytes),
                    ratio * 100.0
                ),
                Style::default().fg(Color::Green),
            ),
            SizeOutcome::Unchanged => Span::styled(
                "output is the same size as the input; try a lower ratio".to_string(),
                Style::default().fg(Color::Yellow),
            ),
            SizeOutcome::Increased { extra_bytes, .. } => Span::styled(
                format!(
                    "output is {} larger than the input; try a lower ratio",
                    format_bytes(extra_bytes)
                ),
                Style::default().fg(Color::Yellow),
            ),
        };
        lines.push(Line::from(format!(
            "Size:    {} -> {}",
            format_bytes(result.input_size),
            format_bytes(result.output_size)
        )));
        lines.push(Line::from(vec![Span::raw("Result:  "), outcome]));
        lines.push(Line::from(format!(
            "Time:    {}",
            format_elapsed(result.elapsed)
        )));
        lines.push(Line::from(format!("Export:  {}", app.workflow.export_name())));

        let preview = match app.workflow.preview() {
            PreviewMode::Original => "original",
            PreviewMode::Compressed => "compressed",
        };
        let preview_size = app
            .workflow
            .preview_bytes()
            .map(|b| format_bytes(b.len() as u64))
            .unwrap_or_else(|| "-".to_string());
        lines.push(Line::from(format!("Preview: {} ({})", preview, preview_size)));
    } else {
        lines.push(Line::from("No result yet."));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(" Result "))
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn render_event_log(f: &mut Frame, area: Rect, app: &App) {
    let visible = area.height.saturating_sub(2) as usize;
    let mut events: Vec<Line> = app
        .event_log
        .iter()
        .rev()
        .take(visible)
        .map(|e| Line::from(e.as_str()))
        .collect();
    events.reverse();

    let paragraph = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title(" Log "))
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn key_help(app: &App) -> &'static str {
    if app.engine_state() == EngineState::Error {
        return " r reload engine | o open | q quit ";
    }
    match app.workflow.state() {
        WorkflowState::Idle => " o open | q quit ",
        WorkflowState::Configuring => {
            " <-/-> ratio | up/down +-10 | 1-4 presets | enter start | o open | d discard | q quit "
        }
        WorkflowState::Running => " c cancel | q quit ",
        WorkflowState::Succeeded => {
            " p preview | n rename | w save | r retry | o open | d discard | q quit "
        }
        WorkflowState::Failed => " r retry | o open | d discard | q quit ",
    }
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let text = match &app.mode {
        InputMode::Path(buffer) => format!(" Open file: {}_ (enter to open, esc to cancel)", buffer),
        InputMode::ExportName(buffer) => {
            format!(" Export name: {}_ (enter to keep, esc to cancel)", buffer)
        }
        InputMode::Normal => match &app.notice {
            Some(notice) => format!(" {} |{}", notice, key_help(app)),
            None => key_help(app).to_string(),
        },
    };

    let paragraph =
        Paragraph::new(text).style(Style::default().fg(Color::White).bg(Color::DarkGray));
    f.render_widget(paragraph, area);
}

/// Render the complete UI layout
pub fn draw(f: &mut Frame, app: &App) {
    let size = f.area();

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(size);

    let content_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(10),
            Constraint::Length(3),
            Constraint::Length(8),
            Constraint::Min(3),
        ])
        .split(main_chunks[1]);

    let top_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(content_chunks[0]);

    render_header(f, main_chunks[0], app);
    render_source(f, top_chunks[0], app);
    render_settings(f, top_chunks[1], app);
    render_progress(f, content_chunks[1], app);
    render_result(f, content_chunks[2], app);
    render_event_log(f, content_chunks[3], app);
    render_status_bar(f, main_chunks[2], app);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_format_duration_never_panics(secs in proptest::num::f64::ANY) {
            let _ = format_duration(secs);
        }

        #[test]
        fn prop_format_bytes_small_values_are_exact(bytes in 0u64..1024) {
            prop_assert_eq!(format_bytes(bytes), format!("{} B", bytes));
        }
    }

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(100 * 1024 * 1024), "100.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42.9), "42s");
        assert_eq!(format_duration(125.0), "2m 5s");
        assert_eq!(format_duration(3725.0), "1h 2m");
        assert_eq!(format_duration(-3.0), "0s");
    }
}

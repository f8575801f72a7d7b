use std::{
    io::stdout,
    path::PathBuf,
    sync::{mpsc, Arc},
};

use crate::grid::CalibratedGrid;
use crate::session::{SessionError, SessionEvent, SessionHandle, StopReason};
use crate::session_stats::{ReadingStats, StatsSnapshot};
use crate::tui::error::TuiError;

use crossterm::{
    event::{self, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{block::Title, *},
    Terminal,
};

/// Characters used to draw a cell, from no pressure to full scale.
const SHADES: [char; 10] = [' ', '.', ':', '-', '=', '+', '*', '#', '%', '@'];

/// Everything the monitor has learned from a session's events.
#[derive(Debug, Clone, Default)]
pub struct MonitorState {
    pub latest: Option<Arc<CalibratedGrid>>,
    pub live: Option<StatsSnapshot>,
    pub final_stats: Option<StatsSnapshot>,
    pub recording: Option<PathBuf>,
    pub persistence_failures: u64,
    pub stopped: Option<StopReason>,
    expected_weight_lbs: Option<f64>,
}

impl MonitorState {
    pub fn new(expected_weight_lbs: Option<f64>) -> Self {
        MonitorState {
            expected_weight_lbs,
            ..Default::default()
        }
    }

    pub fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged(_) => {}
            SessionEvent::Recording { dir } => self.recording = Some(dir),
            SessionEvent::FrameReady { grid, .. } => self.latest = Some(grid),
            SessionEvent::PersistenceFailed { .. } => self.persistence_failures += 1,
            SessionEvent::LiveStats(stats) => self.live = Some(stats),
            SessionEvent::FinalStats(stats) => self.final_stats = Some(stats),
            SessionEvent::Stopped { reason } => self.stopped = Some(reason),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    /// Text shown under the pressure map.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(dir) = &self.recording {
            lines.push(format!("Recording to {}", dir.display()));
        }
        match &self.live {
            Some(stats) => lines.push(stats.live_message()),
            None => lines.push("Waiting for the first frame...".to_owned()),
        }
        if let Some(grid) = &self.latest {
            let reading = ReadingStats::of(grid, self.expected_weight_lbs);
            let mut line = format!(
                "Max {:.2} Pa | Min {:.2} Pa | Avg {:.2} Pa",
                reading.max_pressure, reading.min_pressure, reading.avg_pressure
            );
            if let Some(error) = reading.error {
                line.push_str(&format!(
                    " | Median error {:.1}% of {:.2} Pa",
                    error.median_percent, error.expected_pressure
                ));
            }
            lines.push(line);
        }
        if let Some(reason) = &self.stopped {
            lines.push(format!("Session stopped: {:?}", reason));
        }
        lines
    }
}

/// Draws a grid one text line per row, each cell shaded relative to the
/// largest value in the grid.
pub fn shade_rows(grid: &CalibratedGrid) -> Vec<String> {
    let peak = grid.iter().copied().fold(0.0, f64::max);
    let top = (SHADES.len() - 1) as f64;
    grid.as_slice()
        .chunks(crate::mat::COLS)
        .map(|row| {
            row.iter()
                .map(|&v| {
                    if peak <= 0.0 {
                        SHADES[0]
                    } else {
                        SHADES[((v / peak).clamp(0.0, 1.0) * top).round() as usize]
                    }
                })
                .collect()
        })
        .collect()
}

fn draw(terminal: &mut Terminal<impl Backend>, title: &str, state: &MonitorState) -> Result<(), TuiError> {
    let map: Vec<Line> = match &state.latest {
        Some(grid) => shade_rows(grid).into_iter().map(Line::from).collect(),
        None => vec![],
    };
    let status: Vec<Line> = state
        .status_lines()
        .into_iter()
        .map(Line::from)
        .chain(std::iter::once(Line::from(" Press any key to stop ".magenta().bold())))
        .collect();

    let map_block = Block::default()
        .title(Title::from(format!(" {} ", title).magenta().bold()).alignment(Alignment::Center))
        .borders(Borders::ALL);
    let status_block = Block::default().borders(Borders::ALL);

    terminal.draw(|frame| {
        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(crate::mat::ROWS as u16 + 2),
                Constraint::Min(3),
            ])
            .split(frame.size());
        frame.render_widget(Paragraph::new(map).block(map_block), layout[0]);
        frame.render_widget(Paragraph::new(status).block(status_block), layout[1]);
    })?;
    Ok(())
}

fn watch(
    terminal: &mut Terminal<impl Backend>,
    title: &str,
    events: &mpsc::Receiver<SessionEvent>,
    state: &mut MonitorState,
) -> Result<(), TuiError> {
    loop {
        loop {
            match events.try_recv() {
                Ok(event) => state.apply(event),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => return Ok(()),
            }
        }
        draw(terminal, title, state)?;
        if state.is_stopped() {
            return Ok(());
        }

        if event::poll(std::time::Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(());
                }
            }
        }
    }
}

/// Shows a running session until the user presses a key or the session
/// stops by itself, then stops it.
///
/// Returns what the monitor saw, including the session's final statistics,
/// along with the session's own result.
pub fn monitor_until_keypress(
    title: &str,
    events: mpsc::Receiver<SessionEvent>,
    session: SessionHandle,
    expected_weight_lbs: Option<f64>,
) -> Result<(MonitorState, Result<(), SessionError>), TuiError> {
    let mut state = MonitorState::new(expected_weight_lbs);

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let watched = Terminal::new(CrosstermBackend::new(stdout()))
        .map_err(TuiError::from)
        .and_then(|mut terminal| {
            terminal.clear()?;
            watch(&mut terminal, title, &events, &mut state)
        });

    let result = session.stop();
    for event in events.try_iter() {
        state.apply(event);
    }

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    watched?;

    Ok((state, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mat::{COLS, ROWS};
    use std::time::Duration;

    fn snapshot(frames: u64) -> StatsSnapshot {
        StatsSnapshot {
            frames,
            transmission_errors: 0,
            persistence_errors: 0,
            current_rate: Some(20.0),
            average_rate: Some(19.5),
            elapsed: Duration::from_secs(3),
        }
    }

    #[test]
    fn shading_is_relative_to_the_peak() {
        let mut grid = CalibratedGrid::filled(0.0);
        grid[(0, 0)] = 50.0;
        grid[(0, 1)] = 100.0;

        let rows = shade_rows(&grid);
        assert_eq!(rows.len(), ROWS);
        assert!(rows.iter().all(|r| r.chars().count() == COLS));
        let first: Vec<char> = rows[0].chars().collect();
        assert_eq!(first[0], SHADES[5]);
        assert_eq!(first[1], '@');
        assert_eq!(first[2], ' ');
    }

    #[test]
    fn empty_grid_is_blank() {
        let rows = shade_rows(&CalibratedGrid::filled(0.0));
        assert!(rows.iter().all(|r| r.trim().is_empty()));
    }

    #[test]
    fn state_follows_the_events() {
        let mut state = MonitorState::new(None);
        assert!(state.status_lines()[0].starts_with("Waiting"));

        state.apply(SessionEvent::Recording {
            dir: PathBuf::from("runs/x_0"),
        });
        state.apply(SessionEvent::FrameReady {
            index: 0,
            grid: Arc::new(CalibratedGrid::filled(4.0)),
        });
        state.apply(SessionEvent::PersistenceFailed {
            index: 0,
            reason: "disk full".to_owned(),
        });
        state.apply(SessionEvent::LiveStats(snapshot(1)));
        assert!(!state.is_stopped());
        assert_eq!(state.persistence_failures, 1);

        let lines = state.status_lines();
        assert_eq!(lines[0], "Recording to runs/x_0");
        assert!(lines[1].contains("Frames: 1"));
        assert!(lines[2].starts_with("Max 4.00 Pa"));

        state.apply(SessionEvent::FinalStats(snapshot(1)));
        state.apply(SessionEvent::Stopped {
            reason: StopReason::Requested,
        });
        assert!(state.is_stopped());
        assert_eq!(state.final_stats, Some(snapshot(1)));
    }

    #[test]
    fn expected_weight_adds_error_figures() {
        let mut state = MonitorState::new(Some(10.0));
        state.apply(SessionEvent::FrameReady {
            index: 0,
            grid: Arc::new(CalibratedGrid::filled(1.0)),
        });
        assert!(state.status_lines()[1].contains("Median error"));
    }
}

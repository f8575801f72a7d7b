//! Running statistics of an acquisition session, and of single readings.
//!
//! [`SessionStats`] keeps the inter-frame deltas of a session: a short window
//! of the most recent ones for the current sample rate, and running totals
//! for the average over the whole session.

use crate::grid::CalibratedGrid;
use crate::mat::distributed_lbs_to_sensor_pressure;

use std::{
    collections::VecDeque,
    fmt,
    time::{Duration, Instant},
};

/// How many of the latest deltas the current sample rate is averaged over.
const RECENT_DELTAS: usize = 5;

/// Counters and timings accumulated while a session polls.
#[derive(Debug, Clone)]
pub struct SessionStats {
    started: Instant,
    last_frame: Option<Instant>,
    recent_deltas: VecDeque<Duration>,
    total_delta: Duration,
    delta_count: u64,
    frames: u64,
    transmission_errors: u64,
    persistence_errors: u64,
}

impl SessionStats {
    pub fn new(started: Instant) -> Self {
        SessionStats {
            started,
            last_frame: None,
            recent_deltas: VecDeque::with_capacity(RECENT_DELTAS + 1),
            total_delta: Duration::ZERO,
            delta_count: 0,
            frames: 0,
            transmission_errors: 0,
            persistence_errors: 0,
        }
    }

    /// Records a frame that arrived at `at`.
    pub fn record_frame(&mut self, at: Instant) {
        if let Some(last) = self.last_frame {
            let delta = at.saturating_duration_since(last);
            self.recent_deltas.push_back(delta);
            if self.recent_deltas.len() > RECENT_DELTAS {
                self.recent_deltas.pop_front();
            }
            self.total_delta += delta;
            self.delta_count += 1;
        }
        self.last_frame = Some(at);
        self.frames += 1;
    }

    /// The reader keeps the authoritative count; the session mirrors it here.
    pub fn set_transmission_errors(&mut self, count: u64) {
        self.transmission_errors = count;
    }

    pub fn record_persistence_error(&mut self) {
        self.persistence_errors += 1;
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn transmission_errors(&self) -> u64 {
        self.transmission_errors
    }

    pub fn persistence_errors(&self) -> u64 {
        self.persistence_errors
    }

    /// Frames per second over the most recent deltas.
    pub fn current_rate(&self) -> Option<f64> {
        let window: Duration = self.recent_deltas.iter().sum();
        rate(self.recent_deltas.len() as u64, window)
    }

    /// Frames per second over the whole session.
    pub fn average_rate(&self) -> Option<f64> {
        rate(self.delta_count, self.total_delta)
    }

    /// A copy of the current figures, stamped at `now`.
    pub fn snapshot(&self, now: Instant) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames,
            transmission_errors: self.transmission_errors,
            persistence_errors: self.persistence_errors,
            current_rate: self.current_rate(),
            average_rate: self.average_rate(),
            elapsed: now.saturating_duration_since(self.started),
        }
    }
}

fn rate(count: u64, over: Duration) -> Option<f64> {
    let secs = over.as_secs_f64();
    (count > 0 && secs > 0.0).then(|| count as f64 / secs)
}

/// The figures of a [`SessionStats`] at one instant. This is what sessions
/// publish to their subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub transmission_errors: u64,
    pub persistence_errors: u64,
    pub current_rate: Option<f64>,
    pub average_rate: Option<f64>,
    pub elapsed: Duration,
}

struct Hz(Option<f64>);

impl fmt::Display for Hz {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(hz) => write!(f, "{:.2} Hz", hz),
            None => write!(f, "-- Hz"),
        }
    }
}

impl StatsSnapshot {
    /// One line describing a session in progress.
    pub fn live_message(&self) -> String {
        format!(
            "Sample rate: {} | Frames: {} | Transmission errors: {} | Persistence errors: {} | Elapsed: {:.1} s",
            Hz(self.current_rate),
            self.frames,
            self.transmission_errors,
            self.persistence_errors,
            self.elapsed.as_secs_f64()
        )
    }

    /// One line summarising a finished session.
    pub fn final_message(&self) -> String {
        format!(
            "Average sample rate: {} over {} frames | Total transmission errors: {}",
            Hz(self.average_rate),
            self.frames,
            self.transmission_errors
        )
    }
}

/// How far a reading strays from the pressure a known load should produce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorStats {
    pub expected_pressure: f64,
    pub min_percent: f64,
    pub max_percent: f64,
    pub avg_percent: f64,
    pub median_percent: f64,
}

/// Summary of one calibrated reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadingStats {
    pub max_pressure: f64,
    pub min_pressure: f64,
    pub avg_pressure: f64,
    /// Present when the reading was taken under a known, non-zero load.
    pub error: Option<ErrorStats>,
}

impl ReadingStats {
    /// Summarises `grid`, comparing it against `expected_weight_lbs` spread
    /// evenly over the mat when given.
    pub fn of(grid: &CalibratedGrid, expected_weight_lbs: Option<f64>) -> Self {
        let values = grid.as_slice();
        let n = values.len() as f64;
        let max_pressure = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min_pressure = values.iter().copied().fold(f64::INFINITY, f64::min);
        let avg_pressure = values.iter().sum::<f64>() / n;

        let error = expected_weight_lbs
            .map(distributed_lbs_to_sensor_pressure)
            .filter(|&expected| expected > 0.0)
            .map(|expected| {
                let mut percent: Vec<f64> = values
                    .iter()
                    .map(|v| (v - expected).abs() / expected * 100.0)
                    .collect();
                percent.sort_by(f64::total_cmp);
                ErrorStats {
                    expected_pressure: expected,
                    min_percent: percent[0],
                    max_percent: percent[percent.len() - 1],
                    avg_percent: percent.iter().sum::<f64>() / n,
                    median_percent: median(&percent),
                }
            });

        ReadingStats {
            max_pressure,
            min_pressure,
            avg_pressure,
            error,
        }
    }
}

/// Median of an already sorted, non-empty slice.
fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

impl fmt::Display for ReadingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Max pressure: {:.2} Pa", self.max_pressure)?;
        writeln!(f, "Min pressure: {:.2} Pa", self.min_pressure)?;
        write!(f, "Avg pressure: {:.2} Pa", self.avg_pressure)?;
        if let Some(e) = &self.error {
            writeln!(f)?;
            writeln!(f, "Expected pressure: {:.2} Pa", e.expected_pressure)?;
            writeln!(f, "Min error: {:.2}%", e.min_percent)?;
            writeln!(f, "Max error: {:.2}%", e.max_percent)?;
            writeln!(f, "Avg error: {:.2}%", e.avg_percent)?;
            write!(f, "Median error: {:.2}%", e.median_percent)?;
        }
        Ok(())
    }
}

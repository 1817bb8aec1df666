//! Progress tracking for long-running operations
//!
//! One `ProgressHandler` per operation. The worker side reports completed
//! units and polls the embedded cancellation flag at safe checkpoints; the
//! controlling (UI) side reads derived telemetry (speed, ETA) and can
//! request cancellation. The handler is pure bookkeeping and performs no I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error};

/// Weight given to the newest speed sample in the moving average.
const DEFAULT_SMOOTHING: f64 = 0.3;

/// Lifecycle of the operation a handler is tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// Point-in-time view of an operation's progress, safe to read from any thread.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub status: OperationStatus,
    pub total_units: u64,
    pub completed_units: u64,
    pub unit_label: String,
    /// Smoothed average speed in units per second.
    pub average_speed: f64,
    /// Remaining time formatted as `HH:MM:SS` (`00:00:00` when unknown).
    pub eta: String,
    /// Completed fraction in 0..=1 for progress bars (0 when total unknown).
    pub fraction: f32,
    pub error: Option<String>,
}

#[derive(Debug)]
struct ProgressState {
    status: OperationStatus,
    total_units: u64,
    completed_units: u64,
    unit_label: String,
    started: Option<Instant>,
    average_speed: f64,
    error: Option<String>,
}

impl ProgressState {
    fn reset(&mut self, total_units: u64, unit_label: &str) {
        self.status = OperationStatus::Running;
        self.total_units = total_units;
        self.completed_units = 0;
        self.unit_label = unit_label.to_string();
        self.started = Some(Instant::now());
        self.average_speed = 0.0;
        self.error = None;
    }
}

struct Inner {
    smoothing: f64,
    cancel: AtomicBool,
    state: Mutex<ProgressState>,
}

/// Shared progress bookkeeping for one long-running operation.
///
/// Cloning is cheap; all clones observe the same state, so a worker thread
/// and the UI thread can each hold one.
#[derive(Clone)]
pub struct ProgressHandler {
    inner: Arc<Inner>,
}

impl ProgressHandler {
    pub fn new() -> Self {
        Self::with_smoothing(DEFAULT_SMOOTHING)
    }

    /// Create a handler with a custom smoothing factor (weight of the newest
    /// speed sample, clamped to 0..=1).
    pub fn with_smoothing(smoothing: f64) -> Self {
        Self {
            inner: Arc::new(Inner {
                smoothing: smoothing.clamp(0.0, 1.0),
                cancel: AtomicBool::new(false),
                state: Mutex::new(ProgressState {
                    status: OperationStatus::Idle,
                    total_units: 0,
                    completed_units: 0,
                    unit_label: String::new(),
                    started: None,
                    average_speed: 0.0,
                    error: None,
                }),
            }),
        }
    }

    /// Reset all counters and record the start time. A `total_units` of 0
    /// means "unknown for now"; supply it later via [`set_total_units`].
    ///
    /// The cancellation flag is deliberately left untouched: a cancel sent
    /// between scheduling a worker and the worker reaching this call must
    /// still be observed. Use one handler per operation.
    ///
    /// [`set_total_units`]: ProgressHandler::set_total_units
    pub fn start_operation(&self, total_units: u64, unit_label: &str) {
        let mut state = self.inner.state.lock().unwrap();
        state.reset(total_units, unit_label);
        debug!(
            "operation started: {} {} expected",
            total_units, unit_label
        );
    }

    /// Set the total unit count once it becomes known (e.g. archive entry
    /// count discovered after opening).
    pub fn set_total_units(&self, total_units: u64) {
        self.inner.state.lock().unwrap().total_units = total_units;
    }

    /// Record that `completed_units` have been finished so far and update the
    /// smoothed speed estimate. Callers are expected to pass non-decreasing
    /// values within one operation.
    pub fn report_progress(&self, completed_units: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.completed_units = completed_units;

        let elapsed = match state.started {
            Some(started) => started.elapsed().as_secs_f64(),
            None => return,
        };
        // No estimate until some time has passed.
        if elapsed <= 0.0 {
            return;
        }
        let instantaneous = completed_units as f64 / elapsed;
        state.average_speed = self.inner.smoothing * instantaneous
            + (1.0 - self.inner.smoothing) * state.average_speed;
    }

    /// Estimated seconds remaining, 0 when no estimate is available yet.
    pub fn eta_seconds(&self) -> f64 {
        let state = self.inner.state.lock().unwrap();
        if state.average_speed <= 0.0 || state.total_units <= state.completed_units {
            return 0.0;
        }
        (state.total_units - state.completed_units) as f64 / state.average_speed
    }

    /// Cancellation flag, polled by workers at safe checkpoints.
    pub fn should_cancel(&self) -> bool {
        self.inner.cancel.load(Ordering::SeqCst)
    }

    /// Request cooperative cancellation. The worker unwinds when it next
    /// reaches a checkpoint; a worker blocked in a single I/O call will not
    /// notice until that call returns.
    pub fn send_cancel_signal(&self) {
        debug!("cancellation requested");
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    /// Terminal notification: the operation finished successfully.
    pub fn report_success(&self) {
        self.inner.state.lock().unwrap().status = OperationStatus::Succeeded;
    }

    /// Terminal notification: the operation failed.
    pub fn report_error(&self, err: &str) {
        error!("operation failed: {}", err);
        let mut state = self.inner.state.lock().unwrap();
        state.status = OperationStatus::Failed;
        state.error = Some(err.to_string());
    }

    /// Snapshot the current state for display.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.inner.state.lock().unwrap();
        let eta_secs = if state.average_speed > 0.0 && state.total_units > state.completed_units {
            (state.total_units - state.completed_units) as f64 / state.average_speed
        } else {
            0.0
        };
        let fraction = if state.total_units > 0 {
            (state.completed_units as f64 / state.total_units as f64).min(1.0) as f32
        } else {
            0.0
        };
        ProgressSnapshot {
            status: state.status,
            total_units: state.total_units,
            completed_units: state.completed_units,
            unit_label: state.unit_label.clone(),
            average_speed: state.average_speed,
            eta: format_hms(eta_secs.round() as u64),
            fraction,
            error: state.error.clone(),
        }
    }
}

impl Default for ProgressHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a duration in seconds as zero-padded `HH:MM:SS`.
pub fn format_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(0), "00:00:00");
        assert_eq!(format_hms(59), "00:00:59");
        assert_eq!(format_hms(61), "00:01:01");
        assert_eq!(format_hms(3600 * 5 + 60 * 4 + 3), "05:04:03");
    }

    #[test]
    fn test_report_at_elapsed_zero_does_not_panic() {
        let progress = ProgressHandler::new();
        progress.start_operation(100, "files");
        // Immediately reporting must not divide by a zero elapsed time.
        progress.report_progress(1);
        let snap = progress.snapshot();
        assert_eq!(snap.eta, "00:00:00");
    }

    #[test]
    fn test_eta_zero_without_speed() {
        let progress = ProgressHandler::new();
        progress.start_operation(10, "entries");
        assert_eq!(progress.eta_seconds(), 0.0);
        assert_eq!(progress.snapshot().eta, "00:00:00");
    }

    #[test]
    fn test_eta_non_negative_and_formatted() {
        let progress = ProgressHandler::new();
        progress.start_operation(1000, "bytes");
        std::thread::sleep(Duration::from_millis(20));
        for completed in [100u64, 250, 400, 600] {
            progress.report_progress(completed);
            let snap = progress.snapshot();
            assert!(progress.eta_seconds() >= 0.0);
            assert_eq!(snap.eta.len(), 8);
            let parts: Vec<&str> = snap.eta.split(':').collect();
            assert_eq!(parts.len(), 3);
            for part in parts {
                assert_eq!(part.len(), 2);
                part.parse::<u64>().unwrap();
            }
        }
    }

    #[test]
    fn test_first_sample_uses_zero_history() {
        // With smoothing factor 1.0 the average tracks the instantaneous
        // speed exactly; with 0.0 it stays at the initial 0.
        let progress = ProgressHandler::with_smoothing(0.0);
        progress.start_operation(100, "files");
        std::thread::sleep(Duration::from_millis(10));
        progress.report_progress(50);
        assert_eq!(progress.snapshot().average_speed, 0.0);

        let progress = ProgressHandler::with_smoothing(1.0);
        progress.start_operation(100, "files");
        std::thread::sleep(Duration::from_millis(10));
        progress.report_progress(50);
        assert!(progress.snapshot().average_speed > 0.0);
    }

    #[test]
    fn test_cancel_flag_roundtrip() {
        let progress = ProgressHandler::new();
        assert!(!progress.should_cancel());
        progress.send_cancel_signal();
        assert!(progress.should_cancel());
        // A cancel sent before the worker starts must survive start_operation.
        progress.start_operation(5, "files");
        assert!(progress.should_cancel());
    }

    #[test]
    fn test_terminal_states() {
        let progress = ProgressHandler::new();
        progress.start_operation(1, "files");
        progress.report_success();
        assert_eq!(progress.snapshot().status, OperationStatus::Succeeded);

        progress.start_operation(1, "files");
        progress.report_error("disk full");
        let snap = progress.snapshot();
        assert_eq!(snap.status, OperationStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_total_known_late() {
        let progress = ProgressHandler::new();
        progress.start_operation(0, "entries");
        assert_eq!(progress.snapshot().fraction, 0.0);
        progress.set_total_units(4);
        progress.report_progress(2);
        let snap = progress.snapshot();
        assert_eq!(snap.total_units, 4);
        assert!((snap.fraction - 0.5).abs() < f32::EPSILON);
    }
}

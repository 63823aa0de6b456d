//! Progress reporting and cooperative cancellation.
//!
//! The engine calls the listener at most once per second; the listener is
//! expected to be cheap and non-blocking.  `report_stopped` doubles as the
//! collaborator's stop request — returning true cancels the operation at the
//! next block boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

// ── Listener ─────────────────────────────────────────────────────────────────

pub trait ProgressListener: Send {
    fn set_total(&mut self, bytes: u64);
    fn set_done(&mut self, bytes: u64);
    fn set_pc_done(&mut self, pct: u32);
    fn set_speed(&mut self, bps: f64);
    /// `eta_ms < 0` clears the estimate.  `set_time_ms` is the wall-clock
    /// millisecond timestamp the estimate was computed at.
    fn set_eta(&mut self, eta_ms: i64, set_time_ms: i64);
    /// Polled between blocks; true requests a stop.
    fn report_stopped(&mut self) -> bool;
}

/// Listener that ignores everything and never stops.
pub struct NullProgress;

impl ProgressListener for NullProgress {
    fn set_total(&mut self, _bytes: u64) {}
    fn set_done(&mut self, _bytes: u64) {}
    fn set_pc_done(&mut self, _pct: u32) {}
    fn set_speed(&mut self, _bps: f64) {}
    fn set_eta(&mut self, _eta_ms: i64, _set_time_ms: i64) {}
    fn report_stopped(&mut self) -> bool {
        false
    }
}

pub(crate) fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Shared cancellation flag, polled between blocks in long-running container
/// operations.  Cloning shares the flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Error out if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ── ETA smoothing ────────────────────────────────────────────────────────────

/// Exponentially smoothed block-rate estimator.
///
/// The first sample only seeds the estimate; during the five-minute warm-up
/// further samples blend at 0.9/0.1; after that the blend tightens to
/// 0.99/0.01.  Only the tightened branch emits an ETA, so a single sample
/// can never produce one.
pub struct EtaTracker {
    started: Instant,
    last_update: Instant,
    last_blocks: i64,
    estimated_speed_bpms: f64,
}

const ETA_WARMUP_MS: u128 = 5 * 60 * 1000;

impl EtaTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_update: now,
            last_blocks: 0,
            estimated_speed_bpms: 0.0,
        }
    }

    /// Feed the current progress; returns `Some(eta_ms)` once the estimator
    /// has warmed up.  `done_blocks` must be monotonic.
    pub fn update(&mut self, done_blocks: i64, remaining_blocks: i64) -> Option<i64> {
        if done_blocks <= 1000 {
            return None;
        }

        let now = Instant::now();
        let new_blocks = done_blocks - self.last_blocks;
        let passed_ms = now.duration_since(self.last_update).as_millis();
        if new_blocks <= 0 || passed_ms == 0 {
            return None;
        }

        self.last_blocks = done_blocks;
        self.last_update = now;

        let speed_bpms = new_blocks as f64 / passed_ms as f64;
        let warmed_up = now.duration_since(self.started).as_millis() >= ETA_WARMUP_MS;

        // The branches are mutually exclusive and only the last one may
        // emit: a first sample (even a late one) merely seeds the estimate.
        let mut set_eta = false;
        if self.estimated_speed_bpms == 0.0 {
            self.estimated_speed_bpms = speed_bpms;
        } else if !warmed_up {
            self.estimated_speed_bpms = 0.9 * self.estimated_speed_bpms + 0.1 * speed_bpms;
        } else {
            self.estimated_speed_bpms = 0.99 * self.estimated_speed_bpms + 0.01 * speed_bpms;
            set_eta = true;
        }

        if set_eta && self.estimated_speed_bpms > 0.0 {
            Some((remaining_blocks as f64 / self.estimated_speed_bpms + 0.5) as i64)
        } else {
            None
        }
    }
}

impl Default for EtaTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_propagates() {
        let t = CancelToken::new();
        assert!(t.check().is_ok());
        let t2 = t.clone();
        t2.cancel();
        assert!(matches!(t.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn eta_needs_minimum_progress() {
        let mut eta = EtaTracker::new();
        assert_eq!(eta.update(10, 1000), None);
    }

    #[test]
    fn eta_never_emits_during_warmup() {
        let mut eta = EtaTracker::new();
        // First sample seeds the estimate, the next ones blend; none may
        // produce an ETA before the warm-up window has passed.
        assert_eq!(eta.update(2000, 1000), None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(eta.update(4000, 1000), None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(eta.update(6000, 1000), None);
    }
}

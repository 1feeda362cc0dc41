//! Worker-wide load shedding.
//!
//! Once in-flight work crosses a high watermark the worker stops claiming
//! new tasks until load drops back under a lower watermark. The gap between
//! the two watermarks is hysteresis: without it a worker sitting right at
//! the threshold would flip accept/reject on every single task completion.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Stop claiming new tasks once `in_flight / max_concurrency` reaches this.
    pub high_watermark: f64,
    /// Resume claiming once load drops below this.
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self { high_watermark: 0.9, low_watermark: 0.7 }
    }
}

impl BackpressureConfig {
    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.low_watermark >= self.high_watermark {
            return Err(BackpressureError::InvalidConfig(
                "low_watermark must be less than high_watermark".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// Tracks a worker's current load and whether it should keep claiming work.
/// Lock-free on the hot path; only the human-readable reason string takes a
/// lock, and only when backpressure actually engages or releases.
pub struct BackpressureState {
    config: BackpressureConfig,
    in_flight: AtomicUsize,
    max_concurrency: usize,
    accepting: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl BackpressureState {
    pub fn new(config: BackpressureConfig, max_concurrency: usize) -> Self {
        Self {
            config,
            in_flight: AtomicUsize::new(0),
            max_concurrency,
            accepting: AtomicBool::new(true),
            reason: RwLock::new(None),
        }
    }

    fn load_ratio(&self) -> f64 {
        self.in_flight.load(Ordering::Relaxed) as f64 / self.max_concurrency.max(1) as f64
    }

    /// Whether the worker should claim another task right now. Implements
    /// the hysteresis: an already-rejecting worker keeps rejecting until
    /// load falls under `low_watermark`, not merely under `high_watermark`.
    pub fn should_accept(&self) -> bool {
        let accepting = self.accepting.load(Ordering::Relaxed);
        let ratio = self.load_ratio();

        if accepting {
            if ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Relaxed);
                *self.reason.write().unwrap() =
                    Some(format!("load ratio {:.1}% reached high watermark", ratio * 100.0));
                return false;
            }
            true
        } else if ratio < self.config.low_watermark {
            self.accepting.store(true, Ordering::Relaxed);
            *self.reason.write().unwrap() = None;
            true
        } else {
            false
        }
    }

    pub fn task_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_below_the_high_watermark() {
        let state = BackpressureState::new(BackpressureConfig::default(), 10);
        for _ in 0..8 {
            state.task_started();
        }
        assert!(state.should_accept());
    }

    #[test]
    fn rejects_at_or_above_the_high_watermark() {
        let state = BackpressureState::new(BackpressureConfig::default(), 10);
        for _ in 0..9 {
            state.task_started();
        }
        assert!(!state.should_accept());
        assert!(state.reason().is_some());
    }

    #[test]
    fn hysteresis_prevents_oscillation_between_watermarks() {
        let state = BackpressureState::new(BackpressureConfig::default(), 10);
        for _ in 0..9 {
            state.task_started();
        }
        assert!(!state.should_accept());

        // Drop to 75% in-flight: still above the low watermark (70%), so a
        // rejecting worker must keep rejecting rather than flip back on.
        state.task_finished();
        assert!(!state.should_accept());

        // Drop to 60%: now under the low watermark, accepting resumes.
        state.task_finished();
        state.task_finished();
        assert!(state.should_accept());
    }

    #[test]
    fn validate_rejects_an_inverted_watermark_pair() {
        let config = BackpressureConfig::default().with_low_watermark(0.95);
        assert!(config.validate().is_err());
    }
}

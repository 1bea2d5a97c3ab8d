//! # Upload-Rate Maximiser
//!
//! Side-channel heuristic: when the upload budget stays under-used for a
//! while, ask the scheduler to start one more queued handle.
//!
//! A candidate is started only when all of the following hold on a tick:
//!
//! | Condition | Source |
//! |-----------|--------|
//! | a queued, inactive handle exists | scheduler |
//! | nothing is hashing or allocating | scheduler |
//! | `max(delay, 45 s)` elapsed since the last hash finished | [`UploadRateMaximiser::on_hash_finished`] |
//! | `Σ measured.up < max_rate.up − threshold` for at least `delay` | tick history |
//!
//! With an unlimited upload budget there is nothing to under-use and the
//! maximiser stays idle.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::handle::Fingerprint;

/// Minimum quiet period after a hash check before starting another handle.
pub const MIN_HASH_SETTLE: Duration = Duration::from_secs(45);

pub const DEFAULT_URM_DELAY: Duration = Duration::from_secs(60);

/// Headroom (KiB/s) below the budget that counts as under-use.
pub const DEFAULT_URM_THRESHOLD: f64 = 10.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UrmConfig {
    pub enabled: bool,
    pub delay: Duration,
    pub threshold: f64,
}

impl Default for UrmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay: DEFAULT_URM_DELAY,
            threshold: DEFAULT_URM_THRESHOLD,
        }
    }
}

/// What the scheduler observed on this tick.
#[derive(Clone, Copy, Debug)]
pub struct UrmObservation {
    pub now: Instant,
    /// First queued, inactive handle in queue order.
    pub candidate: Option<Fingerprint>,
    pub any_checking: bool,
    pub total_measured_up: f64,
    pub max_rate_up: f64,
}

#[derive(Debug)]
pub struct UploadRateMaximiser {
    config: UrmConfig,
    last_hash_finished: Instant,
    underused_since: Option<Instant>,
    pending: Option<Fingerprint>,
}

impl UploadRateMaximiser {
    pub fn new(config: UrmConfig, started_at: Instant) -> Self {
        Self {
            config,
            last_hash_finished: started_at,
            underused_since: None,
            pending: None,
        }
    }

    pub fn config(&self) -> &UrmConfig {
        &self.config
    }

    /// Handle the maximiser is currently waiting to start, if any.
    pub fn pending(&self) -> Option<Fingerprint> {
        self.pending
    }

    pub fn on_hash_finished(&mut self, now: Instant) {
        self.last_hash_finished = now;
    }

    /// The pending candidate left the queue: forget it and restart the timer.
    pub fn on_removed(&mut self, fingerprint: Fingerprint) {
        if self.pending == Some(fingerprint) {
            debug!(handle = %fingerprint, "urm candidate removed, cancelling");
            self.reset();
        }
    }

    /// A handle was started on our request.
    pub fn on_started(&mut self, fingerprint: Fingerprint) {
        if self.pending == Some(fingerprint) {
            self.reset();
        }
    }

    fn reset(&mut self) {
        self.pending = None;
        self.underused_since = None;
    }

    /// Evaluate one tick. Returns the handle to start, if any.
    pub fn tick(&mut self, obs: UrmObservation) -> Option<Fingerprint> {
        if !self.config.enabled || obs.max_rate_up <= 0.0 {
            self.reset();
            return None;
        }

        if obs.total_measured_up < obs.max_rate_up - self.config.threshold {
            self.underused_since.get_or_insert(obs.now);
        } else {
            self.reset();
            return None;
        }

        let Some(candidate) = obs.candidate else {
            self.pending = None;
            return None;
        };
        if self.pending != Some(candidate) {
            trace!(handle = %candidate, "urm candidate selected");
        }
        self.pending = Some(candidate);

        if obs.any_checking {
            return None;
        }
        let settle = self.config.delay.max(MIN_HASH_SETTLE);
        if obs.now.saturating_duration_since(self.last_hash_finished) < settle {
            return None;
        }
        let underused_for = self
            .underused_since
            .map(|since| obs.now.saturating_duration_since(since))
            .unwrap_or_default();
        if underused_for < self.config.delay {
            return None;
        }

        debug!(
            handle = %candidate,
            underused_secs = underused_for.as_secs(),
            measured = obs.total_measured_up,
            budget = obs.max_rate_up,
            "upload under-used, starting another handle"
        );
        Some(candidate)
    }
}

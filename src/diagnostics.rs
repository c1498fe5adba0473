use std::sync::Mutex;

use serde::Serialize;

use crate::core::{truncate_message, unix_now_secs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollState {
    Idle,
    Resolving,
    Polling,
    Stopped,
}

/// Counters for one poll subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollDiagnostics {
    pub state: PollState,
    pub generation: u64,
    pub fetches_started: u64,
    pub fetches_completed: u64,
    pub stale_discarded: u64,
    pub in_flight: u32,
    pub max_in_flight: u32,
    pub last_error: Option<String>,
    pub last_success_at: Option<u64>,
}

impl Default for PollDiagnostics {
    fn default() -> Self {
        Self {
            state: PollState::Idle,
            generation: 0,
            fetches_started: 0,
            fetches_completed: 0,
            stale_discarded: 0,
            in_flight: 0,
            max_in_flight: 0,
            last_error: None,
            last_success_at: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct DiagnosticsCell {
    inner: Mutex<PollDiagnostics>,
}

impl DiagnosticsCell {
    pub(crate) fn snapshot(&self) -> PollDiagnostics {
        self.inner
            .lock()
            .map(|diag| diag.clone())
            .unwrap_or_default()
    }

    fn update(&self, apply: impl FnOnce(&mut PollDiagnostics)) {
        if let Ok(mut diag) = self.inner.lock() {
            apply(&mut diag);
        }
    }

    pub(crate) fn set_state(&self, state: PollState) {
        self.update(|diag| diag.state = state);
    }

    pub(crate) fn set_generation(&self, generation: u64) {
        self.update(|diag| diag.generation = generation);
    }

    pub(crate) fn fetch_started(&self) {
        self.update(|diag| {
            diag.fetches_started += 1;
            diag.in_flight += 1;
            diag.max_in_flight = diag.max_in_flight.max(diag.in_flight);
        });
    }

    /// Called exactly once per started fetch, whether it finished or was
    /// dropped.
    pub(crate) fn fetch_ended(&self) {
        self.update(|diag| diag.in_flight = diag.in_flight.saturating_sub(1));
    }

    pub(crate) fn fetch_succeeded(&self) {
        self.update(|diag| {
            diag.fetches_completed += 1;
            diag.last_error = None;
            diag.last_success_at = Some(unix_now_secs());
        });
    }

    pub(crate) fn fetch_failed(&self, reason: &str) {
        self.update(|diag| {
            diag.fetches_completed += 1;
            diag.last_error = Some(truncate_message(reason, 300));
        });
    }

    pub(crate) fn stale_discarded(&self) {
        self.update(|diag| diag.stale_discarded += 1);
    }
}

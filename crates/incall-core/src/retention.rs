//! Disconnect retention
//!
//! A call that has just disconnected stays in the registry for a short grace
//! period so observers can show that it ended. The scheduler only keeps the
//! deadlines. The registry owns the expiry logic and decides when to ask for
//! due entries, which keeps every retirement on the owner task.
//!
//! There is exactly one deadline per call. Scheduling again replaces it.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::RetentionConfig;
use crate::types::{CallId, DisconnectCode};

#[derive(Debug, Clone)]
pub struct RetentionScheduler {
    policy: RetentionConfig,
    pending: HashMap<CallId, Instant>,
}

impl RetentionScheduler {
    pub fn new(policy: RetentionConfig) -> Self {
        Self {
            policy,
            pending: HashMap::new(),
        }
    }

    pub fn delay_for(&self, code: DisconnectCode) -> Duration {
        self.policy.delay_for(code)
    }

    /// Schedule retirement of `call_id`, replacing any pending deadline
    pub fn schedule(&mut self, call_id: CallId, code: DisconnectCode, now: Instant) -> Instant {
        let deadline = now + self.delay_for(code);
        if let Some(previous) = self.pending.insert(call_id, deadline) {
            debug!(
                "Replaced retention deadline for {} ({:?} earlier)",
                call_id,
                previous.saturating_duration_since(now)
            );
        }
        deadline
    }

    pub fn cancel(&mut self, call_id: CallId) -> bool {
        self.pending.remove(&call_id).is_some()
    }

    pub fn is_pending(&self, call_id: CallId) -> bool {
        self.pending.contains_key(&call_id)
    }

    pub fn deadline_for(&self, call_id: CallId) -> Option<Instant> {
        self.pending.get(&call_id).copied()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove and return every call whose deadline has passed, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<CallId> {
        let mut due: Vec<(Instant, CallId)> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(call_id, deadline)| (*deadline, *call_id))
            .collect();
        due.sort();
        for (_, call_id) in &due {
            self.pending.remove(call_id);
        }
        due.into_iter().map(|(_, call_id)| call_id).collect()
    }

    /// Remove and return every pending call regardless of its deadline
    pub fn drain_all(&mut self) -> Vec<CallId> {
        let mut all: Vec<CallId> = self.pending.drain().map(|(call_id, _)| call_id).collect();
        all.sort();
        all
    }
}

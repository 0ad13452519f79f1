//! Per-cluster ordered event queue.
//!
//! Lock order: the mailbox lock may be held while calling into events
//! (`is_active`, `dismiss`), never the other way around.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use kiln_core::sync::{lock, wait, wait_timeout};
use kiln_core::EnvironmentId;
use tracing::{debug, info};

use crate::error::ClusterError;
use crate::event::InvocationEvent;

#[derive(Default)]
struct MailboxState {
    pending: VecDeque<InvocationEvent>,
    /// Delivered events that may still be failed by a close.
    in_flight: Vec<InvocationEvent>,
    closed: bool,
    reason: Option<String>,
}

pub struct Mailbox {
    environment_id: EnvironmentId,
    state: Mutex<MailboxState>,
    available: Condvar,
}

impl Mailbox {
    pub fn new(environment_id: EnvironmentId) -> Self {
        Self {
            environment_id,
            state: Mutex::new(MailboxState::default()),
            available: Condvar::new(),
        }
    }

    pub fn environment_id(&self) -> EnvironmentId {
        self.environment_id
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    fn closed_error(&self, reason: Option<String>) -> ClusterError {
        ClusterError::MailboxClosed {
            environment: self.environment_id,
            reason,
        }
    }

    /// Queue an event. Posting to a closed mailbox fails the event immediately.
    pub fn post(&self, event: InvocationEvent) {
        let mut state = lock(&self.state);
        if state.closed {
            let reason = state.reason.clone();
            drop(state);
            debug!(environment = %self.environment_id, kind = event.kind(), "event posted to closed mailbox");
            event.fail(self.closed_error(reason));
            return;
        }
        state.pending.push_back(event);
        drop(state);
        self.available.notify_all();
    }

    /// Block until at least one active event is queued and return all of
    /// them in post order. Inactive events are dismissed on the way.
    /// Returns `None` once the mailbox is closed.
    pub fn poll(&self) -> Option<Vec<InvocationEvent>> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return None;
            }
            let batch = Self::take_active(&mut state);
            if !batch.is_empty() {
                return Some(batch);
            }
            state = wait(&self.available, state);
        }
    }

    /// Like [`poll`](Self::poll) but returns an empty batch after `timeout`.
    pub fn poll_timeout(&self, timeout: Duration) -> Option<Vec<InvocationEvent>> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return None;
            }
            let batch = Self::take_active(&mut state);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !batch.is_empty() || remaining.is_zero() {
                return Some(batch);
            }
            state = wait_timeout(&self.available, state, remaining);
        }
    }

    fn take_active(state: &mut MailboxState) -> Vec<InvocationEvent> {
        state.in_flight.retain(|e| !e.is_finished());
        let mut batch = Vec::new();
        while let Some(event) = state.pending.pop_front() {
            if event.is_active() {
                state.in_flight.push(event.clone());
                batch.push(event);
            } else {
                event.dismiss();
            }
        }
        batch
    }

    /// Close the mailbox. Every queued or in-flight event is failed before
    /// this returns; later posts fail immediately.
    pub fn close(&self, cause: Option<ClusterError>) {
        let reason = cause.map(|c| c.to_string());
        let events: Vec<InvocationEvent> = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.reason = reason.clone();
            let mut events: Vec<_> = state.pending.drain(..).collect();
            events.append(&mut state.in_flight);
            events
        };
        self.available.notify_all();
        info!(
            environment = %self.environment_id,
            failed_events = events.len(),
            "Mailbox closed"
        );
        let error = self.closed_error(reason);
        for event in events {
            event.fail(error.clone());
        }
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("environment_id", &self.environment_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

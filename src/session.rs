//! Per-connection session state: the pending-correlation table.
//!
//! The table is the single piece of shared mutable state in the proxy.
//! Entries are removed exactly once: on completion, on terminal error, or
//! when the session closes, in which case the caller synthesizes
//! cancellation errors for everything drained. Each entry carries a
//! generation token so a superseded request cannot remove (or write through)
//! the entry of its replacement with the same id.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::config::DuplicatePolicy;
use crate::models::RequestId;

/// Metadata tracked for one in-flight request.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub method: String,
    pub started_at: DateTime<Utc>,
    token: u64,
}

/// Outcome of admitting an inbound call.
#[derive(Debug)]
pub enum Admission {
    /// The id was free; a pending entry now exists under this token.
    New(u64),
    /// The id is pending and policy is reject: fail the new request only.
    Duplicate,
    /// The id was pending and policy is supersede: the original entry was
    /// replaced, the caller must cancel the original.
    Superseded { old: PendingEntry, token: u64 },
    /// The session is closed; nothing was admitted.
    Closed,
}

/// One client connection's lifecycle and correlation table.
#[derive(Debug)]
pub struct Session {
    policy: DuplicatePolicy,
    state: Mutex<SessionState>,
}

#[derive(Debug, Default)]
struct SessionState {
    closed: bool,
    next_token: u64,
    pending: HashMap<RequestId, PendingEntry>,
}

impl Session {
    #[must_use]
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(SessionState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to register `id` as pending.
    pub fn admit(&self, id: &RequestId, method: &str) -> Admission {
        let mut state = self.lock();
        if state.closed {
            return Admission::Closed;
        }
        let token = state.next_token;
        state.next_token += 1;
        let entry = PendingEntry {
            method: method.to_string(),
            started_at: Utc::now(),
            token,
        };
        match state.pending.entry(id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Admission::New(token)
            }
            Entry::Occupied(mut slot) => match self.policy {
                DuplicatePolicy::Reject => Admission::Duplicate,
                DuplicatePolicy::Supersede => Admission::Superseded {
                    old: slot.insert(entry),
                    token,
                },
            },
        }
    }

    /// Remove the entry admitted under `token`. Returns false when it was
    /// already removed (drained at teardown) or replaced (superseded), in
    /// which case the caller must not emit a terminal record.
    pub fn complete(&self, id: &RequestId, token: u64) -> bool {
        let mut state = self.lock();
        match state.pending.entry(id.clone()) {
            Entry::Occupied(slot) if slot.get().token == token => {
                slot.remove();
                true
            }
            _ => false,
        }
    }

    /// Whether the entry admitted under `token` is still the pending one.
    #[must_use]
    pub fn is_current(&self, id: &RequestId, token: u64) -> bool {
        self.lock()
            .pending
            .get(id)
            .is_some_and(|entry| entry.token == token)
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.lock().closed
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Transition to closed and drain every still-pending entry.
    pub fn close(&self) -> Vec<(RequestId, PendingEntry)> {
        let mut state = self.lock();
        state.closed = true;
        state.pending.drain().collect()
    }
}

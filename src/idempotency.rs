//! Idempotency registry (spec.md §4.4).
//!
//! Keyed by `(actor, operation_id, subscope?, idempotency_key)`. A first call
//! records the request's payload hash and runs the handler; a replay with the
//! same key and the same payload hash short-circuits to the recorded
//! response; a replay with the same key but a *different* payload hash is
//! rejected as `IDEMPOTENCY_KEY_REUSE_PAYLOAD_MISMATCH`.

use crate::dispatch::Actor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

enum EntryState {
    InProgress,
    Committed(Value),
}

struct Entry {
    payload_hash: String,
    state: EntryState,
}

pub enum BeginOutcome<Body> {
    /// No prior call under this scope key; run the handler. Caller must
    /// call [`IdempotencyRegistry::commit`] or
    /// [`IdempotencyRegistry::abort`] with the returned scope key.
    Run(String),
    /// A prior call with the same payload already completed; replay its
    /// recorded response.
    Replay(Body),
    /// A prior call under this scope key used a different payload.
    Mismatch,
}

#[derive(Default)]
pub struct IdempotencyRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl IdempotencyRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn scope_key(
        actor: &Actor,
        operation_id: &str,
        subscope: Option<&str>,
        idempotency_key: &str,
    ) -> String {
        format!(
            "{}|{}|{}|{}",
            actor.scope_key_material(),
            operation_id,
            subscope.unwrap_or(""),
            idempotency_key
        )
    }

    pub fn begin<Body: for<'de> Deserialize<'de>>(
        &self,
        actor: &Actor,
        operation_id: &str,
        subscope: Option<&str>,
        idempotency_key: &str,
        payload_hash: &str,
    ) -> BeginOutcome<Body> {
        let scope_key = Self::scope_key(actor, operation_id, subscope, idempotency_key);
        let mut entries = self.entries.lock();
        match entries.get(&scope_key) {
            None => {
                entries.insert(
                    scope_key.clone(),
                    Entry {
                        payload_hash: payload_hash.to_string(),
                        state: EntryState::InProgress,
                    },
                );
                BeginOutcome::Run(scope_key)
            }
            Some(entry) if entry.payload_hash != payload_hash => BeginOutcome::Mismatch,
            Some(entry) => match &entry.state {
                EntryState::Committed(body) => match serde_json::from_value(body.clone()) {
                    Ok(body) => BeginOutcome::Replay(body),
                    Err(_) => BeginOutcome::Run(scope_key),
                },
                EntryState::InProgress => BeginOutcome::Run(scope_key),
            },
        }
    }

    pub fn commit<Body: Serialize>(&self, scope_key: &str, body: &Body) {
        let value = match serde_json::to_value(body) {
            Ok(v) => v,
            Err(_) => return,
        };
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(scope_key) {
            entry.state = EntryState::Committed(value);
        }
    }

    /// Remove the in-flight marker after a failed handler run, so a retry
    /// with the same key and payload is allowed to run again rather than
    /// being stuck `InProgress` forever.
    pub fn abort(&self, scope_key: &str) {
        self.entries.lock().remove(scope_key);
    }
}

//! Process-local session memory.
//!
//! Stores small string values keyed by (session, key). Good enough for
//! carrying extracted preferences across turns within one process; anything
//! durable would implement `MemoryStore` against a real backend.

use relopipe_core::MemoryStore;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryStore for InMemoryStore {
    fn get(&self, session_id: &str, key: &str) -> Option<String> {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        sessions.get(session_id)?.get(key).cloned()
    }

    fn set(&self, session_id: &str, key: &str, value: String) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }
}

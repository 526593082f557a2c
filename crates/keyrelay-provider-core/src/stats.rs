use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Per-key request counters kept for the admin listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyCounters {
    pub usage: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
pub struct KeyStats {
    inner: Mutex<HashMap<String, KeyCounters>>,
}

impl KeyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, name: &str) {
        self.update(name, |c| c.usage += 1);
    }

    pub fn record_error(&self, name: &str) {
        self.update(name, |c| c.errors += 1);
    }

    pub fn get(&self, name: &str) -> KeyCounters {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    pub fn forget(&self, name: &str) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut KeyCounters)) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.entry(name.to_string()).or_default());
    }
}

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Remembers which watch keys already have a live watch. Membership is
/// additive for the process lifetime.
#[derive(Debug, Default)]
pub struct WatcherRegistry {
    keys: Mutex<HashSet<String>>,
}

impl WatcherRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Claims `key`. Returns true when this caller was the first to add it,
    /// so claim-and-spawn is a single atomic step.
    pub fn add(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned())
    }
}

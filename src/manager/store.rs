use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use k8s_openapi::api::core::v1::Endpoints;

use crate::k8s::client::PodList;

/// A complete resource object as delivered by the last watch event for its
/// key. Never a partial patch.
#[derive(Debug, Clone)]
pub enum Snapshot {
    Endpoints(Box<Endpoints>),
    Pods(Box<PodList>),
}

/// Thread-safe KV store for resource snapshots. A key is present iff at
/// least one watch event for it has been processed.
#[derive(Debug, Default)]
pub struct Store {
    data: Mutex<HashMap<String, Snapshot>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of the snapshot for `key`, if one has been stored.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Snapshot> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Stores `snapshot` under `key`, replacing any previous value.
    pub fn set(&self, key: &str, snapshot: Snapshot) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), snapshot);
    }
}

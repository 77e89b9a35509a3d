//! Process-wide cache of externally-defined user privileges.
//!
//! The external auth manager's thread is the only writer; everyone else
//! takes a short read lock. Freshness is judged against the manager's push
//! interval and an epoch that operators can bump to force re-authorization.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Instant;

struct Entry {
    definition: serde_json::Value,
    updated_at: Instant,
}

/// User -> privilege-definition cache.
#[derive(Default)]
pub struct RbacCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl RbacCache {
    pub fn new() -> RbacCache {
        RbacCache::default()
    }

    /// Install or replace the definition for the user named in `rbac`, an
    /// object of the shape `{"<username>": {...}}`. The last update wins.
    pub fn update_external_user(&self, rbac: &serde_json::Value) {
        let Some(object) = rbac.as_object() else {
            tracing::warn!("ignoring rbac payload that is not an object");
            return;
        };
        let mut entries = self.entries.write().unwrap();
        for (username, definition) in object {
            entries.insert(
                username.clone(),
                Entry {
                    definition: definition.clone(),
                    updated_at: Instant::now(),
                },
            );
        }
    }

    pub fn lookup(&self, username: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().unwrap();
        entries.get(username).map(|e| e.definition.clone())
    }

    /// When the cached entry for `username` was last refreshed.
    pub fn external_user_timestamp(&self, username: &str) -> Option<Instant> {
        let entries = self.entries.read().unwrap();
        entries.get(username).map(|e| e.updated_at)
    }

    pub fn remove(&self, username: &str) {
        self.entries.write().unwrap().remove(username);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

/// Milliseconds since an arbitrary process-wide anchor; lets freshness
/// epochs live in an atomic.
pub fn epoch_millis(at: Instant) -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = *ANCHOR.get_or_init(Instant::now);
    at.saturating_duration_since(anchor).as_millis() as u64
}

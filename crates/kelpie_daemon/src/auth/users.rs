//! Tracking of logged-in external users.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Refcounted multiset of external usernames. A user appears in the pushed
/// list while at least one connection is authenticated as them.
#[derive(Debug, Default)]
pub struct ActiveUsers {
    users: Mutex<BTreeMap<String, u64>>,
}

impl ActiveUsers {
    pub fn new() -> ActiveUsers {
        ActiveUsers::default()
    }

    pub fn login(&self, user: &str) {
        let mut users = self.users.lock().unwrap();
        *users.entry(user.to_string()).or_insert(0) += 1;
    }

    pub fn logoff(&self, user: &str) {
        let mut users = self.users.lock().unwrap();
        let count = users
            .get_mut(user)
            .unwrap_or_else(|| panic!("ActiveUsers::logoff: unknown user {user:?}"));
        *count -= 1;
        if *count == 0 {
            users.remove(user);
        }
    }

    /// JSON array of usernames, sorted for stable output.
    pub fn to_json(&self) -> serde_json::Value {
        let users = self.users.lock().unwrap();
        serde_json::Value::Array(
            users
                .keys()
                .map(|user| serde_json::Value::String(user.clone()))
                .collect(),
        )
    }
}

//! Daemon tuning knobs read from the environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default interval between active-user pushes to the auth provider.
pub const DEFAULT_ACTIVE_USERS_PUSH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug)]
pub struct Settings {
    /// How often the external auth manager pushes the active-user list.
    pub active_users_push_interval: Duration,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            active_users_push_interval: DEFAULT_ACTIVE_USERS_PUSH_INTERVAL,
        }
    }
}

impl Settings {
    pub fn from_env() -> Settings {
        Settings {
            active_users_push_interval: Duration::from_millis(read_env_u64(
                "KELPIE_AUTH_PUSH_INTERVAL_MS",
                DEFAULT_ACTIVE_USERS_PUSH_INTERVAL.as_millis() as u64,
            )),
        }
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

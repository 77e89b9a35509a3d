//! Engine tuning knobs read from the environment.

use std::env;
use std::str::FromStr;
use std::sync::OnceLock;

/// Default bound on failover-table entries per vbucket.
pub const DEFAULT_FAILOVER_CAPACITY: usize = 25;

/// Default timeout applied when a client leaves the sync-write timeout unset.
pub const DEFAULT_SYNC_WRITE_TIMEOUT_MS: u64 = 30_000;

/// Per-engine configuration.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Maximum number of failover entries retained per vbucket.
    pub failover_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            failover_capacity: DEFAULT_FAILOVER_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> EngineConfig {
        EngineConfig {
            failover_capacity: read_env_usize("KELPIE_FAILOVER_CAPACITY", DEFAULT_FAILOVER_CAPACITY)
                .max(1),
        }
    }
}

/// Whether expensive development-mode validation (duplicate-prepare scans)
/// is enabled. Read once; defaults to on for debug builds.
pub fn dev_asserts_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| read_env_bool("KELPIE_DEV_ASSERTS", cfg!(debug_assertions)))
}

fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}

fn read_env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            )
        })
        .unwrap_or(default)
}

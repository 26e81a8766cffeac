//! Engine timing: liveness thresholds and reap cadence.

use std::time::Duration;

/// Silence after which a peer is pinged and reported evasive.
pub const DEFAULT_EVASIVE_TIMEOUT: Duration = Duration::from_millis(5_000);
/// Silence after which a peer is declared gone.
pub const DEFAULT_EXPIRED_TIMEOUT: Duration = Duration::from_millis(30_000);
/// How often the peer table is swept.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_millis(1_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub evasive_timeout: Duration,
    pub expired_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evasive_timeout: DEFAULT_EVASIVE_TIMEOUT,
            expired_timeout: DEFAULT_EXPIRED_TIMEOUT,
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }
}

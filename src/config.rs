//! Bridge configuration

use std::time::Duration;

/// Tunables for the kernel bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How often the heartbeat probe is sent.
    pub heartbeat_interval: Duration,
    /// How long to wait for a single echo before counting a miss.
    pub heartbeat_timeout: Duration,
    /// Grace period for the initial heartbeat during `connect`; the kernel
    /// may still be starting.
    pub heartbeat_grace: Duration,
    /// Consecutive missed echoes before the kernel is marked unreachable.
    pub missed_heartbeat_limit: u32,
    /// How long late output for an aborted request is still absorbed before
    /// its correlation key is garbage-collected.
    pub tombstone_retention: Duration,
    /// Execute timeout applied when the caller does not supply one.
    pub default_execute_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(1),
            heartbeat_grace: Duration::from_secs(5),
            missed_heartbeat_limit: 3,
            tombstone_retention: Duration::from_secs(30),
            default_execute_timeout: Duration::from_secs(30),
        }
    }
}

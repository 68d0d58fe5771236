use serde::{Deserialize, Serialize};

use crate::autoinc::AutoincLockMode;
use crate::context::IsolationLevel;

/// Engine-wide configuration for the transaction layer.
///
/// All options map onto server system variables; every field has a
/// conservative default so `TxnConfig::default()` is a usable
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnConfig {
    /// Maximum number of transactions allowed past the commit admission
    /// point at once. `0` disables throttling.
    pub commit_concurrency: u32,

    /// Locking strategy for AUTO_INCREMENT reservation.
    pub autoinc_lock_mode: AutoincLockMode,

    /// Seconds a statement waits for a row lock before timing out.
    pub lock_wait_timeout_secs: u64,

    /// On lock-wait timeout, roll back the whole transaction instead of
    /// only the current statement.
    pub rollback_on_timeout: bool,

    /// Allow non-locking consistent reads for INSERT...SELECT-style
    /// statements even above READ COMMITTED.
    pub relaxed_locking: bool,

    /// Isolation level assigned to new sessions.
    pub default_isolation: IsolationLevel,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            commit_concurrency: 0,
            autoinc_lock_mode: AutoincLockMode::Consecutive,
            lock_wait_timeout_secs: 50,
            rollback_on_timeout: false,
            relaxed_locking: false,
            default_isolation: IsolationLevel::RepeatableRead,
        }
    }
}

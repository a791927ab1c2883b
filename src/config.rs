//! Tunables for the copy engine.
//!
//! The original tool reads these from module-level constants and CLI flags;
//! there is no GUC registry here, since this crate is a library linked into
//! a caller's process rather than a loaded server extension. Every field
//! below carries the original constant's value as its default so behavior
//! matches out of the box.

use std::time::Duration;

/// Engine-wide configuration, threaded through every component.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OscConfig {
    /// Target size, in bytes, of each dump chunk's `SELECT ... INTO OUTFILE`.
    pub chunk_bytes: u64,

    /// Target size, in bytes, of each checksum chunk.
    pub checksum_chunk_bytes: u64,

    /// Replay keeps chunking changes until it estimates it can finish
    /// replaying the remaining backlog within this many seconds, at which
    /// point it proceeds to the cutover-eligible state.
    pub replay_default_timeout: Duration,

    /// Row count per replay batch when no better estimate is available.
    pub default_batch_size: u64,

    /// Number of replay passes attempted before giving up with
    /// [`crate::error::OscError::ReplayMaxAttemptsExceeded`].
    pub default_replay_attempt: u32,

    /// Fraction of total disk space that must remain free after accounting
    /// for the dump's estimated footprint.
    pub reserved_space_percent: u8,

    /// A transaction running longer than this many seconds is considered
    /// long-running for `Threads_running`/DDL-guard purposes.
    pub long_trx_time_secs: u64,

    /// DDL guard blocks while `Threads_running` exceeds this value.
    pub max_running_before_ddl: u32,

    /// Number of DDL-guard polling attempts before raising
    /// [`crate::error::OscError::GuardExhausted`].
    pub ddl_guard_attempts: u32,

    /// Number of attempts to acquire a blocking write lock before killing
    /// the longest-waiting competing query.
    pub lock_max_attempts: u32,

    /// Maximum wait, per attempt, before the kill-timer fires and the
    /// session kills the blocking query.
    pub lock_max_wait_before_kill: Duration,

    /// `wait_timeout`/`session_wait_timeout` set on the long-lived session;
    /// large tables can take a while to copy.
    pub session_wait_timeout: Duration,

    /// Number of change-log rows grouped per replay batch.
    pub default_replay_group_size: u64,

    /// Tables at or above this estimated size (bytes) require an explicit
    /// index covering the filter key on the shadow table, or the opt-out
    /// flag, before Cutover is allowed to proceed.
    pub pk_coverage_size_threshold: u64,

    /// Ceiling, in seconds, the engine will wait on a single slow query
    /// (e.g. a chunk dump) before treating it as stalled.
    pub max_wait_for_slow_query: u64,

    /// Hard ceiling on rows included in one replay batch regardless of
    /// `default_replay_group_size`.
    pub max_replay_batch_size: u64,

    /// If the change-log accumulates more rows than this, the table is
    /// changing faster than replay could ever converge and the run aborts
    /// with [`crate::error::OscError::ReplayTooManyDeltas`].
    pub max_replay_changes: u64,

    /// Name of the server-wide named mutex (`GET_LOCK`) serializing
    /// concurrent schema changes against the same table.
    pub lock_name: String,

    /// When true, a new primary key may be added without an explicit
    /// opt-in flag having been required upstream (the opt-in itself is an
    /// external-interface concern; this just reflects whatever the caller
    /// decided).
    pub allow_new_pk: bool,

    /// Skip the shadow-table index-coverage check for the filter key even
    /// on tables at or above [`Self::pk_coverage_size_threshold`].
    pub skip_pk_coverage_check: bool,

    /// Force cleanup to run even when ordinary exit conditions would skip
    /// it (used for crash recovery against a table left behind by a killed
    /// run).
    pub force_cleanup: bool,

    /// Whether the server-wide named mutex is acquired at all. Disabling
    /// it opts out of the single-writer guarantee that keeps concurrent
    /// runs against the same table from colliding; only meant for test
    /// harnesses driving multiple engine instances against disposable
    /// schemas.
    pub named_mutex_enabled: bool,

    /// Extra `SET SESSION <name> = <value>` pairs applied during
    /// [`crate::session::SessionController::init`], beyond the fixed
    /// isolation/strict-mode/binlog settings the init sequence always
    /// applies.
    pub session_overrides: Vec<(String, String)>,
}

impl Default for OscConfig {
    fn default() -> Self {
        OscConfig {
            chunk_bytes: 2 * 1024 * 1024,
            checksum_chunk_bytes: 64 * 1024 * 1024,
            replay_default_timeout: Duration::from_secs(5),
            default_batch_size: 500,
            default_replay_attempt: 15,
            reserved_space_percent: 1,
            long_trx_time_secs: 30,
            max_running_before_ddl: 200,
            ddl_guard_attempts: 600,
            lock_max_attempts: 3,
            lock_max_wait_before_kill: Duration::from_millis(500),
            session_wait_timeout: Duration::from_secs(604_800),
            default_replay_group_size: 200,
            pk_coverage_size_threshold: 500 * 1024 * 1024,
            max_wait_for_slow_query: 100,
            max_replay_batch_size: 500_000,
            max_replay_changes: 2_146_483_647,
            lock_name: "OnlineSchemaChange".to_string(),
            allow_new_pk: false,
            skip_pk_coverage_check: false,
            force_cleanup: false,
            named_mutex_enabled: true,
            session_overrides: Vec::new(),
        }
    }
}

impl OscConfig {
    /// A looser, larger-chunked configuration for bulk/warehouse-style runs,
    /// mirroring the original tool's separate `wsenv` chunk size.
    pub fn warehouse_defaults() -> Self {
        OscConfig {
            chunk_bytes: 64 * 1024 * 1024,
            ..OscConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_known_values() {
        let cfg = OscConfig::default();
        assert_eq!(cfg.chunk_bytes, 2 * 1024 * 1024);
        assert_eq!(cfg.default_replay_group_size, 200);
        assert_eq!(cfg.lock_name, "OnlineSchemaChange");
        assert_eq!(cfg.max_replay_changes, 2_146_483_647);
    }

    #[test]
    fn warehouse_defaults_only_changes_chunk_size() {
        let base = OscConfig::default();
        let wh = OscConfig::warehouse_defaults();
        assert_eq!(wh.chunk_bytes, 64 * 1024 * 1024);
        assert_eq!(wh.default_batch_size, base.default_batch_size);
    }
}

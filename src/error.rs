//! Structured error types for the copy engine.
//!
//! Every failure kind named in the design is a distinct variant so the
//! [`crate::orchestrator::Orchestrator`] can `match` on it instead of parsing
//! strings. Codes and retryability are ported from the original tool's
//! `OSCError.ERR_MAPPING` table so that operational tooling keyed off those
//! numbers keeps working.

use std::path::PathBuf;

/// All typed failures the copy and cleanup engines can raise.
#[derive(Debug, thiserror::Error)]
pub enum OscError {
    #[error("failed to connect to MySQL: {detail}")]
    ConnectFailed { detail: String },

    #[error("failed to fetch MySQL session/global variables: {detail}")]
    VarsFetchFailed { detail: String },

    #[error("database does not exist: {db}")]
    DbNotExist { db: String },

    #[error("table `{db}`.`{table}` already exists")]
    TableAlreadyExists { db: String, table: String },

    #[error("table `{db}`.`{table}` does not exist")]
    TableNotExist { db: String, table: String },

    #[error("trigger(s) already exist on table: {triggers}")]
    TriggerAlreadyExists { triggers: String },

    #[error("`{db}`.`{table}` is referencing or referenced by a foreign key: {fk}")]
    ForeignKeyFound { db: String, table: String, fk: String },

    #[error("table `{db}`.`{table}` has no primary key")]
    NoPrimaryKey { db: String, table: String },

    #[error(
        "adding a new primary key opens a long-running dump transaction; pass the new-pk opt-in if that is acceptable"
    )]
    NewPrimaryKeyRequiresOptIn,

    #[error(
        "no index on the shadow table covers the filter key <{pk_names}>; pass the pk-coverage-check opt-out if you are sure"
    )]
    NoIndexCoverage { pk_names: String },

    #[error("column `{column}` is part of the current primary key and is dropped in the new schema")]
    PrimaryColumnDropped { column: String },

    #[error("not enough disk space to execute the schema change: required {need}, available {avail}")]
    NotEnoughSpace { need: u64, avail: u64 },

    #[error("outfile already exists: {}", path.display())]
    FileAlreadyExists { path: PathBuf },

    #[error("failed to decide an optimal chunk size for the dump")]
    DumpChunkSizeUnknown,

    #[error("engine `{found}` does not match the requested engine `{expected}`")]
    WrongEngine { found: String, expected: String },

    #[error("adding a column defaulting to CURRENT_TIMESTAMP is unsafe to bootstrap via replay")]
    UnsafeTimestampBootstrap,

    #[error(
        "running with row-based-replication is not safe for this server: triggers would replicate their own writes"
    )]
    NotRbrSafe,

    #[error("failed to acquire lock: {detail}")]
    LockAcquireFailed { detail: String },

    #[error("Threads_running did not drop below the DDL guard threshold after {attempts} attempts")]
    GuardExhausted { attempts: u32 },

    #[error("CREATE TRIGGER failed: {detail}")]
    TriggerCreateFailed { detail: String },

    #[error("replay group affected {actual} row(s), expected {expected}")]
    ReplayAffectedRowsMismatch { expected: u64, actual: u64 },

    #[error("timed out replaying changes within the {timeout_secs}s budget")]
    ReplayTimeout { timeout_secs: f64 },

    #[error("replay did not converge within the {timeout_secs}s budget after {attempts} attempts")]
    ReplayMaxAttemptsExceeded { attempts: u32, timeout_secs: f64 },

    #[error("recorded too many changes to ever catch up ({deltas} > max replay changes {max_deltas})")]
    ReplayTooManyDeltas { deltas: u64, max_deltas: u64 },

    #[error("checksum mismatch between original and shadow table")]
    CheckSumMismatch,

    #[error("cleanup statement failed: {sql}: {detail}")]
    CleanupExecutionError { sql: String, detail: String },

    #[error("named mutex `{name}` is held by another session (id {holder_id:?})")]
    MutexHeld { name: String, holder_id: Option<u64> },

    #[error("assertion failed: expected {expected}, got {got}")]
    Assertion { expected: String, got: String },

    #[error("{stage}: [{mysql_errno}] {message}")]
    Generic {
        stage: &'static str,
        mysql_errno: u16,
        message: String,
    },
}

impl OscError {
    /// Stable numeric code, ported from the original tool's `ERR_MAPPING`.
    pub fn code(&self) -> u32 {
        match self {
            OscError::ConnectFailed { .. } => 119,
            OscError::VarsFetchFailed { .. } => 121,
            OscError::DbNotExist { .. } => 111,
            OscError::TableAlreadyExists { .. } => 122,
            OscError::TriggerAlreadyExists { .. } => 123,
            OscError::ForeignKeyFound { .. } => 144,
            OscError::TableNotExist { .. } => 125,
            OscError::NoPrimaryKey { .. } => 127,
            OscError::NewPrimaryKeyRequiresOptIn => 139,
            OscError::NoIndexCoverage { .. } => 138,
            OscError::PrimaryColumnDropped { .. } => 146,
            OscError::NotEnoughSpace { .. } => 128,
            OscError::FileAlreadyExists { .. } => 106,
            OscError::DumpChunkSizeUnknown => 137,
            OscError::WrongEngine { .. } => 145,
            OscError::UnsafeTimestampBootstrap => 152,
            OscError::NotRbrSafe => 148,
            OscError::LockAcquireFailed { .. } => 136,
            OscError::GuardExhausted { .. } => 129,
            OscError::TriggerCreateFailed { .. } => 153,
            OscError::ReplayAffectedRowsMismatch { .. } => 133,
            OscError::ReplayTimeout { .. } => 132,
            OscError::ReplayMaxAttemptsExceeded { .. } => 140,
            OscError::ReplayTooManyDeltas { .. } => 151,
            OscError::CheckSumMismatch => 134,
            OscError::CleanupExecutionError { .. } => 250,
            OscError::MutexHeld { .. } => 115,
            OscError::Assertion { .. } => 249,
            OscError::Generic { .. } => 254,
        }
    }

    /// A short name for the variant, used alongside `code()` in the
    /// single-line failure message spec §7 asks for.
    pub fn kind_name(&self) -> &'static str {
        match self {
            OscError::ConnectFailed { .. } => "CONNECT_FAILED",
            OscError::VarsFetchFailed { .. } => "VARS_FETCH_FAILED",
            OscError::DbNotExist { .. } => "DB_NOT_EXIST",
            OscError::TableAlreadyExists { .. } => "TABLE_ALREADY_EXIST",
            OscError::TableNotExist { .. } => "TABLE_NOT_EXIST",
            OscError::TriggerAlreadyExists { .. } => "TRIGGER_ALREADY_EXIST",
            OscError::ForeignKeyFound { .. } => "FOREIGN_KEY_FOUND",
            OscError::NoPrimaryKey { .. } => "NO_PK_EXIST",
            OscError::NewPrimaryKeyRequiresOptIn => "NEW_PK",
            OscError::NoIndexCoverage { .. } => "NO_INDEX_COVERAGE",
            OscError::PrimaryColumnDropped { .. } => "PRI_COL_DROPPED",
            OscError::NotEnoughSpace { .. } => "NOT_ENOUGH_SPACE",
            OscError::FileAlreadyExists { .. } => "FILE_ALREADY_EXIST",
            OscError::DumpChunkSizeUnknown => "FAIL_TO_GUESS_CHUNK_SIZE",
            OscError::WrongEngine { .. } => "WRONG_ENGINE",
            OscError::UnsafeTimestampBootstrap => "UNSAFE_TS_BOOTSTRAP",
            OscError::NotRbrSafe => "NOT_RBR_SAFE",
            OscError::LockAcquireFailed { .. } => "UNABLE_TO_GET_LOCK",
            OscError::GuardExhausted { .. } => "DDL_GUARD_ATTEMPTS",
            OscError::TriggerCreateFailed { .. } => "CREATE_TRIGGER_ERROR",
            OscError::ReplayAffectedRowsMismatch { .. } => "REPLAY_WRONG_AFFECTED",
            OscError::ReplayTimeout { .. } => "REPLAY_TIMEOUT",
            OscError::ReplayMaxAttemptsExceeded { .. } => "MAX_ATTEMPT_EXCEEDED",
            OscError::ReplayTooManyDeltas { .. } => "REPLAY_TOO_MANY_DELTAS",
            OscError::CheckSumMismatch => "CHECKSUM_MISMATCH",
            OscError::CleanupExecutionError { .. } => "CLEANUP_EXECUTION_ERROR",
            OscError::MutexHeld { .. } => "FAILED_TO_LOCK",
            OscError::Assertion { .. } => "ASSERTION_ERROR",
            OscError::Generic { .. } => "GENERIC_MYSQL_ERROR",
        }
    }

    /// Whether the orchestrator may reasonably retry the stage that raised
    /// this error. The driver itself never auto-retries (spec §7); this is
    /// advisory information surfaced to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OscError::ConnectFailed { .. }
                | OscError::VarsFetchFailed { .. }
                | OscError::NotEnoughSpace { .. }
                | OscError::DumpChunkSizeUnknown
                | OscError::LockAcquireFailed { .. }
                | OscError::GuardExhausted { .. }
                | OscError::TriggerCreateFailed { .. }
                | OscError::ReplayTimeout { .. }
                | OscError::ReplayMaxAttemptsExceeded { .. }
                | OscError::ReplayTooManyDeltas { .. }
                | OscError::CheckSumMismatch
                | OscError::CleanupExecutionError { .. }
                | OscError::MutexHeld { .. }
                | OscError::Generic { .. }
        )
    }

    /// Whether the driver session appears to have been severed by the
    /// server ("server has gone away" class errors). The Orchestrator uses
    /// this to decide whether Cleanup should still drop the change-log table
    /// (spec §9, Open Questions: this conditional is intentionally narrow
    /// and must not be generalized).
    pub fn is_server_gone(&self) -> bool {
        match self {
            OscError::Generic { mysql_errno, .. } => matches!(mysql_errno, 2006 | 2013),
            OscError::ConnectFailed { .. } => true,
            _ => false,
        }
    }

    /// The single-line, user-facing failure message spec §7 calls for:
    /// stage, typed error kind, code, and contextual detail.
    pub fn describe(&self, stage: &str) -> String {
        format!("{stage}: {} (code {}): {}", self.kind_name(), self.code(), self)
    }
}

pub type OscResult<T> = Result<T, OscError>;

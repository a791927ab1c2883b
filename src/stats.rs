//! Structured progress reporting for a running schema change.
//!
//! The original tool's monitoring layer emits `NOTIFY`-style JSON events a
//! listener subscribes to; this engine has no equivalent in-process
//! broadcast channel; instead each [`ProgressEvent`] is both emitted as a
//! structured `tracing` event (so it shows up in whatever the host
//! process already logs to) and returned to the caller as serializable
//! data for callers that want to forward it elsewhere (a status table, a
//! metrics sink, a CLI progress bar).

use serde::Serialize;

/// The stage of the pipeline a [`ProgressEvent`] was emitted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Setup,
    TriggerInstall,
    Dump,
    Load,
    ChecksumFull,
    Replay,
    ChecksumDelta,
    Cutover,
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::TriggerInstall => "trigger_install",
            Stage::Dump => "dump",
            Stage::Load => "load",
            Stage::ChecksumFull => "checksum_full",
            Stage::Replay => "replay",
            Stage::ChecksumDelta => "checksum_delta",
            Stage::Cutover => "cutover",
            Stage::Cleanup => "cleanup",
        }
    }
}

/// A point-in-time status update about a running schema change,
/// identifying the table and stage along with whatever counters are
/// meaningful at that stage.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub db: String,
    pub table: String,
    pub stage: Stage,
    pub message: String,
    /// Rows processed so far in the current stage, when the stage counts
    /// rows (dump chunks copied, replay rows applied).
    pub rows_processed: Option<u64>,
    /// Total expected, when known in advance (row-estimate at dump start).
    pub rows_total: Option<u64>,
    pub attempt: Option<u32>,
}

impl ProgressEvent {
    pub fn new(db: &str, table: &str, stage: Stage, message: impl Into<String>) -> Self {
        ProgressEvent {
            db: db.to_string(),
            table: table.to_string(),
            stage,
            message: message.into(),
            rows_processed: None,
            rows_total: None,
            attempt: None,
        }
    }

    pub fn with_rows(mut self, processed: u64, total: Option<u64>) -> Self {
        self.rows_processed = Some(processed);
        self.rows_total = total;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Emits this event as a structured `tracing` info event and returns
    /// it, so callers driving the orchestrator can both log as they go
    /// and accumulate a history for a post-run summary.
    pub fn emit(self) -> Self {
        tracing::info!(
            db = %self.db,
            table = %self.table,
            stage = self.stage.as_str(),
            rows_processed = self.rows_processed,
            rows_total = self.rows_total,
            attempt = self.attempt,
            "{}",
            self.message,
        );
        self
    }

    /// JSON form, for callers forwarding progress to an external sink
    /// instead of (or in addition to) the tracing subscriber.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Emits a stage-transition event at `tracing::info!` with no row counters.
pub fn emit_stage_start(db: &str, table: &str, stage: Stage) -> ProgressEvent {
    ProgressEvent::new(db, table, stage, format!("entering stage {}", stage.as_str())).emit()
}

/// Emits a stage-failure event at `tracing::error!`.
pub fn emit_stage_failed(db: &str, table: &str, stage: Stage, detail: &str) -> ProgressEvent {
    let event = ProgressEvent::new(db, table, stage, format!("stage failed: {detail}"));
    tracing::error!(
        db = %event.db,
        table = %event.table,
        stage = event.stage.as_str(),
        "{}",
        event.message,
    );
    event
}

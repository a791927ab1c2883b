//! Component C: installs the three `AFTER INSERT|UPDATE|DELETE` triggers
//! that capture DML against the source table into the change-log table
//! while the copy is in flight.
//!
//! An `UPDATE` that changes the filter-key columns is captured as a
//! delete-of-old plus insert-of-new rather than a single update row, since
//! replay keys its lookups by the filter columns and a changed key would
//! otherwise target the wrong shadow-table row.

use std::time::Duration;

use crate::config::OscConfig;
use crate::error::{OscError, OscResult};
use crate::naming::{delete_trigger_name, insert_trigger_name, quote_ident, update_trigger_name};
use crate::session::{KillTimer, SessionController, SqlSession};
use crate::version::Capabilities;

/// Name of the change-log column recording which DML kind produced a row.
pub const DML_COL_NAME: &str = "_osc_dml_type_";
/// Name of the change-log's own monotonic id column.
pub const ID_COL_NAME: &str = "_osc_ID_";

pub const DML_TYPE_INSERT: u8 = 1;
pub const DML_TYPE_DELETE: u8 = 2;
pub const DML_TYPE_UPDATE: u8 = 3;

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_list_with_prefix(columns: &[String], prefix: &str) -> String {
    columns
        .iter()
        .map(|c| format!("{prefix}.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn match_clause(left: &str, right: &str, pk_columns: &[String]) -> String {
    pk_columns
        .iter()
        .map(|c| format!("{left}.{} = {right}.{}", quote_ident(c), quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn insert_trigger_sql(
    trigger_name: &str,
    table: &str,
    delta_table: &str,
    columns: &[String],
) -> String {
    format!(
        "CREATE TRIGGER {} AFTER INSERT ON {} FOR EACH ROW \
         INSERT INTO {} ({}, {}) VALUES ({}, {})",
        quote_ident(trigger_name),
        quote_ident(table),
        quote_ident(delta_table),
        quote_ident(DML_COL_NAME),
        column_list(columns),
        DML_TYPE_INSERT,
        column_list_with_prefix(columns, "NEW"),
    )
}

fn delete_trigger_sql(
    trigger_name: &str,
    table: &str,
    delta_table: &str,
    columns: &[String],
) -> String {
    format!(
        "CREATE TRIGGER {} AFTER DELETE ON {} FOR EACH ROW \
         INSERT INTO {} ({}, {}) VALUES ({}, {})",
        quote_ident(trigger_name),
        quote_ident(table),
        quote_ident(delta_table),
        quote_ident(DML_COL_NAME),
        column_list(columns),
        DML_TYPE_DELETE,
        column_list_with_prefix(columns, "OLD"),
    )
}

fn update_trigger_sql(
    trigger_name: &str,
    table: &str,
    delta_table: &str,
    columns: &[String],
    filter_columns: &[String],
) -> String {
    format!(
        "CREATE TRIGGER {} AFTER UPDATE ON {} FOR EACH ROW \
         IF ({}) THEN \
         INSERT INTO {} ({}, {}) VALUES ({}, {}); \
         ELSE \
         INSERT INTO {} ({}, {}) VALUES ({}, {}), ({}, {}); \
         END IF",
        quote_ident(trigger_name),
        quote_ident(table),
        match_clause("OLD", "NEW", filter_columns),
        quote_ident(delta_table),
        quote_ident(DML_COL_NAME),
        column_list(columns),
        DML_TYPE_UPDATE,
        column_list_with_prefix(columns, "NEW"),
        quote_ident(delta_table),
        quote_ident(DML_COL_NAME),
        column_list(columns),
        DML_TYPE_DELETE,
        column_list_with_prefix(columns, "OLD"),
        DML_TYPE_INSERT,
        column_list_with_prefix(columns, "NEW"),
    )
}

/// Installs and removes the three capture triggers for a single run.
pub struct TriggerInstaller<'a> {
    pub config: &'a OscConfig,
    pub caps: &'a Capabilities,
}

impl<'a> TriggerInstaller<'a> {
    pub fn new(config: &'a OscConfig, caps: &'a Capabilities) -> Self {
        TriggerInstaller { config, caps }
    }

    /// Fails if any trigger already exists on `table`, since the engine
    /// cannot safely coexist with pre-existing triggers it doesn't own.
    pub fn check_no_existing_triggers(
        &self,
        session: &mut dyn SqlSession,
        db: &str,
        table: &str,
    ) -> OscResult<()> {
        let rows = session.query(&format!(
            "SELECT TRIGGER_NAME, ACTION_TIMING, EVENT_MANIPULATION \
             FROM information_schema.TRIGGERS \
             WHERE EVENT_OBJECT_TABLE = '{}' AND EVENT_OBJECT_SCHEMA = '{}'",
            table.replace('\'', "''"),
            db.replace('\'', "''"),
        ))?;
        if rows.is_empty() {
            return Ok(());
        }
        let desc = rows
            .iter()
            .map(|r| {
                format!(
                    "{}: {} {}",
                    r.get("TRIGGER_NAME").and_then(|v| v.clone()).unwrap_or_default(),
                    r.get("ACTION_TIMING").and_then(|v| v.clone()).unwrap_or_default(),
                    r.get("EVENT_MANIPULATION").and_then(|v| v.clone()).unwrap_or_default(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        Err(OscError::TriggerAlreadyExists { triggers: desc })
    }

    /// Creates all three triggers. The caller is expected to have already
    /// taken a write lock on `table` (directly, or via high-priority DDL
    /// where supported) so the `CREATE TRIGGER` metadata-lock acquisitions
    /// can't be starved by concurrent readers.
    pub fn install(
        &self,
        session: &mut dyn SqlSession,
        table: &str,
        delta_table: &str,
        columns: &[String],
        filter_columns: &[String],
    ) -> OscResult<[String; 3]> {
        let insert_name = insert_trigger_name(table);
        let update_name = update_trigger_name(table);
        let delete_name = delete_trigger_name(table);

        let create = |session: &mut dyn SqlSession, sql: String| -> OscResult<()> {
            session
                .execute(&sql)
                .map(|_| ())
                .map_err(|e| OscError::TriggerCreateFailed {
                    detail: e.to_string(),
                })
        };

        create(
            session,
            insert_trigger_sql(&insert_name, table, delta_table, columns),
        )?;
        create(
            session,
            delete_trigger_sql(&delete_name, table, delta_table, columns),
        )?;
        create(
            session,
            update_trigger_sql(&update_name, table, delta_table, columns, filter_columns),
        )?;

        Ok([insert_name, update_name, delete_name])
    }

    /// Drops all three triggers by name; used by cleanup, tolerant of
    /// triggers that are already gone.
    pub fn drop_all(&self, session: &mut dyn SqlSession, names: &[String; 3]) -> OscResult<()> {
        for name in names {
            session.execute(&format!("DROP TRIGGER IF EXISTS {}", quote_ident(name)))?;
        }
        Ok(())
    }

    /// Installs the three triggers, first serializing with concurrent
    /// writers per spec §4.C: "serialize with table writers via either
    /// high-priority DDL or a brief write lock on O. While holding it,
    /// wait for any long-running statement referencing O to drain, with a
    /// bounded attempt budget; otherwise proceed to kill long selects on O
    /// only." When the server is known to support high-priority DDL,
    /// `CREATE TRIGGER` itself is enough to jump the metadata-lock queue
    /// and no lock is taken. Otherwise: drain first (bounded, fails with
    /// [`OscError::GuardExhausted`] if exhausted), then take the write
    /// lock racing a kill-timer that kills long `SELECT`s on `table`
    /// if the lock can't be acquired before `lock_max_wait_before_kill`
    /// elapses (the same single-shot-timer coordination
    /// [`crate::cutover::CutoverCoordinator::lock_with_kill_timer`] uses
    /// for the cutover write lock).
    #[allow(clippy::too_many_arguments)]
    pub fn install_serialized(
        &self,
        session: &mut dyn SqlSession,
        db: &str,
        table: &str,
        delta_table: &str,
        columns: &[String],
        filter_columns: &[String],
        high_priority_ddl_supported: bool,
        lock_max_wait_before_kill: Duration,
        sleep: impl Fn(Duration),
        kill: impl FnOnce() + Send + 'static,
    ) -> OscResult<[String; 3]> {
        if high_priority_ddl_supported {
            return self.install(session, table, delta_table, columns, filter_columns);
        }

        {
            let mut controller = SessionController::new(session, self.config, self.caps);
            controller.wait_for_drain(db, table, sleep)?;
        }

        lock_for_trigger_install(session, table, lock_max_wait_before_kill, kill)?;
        let result = self.install(session, table, delta_table, columns, filter_columns);
        unlock_after_trigger_install(session).ok();
        result
    }
}

/// Takes a brief `LOCK TABLES ... WRITE` on `table` before trigger
/// creation, arming a kill-timer so a long-running `SELECT`/`ALTER`
/// against it can't stall the lock acquisition indefinitely (spec §4.C,
/// §5). `kill` is expected to issue `KILL` against the blocking
/// statement on a separate connection from `session`.
pub fn lock_for_trigger_install(
    session: &mut dyn SqlSession,
    table: &str,
    lock_max_wait_before_kill: Duration,
    kill: impl FnOnce() + Send + 'static,
) -> OscResult<()> {
    let timer = KillTimer::arm(lock_max_wait_before_kill, kill);
    let result = session.execute(&format!("LOCK TABLES {} WRITE", quote_ident(table)));
    timer.cancel();
    result.map(|_| ()).map_err(|e| OscError::LockAcquireFailed {
        detail: e.to_string(),
    })
}

pub fn unlock_after_trigger_install(session: &mut dyn SqlSession) -> OscResult<()> {
    session.execute("UNLOCK TABLES")?;
    Ok(())
}

/// Spec §4.C's RBR-safety gate: triggers must not be created when the
/// server would replicate their statement-based execution to a replica
/// that has no change-log table to write into.
pub fn enforce_rbr_safety(rbr_safe: bool) -> OscResult<()> {
    if rbr_safe {
        Ok(())
    } else {
        Err(OscError::NotRbrSafe)
    }
}

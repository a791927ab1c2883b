//! Component I: reconciles orphaned shadow tables, triggers, and dump
//! files left behind by a run that failed, was killed, or crashed.
//!
//! The [`Ledger`] is plain data — a list of artifacts registered *before*
//! the operation that creates them runs, so a partial failure still
//! knows what to clean up. [`CleanupEngine`] consumes a ledger (forced
//! or crash-recovery mode) and is itself consumed by
//! [`crate::orchestrator::Orchestrator`]; there is no back-reference from
//! Cleanup into Copy, per spec §9's note on breaking the original's
//! cyclic ownership.

use std::path::PathBuf;

use regex::Regex;

use crate::error::{OscError, OscResult};
use crate::naming::{quote_ident, ALL_FILE_PREFIXES, ALL_TABLE_PREFIXES, ALL_TRIGGER_PREFIXES};
use crate::session::SqlSession;

/// MySQL error codes for "no such partition", tolerated during
/// incremental partition-drop cleanup since concurrent partition
/// maintenance on the same table is not itself an error condition.
const ERR_SAME_NAME_PARTITION: u16 = 1507;
const ERR_DROP_LAST_PARTITION: u16 = 1508;

/// One artifact the engine has created (or is about to create) during a
/// run, tracked so it is guaranteed to be removed regardless of how the
/// run ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEntry {
    Table { db: String, name: String, partitioned: bool },
    Trigger { db: String, name: String },
    File(PathBuf),
}

/// Append-only list of artifacts created during one run.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Ledger {
        Ledger::default()
    }

    pub fn register_table(&mut self, db: &str, name: &str, partitioned: bool) {
        self.entries.push(LedgerEntry::Table {
            db: db.to_string(),
            name: name.to_string(),
            partitioned,
        });
    }

    pub fn register_trigger(&mut self, db: &str, name: &str) {
        self.entries.push(LedgerEntry::Trigger {
            db: db.to_string(),
            name: name.to_string(),
        });
    }

    pub fn register_file(&mut self, path: PathBuf) {
        self.entries.push(LedgerEntry::File(path));
    }

    /// Drops the entry for a file that was already removed by the
    /// ordinary pipeline (e.g. the Loader deletes each chunk as it's
    /// ingested) so Cleanup doesn't try to remove it again.
    pub fn forget_file(&mut self, path: &PathBuf) {
        self.entries.retain(|e| !matches!(e, LedgerEntry::File(p) if p == path));
    }

    /// Removes the change-log table's ledger entry without removing the
    /// others — used by the "skip-cleanup-after-kill" path (spec §9 Open
    /// Questions) when the driver session was severed by the server:
    /// triggers must still be dropped so the source table stops writing
    /// to a change-log, but the change-log/shadow table are deliberately
    /// left for forensic inspection.
    pub fn drop_table_entries(&mut self, name: &str) {
        self.entries.retain(|e| !matches!(e, LedgerEntry::Table { name: n, .. } if n == name));
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Drops a table, dropping all but one partition incrementally first if
/// `partitioned`, to reduce metadata-lock contention (spec §4.I).
/// Errors 1507/1508 (partition already gone / can't drop the last one)
/// are tolerated since concurrent partition maintenance on the same
/// table is expected, not a bug.
fn drop_table(session: &mut dyn SqlSession, db: &str, name: &str, partitioned: bool) -> OscResult<()> {
    if partitioned {
        let rows = session.query(&format!(
            "SELECT PARTITION_NAME FROM information_schema.PARTITIONS \
             WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}' AND PARTITION_NAME IS NOT NULL \
             ORDER BY PARTITION_ORDINAL_POSITION",
            db.replace('\'', "''"),
            name.replace('\'', "''"),
        ))?;
        let partitions: Vec<String> = rows
            .iter()
            .filter_map(|r| r.get("PARTITION_NAME").and_then(|v| v.clone()))
            .collect();
        for p in partitions.iter().take(partitions.len().saturating_sub(1)) {
            let sql = format!(
                "ALTER TABLE {} DROP PARTITION {}",
                quote_ident(name),
                quote_ident(p)
            );
            if let Err(e) = session.execute(&sql) {
                if !is_tolerated_partition_error(&e) {
                    return Err(OscError::CleanupExecutionError {
                        sql,
                        detail: e.to_string(),
                    });
                }
            }
        }
    }
    let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(name));
    session.execute(&sql).map(|_| ()).map_err(|e| OscError::CleanupExecutionError {
        sql,
        detail: e.to_string(),
    })
}

fn is_tolerated_partition_error(e: &OscError) -> bool {
    matches!(
        e,
        OscError::Generic { mysql_errno, .. }
            if *mysql_errno == ERR_SAME_NAME_PARTITION || *mysql_errno == ERR_DROP_LAST_PARTITION
    )
}

fn drop_trigger(session: &mut dyn SqlSession, name: &str) -> OscResult<()> {
    let sql = format!("DROP TRIGGER IF EXISTS {}", quote_ident(name));
    session.execute(&sql).map(|_| ()).map_err(|e| OscError::CleanupExecutionError {
        sql,
        detail: e.to_string(),
    })
}

fn remove_file(path: &PathBuf) -> OscResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OscError::CleanupExecutionError {
            sql: format!("rm {}", path.display()),
            detail: e.to_string(),
        }),
    }
}

/// Runs a ledger to completion: triggers first, then tables, then
/// files — dropping triggers before tables so DML against the source
/// table between the two steps can't reference a change-log that no
/// longer exists (spec §4.I). Every entry is attempted even after a
/// failure; the first error encountered is returned once the sweep
/// finishes.
pub fn execute_ledger(session: &mut dyn SqlSession, ledger: &Ledger) -> OscResult<()> {
    let mut first_err: Option<OscError> = None;
    let mut record = |r: OscResult<()>| {
        if let Err(e) = r {
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    };

    for entry in ledger.entries() {
        if let LedgerEntry::Trigger { name, .. } = entry {
            record(drop_trigger(session, name));
        }
    }
    for entry in ledger.entries() {
        if let LedgerEntry::Table { name, partitioned, db, .. } = entry {
            record(drop_table(session, db, name, *partitioned));
        }
    }
    for entry in ledger.entries() {
        if let LedgerEntry::File(path) = entry {
            record(remove_file(path));
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Matches a table/trigger/file name against every prefix this engine
/// has ever used across either long or short naming tiers.
fn matches_any_prefix(name: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| name.starts_with(p))
}

/// Enumerates every table in `db` whose name matches one of the engine's
/// table-name prefixes (both long and short tiers), along with whether
/// it's partitioned.
pub fn discover_orphan_tables(session: &mut dyn SqlSession, db: &str) -> OscResult<Vec<(String, bool)>> {
    let rows = session.query(&format!(
        "SELECT TABLE_NAME, CREATE_OPTIONS FROM information_schema.TABLES WHERE TABLE_SCHEMA = '{}'",
        db.replace('\'', "''"),
    ))?;
    Ok(rows
        .into_iter()
        .filter_map(|r| {
            let name = r.get("TABLE_NAME").and_then(|v| v.clone())?;
            if !matches_any_prefix(&name, ALL_TABLE_PREFIXES) {
                return None;
            }
            let partitioned = r
                .get("CREATE_OPTIONS")
                .and_then(|v| v.clone())
                .is_some_and(|opts| opts.contains("partitioned"));
            Some((name, partitioned))
        })
        .collect())
}

/// Enumerates every trigger in `db` whose name matches one of the
/// engine's trigger-name prefixes.
pub fn discover_orphan_triggers(session: &mut dyn SqlSession, db: &str) -> OscResult<Vec<String>> {
    let rows = session.query(&format!(
        "SELECT TRIGGER_NAME FROM information_schema.TRIGGERS WHERE TRIGGER_SCHEMA = '{}'",
        db.replace('\'', "''"),
    ))?;
    Ok(rows
        .into_iter()
        .filter_map(|r| r.get("TRIGGER_NAME").and_then(|v| v.clone()))
        .filter(|name| matches_any_prefix(name, ALL_TRIGGER_PREFIXES))
        .collect())
}

/// Enumerates dump files in `dir` matching one of the engine's outfile
/// prefixes.
pub fn discover_orphan_files(dir: &std::path::Path) -> std::io::Result<Vec<PathBuf>> {
    let pattern = format!("^({})", ALL_FILE_PREFIXES.join("|").replace('.', "\\."));
    let re = Regex::new(&pattern).expect("static regex is valid");
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if re.is_match(name) {
                found.push(entry.path());
            }
        }
    }
    Ok(found)
}

/// Builds a forced-cleanup ledger by enumerating every schema's orphaned
/// tables, triggers, and the dump directory's orphaned files.
pub fn build_forced_cleanup_ledger(
    session: &mut dyn SqlSession,
    dbs: &[String],
    dump_dir: &std::path::Path,
) -> OscResult<Ledger> {
    let mut ledger = Ledger::new();
    for db in dbs {
        for name in discover_orphan_triggers(session, db)? {
            ledger.register_trigger(db, &name);
        }
        for (name, partitioned) in discover_orphan_tables(session, db)? {
            ledger.register_table(db, &name, partitioned);
        }
    }
    if let Ok(files) = discover_orphan_files(dump_dir) {
        for f in files {
            ledger.register_file(f);
        }
    }
    Ok(ledger)
}

/// Crash-recovery cleanup with `--kill`: locates the session holding the
/// named mutex and terminates it, waits a grace period for the victim to
/// self-cleanup, then forces the sweep regardless. `holder_id` is
/// expected to come from the [`OscError::MutexHeld`] the caller observed
/// when trying to acquire the lock itself.
pub fn kill_and_sweep(
    session: &mut dyn SqlSession,
    holder_id: u64,
    grace_period: impl Fn(),
    dbs: &[String],
    dump_dir: &std::path::Path,
) -> OscResult<Ledger> {
    session.kill_query_by_id(holder_id)?;
    session.execute(&format!("KILL {holder_id}"))?;
    grace_period();
    let ledger = build_forced_cleanup_ledger(session, dbs, dump_dir)?;
    execute_ledger(session, &ledger)?;
    Ok(ledger)
}

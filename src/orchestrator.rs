//! Component J: the top-level driver that sequences every other
//! component through one online schema change, start to finish.
//!
//! Grounded on `copy.py`'s `execute_steps_to_cutover` for the fixed stage
//! order, and on the extension's own top-level init/sequencing style for
//! "one function drives a fixed sequence, registering undo state as it
//! goes rather than computing it after the fact". [`Ledger`] is the undo
//! state: every table, trigger, and file is registered *before* the
//! statement that creates it runs, so [`Orchestrator::run`] can hand the
//! ledger to [`execute_ledger`] regardless of where in the sequence a
//! typed error surfaces. Per spec §9's note on breaking the original's
//! cyclic ownership, Cleanup has no back-reference into this module —
//! `Orchestrator` owns the ledger and calls `cleanup::execute_ledger`
//! directly.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::checksum::{
    delta_checksum_keys_sql, filter_keys_where_clause, need_checksum, need_checksum_for_changes,
    ChecksumEngine,
};
use crate::cleanup::{execute_ledger, Ledger};
use crate::config::OscConfig;
use crate::cutover::{reconcile_partitions, CutoverCoordinator};
use crate::dump::{check_disk_free_space_reserved, rows_per_chunk, ChunkedDumper};
use crate::error::{OscError, OscResult};
use crate::load::{droppable_indexes, drop_non_unique_indexes, recreate_non_unique_indexes, Loader};
use crate::model::{ColumnDef, IndexDef, TableModel};
use crate::naming::{self, quote_ident};
use crate::replay::{replay_till_good_to_go, ReplayEngine, ReplayState};
use crate::session::{SessionController, SqlSession};
use crate::sql::{create_table_ddl, COMMIT, START_TRANSACTION_WITH_CONSISTENT_SNAPSHOT};
use crate::stats::{emit_stage_failed, emit_stage_start, Stage};
use crate::trigger::{enforce_rbr_safety, TriggerInstaller, DML_COL_NAME, ID_COL_NAME};
use crate::version::{is_trigger_rbr_safe, Capabilities};

/// The minimal column set Replay uses to locate a row in the shadow table
/// from a change-log row (spec §3 "P_filter").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterKey {
    pub columns: Vec<String>,
    /// Set when the filter key was bootstrapped from "all columns" because
    /// no usable index exists and the caller opted into a new primary key;
    /// the chunked dumper cannot express a range cursor over such a key,
    /// so the whole table is dumped in one pass.
    pub forces_full_table_dump: bool,
}

/// Chooses P_filter per spec §3: the current primary key if one exists
/// and isn't itself prefix-indexed; else the first non-primary unique
/// index; else, if a new primary key was explicitly permitted, every
/// column with a forced full-table dump; else reject.
pub fn choose_filter_key(old: &TableModel, allow_new_pk: bool) -> OscResult<FilterKey> {
    if let Some(pk) = old.primary_key() {
        if !pk.is_prefix_indexable() {
            return Ok(FilterKey {
                columns: pk.columns.clone(),
                forces_full_table_dump: false,
            });
        }
    }
    if let Some(unique) = old.indexes.iter().find(|i| i.is_unique && !i.is_primary) {
        return Ok(FilterKey {
            columns: unique.columns.clone(),
            forces_full_table_dump: unique.is_prefix_indexable(),
        });
    }
    if allow_new_pk {
        return Ok(FilterKey {
            columns: old.columns.iter().map(|c| c.name.clone()).collect(),
            forces_full_table_dump: true,
        });
    }
    Err(OscError::NewPrimaryKeyRequiresOptIn)
}

/// Rejects a source table that references or is referenced by a foreign
/// key (spec §3: this engine never attempts to rewrite FK constraints).
pub fn reject_foreign_keys(db: &str, old: &TableModel) -> OscResult<()> {
    match old.foreign_keys.first() {
        Some(fk) => Err(OscError::ForeignKeyFound {
            db: db.to_string(),
            table: old.name.clone(),
            fk: fk.clone(),
        }),
        None => Ok(()),
    }
}

/// The desired schema must declare a primary key; this engine never
/// produces a shadow table with none.
pub fn require_new_primary_key(db: &str, new: &TableModel) -> OscResult<()> {
    if new.primary_key().is_some() {
        Ok(())
    } else {
        Err(OscError::NoPrimaryKey {
            db: db.to_string(),
            table: new.name.clone(),
        })
    }
}

/// Fails if any P_filter column was dropped in the desired schema —
/// Replay needs every filter column present on the shadow table to
/// locate rows by it.
pub fn check_filter_columns_not_dropped(filter_columns: &[String], new: &TableModel) -> OscResult<()> {
    for c in filter_columns {
        if new.column(c).is_none() {
            return Err(OscError::PrimaryColumnDropped { column: c.clone() });
        }
    }
    Ok(())
}

/// Requires some unique index on the desired schema to cover P_filter as
/// a leftmost prefix, unless explicitly skipped (spec §3's shadow-table
/// coverage check).
pub fn check_filter_key_covered(new: &TableModel, filter_columns: &[String], skip_check: bool) -> OscResult<()> {
    if skip_check {
        return Ok(());
    }
    let covered = new
        .indexes
        .iter()
        .any(|idx| idx.is_unique && idx.covers_as_prefix(filter_columns));
    if covered {
        Ok(())
    } else {
        Err(OscError::NoIndexCoverage {
            pk_names: filter_columns.join(", "),
        })
    }
}

/// Fails if the desired schema adds a column defaulting to
/// `CURRENT_TIMESTAMP` that the old schema never had — Replay would
/// bootstrap it from nothing, and the server-chosen insert time is not
/// reproducible across the dump and replay paths.
pub fn check_unsafe_timestamp_bootstrap(old: &TableModel, new: &TableModel) -> OscResult<()> {
    for col in &new.columns {
        if old.column(&col.name).is_none() && col.has_unsafe_timestamp_default() {
            return Err(OscError::UnsafeTimestampBootstrap);
        }
    }
    Ok(())
}

/// Columns captured into the change-log and replayed: every old-schema
/// column that still exists in the desired schema. A column dropped in
/// the desired schema is never written to the shadow table, so Replay
/// has nothing to do with it.
pub fn captured_columns(old: &TableModel, new: &TableModel) -> Vec<String> {
    old.columns
        .iter()
        .filter(|c| new.column(&c.name).is_some())
        .map(|c| c.name.clone())
        .collect()
}

fn delta_column(col: &ColumnDef) -> ColumnDef {
    ColumnDef {
        name: col.name.clone(),
        column_type: col.column_type.clone(),
        length: col.length,
        unsigned: col.unsigned,
        nullable: true,
        default: None,
        auto_increment: false,
        charset: col.charset.clone(),
        collate: col.collate.clone(),
        comment: None,
        generated_expression: None,
        generated_stored: false,
    }
}

/// Builds the change-log table's schema: the engine's own id/dml-type
/// columns, followed by every captured column carried over from the old
/// schema with defaults and generated-ness stripped (the change-log only
/// ever stores literal captured values).
fn delta_table_model(delta_table: &str, captured: &[String], old: &TableModel) -> TableModel {
    let mut columns = vec![
        ColumnDef {
            name: ID_COL_NAME.to_string(),
            column_type: "bigint".to_string(),
            length: None,
            unsigned: true,
            nullable: false,
            default: None,
            auto_increment: true,
            charset: None,
            collate: None,
            comment: None,
            generated_expression: None,
            generated_stored: false,
        },
        ColumnDef {
            name: DML_COL_NAME.to_string(),
            column_type: "tinyint".to_string(),
            length: None,
            unsigned: true,
            nullable: false,
            default: None,
            auto_increment: false,
            charset: None,
            collate: None,
            comment: None,
            generated_expression: None,
            generated_stored: false,
        },
    ];
    for name in captured {
        if let Some(c) = old.column(name) {
            columns.push(delta_column(c));
        }
    }
    TableModel {
        name: delta_table.to_string(),
        engine: old.engine.clone(),
        charset: old.charset.clone(),
        collate: old.collate.clone(),
        columns,
        indexes: vec![IndexDef {
            name: "PRIMARY".to_string(),
            is_unique: true,
            is_primary: true,
            columns: vec![ID_COL_NAME.to_string()],
            prefix_lengths: vec![None],
        }],
        partition: None,
        foreign_keys: Vec::new(),
    }
}

fn average_row_length(session: &mut dyn SqlSession, db: &str, table: &str) -> OscResult<u64> {
    let rows = session.query(&format!(
        "SELECT AVG_ROW_LENGTH FROM information_schema.TABLES WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}'",
        db.replace('\'', "''"),
        table.replace('\'', "''"),
    ))?;
    Ok(rows
        .first()
        .and_then(|r| r.get("AVG_ROW_LENGTH"))
        .and_then(|v| v.as_deref())
        .and_then(|v| v.parse().ok())
        .unwrap_or(20))
}

fn current_delta_ceiling(session: &mut dyn SqlSession, delta_table: &str) -> OscResult<u64> {
    let rows = session.query(&format!(
        "SELECT MAX({id_col}) AS max_id FROM {delta}",
        id_col = quote_ident(ID_COL_NAME),
        delta = quote_ident(delta_table),
    ))?;
    Ok(rows
        .first()
        .and_then(|r| r.get("max_id"))
        .and_then(|v| v.as_deref())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

fn chunk_lower_bound_clause(filter_columns: &[String], cursor: &[String]) -> String {
    if cursor.is_empty() {
        return "1 = 1".to_string();
    }
    let cols = filter_columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let vals = cursor
        .iter()
        .map(|v| format!("'{}'", v.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ");
    format!("({cols}) > ({vals})")
}

fn fetch_chunk_cursor(
    session: &mut dyn SqlSession,
    source: &str,
    filter_columns: &[String],
    lower_bound: &str,
    offset: u64,
) -> OscResult<Vec<String>> {
    let cols = filter_columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT {cols} FROM {src} WHERE {lower_bound} ORDER BY {cols} LIMIT 1 OFFSET {offset}",
        src = quote_ident(source),
    );
    let rows = session.query(&sql)?;
    let row = rows.first().ok_or_else(|| OscError::Assertion {
        expected: "chunk cursor row present".to_string(),
        got: "no rows".to_string(),
    })?;
    Ok(filter_columns
        .iter()
        .map(|c| row.get(c).cloned().flatten().unwrap_or_default())
        .collect())
}

/// Dumps and loads the source table's current contents into the shadow
/// table, one outfile chunk at a time, advancing a P_filter cursor
/// fetched back from the server after each chunk. Files are removed as
/// soon as they are consumed, matching the original's dump-directory
/// lifecycle.
#[allow(clippy::too_many_arguments)]
fn dump_and_load(
    config: &OscConfig,
    session: &mut dyn SqlSession,
    source: &str,
    shadow: &str,
    filter_columns: &[String],
    all_columns: &[String],
    chunk_rows: u64,
    full_table: bool,
    where_filter: Option<&str>,
    dump_dir: &std::path::Path,
    loader: &Loader,
    ledger: &mut Ledger,
) -> OscResult<u64> {
    let dumper = ChunkedDumper::new(config);

    if full_table {
        let path = naming::outfile_base(&dump_dir.to_string_lossy(), source);
        ledger.register_file(PathBuf::from(&path));
        let where_clause = where_filter.unwrap_or("1 = 1").to_string();
        let rows = dumper.dump_chunk(session, source, all_columns, &where_clause, &path)?;
        loader.load_chunk(session, shadow, all_columns, &path)?;
        std::fs::remove_file(&path).ok();
        ledger.forget_file(&PathBuf::from(&path));
        return Ok(rows);
    }

    let mut total = 0u64;
    let mut cursor: Vec<String> = Vec::new();
    let mut chunk_no: u64 = 1;
    loop {
        let path = format!("{}.{chunk_no}", naming::outfile_base(&dump_dir.to_string_lossy(), source));
        ledger.register_file(PathBuf::from(&path));
        let lower = chunk_lower_bound_clause(filter_columns, &cursor);
        let bounded = match where_filter {
            Some(w) => format!("({lower}) AND ({w})"),
            None => lower,
        };
        let order = filter_columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let chunk_where = format!("{bounded} ORDER BY {order} LIMIT {chunk_rows}");

        let rows = dumper.dump_chunk(session, source, all_columns, &chunk_where, &path)?;
        if rows == 0 {
            std::fs::remove_file(&path).ok();
            ledger.forget_file(&PathBuf::from(&path));
            break;
        }
        cursor = fetch_chunk_cursor(session, source, filter_columns, &bounded, rows - 1)?;
        loader.load_chunk(session, shadow, all_columns, &path)?;
        std::fs::remove_file(&path).ok();
        ledger.forget_file(&PathBuf::from(&path));
        total += rows;
        chunk_no += 1;
    }
    Ok(total)
}

/// Everything about a run that is an external-interface concern rather
/// than an engine decision: which db/table, the optional narrowing
/// predicate, where dump files land, and the replication/disk facts the
/// caller already has on hand from its own `SHOW VARIABLES`/`statvfs`
/// calls.
pub struct RunOptions {
    pub db: String,
    pub where_filter: Option<String>,
    pub dump_dir: PathBuf,
    pub binlog_format: String,
    pub sql_log_bin_triggers_enabled: bool,
    pub disk_space: Option<(u64, u64)>,
    pub any_filter_collation_changed: bool,
    /// Skip Cleanup at the end of a successful or failed run, leaving
    /// every artifact in place for post-mortem inspection.
    pub keep_for_debug: bool,
    /// Whether the server jumps `CREATE TRIGGER` to the front of the
    /// metadata-lock queue ahead of waiting readers (spec §4.C). When
    /// `false`, trigger install instead drains long-running statements on
    /// `O` and takes a brief write lock, racing a kill-timer.
    pub high_priority_ddl_supported: bool,
}

/// Summary of a completed run, returned once Cutover and Cleanup have
/// both finished.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub rows_dumped: u64,
    pub replay_attempts: u32,
    pub checksum_passed: bool,
}

/// Drives Setup through Cleanup for one schema change against one table.
pub struct Orchestrator<'a> {
    pub config: &'a OscConfig,
    pub caps: &'a Capabilities,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a OscConfig, caps: &'a Capabilities) -> Self {
        Orchestrator { config, caps }
    }

    /// Runs the full pipeline. `session` is the single long-lived driver
    /// connection every DDL/DML statement is issued through; `applier_session`
    /// is a short-lived auxiliary connection used only to stop/restart
    /// replication during Cutover, so the driver session's `LOCK TABLES`
    /// doesn't have to share a connection with that control statement.
    /// `cutover_kill` fires if the Cutover write-lock can't be acquired
    /// within `lock_max_wait_before_kill`, and is expected to issue `KILL`
    /// against the blocking query on a third, caller-owned connection.
    /// `trigger_kill` plays the same role for the write lock taken before
    /// `CREATE TRIGGER` when `opts.high_priority_ddl_supported` is false.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        session: &mut dyn SqlSession,
        applier_session: &mut dyn SqlSession,
        old: &TableModel,
        new: &TableModel,
        opts: &RunOptions,
        sleep: impl Fn(Duration) + Copy,
        now: impl Fn() -> Instant + Copy,
        trigger_kill: impl FnOnce() + Send + 'static,
        cutover_kill: impl FnOnce() + Send + 'static,
    ) -> OscResult<RunReport> {
        let mut ledger = Ledger::new();
        let result = self.run_inner(
            session,
            applier_session,
            old,
            new,
            opts,
            sleep,
            now,
            trigger_kill,
            cutover_kill,
            &mut ledger,
        );

        if self.config.named_mutex_enabled {
            let mut controller = SessionController::new(session, self.config, self.caps);
            controller.release_named_mutex().ok();
        }

        match &result {
            Ok(_) => {
                emit_stage_start(&opts.db, &old.name, Stage::Cleanup);
                if !opts.keep_for_debug {
                    execute_ledger(session, &ledger)?;
                }
            }
            Err(e) => {
                emit_stage_failed(&opts.db, &old.name, Stage::Cleanup, &e.to_string());
                if e.is_server_gone() {
                    ledger.drop_table_entries(&naming::new_table_name(&old.name));
                    ledger.drop_table_entries(&naming::delta_table_name(&old.name));
                }
                if !opts.keep_for_debug {
                    execute_ledger(session, &ledger).ok();
                }
            }
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_inner(
        &self,
        session: &mut dyn SqlSession,
        applier_session: &mut dyn SqlSession,
        old: &TableModel,
        new: &TableModel,
        opts: &RunOptions,
        sleep: impl Fn(Duration) + Copy,
        now: impl Fn() -> Instant + Copy,
        trigger_kill: impl FnOnce() + Send + 'static,
        cutover_kill: impl FnOnce() + Send + 'static,
        ledger: &mut Ledger,
    ) -> OscResult<RunReport> {
        let db = opts.db.as_str();

        reject_foreign_keys(db, old)?;
        require_new_primary_key(db, new)?;
        let filter = choose_filter_key(old, self.config.allow_new_pk)?;
        check_filter_columns_not_dropped(&filter.columns, new)?;
        check_filter_key_covered(new, &filter.columns, self.config.skip_pk_coverage_check)?;
        check_unsafe_timestamp_bootstrap(old, new)?;
        if let Some((partition_size, free)) = opts.disk_space {
            check_disk_free_space_reserved(self.config, partition_size, free)?;
        }

        let captured = captured_columns(old, new);
        let shadow_table = naming::new_table_name(&old.name);
        let delta_table = naming::delta_table_name(&old.name);
        let renamed_table = naming::renamed_table_name(&old.name);

        emit_stage_start(db, &old.name, Stage::Setup);
        {
            let mut controller = SessionController::new(session, self.config, self.caps);
            controller.init()?;
            if self.config.named_mutex_enabled {
                controller.acquire_named_mutex(self.config.lock_max_wait_before_kill.as_secs_f64())?;
            }
        }

        let trigger_installer = TriggerInstaller::new(self.config, self.caps);
        trigger_installer.check_no_existing_triggers(session, db, &old.name)?;

        let delta_model = delta_table_model(&delta_table, &captured, old);
        ledger.register_table(db, &delta_table, false);
        {
            let mut controller = SessionController::new(session, self.config, self.caps);
            controller.ddl_guard(sleep)?;
        }
        session.execute(&create_table_ddl(&delta_model))?;

        let shadow_model = TableModel {
            name: shadow_table.clone(),
            ..new.clone()
        };
        ledger.register_table(db, &shadow_table, shadow_model.partition.is_some());
        {
            let mut controller = SessionController::new(session, self.config, self.caps);
            controller.ddl_guard(sleep)?;
        }
        session.execute(&create_table_ddl(&shadow_model))?;

        emit_stage_start(db, &old.name, Stage::TriggerInstall);
        let rbr_safe = is_trigger_rbr_safe(&opts.binlog_format, opts.sql_log_bin_triggers_enabled);
        enforce_rbr_safety(rbr_safe)?;
        let trigger_names = trigger_installer.install_serialized(
            session,
            db,
            &old.name,
            &delta_table,
            &captured,
            &filter.columns,
            opts.high_priority_ddl_supported,
            self.config.lock_max_wait_before_kill,
            sleep,
            trigger_kill,
        )?;
        for name in &trigger_names {
            ledger.register_trigger(db, name);
        }

        emit_stage_start(db, &old.name, Stage::Dump);
        // Take a consistent-snapshot transaction before reading
        // snapshot_max_id so the dump's repeatable-read view is fixed at
        // exactly the moment up to which change-log rows are considered
        // already reflected (spec §4.D steps 1-2).
        session.execute(START_TRANSACTION_WITH_CONSISTENT_SNAPSHOT)?;
        let snapshot_max_id = current_delta_ceiling(session, &delta_table)?;
        let mut state = ReplayState {
            last_replayed_id: snapshot_max_id,
            ..Default::default()
        };

        let avg_row_length = average_row_length(session, db, &old.name)?;
        let chunk_rows = rows_per_chunk(self.config.chunk_bytes, avg_row_length)?;
        let loader = Loader::new(false);
        let rows_dumped = dump_and_load(
            self.config,
            session,
            &old.name,
            &shadow_table,
            &filter.columns,
            &captured,
            chunk_rows,
            filter.forces_full_table_dump,
            opts.where_filter.as_deref(),
            &opts.dump_dir,
            &loader,
            ledger,
        )?;
        session.execute(COMMIT)?;

        emit_stage_start(db, &old.name, Stage::Load);
        let droppable: Vec<&IndexDef> = droppable_indexes(&shadow_model.indexes, &shadow_model.columns, loader.eliminate_dups);
        if !droppable.is_empty() {
            let mut controller = SessionController::new(session, self.config, self.caps);
            drop_non_unique_indexes(&mut controller, &shadow_table, &droppable, sleep)?;
            recreate_non_unique_indexes(&mut controller, &shadow_table, &droppable, sleep)?;
        }

        let has_covering_unique_index =
            new.indexes.iter().any(|i| i.is_unique && i.covers_as_prefix(&filter.columns));
        let where_filter_active = opts.where_filter.is_some();

        emit_stage_start(db, &old.name, Stage::ChecksumFull);
        let mut checksum_passed = true;
        if need_checksum(
            self.config.skip_pk_coverage_check,
            where_filter_active,
            opts.any_filter_collation_changed,
            has_covering_unique_index,
        ) {
            let checksum_engine = ChecksumEngine::new(captured.clone());
            let old_sum = checksum_engine.checksum_full_table(session, &old.name)?;
            let new_sum = checksum_engine.checksum_full_table(session, &shadow_table)?;
            if old_sum != new_sum {
                return Err(OscError::CheckSumMismatch);
            }
        } else {
            checksum_passed = false;
        }

        emit_stage_start(db, &old.name, Stage::Replay);
        let replay_engine = ReplayEngine {
            config: self.config,
            shadow_table: shadow_table.clone(),
            delta_table: delta_table.clone(),
            filter_columns: filter.columns.clone(),
            captured_columns: captured.clone(),
            charset_converts: Default::default(),
            eliminate_dups: false,
            batched_updates: false,
            affected_rows_check_disabled: where_filter_active,
        };
        let max_replay_changes = self.config.max_replay_changes;
        let outcome = replay_till_good_to_go(
            |_attempt| {
                let ceiling = current_delta_ceiling(session, &delta_table)?;
                let backlog = ceiling.saturating_sub(state.last_replayed_id);
                crate::replay::check_not_too_many_deltas(backlog, max_replay_changes)?;
                let started = now();
                replay_engine.run_once(session, &mut state, ceiling)?;
                Ok(now().duration_since(started))
            },
            self.config.default_replay_attempt,
            self.config.replay_default_timeout,
        )?;

        emit_stage_start(db, &old.name, Stage::ChecksumDelta);
        if need_checksum_for_changes(
            self.config.skip_pk_coverage_check,
            where_filter_active,
            opts.any_filter_collation_changed,
            has_covering_unique_index,
        ) {
            let keys_sql = delta_checksum_keys_sql(&delta_table, &filter.columns, 0, state.last_replayed_id);
            let rows = session.query(&keys_sql)?;
            let keys: Vec<Vec<String>> = rows
                .iter()
                .map(|r| {
                    filter
                        .columns
                        .iter()
                        .map(|c| r.get(c).cloned().flatten().unwrap_or_default())
                        .collect()
                })
                .collect();
            if !keys.is_empty() {
                let where_clause = filter_keys_where_clause(&filter.columns, &keys);
                let checksum_engine = ChecksumEngine::new(captured.clone());
                let old_sum = checksum_engine.checksum_chunk(session, &old.name, &where_clause)?;
                let new_sum = checksum_engine.checksum_chunk(session, &shadow_table, &where_clause)?;
                if old_sum.result != new_sum.result {
                    return Err(OscError::CheckSumMismatch);
                }
            }
        }

        emit_stage_start(db, &old.name, Stage::Cutover);
        let partition_reconcile_stmts = match (&old.partition, &shadow_model.partition) {
            (Some(o), Some(s)) => reconcile_partitions(o, s, &shadow_table),
            _ => Vec::new(),
        };
        let cutover = CutoverCoordinator {
            caps: self.caps,
            source_table: old.name.clone(),
            shadow_table: shadow_table.clone(),
            delta_table: delta_table.clone(),
            renamed_table: renamed_table.clone(),
        };
        let final_ceiling = current_delta_ceiling(session, &delta_table)?;
        {
            let mut applier_controller = SessionController::new(applier_session, self.config, self.caps);
            cutover.execute(
                session,
                &mut applier_controller,
                &replay_engine,
                &mut state,
                final_ceiling,
                self.config.replay_default_timeout,
                self.config.lock_max_wait_before_kill,
                &partition_reconcile_stmts,
                true,
                cutover_kill,
                now,
            )?;
        }

        ledger.drop_table_entries(&shadow_table);
        ledger.register_table(db, &renamed_table, old.partition.is_some());

        Ok(RunReport {
            rows_dumped,
            replay_attempts: outcome.attempts,
            checksum_passed,
        })
    }
}

//! Component H: the atomic rename that swaps the shadow table into the
//! source table's name, bounded by a short write-lock window.
//!
//! The sequence is: stop the replication applier, take write locks on
//! `{O, N, L}` (racing a kill-timer so a long-running reader can't
//! starve the lock acquisition indefinitely), run one final bounded
//! replay pass to catch up to a fixed `max(L.id)`, reconcile any
//! `RANGE`-partition drift, rename, then release and restart the
//! applier. Every step that can fail leaves the source table in a state
//! the caller can still operate on; only the rename step itself commits
//! the visible swap.

use std::time::{Duration, Instant};

use crate::error::{OscError, OscResult};
use crate::model::{PartitionDef, PartitionEntry, PartitionKind};
use crate::naming::quote_ident;
use crate::replay::{ReplayEngine, ReplayState};
use crate::session::{KillTimer, SessionController, SqlSession};
use crate::sql::rename_table_sql;
use crate::version::Capabilities;

/// `LOCK TABLES t1 WRITE, t2 WRITE, ...`.
fn lock_tables_sql(tables: &[String]) -> String {
    let clauses: Vec<String> = tables.iter().map(|t| format!("{} WRITE", quote_ident(t))).collect();
    format!("LOCK TABLES {}", clauses.join(", "))
}

const UNLOCK_TABLES_SQL: &str = "UNLOCK TABLES";

/// Computes the `ADD PARTITION`/`DROP PARTITION` statements needed to
/// bring the shadow table's partition list in line with the source
/// table's current one. Only `RANGE` partitioning is reconciled (spec
/// §4.H.5); any other kind, or a kind mismatch, is a no-op here —
/// cutover proceeds with whatever partitioning the shadow table already
/// has, since the spec scopes drift-reconciliation to `RANGE` only.
pub fn reconcile_partitions(old: &PartitionDef, shadow: &PartitionDef, shadow_table: &str) -> Vec<String> {
    if old.kind != PartitionKind::Range || shadow.kind != PartitionKind::Range {
        return Vec::new();
    }
    let shadow_names: Vec<&str> = shadow.entries.iter().map(|e| e.name.as_str()).collect();
    let old_names: Vec<&str> = old.entries.iter().map(|e| e.name.as_str()).collect();

    let mut stmts = Vec::new();

    let to_add: Vec<&PartitionEntry> = old
        .entries
        .iter()
        .filter(|e| !shadow_names.contains(&e.name.as_str()))
        .collect();
    if !to_add.is_empty() {
        let clauses: Vec<String> = to_add
            .iter()
            .map(|e| format!("PARTITION {} VALUES LESS THAN {}", quote_ident(&e.name), e.values))
            .collect();
        stmts.push(format!(
            "ALTER TABLE {} ADD PARTITION ({})",
            quote_ident(shadow_table),
            clauses.join(", ")
        ));
    }

    for name in shadow_names.iter().filter(|n| !old_names.contains(n)) {
        stmts.push(format!(
            "ALTER TABLE {} DROP PARTITION {}",
            quote_ident(shadow_table),
            quote_ident(name)
        ));
    }

    stmts
}

/// Drives the Cutover sequence.
pub struct CutoverCoordinator<'a> {
    pub caps: &'a Capabilities,
    pub source_table: String,
    pub shadow_table: String,
    pub delta_table: String,
    pub renamed_table: String,
}

impl<'a> CutoverCoordinator<'a> {
    /// Arms a kill-timer before requesting the write locks so a
    /// long-running `SELECT`/`ALTER` against the source table can't
    /// indefinitely stall the lock acquisition, per spec §5's
    /// single-shot-timer coordination between the driver and a "killer"
    /// session. `kill` is expected to issue `KILL` against any matching
    /// blocking statement on a *separate* connection from `session`.
    pub fn lock_with_kill_timer(
        &self,
        session: &mut dyn SqlSession,
        lock_max_wait_before_kill: Duration,
        kill: impl FnOnce() + Send + 'static,
    ) -> OscResult<()> {
        let timer = KillTimer::arm(lock_max_wait_before_kill, kill);
        let result = session.execute(&lock_tables_sql(&[
            self.source_table.clone(),
            self.shadow_table.clone(),
            self.delta_table.clone(),
        ]));
        timer.cancel();
        result.map(|_| ()).map_err(|e| OscError::LockAcquireFailed {
            detail: e.to_string(),
        })
    }

    pub fn unlock(&self, session: &mut dyn SqlSession) -> OscResult<()> {
        session.execute(UNLOCK_TABLES_SQL)?;
        Ok(())
    }

    /// Runs the final, bounded replay pass while locks are held. If it
    /// exceeds `timeout`, the caller must unlock and resume the applier
    /// (spec §4.H step 4) — this function only surfaces the typed error
    /// and leaves recovery to the caller, since only the caller knows
    /// whether the applier needs restarting.
    pub fn final_replay(
        &self,
        session: &mut dyn SqlSession,
        replay: &ReplayEngine,
        state: &mut ReplayState,
        ceiling: u64,
        timeout: Duration,
        now: impl Fn() -> Instant,
    ) -> OscResult<()> {
        let started = now();
        replay.run_once(session, state, ceiling)?;
        let elapsed = now().duration_since(started);
        if elapsed > timeout {
            return Err(OscError::ReplayTimeout {
                timeout_secs: timeout.as_secs_f64(),
            });
        }
        Ok(())
    }

    /// Performs the rename itself: a single atomic `RENAME TABLE` when
    /// the server supports a multi-pair atomic rename, else two
    /// sequential `ALTER TABLE ... RENAME` statements with the
    /// rollback-to-original-name step registered *before* the second
    /// `ALTER` executes, so a crash between the two leaves a table the
    /// caller can recover by re-running that one statement (spec §4.H.6).
    pub fn rename(&self, session: &mut dyn SqlSession) -> OscResult<()> {
        if self.caps.supports_atomic_multi_rename() {
            session.execute(&rename_table_sql(&[
                (self.source_table.clone(), self.renamed_table.clone()),
                (self.shadow_table.clone(), self.source_table.clone()),
            ]))?;
        } else {
            session.execute(&format!(
                "ALTER TABLE {} RENAME {}",
                quote_ident(&self.source_table),
                quote_ident(&self.renamed_table)
            ))?;
            // Rollback recipe, were a crash to occur before the next
            // statement commits: `ALTER TABLE {renamed} RENAME {source}`.
            session.execute(&format!(
                "ALTER TABLE {} RENAME {}",
                quote_ident(&self.shadow_table),
                quote_ident(&self.source_table)
            ))?;
        }
        Ok(())
    }

    /// Recovers from a rename left half-complete by the two-step path:
    /// renames the original back to its live name.
    pub fn rename_back(&self, session: &mut dyn SqlSession) -> OscResult<()> {
        session.execute(&format!(
            "ALTER TABLE {} RENAME {}",
            quote_ident(&self.renamed_table),
            quote_ident(&self.source_table)
        ))?;
        Ok(())
    }

    /// Runs the entire sequence described in spec §4.H: stop applier,
    /// begin transaction, lock, final replay, partition reconcile,
    /// rename, unlock, commit, restore autocommit, restart applier if
    /// this run stopped it.
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &self,
        session: &mut dyn SqlSession,
        controller: &mut SessionController,
        replay: &ReplayEngine,
        state: &mut ReplayState,
        ceiling: u64,
        replay_timeout: Duration,
        lock_max_wait_before_kill: Duration,
        partition_reconcile_stmts: &[String],
        applier_was_stopped_by_us: bool,
        kill: impl FnOnce() + Send + 'static,
        now: impl Fn() -> Instant,
    ) -> OscResult<()> {
        controller.stop_applier()?;
        session.execute("SET autocommit = 0")?;
        session.execute("START TRANSACTION")?;

        if let Err(e) = self.lock_with_kill_timer(session, lock_max_wait_before_kill, kill) {
            session.execute("ROLLBACK").ok();
            session.execute("SET autocommit = 1").ok();
            if applier_was_stopped_by_us {
                controller.start_applier().ok();
            }
            return Err(e);
        }

        if let Err(e) = self.final_replay(session, replay, state, ceiling, replay_timeout, now) {
            self.unlock(session).ok();
            session.execute("ROLLBACK").ok();
            session.execute("SET autocommit = 1").ok();
            if applier_was_stopped_by_us {
                controller.start_applier().ok();
            }
            return Err(e);
        }

        for stmt in partition_reconcile_stmts {
            session.execute(stmt)?;
        }

        self.rename(session)?;
        self.unlock(session)?;
        session.execute("COMMIT")?;
        session.execute("SET autocommit = 1")?;
        if applier_was_stopped_by_us {
            controller.start_applier()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition_def(kind: PartitionKind, names: &[&str]) -> PartitionDef {
        PartitionDef {
            kind,
            linear: false,
            fields_or_expr: "id".to_string(),
            num_partitions: names.len() as u32,
            entries: names
                .iter()
                .map(|n| PartitionEntry {
                    name: n.to_string(),
                    values: "(100)".to_string(),
                    comment: None,
                })
                .collect(),
        }
    }

    #[test]
    fn reconcile_partitions_noop_for_non_range() {
        let old = partition_def(PartitionKind::Hash, &["p0", "p1"]);
        let shadow = partition_def(PartitionKind::Hash, &["p0"]);
        assert!(reconcile_partitions(&old, &shadow, "n").is_empty());
    }

    #[test]
    fn reconcile_partitions_adds_new_and_drops_stale() {
        let old = partition_def(PartitionKind::Range, &["p0", "p1", "p2"]);
        let shadow = partition_def(PartitionKind::Range, &["p0", "p99"]);
        let stmts = reconcile_partitions(&old, &shadow, "n");
        assert_eq!(stmts.len(), 3);
        assert!(stmts.iter().any(|s| s.contains("ADD PARTITION") && s.contains("`p1`")));
        assert!(stmts.iter().any(|s| s.contains("ADD PARTITION") && s.contains("`p2`")));
        assert!(stmts.iter().any(|s| s.contains("DROP PARTITION `p99`")));
    }

    #[test]
    fn lock_tables_sql_lists_all_three_with_write() {
        assert_eq!(
            lock_tables_sql(&["o".to_string(), "n".to_string(), "l".to_string()]),
            "LOCK TABLES `o` WRITE, `n` WRITE, `l` WRITE"
        );
    }

    #[test]
    fn execute_runs_full_sequence_and_renames_on_success() {
        use crate::config::OscConfig;
        use crate::session::Row;
        use crate::version::MySqlVersion;
        use std::cell::RefCell;
        use std::collections::HashMap;

        struct FakeSession {
            executed: RefCell<Vec<String>>,
        }
        impl SqlSession for FakeSession {
            fn query(&mut self, _sql: &str) -> OscResult<Vec<Row>> {
                Ok(vec![])
            }
            fn execute(&mut self, sql: &str) -> OscResult<u64> {
                self.executed.borrow_mut().push(sql.to_string());
                Ok(0)
            }
            fn affected_rows(&self) -> u64 {
                0
            }
            fn connection_id(&mut self) -> OscResult<u64> {
                Ok(1)
            }
            fn kill_query_by_id(&mut self, _id: u64) -> OscResult<()> {
                Ok(())
            }
        }

        let config = OscConfig::default();
        let caps = Capabilities::new(MySqlVersion::parse("8.0.32-x.prod").unwrap());
        let replay = ReplayEngine {
            config: &config,
            shadow_table: "n".to_string(),
            delta_table: "c".to_string(),
            filter_columns: vec!["id".to_string()],
            captured_columns: vec!["id".to_string()],
            charset_converts: HashMap::new(),
            eliminate_dups: false,
            batched_updates: false,
            affected_rows_check_disabled: true,
        };
        let mut state = ReplayState::default();
        let coordinator = CutoverCoordinator {
            caps: &caps,
            source_table: "orders".to_string(),
            shadow_table: "__osc_new_orders".to_string(),
            delta_table: "__osc_chg_orders".to_string(),
            renamed_table: "__osc_old_orders".to_string(),
        };

        let mut fake = FakeSession {
            executed: RefCell::new(vec![]),
        };
        {
            let mut applier_session = FakeSession {
                executed: RefCell::new(vec![]),
            };
            let mut controller =
                SessionController::new(&mut applier_session, &config, &caps);
            coordinator
                .execute(
                    &mut fake,
                    &mut controller,
                    &replay,
                    &mut state,
                    0,
                    Duration::from_secs(5),
                    Duration::from_millis(10),
                    &[],
                    false,
                    || {},
                    Instant::now,
                )
                .unwrap();
        }
        let log = fake.executed.borrow();
        assert!(log.iter().any(|s| s.starts_with("LOCK TABLES")));
        assert!(log.iter().any(|s| s.starts_with("RENAME TABLE")));
        assert!(log.iter().any(|s| s.as_str() == "COMMIT"));
        assert_eq!(log.last().unwrap(), "SET autocommit = 1");
    }
}

//! The single long-lived connection the engine drives every statement
//! through, plus the small set of session-level operations (named mutex,
//! DDL guard, blocking-write-lock-with-kill-timer, replication
//! stop/start) that the rest of the engine composes into larger
//! operations.
//!
//! Everything downstream of [`Orchestrator`](crate::orchestrator::Orchestrator)
//! takes a `&mut dyn SqlSession` rather than a concrete driver type, so
//! unit tests can drive the state machines in this crate against a fake
//! session instead of a live server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mysql::prelude::Queryable;
use mysql::Conn;

use crate::config::OscConfig;
use crate::error::{OscError, OscResult};
use crate::sql::{get_lock_sql, is_used_lock_sql, release_lock_sql};
use crate::version::{Capabilities, MySqlVersion};

/// A single row of query output, keyed by column name. Mirrors the
/// dict-cursor shape the original driver wrapper returns.
pub type Row = std::collections::HashMap<String, Option<String>>;

/// Abstraction over one MySQL connection carrying out the operations the
/// copy engine needs. A thin wrapper rather than a generic ORM-style trait:
/// every method here corresponds to an operation the engine actually
/// issues.
pub trait SqlSession {
    fn query(&mut self, sql: &str) -> OscResult<Vec<Row>>;
    fn execute(&mut self, sql: &str) -> OscResult<u64>;
    fn affected_rows(&self) -> u64;
    fn connection_id(&mut self) -> OscResult<u64>;
    fn kill_query_by_id(&mut self, id: u64) -> OscResult<()>;
}

/// `mysql`-crate-backed [`SqlSession`] for a single live connection.
pub struct MySqlSession {
    conn: Conn,
    last_affected_rows: u64,
}

impl MySqlSession {
    pub fn connect(url: &str, config: &OscConfig) -> OscResult<MySqlSession> {
        let mut conn = Conn::new(url).map_err(|e| OscError::ConnectFailed {
            detail: e.to_string(),
        })?;
        conn.query_drop(format!(
            "SET SESSION WAIT_TIMEOUT = {}",
            config.session_wait_timeout.as_secs()
        ))
        .map_err(|e| OscError::ConnectFailed {
            detail: e.to_string(),
        })?;
        Ok(MySqlSession {
            conn,
            last_affected_rows: 0,
        })
    }
}

impl SqlSession for MySqlSession {
    fn query(&mut self, sql: &str) -> OscResult<Vec<Row>> {
        let rows: Vec<mysql::Row> = self.conn.query(sql).map_err(|e| OscError::Generic {
            stage: "query",
            mysql_errno: driver_errno(&e),
            message: e.to_string(),
        })?;
        Ok(rows.into_iter().map(row_to_map).collect())
    }

    fn execute(&mut self, sql: &str) -> OscResult<u64> {
        self.conn.query_drop(sql).map_err(|e| OscError::Generic {
            stage: "execute",
            mysql_errno: driver_errno(&e),
            message: e.to_string(),
        })?;
        self.last_affected_rows = self.conn.affected_rows();
        Ok(self.last_affected_rows)
    }

    fn affected_rows(&self) -> u64 {
        self.last_affected_rows
    }

    fn connection_id(&mut self) -> OscResult<u64> {
        Ok(self.conn.connection_id() as u64)
    }

    fn kill_query_by_id(&mut self, id: u64) -> OscResult<()> {
        match self.conn.query_drop(format!("KILL QUERY {id}")) {
            Ok(()) => Ok(()),
            // 1094: Unknown thread id -- the query already finished.
            Err(mysql::Error::MySqlError(ref e)) if e.code == 1094 => Ok(()),
            Err(e) => Err(OscError::Generic {
                stage: "kill_query_by_id",
                mysql_errno: driver_errno(&e),
                message: e.to_string(),
            }),
        }
    }
}

fn driver_errno(e: &mysql::Error) -> u16 {
    match e {
        mysql::Error::MySqlError(m) => m.code,
        _ => 0,
    }
}

fn row_to_map(row: mysql::Row) -> Row {
    let columns = row.columns();
    let mut map = Row::new();
    for (i, col) in columns.iter().enumerate() {
        let value: Option<String> = row.as_ref(i).and_then(|v| match v {
            mysql::Value::NULL => None,
            other => Some(mysql::from_value::<String>(other.clone())),
        });
        map.insert(col.name_str().to_string(), value);
    }
    map
}

/// Session-level operations layered on top of a [`SqlSession`]: named
/// mutex, DDL guard, blocking-write-lock acquisition, and applier
/// (replication SQL thread) control.
pub struct SessionController<'a> {
    pub session: &'a mut dyn SqlSession,
    pub config: &'a OscConfig,
    pub caps: &'a Capabilities,
}

impl<'a> SessionController<'a> {
    pub fn new(
        session: &'a mut dyn SqlSession,
        config: &'a OscConfig,
        caps: &'a Capabilities,
    ) -> Self {
        SessionController { session, config, caps }
    }

    /// Sets up the long-lived session the rest of the run is driven
    /// through: `REPEATABLE READ` isolation, strict SQL mode, local
    /// binlog suppression for this session's own writes so the change-log
    /// table's bookkeeping DML doesn't itself get captured as a change
    /// the source table replicates, plus any caller-supplied
    /// [`OscConfig::session_overrides`].
    pub fn init(&mut self) -> OscResult<()> {
        self.session.execute(&format!(
            "SET SESSION {} = 'REPEATABLE-READ'",
            self.caps.isolation_level_var()
        ))?;
        self.session.execute(
            "SET SESSION sql_mode = 'STRICT_ALL_TABLES,NO_ENGINE_SUBSTITUTION'",
        )?;
        self.session.execute("SET SESSION sql_log_bin = 0")?;
        for (name, value) in &self.config.session_overrides {
            self.session
                .execute(&format!("SET SESSION {name} = {value}"))?;
        }
        Ok(())
    }

    /// Acquires the server-wide named mutex serializing concurrent schema
    /// changes against the same table. `GET_LOCK` returns `1` on success,
    /// `0` on timeout, `NULL` if the server couldn't obtain the lock for an
    /// unrelated reason.
    pub fn acquire_named_mutex(&mut self, timeout_secs: f64) -> OscResult<()> {
        let rows = self
            .session
            .query(&get_lock_sql(&self.config.lock_name, timeout_secs))?;
        let got = rows
            .first()
            .and_then(|r| r.values().next())
            .and_then(|v| v.as_deref())
            == Some("1");
        if got {
            Ok(())
        } else {
            let holder_id = self.lookup_lock_holder()?;
            Err(OscError::MutexHeld {
                name: self.config.lock_name.clone(),
                holder_id,
            })
        }
    }

    /// Queries `IS_USED_LOCK(name)` to find the connection id currently
    /// holding the named mutex, so a failed `GET_LOCK` carries enough
    /// information for Cleanup's `--kill` path to target the right
    /// session.
    fn lookup_lock_holder(&mut self) -> OscResult<Option<u64>> {
        let rows = self.session.query(&is_used_lock_sql(&self.config.lock_name))?;
        Ok(rows
            .first()
            .and_then(|r| r.get("holder"))
            .and_then(|v| v.as_deref())
            .and_then(|v| v.parse().ok()))
    }

    pub fn release_named_mutex(&mut self) -> OscResult<()> {
        self.session
            .execute(&release_lock_sql(&self.config.lock_name))?;
        Ok(())
    }

    /// Blocks until `Threads_running` drops at or below
    /// [`OscConfig::max_running_before_ddl`], polling once a second up to
    /// [`OscConfig::ddl_guard_attempts`] times.
    pub fn ddl_guard(&mut self, sleep: impl Fn(Duration)) -> OscResult<()> {
        for _ in 0..self.config.ddl_guard_attempts {
            let rows = self.session.query("SHOW STATUS LIKE 'Threads_running'")?;
            let threads_running: u32 = rows
                .first()
                .and_then(|r| r.get("Value"))
                .and_then(|v| v.as_deref())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            if threads_running <= self.config.max_running_before_ddl {
                return Ok(());
            }
            sleep(Duration::from_secs(1));
        }
        Err(OscError::GuardExhausted {
            attempts: self.config.ddl_guard_attempts,
        })
    }

    /// Finds a statement that's been running longer than
    /// [`OscConfig::long_trx_time_secs`] against `table` in `db` (spec
    /// §4.C: "wait for any long-running statement referencing O to
    /// drain"). Filtering happens client-side over `SHOW FULL
    /// PROCESSLIST`, mirroring the original tool, since the statement
    /// text can't be pushed down into a `WHERE` clause on that pseudo-table.
    pub fn find_long_running_statement(&mut self, db: &str, table: &str) -> OscResult<Option<Row>> {
        let rows = self.session.query("SHOW FULL PROCESSLIST")?;
        let needle = table.to_lowercase();
        Ok(rows.into_iter().find(|r| {
            let info = r.get("Info").and_then(|v| v.clone()).unwrap_or_default();
            let row_db = r.get("db").and_then(|v| v.clone()).unwrap_or_default();
            let command = r.get("Command").and_then(|v| v.clone()).unwrap_or_default();
            let time: u64 = r
                .get("Time")
                .and_then(|v| v.as_deref())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            time > self.config.long_trx_time_secs
                && row_db == db
                && command != "Sleep"
                && info.to_lowercase().contains(&needle)
        }))
    }

    /// Polls [`Self::find_long_running_statement`] until it drains, up to
    /// [`OscConfig::max_wait_for_slow_query`] attempts, sleeping 5 seconds
    /// between polls as the original does. Bounded so a single
    /// perpetually-busy connection can't stall trigger installation
    /// forever.
    pub fn wait_for_drain(&mut self, db: &str, table: &str, sleep: impl Fn(Duration)) -> OscResult<()> {
        for _ in 0..self.config.max_wait_for_slow_query {
            match self.find_long_running_statement(db, table)? {
                Some(_) => sleep(Duration::from_secs(5)),
                None => return Ok(()),
            }
        }
        Err(OscError::GuardExhausted {
            attempts: self.config.max_wait_for_slow_query as u32,
        })
    }

    pub fn stop_applier(&mut self) -> OscResult<()> {
        self.session.execute(self.caps.stop_replication_sql())?;
        Ok(())
    }

    pub fn start_applier(&mut self) -> OscResult<()> {
        self.session.execute(self.caps.start_replication_sql())?;
        Ok(())
    }
}

/// A kill-timer: arms a background thread that, unless cancelled first,
/// kills the given query ids on a second connection after
/// `lock_max_wait_before_kill`. Mirrors the original tool's
/// `threading.Timer` used while waiting to acquire a blocking write lock,
/// so a long-running `SELECT` can't indefinitely block the DDL.
pub struct KillTimer {
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KillTimer {
    pub fn arm<F>(delay: Duration, kill: F) -> KillTimer
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled_for_thread = cancelled.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(delay);
            if !cancelled_for_thread.load(Ordering::SeqCst) {
                kill();
            }
        });
        KillTimer {
            cancelled,
            handle: Some(handle),
        }
    }

    pub fn cancel(mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FakeSession {
        responses: RefCell<Vec<Vec<Row>>>,
        executed: RefCell<Vec<String>>,
    }

    impl SqlSession for FakeSession {
        fn query(&mut self, sql: &str) -> OscResult<Vec<Row>> {
            self.executed.borrow_mut().push(sql.to_string());
            Ok(self.responses.borrow_mut().remove(0))
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

    fn row(value: &str) -> Row {
        let mut r = Row::new();
        r.insert("Value".to_string(), Some(value.to_string()));
        r
    }

    fn processlist_row(db: &str, info: &str, time: &str, command: &str) -> Row {
        let mut r = Row::new();
        r.insert("db".to_string(), Some(db.to_string()));
        r.insert("Info".to_string(), Some(info.to_string()));
        r.insert("Time".to_string(), Some(time.to_string()));
        r.insert("Command".to_string(), Some(command.to_string()));
        r
    }

    #[test]
    fn find_long_running_statement_ignores_short_and_other_table_queries() {
        let mut fake = FakeSession {
            responses: RefCell::new(vec![vec![
                processlist_row("test", "select * from orders", "5", "Query"),
                processlist_row("test", "select * from other", "9000", "Query"),
                processlist_row("test", "select sleep(1)", "9000", "Sleep"),
            ]]),
            executed: RefCell::new(vec![]),
        };
        let config = OscConfig::default();
        let caps = Capabilities::new(MySqlVersion::parse("8.0.32-x.prod").unwrap());
        let mut controller = SessionController::new(&mut fake, &config, &caps);
        assert!(controller.find_long_running_statement("test", "orders").unwrap().is_none());
    }

    #[test]
    fn find_long_running_statement_flags_slow_query_on_table() {
        let mut fake = FakeSession {
            responses: RefCell::new(vec![vec![processlist_row(
                "test",
                "select * from `orders` where 1=1",
                "9000",
                "Query",
            )]]),
            executed: RefCell::new(vec![]),
        };
        let config = OscConfig::default();
        let caps = Capabilities::new(MySqlVersion::parse("8.0.32-x.prod").unwrap());
        let mut controller = SessionController::new(&mut fake, &config, &caps);
        assert!(controller.find_long_running_statement("test", "orders").unwrap().is_some());
    }

    #[test]
    fn wait_for_drain_returns_once_long_running_statement_disappears() {
        let mut fake = FakeSession {
            responses: RefCell::new(vec![
                vec![processlist_row("test", "select * from `orders`", "9000", "Query")],
                vec![],
            ]),
            executed: RefCell::new(vec![]),
        };
        let config = OscConfig::default();
        let caps = Capabilities::new(MySqlVersion::parse("8.0.32-x.prod").unwrap());
        let mut controller = SessionController::new(&mut fake, &config, &caps);
        let mut slept = 0;
        controller.wait_for_drain("test", "orders", |_| slept += 1).unwrap();
        assert_eq!(slept, 1);
    }

    #[test]
    fn wait_for_drain_exhausts_after_configured_attempts() {
        let mut config = OscConfig::default();
        config.max_wait_for_slow_query = 2;
        let mut fake = FakeSession {
            responses: RefCell::new(vec![
                vec![processlist_row("test", "select * from `orders`", "9000", "Query")],
                vec![processlist_row("test", "select * from `orders`", "9000", "Query")],
            ]),
            executed: RefCell::new(vec![]),
        };
        let caps = Capabilities::new(MySqlVersion::parse("8.0.32-x.prod").unwrap());
        let mut controller = SessionController::new(&mut fake, &config, &caps);
        let err = controller.wait_for_drain("test", "orders", |_| {}).unwrap_err();
        assert!(matches!(err, OscError::GuardExhausted { attempts: 2 }));
    }

    #[test]
    fn ddl_guard_returns_once_threads_running_drops() {
        let mut fake = FakeSession {
            responses: RefCell::new(vec![vec![row("250")], vec![row("10")]]),
            executed: RefCell::new(vec![]),
        };
        let config = OscConfig::default();
        let caps = Capabilities::new(MySqlVersion::parse("8.0.32-x.prod").unwrap());
        let mut controller = SessionController::new(&mut fake, &config, &caps);
        let mut slept = 0;
        controller.ddl_guard(|_| slept += 1).unwrap();
        assert_eq!(slept, 1);
    }

    #[test]
    fn ddl_guard_exhausts_after_configured_attempts() {
        let mut config = OscConfig::default();
        config.ddl_guard_attempts = 2;
        let mut fake = FakeSession {
            responses: RefCell::new(vec![vec![row("500")], vec![row("500")]]),
            executed: RefCell::new(vec![]),
        };
        let caps = Capabilities::new(MySqlVersion::parse("8.0.32-x.prod").unwrap());
        let mut controller = SessionController::new(&mut fake, &config, &caps);
        let err = controller.ddl_guard(|_| {}).unwrap_err();
        assert!(matches!(err, OscError::GuardExhausted { attempts: 2 }));
    }

    #[test]
    fn acquire_named_mutex_fails_when_get_lock_returns_zero() {
        let mut fake = FakeSession {
            responses: RefCell::new(vec![vec![row("0")], vec![{
                let mut r = Row::new();
                r.insert("holder".to_string(), Some("42".to_string()));
                r
            }]]),
            executed: RefCell::new(vec![]),
        };
        let config = OscConfig::default();
        let caps = Capabilities::new(MySqlVersion::parse("8.0.32-x.prod").unwrap());
        {
            let mut controller = SessionController::new(&mut fake, &config, &caps);
            assert!(matches!(
                controller.acquire_named_mutex(1.0),
                Err(OscError::MutexHeld { holder_id: Some(42), .. })
            ));
        }
        let log = fake.executed.borrow();
        assert!(log.iter().any(|s| s.contains("IS_USED_LOCK")));
    }

    #[test]
    fn init_applies_isolation_strict_mode_and_overrides() {
        let mut fake = FakeSession {
            responses: RefCell::new(vec![]),
            executed: RefCell::new(vec![]),
        };
        let mut config = OscConfig::default();
        config.session_overrides.push(("foo".to_string(), "1".to_string()));
        let caps = Capabilities::new(MySqlVersion::parse("8.0.32-x.prod").unwrap());
        {
            let mut controller = SessionController::new(&mut fake, &config, &caps);
            controller.init().unwrap();
        }
        let log = fake.executed.borrow();
        assert!(log.iter().any(|s| s.contains("transaction_isolation")));
        assert!(log.iter().any(|s| s.contains("sql_mode")));
        assert!(log.iter().any(|s| s.contains("sql_log_bin = 0")));
        assert!(log.iter().any(|s| s == "SET SESSION foo = 1"));
    }

    #[test]
    fn kill_timer_does_not_fire_if_cancelled_promptly() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_for_thread = fired.clone();
        let timer = KillTimer::arm(Duration::from_millis(200), move || {
            fired_for_thread.store(true, Ordering::SeqCst);
        });
        timer.cancel();
        assert!(!fired.load(Ordering::SeqCst));
    }
}

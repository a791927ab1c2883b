//! Shared test helpers for integration tests using Testcontainers.
//!
//! The engine itself drives MySQL over a plain blocking [`mysql::Conn`]
//! (see [`myosc_core::session::MySqlSession`]); `tokio` is only used here
//! to drive the container lifecycle, matching the async container
//! start/stop protocol `testcontainers` expects.

#![allow(dead_code)]

use myosc_core::config::OscConfig;
use myosc_core::session::MySqlSession;
use testcontainers::core::Mount;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::mysql::Mysql;

/// A test database backed by a Testcontainers MySQL 8.0 instance, with a
/// ready-to-use blocking [`MySqlSession`] for the engine under test.
pub struct TestDb {
    pub session: MySqlSession,
    pub root_url: String,
    _container: ContainerAsync<Mysql>,
}

impl TestDb {
    /// Path, inside the container, that dump/load tests bind-mount a host
    /// directory onto — see [`Self::with_dump_mount`].
    pub const DUMP_DIR: &'static str = "/tmp/myosc_dump";

    async fn from_container(container: ContainerAsync<Mysql>) -> Self {
        let port = container
            .get_host_port_ipv4(3306)
            .await
            .expect("failed to get mapped port");

        let root_url = format!("mysql://root@127.0.0.1:{port}/test");
        let config = OscConfig::default();
        let session = MySqlSession::connect(&root_url, &config)
            .expect("failed to connect engine session to test container");

        TestDb {
            session,
            root_url,
            _container: container,
        }
    }

    /// Start a fresh MySQL 8.0 container and open the engine's session.
    pub async fn new() -> Self {
        let container = Mysql::default()
            .with_tag("8.0")
            .start()
            .await
            .expect("failed to start MySQL 8.0 container");
        Self::from_container(container).await
    }

    /// Like [`Self::new`], but also bind-mounts `host_dir` onto
    /// [`Self::DUMP_DIR`] inside the container and disables
    /// `secure_file_priv`, so `SELECT ... INTO OUTFILE`/`LOAD DATA INFILE`
    /// against [`Self::DUMP_DIR`] work for dump/load integration tests.
    pub async fn with_dump_mount(host_dir: &tempfile::TempDir) -> Self {
        let mount = Mount::bind_mount(host_dir.path().to_string_lossy().to_string(), Self::DUMP_DIR);
        let container = Mysql::default()
            .with_tag("8.0")
            .with_mount(mount)
            .with_cmd(["--secure-file-priv="])
            .start()
            .await
            .expect("failed to start MySQL 8.0 container");
        Self::from_container(container).await
    }

    /// A second, independent connection against the same container — the
    /// engine's cutover path needs two live sessions (the long-lived
    /// driver and the applier connection it stops/restarts).
    pub fn second_session(&self) -> MySqlSession {
        MySqlSession::connect(&self.root_url, &OscConfig::default())
            .expect("failed to open second session against test container")
    }
}

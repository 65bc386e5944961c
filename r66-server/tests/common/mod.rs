//! Shared helpers for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use r66_common::run::RunStatus;
use r66_server::blacklist::Blacklist;
use r66_server::connection_tracker::ConnectionTracker;
use r66_server::db::host_key::hash_key;
use r66_server::db::{self, Database, IdStrategy, TransferRun};
use r66_server::recovery::Instance;
use r66_server::registry::ConnectionRegistry;
use r66_server::server::Server;
use r66_server::session::SessionContext;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Key every test host authenticates with
pub const HOST_KEY: &str = "test-host-key";

/// Hosts every node accepts `Authent` from
pub const KNOWN_HOSTS: &[&str] = &["client-node", "raw-peer", "mallory"];

/// One side of a transfer: its own database and spool
pub struct Node {
    pub dir: TempDir,
    pub ctx: SessionContext,
}

impl Node {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let pool = db::init_db(&dir.path().join("r66.db"))
            .await
            .expect("Failed to init database");
        let spool = dir.path().join("spool");
        std::fs::create_dir_all(&spool).expect("Failed to create spool");

        let database = Database::new(pool, IdStrategy::Sequence);
        let key_hash = hash_key(HOST_KEY, true).expect("Failed to hash host key");
        for host_id in KNOWN_HOSTS {
            database
                .hosts
                .upsert(host_id, &key_hash)
                .await
                .expect("Failed to register host");
        }

        let ctx = SessionContext::new(database, spool).with_host_key(Some(HOST_KEY.to_string()));
        Self { dir, ctx }
    }

    /// Register this node as a live instance; its runs are owned from now on
    pub async fn start_instance(&mut self) -> Instance {
        let (database, instance) = Instance::start(self.ctx.db.clone(), false)
            .await
            .expect("Failed to register instance");
        self.ctx.db = database;
        instance
    }

    /// A second handle on this node's database, as another process would open it
    pub async fn reopen_db(&self) -> Database {
        let pool = db::init_db(&self.dir.path().join("r66.db"))
            .await
            .expect("Failed to reopen database");
        Database::new(pool, IdStrategy::Sequence)
    }

    pub fn db(&self) -> &Database {
        &self.ctx.db
    }

    pub fn spool(&self) -> &Path {
        &self.ctx.spool
    }

    /// Write a file of `len` patterned bytes outside the spool
    pub fn source_file(&self, name: &str, len: usize) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, pattern(len)).expect("Failed to write source file");
        path
    }

    pub async fn run(&self, id: i64) -> TransferRun {
        self.db().runs.get(id).await.expect("run not found")
    }

    /// Poll a run until `done` holds for it
    pub async fn wait_for_run<F>(&self, id: i64, done: F) -> TransferRun
    where
        F: Fn(&TransferRun) -> bool,
    {
        let db = self.db();
        let done = &done;
        wait_until(move || async move {
            let run = db.runs.get(id).await.ok()?;
            done(&run).then_some(run)
        })
        .await
    }

    pub async fn wait_for_status(&self, id: i64, status: RunStatus) -> TransferRun {
        self.wait_for_run(id, |run| run.status == status).await
    }
}

/// Deterministic file content
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll `check` every 10ms for up to 5s
pub async fn wait_until<F, Fut, T>(check: F) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..500 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// A server running in the background on an ephemeral port
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<ConnectionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(node: &Node) -> Self {
        Self::start_with(node, Blacklist::new(), false).await
    }

    pub async fn start_with(node: &Node, blacklist: Blacklist, blacklist_bad_auth: bool) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            blacklist,
            ConnectionTracker::new(0, 0),
            node.db().blacklist.clone(),
            Duration::from_secs(300),
        ));
        let server = Server::bind(
            "127.0.0.1:0".parse().unwrap(),
            registry.clone(),
            node.ctx.clone().blacklist_bad_auth(blacklist_bad_auth),
        )
        .await
        .expect("Failed to bind server");
        let addr = server.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async {
            let _ = shutdown_rx.await;
        }));

        Self {
            addr,
            registry,
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    /// Signal shutdown and wait for the accept loop to finish draining
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.expect("server task panicked");
    }
}

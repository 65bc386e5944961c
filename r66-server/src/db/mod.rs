//! Database layer
//!
//! SQLite through `sqlx`, with the schema embedded as migrations. WAL mode
//! and a busy timeout let several processes share one database file, which
//! is what the run id allocators rely on.

pub mod blacklist;
pub mod config;
pub mod host_key;
pub mod hosts;
pub mod ids;
pub mod instances;
pub mod rules;
pub mod runs;
pub mod sql;
#[cfg(test)]
pub mod testing;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use r66_common::run::RunStatus;

pub use blacklist::BlacklistDb;
pub use config::ConfigDb;
pub use hosts::HostDb;
pub use ids::{IdAllocator, IdStrategy, allocator_for};
pub use instances::InstanceDb;
pub use rules::RuleDb;
pub use runs::{NewRun, RunStore, TransferRun};

/// How long a connection waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum pooled connections per process
const MAX_POOL_CONNECTIONS: u32 = 8;

/// Errors from the transfer run store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("run {0} not found")]
    NotFound(i64),

    /// Illegal or lost-race status transition; nothing was written
    #[error("run {id}: cannot move from {from} to {to}")]
    StateConflict {
        id: i64,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("run id allocation failed: {0}")]
    IdAllocation(String),

    #[error("invalid stored value: {0}")]
    InvalidData(String),
}

/// All database accessors, sharing one pool
///
/// `SqlitePool` is reference counted, so cloning is cheap.
#[derive(Clone)]
pub struct Database {
    pub config: ConfigDb,
    pub blacklist: BlacklistDb,
    pub hosts: HostDb,
    pub instances: InstanceDb,
    pub rules: RuleDb,
    pub runs: RunStore,
}

impl Database {
    /// Build all accessors over `pool`, allocating run ids with `strategy`
    pub fn new(pool: SqlitePool, strategy: IdStrategy) -> Self {
        Self {
            config: ConfigDb::new(pool.clone()),
            blacklist: BlacklistDb::new(pool.clone()),
            hosts: HostDb::new(pool.clone()),
            instances: InstanceDb::new(pool.clone()),
            rules: RuleDb::new(pool.clone()),
            runs: RunStore::new(pool.clone(), allocator_for(strategy, pool)),
        }
    }

    /// Register this process as an instance
    ///
    /// Runs created or resumed through the returned database belong to the
    /// new instance until it stops heart-beating.
    pub async fn register_instance(self) -> Result<Self, sqlx::Error> {
        let id = self.instances.register().await?;
        Ok(Self {
            runs: self.runs.with_owner(id),
            ..self
        })
    }

    /// Instance registered by [`register_instance`](Self::register_instance)
    pub fn instance_id(&self) -> Option<i64> {
        self.runs.owner()
    }
}

/// Platform default database path (`<data dir>/r66d/r66.db`)
pub fn default_database_path() -> io::Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no platform data directory"))?;
    Ok(data_dir.join("r66d").join("r66.db"))
}

/// Open (creating if needed) the database at `path` and run migrations
pub async fn init_db(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_POOL_CONNECTIONS)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Current Unix timestamp in seconds
pub(crate) fn now() -> i64 {
    Utc::now().timestamp()
}

//! Server configuration database operations

use std::io;
use std::str::FromStr;

use sqlx::SqlitePool;

use super::ids::IdStrategy;
use super::sql::{SQL_GET_CONFIG, SQL_INSERT_CONFIG_IF_ABSENT, SQL_SET_CONFIG};
use crate::constants::{
    CONFIG_KEY_BLACKLIST_DURATION_SECS, CONFIG_KEY_ID_STRATEGY, CONFIG_KEY_MAX_CONNECTIONS,
    CONFIG_KEY_MAX_CONNECTIONS_PER_IP, DEFAULT_BLACKLIST_DURATION_SECS, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_CONNECTIONS_PER_IP,
};

/// Database interface for server configuration
#[derive(Clone)]
pub struct ConfigDb {
    pool: SqlitePool,
}

impl ConfigDb {
    /// Create a new ConfigDb instance
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the global connection ceiling
    ///
    /// Returns the configured value, or 0 (unlimited) if not found or invalid.
    pub async fn get_max_connections(&self) -> usize {
        sqlx::query_scalar::<_, String>(SQL_GET_CONFIG)
            .bind(CONFIG_KEY_MAX_CONNECTIONS)
            .fetch_one(&self.pool)
            .await
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Set the global connection ceiling
    ///
    /// A value of 0 means unlimited connections are allowed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub async fn set_max_connections(&self, value: u32) -> io::Result<()> {
        self.set(CONFIG_KEY_MAX_CONNECTIONS, &value.to_string()).await
    }

    /// Get the maximum connections allowed per IP address
    ///
    /// Returns the configured value, or 0 (unlimited) if not found or invalid.
    pub async fn get_max_connections_per_ip(&self) -> usize {
        sqlx::query_scalar::<_, String>(SQL_GET_CONFIG)
            .bind(CONFIG_KEY_MAX_CONNECTIONS_PER_IP)
            .fetch_one(&self.pool)
            .await
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_IP)
    }

    /// Set the maximum connections allowed per IP address
    ///
    /// A value of 0 means unlimited connections are allowed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub async fn set_max_connections_per_ip(&self, value: u32) -> io::Result<()> {
        self.set(CONFIG_KEY_MAX_CONNECTIONS_PER_IP, &value.to_string())
            .await
    }

    /// Get how long an address stays blacklisted after a protocol violation
    ///
    /// Returns the configured value, or 300 seconds if not found or invalid.
    pub async fn get_blacklist_duration_secs(&self) -> u64 {
        sqlx::query_scalar::<_, String>(SQL_GET_CONFIG)
            .bind(CONFIG_KEY_BLACKLIST_DURATION_SECS)
            .fetch_one(&self.pool)
            .await
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_BLACKLIST_DURATION_SECS)
    }

    /// Set the automatic blacklist duration in seconds
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub async fn set_blacklist_duration_secs(&self, value: u64) -> io::Result<()> {
        self.set(CONFIG_KEY_BLACKLIST_DURATION_SECS, &value.to_string())
            .await
    }

    /// Record the run id strategy for this database, or read back the one
    /// already recorded
    ///
    /// The first process to start on a database pins its strategy. Later
    /// processes get the pinned value back and must refuse to start if it
    /// differs, since two strategies draw from different counters and
    /// would hand out the same ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the database access fails or the stored value is
    /// not a known strategy.
    pub async fn pin_id_strategy(&self, requested: IdStrategy) -> io::Result<IdStrategy> {
        sqlx::query(SQL_INSERT_CONFIG_IF_ABSENT)
            .bind(CONFIG_KEY_ID_STRATEGY)
            .bind(requested.as_ref())
            .execute(&self.pool)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;

        let stored = sqlx::query_scalar::<_, String>(SQL_GET_CONFIG)
            .bind(CONFIG_KEY_ID_STRATEGY)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;

        IdStrategy::from_str(&stored).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown id strategy '{stored}'"),
            )
        })
    }

    async fn set(&self, key: &str, value: &str) -> io::Result<()> {
        sqlx::query(SQL_SET_CONFIG)
            .bind(value)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;

        Ok(())
    }
}

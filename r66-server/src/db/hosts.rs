//! Partner host database operations

use sqlx::sqlite::SqlitePool;

use super::now;
use crate::db::sql;

/// Database access for partner hosts and their key hashes
#[derive(Clone)]
pub struct HostDb {
    pool: SqlitePool,
}

impl HostDb {
    /// Create a new HostDb instance
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a host or replace its key hash
    pub async fn upsert(&self, host_id: &str, key_hash: &str) -> Result<(), sqlx::Error> {
        sqlx::query(sql::SQL_UPSERT_HOST)
            .bind(host_id)
            .bind(key_hash)
            .bind(now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stored key hash of a host, if the host is known
    pub async fn key_hash(&self, host_id: &str) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar(sql::SQL_SELECT_HOST_KEY)
            .bind(host_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// All host ids, sorted
    pub async fn list(&self) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(sql::SQL_SELECT_HOST_IDS)
            .fetch_all(&self.pool)
            .await
    }

    /// Delete a host; returns whether it existed
    pub async fn delete(&self, host_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(sql::SQL_DELETE_HOST)
            .bind(host_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

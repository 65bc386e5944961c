//! Blacklist database operations

use std::str::FromStr;

use sqlx::sqlite::SqlitePool;
use strum::{AsRefStr, Display, EnumString};

use super::now;
use crate::db::sql;

/// What a blacklist entry matches against
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum BlacklistKind {
    /// Peer IP address or CIDR range
    Address,
    /// Host identifier announced in a transfer request
    Host,
}

/// A blacklist record from the database
#[derive(Debug, Clone)]
pub struct BlacklistRecord {
    #[allow(dead_code)]
    pub id: i64,
    pub kind: BlacklistKind,
    pub value: String,
    pub reason: Option<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

/// Row type for blacklist queries
type BlacklistRow = (i64, String, String, Option<String>, i64, Option<i64>);

impl TryFrom<BlacklistRow> for BlacklistRecord {
    type Error = sqlx::Error;

    fn try_from(row: BlacklistRow) -> Result<Self, Self::Error> {
        let kind = BlacklistKind::from_str(&row.1).map_err(|_| sqlx::Error::ColumnDecode {
            index: "kind".to_string(),
            source: format!("unknown blacklist kind '{}'", row.1).into(),
        })?;

        Ok(Self {
            id: row.0,
            kind,
            value: row.2,
            reason: row.3,
            created_at: row.4,
            expires_at: row.5,
        })
    }
}

/// Database access for blacklist entries
#[derive(Clone)]
pub struct BlacklistDb {
    pool: SqlitePool,
}

impl BlacklistDb {
    /// Create a new BlacklistDb instance
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create or update an entry (upsert)
    ///
    /// Re-blacklisting an existing value replaces its reason and expiry.
    /// Returns the stored record.
    pub async fn upsert(
        &self,
        kind: BlacklistKind,
        value: &str,
        reason: Option<&str>,
        expires_at: Option<i64>,
    ) -> Result<BlacklistRecord, sqlx::Error> {
        sqlx::query(sql::SQL_UPSERT_BLACKLIST)
            .bind(kind.as_ref())
            .bind(value)
            .bind(reason)
            .bind(now())
            .bind(expires_at)
            .execute(&self.pool)
            .await?;

        self.get_entry(kind, value)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Get an entry regardless of expiry status
    pub async fn get_entry(
        &self,
        kind: BlacklistKind,
        value: &str,
    ) -> Result<Option<BlacklistRecord>, sqlx::Error> {
        let row: Option<BlacklistRow> = sqlx::query_as(sql::SQL_SELECT_BLACKLIST_ENTRY)
            .bind(kind.as_ref())
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        row.map(BlacklistRecord::try_from).transpose()
    }

    /// Delete an entry
    ///
    /// Returns true if an entry was deleted.
    pub async fn delete(&self, kind: BlacklistKind, value: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(sql::SQL_DELETE_BLACKLIST_ENTRY)
            .bind(kind.as_ref())
            .bind(value)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// List all non-expired entries, newest first
    ///
    /// Used at startup to populate the in-memory blacklist.
    pub async fn list_active(&self) -> Result<Vec<BlacklistRecord>, sqlx::Error> {
        let rows: Vec<BlacklistRow> = sqlx::query_as(sql::SQL_SELECT_ACTIVE_BLACKLIST)
            .bind(now())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(BlacklistRecord::try_from).collect()
    }

    /// Delete all expired entries
    ///
    /// Returns the number of entries deleted.
    pub async fn cleanup_expired(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(sql::SQL_DELETE_EXPIRED_BLACKLIST)
            .bind(now())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

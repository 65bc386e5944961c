//! Process registration for shared databases
//!
//! Every process that creates or resumes runs registers an instance row and
//! keeps its heartbeat fresh. Recovery only touches runs whose owning
//! instance stopped beating.

use sqlx::sqlite::SqlitePool;

use super::now;
use crate::db::sql;

/// Database access for instance rows
#[derive(Clone)]
pub struct InstanceDb {
    pool: SqlitePool,
}

impl InstanceDb {
    /// Create a new InstanceDb instance
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register the current process and return its instance id
    pub async fn register(&self) -> Result<i64, sqlx::Error> {
        let now = now();
        let result = sqlx::query(sql::SQL_INSERT_INSTANCE)
            .bind(i64::from(std::process::id()))
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Refresh the heartbeat of `id`
    ///
    /// Recreates the row when a sweep removed it after a long stall, so the
    /// runs still stamped with `id` count as live again.
    pub async fn heartbeat(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(sql::SQL_INSTANCE_HEARTBEAT)
            .bind(id)
            .bind(i64::from(std::process::id()))
            .bind(now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove the row of an instance that is shutting down
    pub async fn release(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(sql::SQL_DELETE_INSTANCE)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove instances with a heartbeat at or before `live_since`
    ///
    /// Returns the number of rows removed.
    pub async fn remove_stale(&self, live_since: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(sql::SQL_DELETE_STALE_INSTANCES)
            .bind(live_since)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::create_test_db;

    async fn heartbeat_of(pool: &SqlitePool, id: i64) -> Option<i64> {
        sqlx::query_scalar("SELECT heartbeat_at FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_assigns_distinct_ids() {
        let pool = create_test_db().await;
        let db = InstanceDb::new(pool.clone());

        let a = db.register().await.unwrap();
        let b = db.register().await.unwrap();
        assert_ne!(a, b);
        assert!(heartbeat_of(&pool, a).await.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_recreates_swept_row() {
        let pool = create_test_db().await;
        let db = InstanceDb::new(pool.clone());
        let id = db.register().await.unwrap();

        sqlx::query("UPDATE instances SET heartbeat_at = 0 WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(db.remove_stale(now() - 60).await.unwrap(), 1);
        assert!(heartbeat_of(&pool, id).await.is_none());

        db.heartbeat(id).await.unwrap();
        let beat = heartbeat_of(&pool, id).await.unwrap();
        assert!(beat >= now() - 1);
    }

    #[tokio::test]
    async fn test_release_and_remove_stale() {
        let pool = create_test_db().await;
        let db = InstanceDb::new(pool.clone());
        let live = db.register().await.unwrap();
        let gone = db.register().await.unwrap();

        db.release(gone).await.unwrap();
        assert!(heartbeat_of(&pool, gone).await.is_none());

        // Fresh heartbeats survive a sweep
        assert_eq!(db.remove_stale(now() - 60).await.unwrap(), 0);
        assert!(heartbeat_of(&pool, live).await.is_some());
    }
}

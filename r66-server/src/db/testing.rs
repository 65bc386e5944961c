//! Test helpers for the database layer

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{Database, IdStrategy};

/// Create an in-memory database with migrations applied
///
/// A single connection keeps every query on the same in-memory database.
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

/// Create a full `Database` over an in-memory pool
pub async fn create_test_database(strategy: IdStrategy) -> Database {
    Database::new(create_test_db().await, strategy)
}

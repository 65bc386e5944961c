//! Run id allocation strategies
//!
//! Every strategy hands out ids that are unique across all processes sharing
//! the database and strictly increasing in allocation order. They differ in
//! the primitive they lean on:
//!
//! - `Sequence`: one statement that advances and returns a counter, the way a
//!   native sequence object (`NEXTVAL`) works
//! - `AutoIncrement`: insert into an AUTOINCREMENT table and read the new rowid
//! - `CounterTable`: read a single-row counter, then compare-and-swap it,
//!   retrying when another allocator got there first

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::Mutex;

use super::sql::{
    SQL_INSERT_RUN_ID, SQL_NEXT_SEQUENCE_VALUE, SQL_SELECT_COUNTER, SQL_SWAP_COUNTER,
};
use super::{StoreError, now};

/// Row name shared by the sequence and counter tables
const RUN_COUNTER_NAME: &str = "runs";

/// Compare-and-swap attempts before giving up
const MAX_SWAP_ATTEMPTS: usize = 64;

/// Which primitive hands out run ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, EnumString, clap::ValueEnum)]
#[strum(serialize_all = "kebab-case")]
pub enum IdStrategy {
    Sequence,
    AutoIncrement,
    CounterTable,
}

/// Source of unique run ids
#[async_trait]
pub trait IdAllocator: Send + Sync {
    /// Allocate the next id; never returns the same value twice
    async fn allocate(&self) -> Result<i64, StoreError>;

    fn strategy(&self) -> IdStrategy;
}

/// Build the allocator for a strategy
pub fn allocator_for(strategy: IdStrategy, pool: SqlitePool) -> Arc<dyn IdAllocator> {
    match strategy {
        IdStrategy::Sequence => Arc::new(SequenceAllocator { pool }),
        IdStrategy::AutoIncrement => Arc::new(AutoIncrementAllocator { pool }),
        IdStrategy::CounterTable => Arc::new(CounterTableAllocator {
            pool,
            local: Mutex::new(()),
        }),
    }
}

/// Single round trip: `UPDATE ... RETURNING`
pub struct SequenceAllocator {
    pool: SqlitePool,
}

#[async_trait]
impl IdAllocator for SequenceAllocator {
    async fn allocate(&self) -> Result<i64, StoreError> {
        let value: Option<i64> = sqlx::query_scalar(SQL_NEXT_SEQUENCE_VALUE)
            .bind(RUN_COUNTER_NAME)
            .fetch_optional(&self.pool)
            .await?;

        value.ok_or_else(|| StoreError::IdAllocation("run sequence row missing".to_string()))
    }

    fn strategy(&self) -> IdStrategy {
        IdStrategy::Sequence
    }
}

/// Auto-increment column read back after insert
pub struct AutoIncrementAllocator {
    pool: SqlitePool,
}

#[async_trait]
impl IdAllocator for AutoIncrementAllocator {
    async fn allocate(&self) -> Result<i64, StoreError> {
        let result = sqlx::query(SQL_INSERT_RUN_ID)
            .bind(now())
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    fn strategy(&self) -> IdStrategy {
        IdStrategy::AutoIncrement
    }
}

/// Single-row counter updated with compare-and-swap
///
/// The in-process mutex only cuts down on lost races between tasks of the
/// same process; uniqueness across processes comes from the swap.
pub struct CounterTableAllocator {
    pool: SqlitePool,
    local: Mutex<()>,
}

#[async_trait]
impl IdAllocator for CounterTableAllocator {
    async fn allocate(&self) -> Result<i64, StoreError> {
        let _local = self.local.lock().await;

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let current: Option<i64> = sqlx::query_scalar(SQL_SELECT_COUNTER)
                .bind(RUN_COUNTER_NAME)
                .fetch_optional(&self.pool)
                .await?;
            let current = current
                .ok_or_else(|| StoreError::IdAllocation("run counter row missing".to_string()))?;
            let next = current + 1;

            let swapped = sqlx::query(SQL_SWAP_COUNTER)
                .bind(next)
                .bind(RUN_COUNTER_NAME)
                .bind(current)
                .execute(&self.pool)
                .await?
                .rows_affected();

            if swapped == 1 {
                return Ok(next);
            }
            tokio::task::yield_now().await;
        }

        Err(StoreError::IdAllocation(format!(
            "counter contention: gave up after {MAX_SWAP_ATTEMPTS} attempts"
        )))
    }

    fn strategy(&self) -> IdStrategy {
        IdStrategy::CounterTable
    }
}

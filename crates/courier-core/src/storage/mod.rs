//! Transactional record store.
//!
//! A [`RecordStore`] owns one database connection and at most one open
//! transaction. Every cycle begins a transaction, claims a batch with a
//! lock-skipping read, applies per-row outcomes, and commits or rolls back.
//! Only the delivery coordinator holds the store, so statements are never
//! issued concurrently against the transaction.

use std::{future::Future, pin::Pin};

use crate::{
    error::{Result, StoreError},
    models::{RawRow, RecordId},
};

pub mod mock;
pub mod postgres;

pub use postgres::PostgresStore;

/// Boxed future returned by store operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Storage operations required by the delivery cycle.
///
/// Object safe, so the coordinator can drive either the PostgreSQL
/// implementation or the in-memory [`mock::MockStore`].
pub trait RecordStore: Send + 'static {
    /// Opens the cycle's transaction.
    ///
    /// Fails with `TransactionAlreadyOpen` if the previous cycle neither
    /// committed nor rolled back.
    fn begin(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Claims up to `limit` unprocessed rows whose retry counter is below
    /// `max_retry`, skipping rows locked by another claimer.
    ///
    /// The ceiling is exclusive: a row is claimed only while
    /// `retry < max_retry`, so with `max_retry = 3` it gets three cycles and
    /// a row that has reached the ceiling is never returned again.
    ///
    /// An empty vector means there was nothing to claim.
    fn claim_batch(&mut self, limit: usize, max_retry: i32) -> BoxFuture<'_, Result<Vec<RawRow>>>;

    /// Sets `is_processed` for a record. Idempotent.
    fn mark_processed(&mut self, id: RecordId) -> BoxFuture<'_, Result<()>>;

    /// Increments the persisted retry counter of a record.
    fn mark_retried(&mut self, id: RecordId) -> BoxFuture<'_, Result<()>>;

    /// Commits the open transaction.
    fn commit(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Rolls back the open transaction.
    fn rollback(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Releases the connection, rolling back any transaction still open.
    ///
    /// Returns every error encountered rather than stopping at the first.
    fn close(&mut self) -> BoxFuture<'_, Vec<StoreError>>;
}

/// Rolls back the open transaction after `cause` and returns the error to
/// propagate.
///
/// When the rollback itself fails the returned error carries both.
pub async fn rollback_and_wrap(store: &mut dyn RecordStore, cause: StoreError) -> StoreError {
    match store.rollback().await {
        Ok(()) => cause,
        Err(rollback) => StoreError::rollback_failed(cause, rollback),
    }
}

/// Checks that `name` is a plain SQL identifier safe to quote into a
/// statement.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= 63 {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(name.to_string()))
    }
}

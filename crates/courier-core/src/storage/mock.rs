//! In-memory record store for testing.
//!
//! Behaves like the PostgreSQL store at the transaction level: claims read
//! committed state, mutations are staged in the open transaction and become
//! visible only on commit, and rollback discards them. Clones share state, so
//! a test can hand one handle to the coordinator and inspect another.

use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::RwLock;

use super::{BoxFuture, RecordStore};
use crate::{
    error::{Result, StoreError},
    models::{RawRow, RawValue, RecordId, ID_COLUMN, PROCESSED_COLUMN, RETRY_COLUMN},
};

/// A store call, as recorded in the operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOperation {
    /// `begin`
    Begin,
    /// `claim_batch`, with the number of rows returned
    Claim {
        /// Rows handed back to the caller
        returned: usize,
    },
    /// `mark_processed`
    MarkProcessed(RecordId),
    /// `mark_retried`
    MarkRetried(RecordId),
    /// `commit`
    Commit,
    /// `rollback`
    Rollback,
    /// `close`
    Close,
}

/// Committed bookkeeping state of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowState {
    /// Delivery flag
    pub is_processed: bool,
    /// Persisted retry counter
    pub retry: i32,
}

#[derive(Debug, Clone)]
struct StoredRow {
    state: RowState,
    fields: Vec<(String, String)>,
    raw_override: Option<RawRow>,
}

impl StoredRow {
    fn to_raw(&self, id: RecordId) -> RawRow {
        if let Some(raw) = &self.raw_override {
            return raw.clone();
        }
        let mut raw = RawRow::new().with(ID_COLUMN, RawValue::Int(id.0));
        for (name, value) in &self.fields {
            raw.push(name.clone(), RawValue::Text(value.clone()));
        }
        raw.with(PROCESSED_COLUMN, RawValue::Bool(self.state.is_processed))
            .with(RETRY_COLUMN, RawValue::Int(i64::from(self.state.retry)))
    }
}

#[derive(Debug, Clone, Copy)]
enum Mutation {
    Processed(RecordId),
    Retried(RecordId),
}

#[derive(Debug, Default)]
struct MockState {
    rows: BTreeMap<RecordId, StoredRow>,
    staged: Option<Vec<Mutation>>,
    operations: Vec<StoreOperation>,
    closed: bool,
    begin_error: Option<String>,
    claim_error: Option<String>,
    mutation_error: Option<String>,
    commit_error: Option<String>,
    rollback_error: Option<String>,
}

impl MockState {
    fn staged_mut(&mut self) -> Result<&mut Vec<Mutation>> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        self.staged.as_mut().ok_or(StoreError::NoTransaction)
    }
}

/// Mock record store with an operation log and fault injection.
#[derive(Debug, Clone, Default)]
pub struct MockStore {
    state: Arc<RwLock<MockState>>,
}

impl MockStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an unprocessed row with the given business fields.
    pub async fn insert_row(&self, id: i64, fields: &[(&str, &str)]) {
        self.insert_row_with_retry(id, fields, 0).await;
    }

    /// Inserts an unprocessed row with a preset retry counter.
    pub async fn insert_row_with_retry(&self, id: i64, fields: &[(&str, &str)], retry: i32) {
        let row = StoredRow {
            state: RowState { is_processed: false, retry },
            fields: fields.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect(),
            raw_override: None,
        };
        self.state.write().await.rows.insert(RecordId(id), row);
    }

    /// Inserts a row whose claimed form is `raw` verbatim.
    ///
    /// Used to feed malformed rows into the decode path. The row is eligible
    /// for claiming like any other unprocessed row.
    pub async fn insert_raw(&self, id: i64, raw: RawRow) {
        let row = StoredRow {
            state: RowState { is_processed: false, retry: 0 },
            fields: Vec::new(),
            raw_override: Some(raw),
        };
        self.state.write().await.rows.insert(RecordId(id), row);
    }

    /// Committed state of a row.
    pub async fn row_state(&self, id: i64) -> Option<RowState> {
        self.state.read().await.rows.get(&RecordId(id)).map(|row| row.state)
    }

    /// Every store call so far, in order.
    pub async fn operations(&self) -> Vec<StoreOperation> {
        self.state.read().await.operations.clone()
    }

    /// Number of commits issued.
    pub async fn commit_count(&self) -> usize {
        self.state.read().await.operations.iter().filter(|op| **op == StoreOperation::Commit).count()
    }

    /// Mutations staged in the open transaction, zero when none is open.
    pub async fn staged_count(&self) -> usize {
        self.state.read().await.staged.as_ref().map_or(0, Vec::len)
    }

    /// Whether a transaction is open.
    pub async fn in_transaction(&self) -> bool {
        self.state.read().await.staged.is_some()
    }

    /// Whether `close` has been called.
    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    /// Fails the next `begin`.
    pub async fn fail_next_begin(&self, message: impl Into<String>) {
        self.state.write().await.begin_error = Some(message.into());
    }

    /// Fails the next `claim_batch`.
    pub async fn fail_next_claim(&self, message: impl Into<String>) {
        self.state.write().await.claim_error = Some(message.into());
    }

    /// Fails the next `mark_processed` or `mark_retried`.
    pub async fn fail_next_mutation(&self, message: impl Into<String>) {
        self.state.write().await.mutation_error = Some(message.into());
    }

    /// Fails the next `commit`. The transaction stays open.
    pub async fn fail_next_commit(&self, message: impl Into<String>) {
        self.state.write().await.commit_error = Some(message.into());
    }

    /// Fails the next `rollback`. The transaction is discarded anyway.
    pub async fn fail_next_rollback(&self, message: impl Into<String>) {
        self.state.write().await.rollback_error = Some(message.into());
    }

    async fn stage(&self, mutation: Mutation, operation: StoreOperation) -> Result<()> {
        let mut state = self.state.write().await;
        state.operations.push(operation);
        if let Some(error) = state.mutation_error.take() {
            return Err(StoreError::Database(error));
        }
        state.staged_mut()?.push(mutation);
        Ok(())
    }
}

impl RecordStore for MockStore {
    fn begin(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.operations.push(StoreOperation::Begin);
            if state.closed {
                return Err(StoreError::Closed);
            }
            if let Some(error) = state.begin_error.take() {
                return Err(StoreError::Database(error));
            }
            if state.staged.is_some() {
                return Err(StoreError::TransactionAlreadyOpen);
            }
            state.staged = Some(Vec::new());
            Ok(())
        })
    }

    fn claim_batch(&mut self, limit: usize, max_retry: i32) -> BoxFuture<'_, Result<Vec<RawRow>>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.staged_mut()?;
            if let Some(error) = state.claim_error.take() {
                state.operations.push(StoreOperation::Claim { returned: 0 });
                return Err(StoreError::Database(error));
            }

            let claimed: Vec<RawRow> = state
                .rows
                .iter()
                .filter(|(_, row)| !row.state.is_processed && row.state.retry < max_retry)
                .take(limit)
                .map(|(id, row)| row.to_raw(*id))
                .collect();

            state.operations.push(StoreOperation::Claim { returned: claimed.len() });
            Ok(claimed)
        })
    }

    fn mark_processed(&mut self, id: RecordId) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.stage(Mutation::Processed(id), StoreOperation::MarkProcessed(id)))
    }

    fn mark_retried(&mut self, id: RecordId) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.stage(Mutation::Retried(id), StoreOperation::MarkRetried(id)))
    }

    fn commit(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.operations.push(StoreOperation::Commit);
            state.staged_mut()?;
            if let Some(error) = state.commit_error.take() {
                return Err(StoreError::Database(error));
            }

            let staged = state.staged.take().unwrap_or_default();
            for mutation in staged {
                match mutation {
                    Mutation::Processed(id) => {
                        if let Some(row) = state.rows.get_mut(&id) {
                            row.state.is_processed = true;
                        }
                    },
                    Mutation::Retried(id) => {
                        if let Some(row) = state.rows.get_mut(&id) {
                            row.state.retry += 1;
                        }
                    },
                }
            }
            Ok(())
        })
    }

    fn rollback(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.operations.push(StoreOperation::Rollback);
            state.staged_mut()?;
            state.staged = None;
            if let Some(error) = state.rollback_error.take() {
                return Err(StoreError::Database(error));
            }
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Vec<StoreError>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.operations.push(StoreOperation::Close);
            state.staged = None;
            state.closed = true;
            Vec::new()
        })
    }
}

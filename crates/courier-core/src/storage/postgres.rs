//! PostgreSQL implementation of [`RecordStore`].

use sqlx::{
    postgres::PgRow, Column, PgPool, Postgres, Row, Transaction, TypeInfo, ValueRef,
};
use tracing::{debug, warn};

use super::{validate_identifier, BoxFuture, RecordStore};
use crate::{
    error::{Result, StoreError},
    models::{RawRow, RawValue, RecordId, BOOKKEEPING_COLUMNS},
};

/// Statements bound to one table, built once at connect time.
#[derive(Debug, Clone)]
struct Queries {
    claim: String,
    mark_processed: String,
    mark_retried: String,
}

impl Queries {
    fn for_table(table: &str) -> Self {
        Self {
            claim: format!(
                r#"SELECT * FROM "{table}"
                WHERE NOT is_processed AND retry < $1
                ORDER BY id
                LIMIT $2
                FOR UPDATE SKIP LOCKED"#
            ),
            mark_processed: format!(r#"UPDATE "{table}" SET is_processed = TRUE WHERE id = $1"#),
            mark_retried: format!(r#"UPDATE "{table}" SET retry = retry + 1 WHERE id = $1"#),
        }
    }
}

/// Record store over a single-table PostgreSQL source.
///
/// Holds at most one open transaction. The pool is expected to be sized to
/// one connection; the store never needs more.
pub struct PostgresStore {
    pool: PgPool,
    table: String,
    tx: Option<Transaction<'static, Postgres>>,
    queries: Queries,
    closed: bool,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("table", &self.table)
            .field("in_transaction", &self.tx.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl PostgresStore {
    /// Connects the store to `table`, verifying the table shape first.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTableName`, `TableNotFound` or `MissingColumn` when
    /// the table cannot serve as a source, and `Database` on query failure.
    pub async fn connect(pool: PgPool, table: &str) -> Result<Self> {
        validate_identifier(table)?;

        let columns: Vec<String> = sqlx::query_scalar(
            r"
            SELECT column_name::text FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ",
        )
        .bind(table)
        .fetch_all(&pool)
        .await?;

        if columns.is_empty() {
            return Err(StoreError::TableNotFound { table: table.to_string() });
        }

        for required in BOOKKEEPING_COLUMNS {
            if !columns.iter().any(|column| column == required) {
                return Err(StoreError::MissingColumn {
                    table: table.to_string(),
                    column: required.to_string(),
                });
            }
        }

        debug!(table, columns = columns.len(), "source table validated");

        Ok(Self {
            pool,
            table: table.to_string(),
            tx: None,
            queries: Queries::for_table(table),
            closed: false,
        })
    }

    /// Name of the source table.
    pub fn table(&self) -> &str {
        &self.table
    }
}

impl RecordStore for PostgresStore {
    fn begin(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.closed {
                return Err(StoreError::Closed);
            }
            if self.tx.is_some() {
                return Err(StoreError::TransactionAlreadyOpen);
            }
            self.tx = Some(self.pool.begin().await?);
            Ok(())
        })
    }

    fn claim_batch(&mut self, limit: usize, max_retry: i32) -> BoxFuture<'_, Result<Vec<RawRow>>> {
        Box::pin(async move {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let tx = self.tx.as_mut().ok_or(StoreError::NoTransaction)?;

            let rows = sqlx::query(&self.queries.claim)
                .bind(max_retry)
                .bind(limit)
                .fetch_all(&mut **tx)
                .await?;

            rows.iter().map(raw_row).collect()
        })
    }

    fn mark_processed(&mut self, id: RecordId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let tx = self.tx.as_mut().ok_or(StoreError::NoTransaction)?;
            let result =
                sqlx::query(&self.queries.mark_processed).bind(id.0).execute(&mut **tx).await?;

            if result.rows_affected() == 0 {
                debug!(record_id = %id, "mark_processed matched no row");
            }
            Ok(())
        })
    }

    fn mark_retried(&mut self, id: RecordId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let tx = self.tx.as_mut().ok_or(StoreError::NoTransaction)?;
            let result =
                sqlx::query(&self.queries.mark_retried).bind(id.0).execute(&mut **tx).await?;

            if result.rows_affected() == 0 {
                debug!(record_id = %id, "mark_retried matched no row");
            }
            Ok(())
        })
    }

    fn commit(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let tx = self.tx.take().ok_or(StoreError::NoTransaction)?;
            tx.commit().await?;
            Ok(())
        })
    }

    fn rollback(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let tx = self.tx.take().ok_or(StoreError::NoTransaction)?;
            tx.rollback().await?;
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Vec<StoreError>> {
        Box::pin(async move {
            let mut errors = Vec::new();

            if let Some(tx) = self.tx.take() {
                warn!(table = %self.table, "closing store with an open transaction, rolling back");
                if let Err(e) = tx.rollback().await {
                    errors.push(StoreError::from(e));
                }
            }

            if !self.closed {
                self.pool.close().await;
                self.closed = true;
            }

            errors
        })
    }
}

/// Converts a driver row into named raw values using column type metadata.
fn raw_row(row: &PgRow) -> Result<RawRow> {
    let mut raw = RawRow::new();

    for (index, column) in row.columns().iter().enumerate() {
        let value = if row.try_get_raw(index)?.is_null() {
            RawValue::Null
        } else {
            match column.type_info().name() {
                "BOOL" => RawValue::Bool(row.try_get::<bool, _>(index)?),
                "INT2" => RawValue::Int(i64::from(row.try_get::<i16, _>(index)?)),
                "INT4" => RawValue::Int(i64::from(row.try_get::<i32, _>(index)?)),
                "INT8" => RawValue::Int(row.try_get::<i64, _>(index)?),
                "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                    RawValue::Text(row.try_get::<String, _>(index)?)
                },
                other => RawValue::Unsupported(other.to_string()),
            }
        };
        raw.push(column.name(), value);
    }

    Ok(raw)
}

//! PostgreSQL record store against a live database.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::time::{SystemTime, UNIX_EPOCH};

use courier_core::{
    storage::{PostgresStore, RecordStore},
    Record, RecordId, StoreError,
};
use sqlx::{postgres::PgPoolOptions, PgPool};

async fn pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    PgPoolOptions::new().max_connections(2).connect(&url).await.expect("connect")
}

/// Creates a uniquely named source table seeded with `rows` ids.
async fn source_table(pool: &PgPool, rows: &[i64]) -> String {
    let suffix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let table = format!("courier_test_{suffix}");

    sqlx::query(&format!(
        r#"CREATE TABLE "{table}" (
            id BIGINT PRIMARY KEY,
            name TEXT NOT NULL,
            email VARCHAR(120) NOT NULL,
            is_processed BOOLEAN NOT NULL DEFAULT FALSE,
            retry INTEGER NOT NULL DEFAULT 0
        )"#
    ))
    .execute(pool)
    .await
    .expect("create table");

    for id in rows {
        sqlx::query(&format!(r#"INSERT INTO "{table}" (id, name, email) VALUES ($1, $2, $3)"#))
            .bind(id)
            .bind(format!("user {id}"))
            .bind(format!("user{id}@example.com"))
            .execute(pool)
            .await
            .expect("insert row");
    }

    table
}

async fn drop_table(pool: &PgPool, table: &str) {
    sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{table}""#))
        .execute(pool)
        .await
        .expect("drop table");
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn connect_rejects_missing_table() {
    let pool = pool().await;

    let result = PostgresStore::connect(pool, "courier_table_that_does_not_exist").await;

    assert!(matches!(result, Err(StoreError::TableNotFound { .. })));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn connect_rejects_table_without_bookkeeping_columns() {
    let pool = pool().await;
    let table = format!(
        "courier_bare_{}",
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
    );
    sqlx::query(&format!(r#"CREATE TABLE "{table}" (id BIGINT PRIMARY KEY, name TEXT)"#))
        .execute(&pool)
        .await
        .unwrap();

    let result = PostgresStore::connect(pool.clone(), &table).await;

    assert!(
        matches!(result, Err(StoreError::MissingColumn { ref column, .. }) if column == "is_processed")
    );
    drop_table(&pool, &table).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn claimed_rows_decode_and_mutations_commit() {
    let pool = pool().await;
    let table = source_table(&pool, &[1, 2]).await;
    let mut store = PostgresStore::connect(pool.clone(), &table).await.unwrap();

    store.begin().await.unwrap();
    let rows = store.claim_batch(10, 3).await.unwrap();
    let records: Vec<Record> = rows.into_iter().map(|r| Record::decode(r).unwrap()).collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].body(), serde_json::json!({"name": "user 1", "email": "user1@example.com"}));

    store.mark_processed(RecordId(1)).await.unwrap();
    store.mark_retried(RecordId(2)).await.unwrap();
    store.commit().await.unwrap();

    let state: Vec<(i64, bool, i32)> =
        sqlx::query_as(&format!(r#"SELECT id, is_processed, retry FROM "{table}" ORDER BY id"#))
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(state, [(1, true, 0), (2, false, 1)]);

    drop_table(&pool, &table).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_claims_skip_locked_rows() {
    let pool = pool().await;
    let table = source_table(&pool, &[1, 2, 3]).await;
    let mut first = PostgresStore::connect(pool.clone(), &table).await.unwrap();
    let mut second = PostgresStore::connect(pool.clone(), &table).await.unwrap();

    first.begin().await.unwrap();
    let claimed_first = first.claim_batch(2, 3).await.unwrap();
    second.begin().await.unwrap();
    let claimed_second = second.claim_batch(10, 3).await.unwrap();

    let ids = |rows: &[courier_core::RawRow]| -> Vec<i64> {
        rows.iter().filter_map(courier_core::RawRow::id_hint).collect()
    };
    assert_eq!(ids(&claimed_first), [1, 2]);
    assert_eq!(ids(&claimed_second), [3]);

    first.rollback().await.unwrap();
    second.rollback().await.unwrap();
    drop_table(&pool, &table).await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn rows_at_retry_ceiling_not_claimed() {
    let pool = pool().await;
    let table = source_table(&pool, &[1, 2]).await;
    sqlx::query(&format!(r#"UPDATE "{table}" SET retry = 3 WHERE id = 1"#))
        .execute(&pool)
        .await
        .unwrap();
    let mut store = PostgresStore::connect(pool.clone(), &table).await.unwrap();

    store.begin().await.unwrap();
    let rows = store.claim_batch(10, 3).await.unwrap();
    store.rollback().await.unwrap();

    assert_eq!(rows.iter().filter_map(|r| r.id_hint()).collect::<Vec<_>>(), [2]);
    drop_table(&pool, &table).await;
}

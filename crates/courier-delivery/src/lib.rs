//! Record delivery engine.
//!
//! Moves rows from a transactional [`courier_core::RecordStore`] to a remote
//! HTTP endpoint. Each cycle claims a batch with `FOR UPDATE SKIP LOCKED`,
//! fans the rows out to a fixed pool of workers, and commits the per-row
//! outcomes in the same transaction that claimed them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐ claim/commit ┌─────────────┐
//! │ Coordinator │─────────────▶│ RecordStore │
//! └─────────────┘              └─────────────┘
//!   │ jobs   ▲ outcomes
//!   ▼        │
//! ┌─────────────┐   POST       ┌─────────────┐
//! │ Worker Pool │─────────────▶│  Endpoint   │
//! └─────────────┘              └─────────────┘
//! ```
//!
//! - **Deterministic dispatch** - a row goes to worker `id mod worker_count`
//! - **Two backoff layers** - between idle cycles and between delivery
//!   attempts, each with its own random source
//! - **Commit gating** - the transaction commits only after every dispatched
//!   row has reported an outcome
//! - **Graceful drain** - on shutdown in-flight deliveries are cancelled and
//!   the outcomes recorded so far are committed
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{storage::PostgresStore, RealClock};
//! use courier_delivery::{Coordinator, DeliveryConfig};
//! use sqlx::PgPool;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresStore::connect(pool, "customers").await?;
//! let config = DeliveryConfig {
//!     endpoint_url: "https://crm.example.com/leads".to_string(),
//!     ..DeliveryConfig::default()
//! };
//! let shutdown = CancellationToken::new();
//!
//! let coordinator =
//!     Coordinator::start(Box::new(store), config, Arc::new(RealClock::new()), shutdown)?;
//! let summary = coordinator.run().await?;
//! println!("delivered {} records", summary.delivered);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod worker;
pub mod worker_pool;

pub use backoff::{Backoff, BackoffPolicy};
pub use coordinator::{Coordinator, CycleOutcome, CycleReport, DeliveryConfig, RunSummary};
pub use error::{DeliveryError, Result};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 20;

/// Default capacity of each worker's job queue.
pub const DEFAULT_QUEUE_SIZE: usize = 5;

/// Default number of rows claimed per cycle.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default retry ceiling; rows that failed this many cycles are left alone.
pub const DEFAULT_MAX_RETRY: i32 = 3;

/// Default delivery attempts per record per cycle.
pub const DEFAULT_DELIVERY_ATTEMPTS: u32 = 3;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

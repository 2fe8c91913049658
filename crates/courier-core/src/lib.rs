//! Core domain models, errors and storage for courier.
//!
//! Provides the record model decoded from claimed rows, the error taxonomy
//! for store operations, the clock abstraction used for backoff sleeps, and
//! the transactional [`storage::RecordStore`] that the delivery cycle drives.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{DecodeError, Result, StoreError};
pub use models::{BusinessField, RawRow, RawValue, Record, RecordId};
pub use storage::RecordStore;
pub use time::{Clock, RealClock, TestClock};

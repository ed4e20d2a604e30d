//! # sqlx-sqlite-busy
//!
//! Bounded retry policies for writers blocked on SQLite's single write lock.
//!
//! When a connection needs the write lock and another connection holds it,
//! SQLite reports the database as busy. A busy handler decides whether to wait
//! and try again or to give up and let the statement fail with `SQLITE_BUSY`.
//! This crate provides that decision as a plain object and installs it as
//! SQLite's native busy handler on sqlx connections.
//!
//! ## Core Types
//!
//! - **[`RetryPolicy`]**: Immutable budget (time or attempts), pacing and poll stride
//! - **[`BusyConfig`]**: Deserializable options that validate into a policy
//! - **[`BusyController`]**: The wait-or-give-up decision
//! - **[`RetryState`]**: Progress of one lock acquisition
//! - **[`Clock`]**: Monotonic time source, with [`ManualClock`] for tests
//!
//! ## Usage
//!
//! ```no_run
//! use sqlx::sqlite::SqlitePoolOptions;
//! use sqlx_sqlite_busy::{BusyConfig, BusyController, install_busy_handler};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BusyConfig {
//!    timeout: Some(5000),
//!    ..Default::default()
//! };
//!
//! // Conflicting options fail here, before any connection exists
//! let policy = config.policy()?.expect("timeout configured");
//! let controller = Arc::new(BusyController::new(policy));
//!
//! let pool = SqlitePoolOptions::new()
//!    .after_connect(move |conn, _meta| {
//!       let controller = Arc::clone(&controller);
//!       Box::pin(async move {
//!          install_busy_handler(conn, controller)
//!             .await
//!             .map_err(|e| sqlx::Error::Configuration(e.into()))
//!       })
//!    })
//!    .connect("sqlite://app.db")
//!    .await?;
//! # Ok(())
//! # }
//! ```
mod clock;
mod config;
mod controller;
mod error;
pub mod hooks;
mod policy;
mod retry;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::BusyConfig;
pub use controller::{BusyController, BusyDecision, ContentionPhase, RetryState};
pub use error::Error;
pub use hooks::install_busy_handler;
pub use policy::{
   DEFAULT_COUNT_RETRY_INTERVAL, DEFAULT_POLL_STRIDE, DEFAULT_TIMEOUT_RETRY_INTERVAL, RetryMode,
   RetryPolicy,
};
pub use retry::{ContentionError, is_busy_error, retry_on_busy};

/// A type alias for Results with our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

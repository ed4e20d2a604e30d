//! # sqlx-sqlite-enhanced
//!
//! A wrapper around SQLx that enforces pragmatic SQLite connection policies
//! for concurrent server workloads.
//!
//! ## Core Types
//!
//! - **[`SqliteDatabase`]**: Main database type with separate read and write connection pools
//! - **[`SqliteDatabaseConfig`]**: Pool sizes, busy budget, pragma overrides and extensions
//! - **[`WriteGuard`]**: RAII guard ensuring exclusive write access
//! - **[`ExtensionRegistry`]**: Extensions the application allows configuration to enable
//! - **[`Error`]**: Error type for database operations
//!
//! ## Architecture
//!
//! - **Connection pooling**: Separate read-only pool and write pool with a max of 1 connection
//! - **Bounded contention**: Writers blocked by another process wait according to a
//!   [`sqlx_sqlite_busy::BusyController`] installed on every connection
//! - **Tuned pragmas**: Foreign keys, WAL, `synchronous = NORMAL` and cache sizing by default
//! - **Lazy journal mode**: The journal mode is set on the first write
//! - **Clean release**: A writer returned with an open transaction is rolled back
//!
//! ## Usage
//!
//! ```no_run
//! use sqlx_sqlite_busy::BusyConfig;
//! use sqlx_sqlite_enhanced::{SqliteDatabase, SqliteDatabaseConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> sqlx_sqlite_enhanced::Result<()> {
//!     let config = SqliteDatabaseConfig {
//!         busy: BusyConfig {
//!             timeout: Some(5000),
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     };
//!     let db = SqliteDatabase::connect("example.db", Some(config)).await?;
//!
//!     // Multiple connects to the same path return the same instance
//!     let db2 = SqliteDatabase::connect("example.db", None).await?;
//!     assert!(Arc::ptr_eq(&db, &db2));
//!
//!     let mut writer = db.acquire_writer().await?;
//!     writer.begin_immediate().await?;
//!     sqlx::query("INSERT INTO users (name) VALUES (?)")
//!         .bind("Alice")
//!         .execute(&mut *writer)
//!         .await?;
//!     writer.commit().await?;
//!     drop(writer);
//!
//!     let rows = sqlx::query("SELECT * FROM users")
//!         .fetch_all(db.read_pool()?)
//!         .await?;
//!
//!     db.close().await?;
//!     Ok(())
//! }
//! ```
mod config;
mod database;
mod error;
mod extensions;
mod pragmas;
mod registry;
mod write_guard;

// Re-export public types
pub use config::SqliteDatabaseConfig;
pub use database::SqliteDatabase;
pub use error::Error;
pub use extensions::{ExtensionRegistry, LoadableExtension, SqliteExtension};
pub use write_guard::WriteGuard;

/// A type alias for Results with our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

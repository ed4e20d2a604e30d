//! WriteGuard for exclusive write access to the database

use libsqlite3_sys::sqlite3_get_autocommit;
use sqlx::Sqlite;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteConnection;
use std::ops::{Deref, DerefMut};

use crate::Result;
use crate::error::Error;

/// RAII guard for exclusive write access to a database connection
///
/// This guard wraps a pool connection and returns it to the pool on drop.
/// Only one `WriteGuard` can exist at a time (enforced by max_connections=1),
/// ensuring serialized write access within this process. Other processes
/// writing to the same file are handled by the database's busy handler.
///
/// The guard derefs to `SqliteConnection` allowing direct use with sqlx queries.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_enhanced::SqliteDatabase;
/// use sqlx::query;
///
/// # async fn example() -> Result<(), sqlx_sqlite_enhanced::Error> {
/// let db = SqliteDatabase::connect("test.db", None).await?;
/// let mut writer = db.acquire_writer().await?;
///
/// // Take the write lock up front so contention is resolved by the busy
/// // handler instead of failing midway through the transaction
/// writer.begin_immediate().await?;
/// query("INSERT INTO users (name) VALUES (?)")
///     .bind("Alice")
///     .execute(&mut *writer)
///     .await?;
/// writer.commit().await?;
/// // Writer is automatically returned when dropped
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct WriteGuard {
   conn: PoolConnection<Sqlite>,
}

impl WriteGuard {
   /// Create a new WriteGuard by taking ownership of a pool connection
   pub(crate) fn new(conn: PoolConnection<Sqlite>) -> Self {
      Self { conn }
   }

   /// Begin a transaction that acquires the write lock immediately.
   ///
   /// A deferred transaction that later tries to write cannot wait on the
   /// busy handler and fails with `SQLITE_BUSY` at once. Acquiring the lock
   /// at `BEGIN` lets the busy handler wait for it instead.
   ///
   /// # Errors
   ///
   /// Returns a lock timeout error (see [`Error::is_lock_timeout`]) if the
   /// busy budget runs out before the lock is acquired.
   pub async fn begin_immediate(&mut self) -> Result<()> {
      sqlx::query("BEGIN IMMEDIATE")
         .execute(&mut **self)
         .await
         .map_err(Error::from_write)?;
      Ok(())
   }

   /// Commit the current transaction
   pub async fn commit(&mut self) -> Result<()> {
      sqlx::query("COMMIT")
         .execute(&mut **self)
         .await
         .map_err(Error::from_write)?;
      Ok(())
   }

   /// Rollback the current transaction
   pub async fn rollback(&mut self) -> Result<()> {
      sqlx::query("ROLLBACK").execute(&mut **self).await?;
      Ok(())
   }

   /// Returns `true` if a transaction is open on this connection
   pub async fn in_transaction(&mut self) -> Result<bool> {
      Ok(in_transaction(&mut self.conn).await?)
   }
}

/// Asks SQLite whether `conn` is outside autocommit mode
pub(crate) async fn in_transaction(conn: &mut SqliteConnection) -> sqlx::Result<bool> {
   let mut handle = conn.lock_handle().await?;
   // SAFETY: The locked handle guarantees the connection is open and not in
   // use elsewhere until it is dropped.
   let autocommit = unsafe { sqlite3_get_autocommit(handle.as_raw_handle().as_ptr()) };
   Ok(autocommit == 0)
}

impl Deref for WriteGuard {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      &self.conn
   }
}

impl DerefMut for WriteGuard {
   fn deref_mut(&mut self) -> &mut Self::Target {
      &mut self.conn
   }
}

// Drop is automatically implemented - PoolConnection returns itself to the pool,
// where a transaction left open is rolled back before the writer is reused

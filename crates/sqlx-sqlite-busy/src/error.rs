//! Error types for sqlx-sqlite-busy

use thiserror::Error;

use crate::retry::is_busy_error;

/// Errors that may occur when configuring or running a busy controller
#[derive(Error, Debug)]
pub enum Error {
   /// The retry configuration is contradictory or out of range. Raised while
   /// building a policy, never while waiting on a lock.
   #[error("Invalid busy handler configuration: {0}")]
   Configuration(String),

   /// The retry budget ran out before the write lock could be acquired.
   /// Holds the `SQLITE_BUSY` error SQLite reported to the writer.
   #[error("Timed out waiting for the database write lock: {0}")]
   LockTimeout(#[source] sqlx::Error),

   /// Any other error from sqlx, passed through unchanged
   #[error("Sqlx error: {0}")]
   Sqlx(#[source] sqlx::Error),

   /// SQLite refused the busy handler registration
   #[error("Busy handler registration failed: {0}")]
   HookRegistration(String),
}

impl Error {
   /// Returns `true` if this error means the write lock was never acquired
   pub fn is_lock_timeout(&self) -> bool {
      matches!(self, Error::LockTimeout(_))
   }
}

impl From<sqlx::Error> for Error {
   fn from(err: sqlx::Error) -> Self {
      if is_busy_error(&err) {
         Error::LockTimeout(err)
      } else {
         Error::Sqlx(err)
      }
   }
}

//! Error types for sqlx-sqlite-enhanced

use sqlx_sqlite_busy::{ContentionError, is_busy_error};
use thiserror::Error;

/// Errors that may occur when working with sqlx-sqlite-enhanced
#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library. Standard sqlx errors are converted to this variant
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// Busy handler configuration errors and write lock timeouts
   #[error(transparent)]
   Busy(#[from] sqlx_sqlite_busy::Error),

   /// Database has been closed and cannot be used
   #[error("Database has been closed")]
   DatabaseClosed,

   /// A pragma name or value that cannot be safely interpolated into SQL
   #[error("Invalid pragma '{0}': names must be identifiers and values simple literals")]
   InvalidPragma(String),
}

impl Error {
   /// Returns `true` if the write lock could not be acquired within the
   /// configured busy budget
   pub fn is_lock_timeout(&self) -> bool {
      match self {
         Error::Busy(err) => err.is_lock_timeout(),
         Error::Sqlx(err) => is_busy_error(err),
         _ => false,
      }
   }

   /// Converts an sqlx error raised while writing, reporting `SQLITE_BUSY`
   /// as a lock timeout
   pub(crate) fn from_write(err: sqlx::Error) -> Self {
      Error::Busy(sqlx_sqlite_busy::Error::from(err))
   }
}

impl ContentionError for Error {
   fn is_busy(&self) -> bool {
      self.is_lock_timeout()
   }
}

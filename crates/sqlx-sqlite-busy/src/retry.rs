//! Caller-driven retries for statements that fail with `SQLITE_BUSY`.
//!
//! SQLite does not always consult the busy handler. A transaction opened with
//! a plain `BEGIN` that later tries to write gets `SQLITE_BUSY` immediately,
//! because retrying inside the engine could deadlock. The caller has to roll
//! back and start over, and [`retry_on_busy`] paces those restarts with the
//! same policy the busy handler uses.

use std::future::Future;

use libsqlite3_sys::SQLITE_BUSY;
use tracing::debug;

use crate::clock::Clock;
use crate::controller::BusyController;


/// Returns `true` if `err` is SQLite reporting `SQLITE_BUSY` (including its
/// extended codes such as `SQLITE_BUSY_SNAPSHOT`)
pub fn is_busy_error(err: &sqlx::Error) -> bool {
   err.as_database_error()
      .and_then(|db_err| db_err.code())
      .and_then(|code| code.parse::<i32>().ok())
      .is_some_and(|code| code & 0xff == SQLITE_BUSY)
}

/// Errors that can tell whether they were caused by write-lock contention
pub trait ContentionError {
   fn is_busy(&self) -> bool;
}

impl ContentionError for sqlx::Error {
   fn is_busy(&self) -> bool {
      is_busy_error(self)
   }
}

impl ContentionError for crate::Error {
   fn is_busy(&self) -> bool {
      match self {
         crate::Error::LockTimeout(_) => true,
         crate::Error::Sqlx(err) => is_busy_error(err),
         _ => false,
      }
   }
}

/// Runs `operation` until it succeeds, fails with a non-busy error, or the
/// controller's budget runs out.
///
/// Pacing uses the tokio timer rather than the controller's clock, so the
/// calling task yields instead of blocking its worker thread. On exhaustion
/// the last busy error is returned unchanged.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_busy::{BusyController, RetryPolicy, retry_on_busy};
///
/// # async fn example(pool: sqlx::SqlitePool) -> Result<(), sqlx_sqlite_busy::Error> {
/// let controller = BusyController::new(RetryPolicy::retries(10));
///
/// retry_on_busy(&controller, || {
///    let pool = pool.clone();
///    async move {
///       let mut tx = pool.begin().await?;
///       sqlx::query("UPDATE counters SET value = value + 1")
///          .execute(&mut *tx)
///          .await?;
///       tx.commit().await
///    }
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_on_busy<C, F, Fut, T, E>(
   controller: &BusyController<C>,
   mut operation: F,
) -> Result<T, E>
where
   C: Clock,
   F: FnMut() -> Fut,
   Fut: Future<Output = Result<T, E>>,
   E: ContentionError,
{
   let mut state = controller.begin();
   let mut count: u32 = 0;

   loop {
      let err = match operation().await {
         Ok(value) => return Ok(value),
         Err(err) if err.is_busy() => err,
         Err(err) => return Err(err),
      };

      if !controller.evaluate(&mut state, count).should_retry() {
         debug!(
            attempts = state.attempt_count().saturating_add(1),
            elapsed = ?state.elapsed(),
            "Giving up on busy database"
         );
         return Err(err);
      }

      let interval = controller.policy().retry_interval();
      if !interval.is_zero() {
         tokio::time::sleep(interval).await;
      }
      count = count.saturating_add(1);
   }
}

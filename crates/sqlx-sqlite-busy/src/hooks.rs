//! Installs a [`BusyController`] as SQLite's native busy handler.
//!
//! SQLite calls the busy handler from inside `sqlite3_step` whenever a lock
//! it needs is held by another connection, passing the number of times it
//! has already called the handler for the current lock request. The handler
//! runs synchronously on the thread executing the statement, so each thread
//! keeps the [`RetryState`] of the acquisition it is currently waiting on.

use std::cell::RefCell;
use std::ffi::{CStr, c_int, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::Arc;

use libsqlite3_sys::{SQLITE_OK, sqlite3, sqlite3_busy_handler, sqlite3_set_clientdata};
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::controller::{BusyController, RetryState};

/// Client data slot holding the registered controller reference
const CONTEXT_KEY: &CStr = c"sqlx_sqlite_busy.controller";

thread_local! {
   /// Progress of the lock acquisition this thread is blocked on, tagged with
   /// the controller that owns it
   static CURRENT_WAIT: RefCell<Option<(usize, RetryState)>> = const { RefCell::new(None) };
}

/// Installs `controller` as the busy handler of an sqlx connection.
///
/// Intended for `SqlitePoolOptions::after_connect`, so every pooled
/// connection has the handler before its first write.
///
/// # Errors
///
/// Returns an error if the connection handle cannot be locked or SQLite
/// rejects the registration.
pub async fn install_busy_handler<C: Clock + 'static>(
   conn: &mut SqliteConnection,
   controller: Arc<BusyController<C>>,
) -> crate::Result<()> {
   let mut handle = conn.lock_handle().await.map_err(crate::Error::Sqlx)?;
   let db: *mut sqlite3 = handle.as_raw_handle().as_ptr();

   // SAFETY: The locked handle guarantees db is open and not in use by
   // another thread until `handle` is dropped.
   unsafe { register_busy_handler(db, controller) }
}

/// Registers `controller` as the busy handler of a raw SQLite connection.
///
/// Replaces any busy handler or `busy_timeout` previously set on `db`. The
/// connection holds one reference to `controller` until it closes, or until
/// the handler is replaced or unregistered.
///
/// # Safety
///
/// - `db` must be a valid pointer to an open sqlite3 connection
/// - Must not be called while another thread is executing a statement on `db`
///
/// # Errors
///
/// Returns an error if SQLite rejects the registration.
pub unsafe fn register_busy_handler<C: Clock + 'static>(
   db: *mut sqlite3,
   controller: Arc<BusyController<C>>,
) -> crate::Result<()> {
   debug!(policy = ?controller.policy(), "Registering SQLite busy handler");

   // Released by SQLite through the connection's client data: when the
   // connection closes, or when a later registration replaces it.
   let context_ptr = Arc::into_raw(controller) as *mut c_void;

   // SAFETY: db is a valid sqlite3 pointer (guaranteed by caller). The
   // context pointer stays valid until release_context runs, which SQLite
   // only does after the handler below has been replaced or the connection
   // has closed.
   let rc = unsafe { sqlite3_busy_handler(db, Some(busy_callback::<C>), context_ptr) };

   if rc != SQLITE_OK {
      // SAFETY: SQLite rejected the pointer, so this is still the only owner
      // of the reference created above.
      drop(unsafe { Arc::from_raw(context_ptr as *const BusyController<C>) });
      return Err(crate::Error::HookRegistration(format!(
         "sqlite3_busy_handler returned {rc}"
      )));
   }

   // SAFETY: db is valid; any context stored by an earlier registration is
   // released here, after its handler was replaced above.
   let rc = unsafe {
      sqlite3_set_clientdata(
         db,
         CONTEXT_KEY.as_ptr(),
         context_ptr,
         Some(release_context::<C>),
      )
   };

   if rc != SQLITE_OK {
      // SQLite already ran release_context on failure, so the handler must
      // not keep pointing at it
      // SAFETY: db is valid (guaranteed by caller).
      unsafe { sqlite3_busy_handler(db, None, ptr::null_mut()) };
      return Err(crate::Error::HookRegistration(format!(
         "sqlite3_set_clientdata returned {rc}"
      )));
   }

   trace!("SQLite busy handler registered");
   Ok(())
}

/// Removes any busy handler from `db`, restoring immediate `SQLITE_BUSY`
/// failures.
///
/// # Safety
///
/// - `db` must be a valid pointer to an open sqlite3 connection
/// - Must not be called while another thread is executing a statement on `db`
pub unsafe fn unregister_busy_handler(db: *mut sqlite3) {
   // SAFETY: A null callback clears the handler; db validity is guaranteed by
   // caller. Clearing the client data afterwards releases the controller.
   unsafe {
      sqlite3_busy_handler(db, None, ptr::null_mut());
      sqlite3_set_clientdata(db, CONTEXT_KEY.as_ptr(), ptr::null_mut(), None);
   }
   trace!("SQLite busy handler removed");
}

/// Drops the controller reference taken in `register_busy_handler`
unsafe extern "C" fn release_context<C: Clock + 'static>(context: *mut c_void) {
   if !context.is_null() {
      // SAFETY: context was created by Arc::into_raw in register_busy_handler
      // and SQLite calls this exactly once for it.
      drop(unsafe { Arc::from_raw(context as *const BusyController<C>) });
   }
}

/// Busy handler callback.
///
/// Returns non-zero to have SQLite retry the lock, zero to make the statement
/// fail with `SQLITE_BUSY`.
///
/// Note: `user_data` is SQLite's C API term for the callback context (the
/// controller pointer registered above).
unsafe extern "C" fn busy_callback<C: Clock + 'static>(user_data: *mut c_void, count: c_int) -> c_int {
   if user_data.is_null() {
      return 0;
   }

   // Catch any panics to prevent unwinding across the FFI boundary (which is UB).
   let result = catch_unwind(AssertUnwindSafe(|| {
      // SAFETY: user_data was created by Arc::into_raw in register_busy_handler
      // and is only released once this handler is no longer installed.
      let controller = unsafe { &*(user_data as *const BusyController<C>) };
      let owner = user_data as usize;
      // SQLite's counter is a signed int; treat a wrapped value as exhausted
      let count = u32::try_from(count).unwrap_or(u32::MAX);

      CURRENT_WAIT.with(|cell| {
         let mut wait = cell.borrow_mut();
         if !matches!(wait.as_ref(), Some((current_owner, _)) if *current_owner == owner) {
            *wait = Some((owner, controller.begin()));
         }
         let Some((_, state)) = wait.as_mut() else {
            return false;
         };

         let retry = controller.on_busy(state, count);
         if !retry {
            trace!(
               attempts = state.attempt_count().saturating_add(1),
               elapsed = ?state.elapsed(),
               "Busy handler giving up"
            );
         }
         retry
      })
   }));

   match result {
      Ok(true) => 1,
      Ok(false) => 0,
      Err(_) => {
         // Cannot rely on tracing here since it may have been the source of the panic.
         eprintln!("sqlx-sqlite-busy: panic in busy_callback (absorbed, giving up)");
         0
      }
   }
}

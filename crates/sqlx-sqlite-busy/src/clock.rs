//! Time sources for measuring how long a writer has been blocked

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic time source that also knows how to pause the caller.
///
/// The controller reads the clock to measure elapsed time and calls
/// [`sleep`](Clock::sleep) to pace attempts, so a test clock can make both
/// deterministic.
pub trait Clock: Send + Sync {
   /// Current instant. Must never go backwards.
   fn now(&self) -> Instant;

   /// Block the calling thread for `duration`
   fn sleep(&self, duration: Duration) {
      std::thread::sleep(duration);
   }
}

/// The real clock, backed by [`Instant`]. Unaffected by wall-clock changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
   fn now(&self) -> Instant {
      Instant::now()
   }
}

/// A clock that only moves when told to.
///
/// `sleep` advances the clock instead of blocking, so a controller driven by
/// a `ManualClock` runs instantly while still "spending" its retry interval.
/// Time can only move forward: [`set_elapsed`](Self::set_elapsed) with an
/// earlier value is ignored.
#[derive(Debug)]
pub struct ManualClock {
   origin: Instant,
   elapsed_nanos: AtomicU64,
}

impl ManualClock {
   pub fn new() -> Self {
      Self {
         origin: Instant::now(),
         elapsed_nanos: AtomicU64::new(0),
      }
   }

   /// Move the clock forward by `duration`
   pub fn advance(&self, duration: Duration) {
      let nanos = saturating_nanos(duration);
      let _ = self
         .elapsed_nanos
         .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some(current.saturating_add(nanos))
         });
   }

   /// Move the clock to `elapsed` past its origin, if that is later than now
   pub fn set_elapsed(&self, elapsed: Duration) {
      self
         .elapsed_nanos
         .fetch_max(saturating_nanos(elapsed), Ordering::SeqCst);
   }

   /// Time this clock has advanced since it was created
   pub fn elapsed(&self) -> Duration {
      Duration::from_nanos(self.elapsed_nanos.load(Ordering::SeqCst))
   }
}

impl Default for ManualClock {
   fn default() -> Self {
      Self::new()
   }
}

impl Clock for ManualClock {
   fn now(&self) -> Instant {
      self.origin + self.elapsed()
   }

   fn sleep(&self, duration: Duration) {
      self.advance(duration);
   }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
   fn now(&self) -> Instant {
      (**self).now()
   }

   fn sleep(&self, duration: Duration) {
      (**self).sleep(duration);
   }
}

fn saturating_nanos(duration: Duration) -> u64 {
   u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

//! The wait-or-give-up decision made each time SQLite reports the database busy

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, MonotonicClock};
use crate::policy::{RetryMode, RetryPolicy};

/// What a blocked writer should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyDecision {
   /// Wait and try to take the lock again
   Retry,
   /// Stop waiting; SQLite reports `SQLITE_BUSY` to the writer
   GiveUp,
}

impl BusyDecision {
   pub fn should_retry(self) -> bool {
      matches!(self, BusyDecision::Retry)
   }
}

/// Where a single lock acquisition stands, as seen by the controller.
///
/// Lock acquisition itself is observed only by SQLite, which stops calling
/// the controller once it succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentionPhase {
   /// No rejection seen yet
   Idle,
   /// Rejected `attempt + 1` times so far and still willing to wait
   Waiting { attempt: u64 },
   /// Budget exhausted or cancelled
   GaveUp,
}

/// Per-acquisition bookkeeping.
///
/// Create one with [`BusyController::begin`] for each lock acquisition and
/// drop it once the lock is taken or abandoned. A rejection count of zero
/// passed to the controller also starts a new acquisition.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
   attempt_count: u64,
   started_at: Option<Instant>,
   elapsed: Duration,
   gave_up: bool,
}

impl RetryState {
   /// Zero-based index of the most recent rejection
   pub fn attempt_count(&self) -> u64 {
      self.attempt_count
   }

   /// When the first rejection of this acquisition was seen
   pub fn started_at(&self) -> Option<Instant> {
      self.started_at
   }

   /// Time spent waiting as of the last clock read
   pub fn elapsed(&self) -> Duration {
      self.elapsed
   }

   pub fn phase(&self) -> ContentionPhase {
      match (self.started_at, self.gave_up) {
         (None, _) => ContentionPhase::Idle,
         (Some(_), true) => ContentionPhase::GaveUp,
         (Some(_), false) => ContentionPhase::Waiting {
            attempt: self.attempt_count,
         },
      }
   }

   fn restart(&mut self, now: Instant) {
      *self = Self {
         attempt_count: 0,
         started_at: Some(now),
         elapsed: Duration::ZERO,
         gave_up: false,
      };
   }
}

/// Decides whether a writer blocked on SQLite's write lock keeps waiting.
///
/// The controller holds only immutable configuration, so one instance can be
/// shared by every connection to a database. Mutable progress lives in a
/// [`RetryState`] owned by whoever is waiting.
///
/// # Example
///
/// ```
/// use sqlx_sqlite_busy::{BusyController, RetryPolicy};
/// use std::time::Duration;
///
/// let controller = BusyController::new(
///    RetryPolicy::retries(2).with_retry_interval(Duration::ZERO),
/// );
/// let mut state = controller.begin();
///
/// assert!(controller.on_busy(&mut state, 0));
/// assert!(controller.on_busy(&mut state, 1));
/// assert!(controller.on_busy(&mut state, 2));
/// assert!(!controller.on_busy(&mut state, 3));
/// ```
#[derive(Debug)]
pub struct BusyController<C: Clock = MonotonicClock> {
   policy: RetryPolicy,
   clock: C,
   cancel: Option<CancellationToken>,
}

impl BusyController<MonotonicClock> {
   pub fn new(policy: RetryPolicy) -> Self {
      Self::with_clock(policy, MonotonicClock)
   }
}

impl<C: Clock> BusyController<C> {
   pub fn with_clock(policy: RetryPolicy, clock: C) -> Self {
      Self {
         policy,
         clock,
         cancel: None,
      }
   }

   /// Gives up on the next rejection after `token` is cancelled, regardless
   /// of the remaining budget
   pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
      self.cancel = Some(token);
      self
   }

   pub fn policy(&self) -> &RetryPolicy {
      &self.policy
   }

   pub fn clock(&self) -> &C {
      &self.clock
   }

   /// Fresh state for a new lock acquisition
   pub fn begin(&self) -> RetryState {
      RetryState::default()
   }

   /// Busy handler contract: called with the zero-based number of times the
   /// current acquisition has been rejected. Returns `true` to wait and retry,
   /// `false` to give up.
   ///
   /// Sleeps for the policy's retry interval before returning `true`.
   pub fn on_busy(&self, state: &mut RetryState, count: u32) -> bool {
      let decision = self.evaluate(state, count);
      if decision.should_retry() {
         let interval = self.policy.retry_interval();
         if !interval.is_zero() {
            self.clock.sleep(interval);
         }
      }
      decision.should_retry()
   }

   /// Same decision as [`on_busy`](Self::on_busy) without pacing, for callers
   /// that sleep on their own (e.g. on an async timer)
   pub fn evaluate(&self, state: &mut RetryState, count: u32) -> BusyDecision {
      if count == 0 || state.started_at.is_none() {
         state.restart(self.clock.now());
      } else {
         state.attempt_count = state.attempt_count.saturating_add(1);
      }

      if state.gave_up {
         return BusyDecision::GiveUp;
      }

      let stride = u64::from(self.policy.poll_stride());
      // A saturated counter re-reads the clock every time so it can still time out
      let poll_due = state.attempt_count % stride == 0 || state.attempt_count == u64::MAX;
      if poll_due && let Some(started_at) = state.started_at {
         state.elapsed = self.clock.now().saturating_duration_since(started_at);
      }

      let exhausted = match self.policy.mode() {
         RetryMode::CountBased { max_retries } => count > max_retries,
         RetryMode::TimeoutBased { timeout } => poll_due && state.elapsed > timeout,
      };

      let cancelled = self
         .cancel
         .as_ref()
         .is_some_and(CancellationToken::is_cancelled);

      if exhausted || cancelled {
         state.gave_up = true;
         BusyDecision::GiveUp
      } else {
         BusyDecision::Retry
      }
   }
}

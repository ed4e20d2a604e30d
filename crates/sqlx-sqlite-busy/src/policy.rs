//! Immutable retry policies for SQLite write-lock contention

use std::time::Duration;

use crate::Result;
use crate::error::Error;

/// Default pause between attempts when waiting against a time budget
pub const DEFAULT_TIMEOUT_RETRY_INTERVAL: Duration = Duration::from_micros(60);

/// Default pause between attempts when waiting against an attempt budget
pub const DEFAULT_COUNT_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Default number of attempts between clock reads
pub const DEFAULT_POLL_STRIDE: u32 = 100;

/// How long a blocked writer is allowed to keep trying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
   /// Give up once the wall-clock budget is spent
   TimeoutBased { timeout: Duration },

   /// Give up once more than `max_retries` attempts have been rejected
   CountBased { max_retries: u32 },
}

/// Immutable configuration for a busy controller.
///
/// A policy always carries exactly one budget. Both constructors pick a
/// default `retry_interval` suited to their mode; override it with
/// [`with_retry_interval`](Self::with_retry_interval). A zero interval turns
/// pacing off and leaves it to SQLite.
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_busy::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::timeout(Duration::from_secs(5))
///    .with_retry_interval(Duration::from_micros(100))
///    .with_poll_stride(50)
///    .unwrap();
///
/// assert_eq!(policy.timeout_budget(), Some(Duration::from_secs(5)));
/// assert_eq!(policy.poll_stride(), 50);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
   mode: RetryMode,
   retry_interval: Duration,
   poll_stride: u32,
}

impl RetryPolicy {
   /// Wait for at most `timeout` before surfacing a lock timeout
   pub fn timeout(timeout: Duration) -> Self {
      Self {
         mode: RetryMode::TimeoutBased { timeout },
         retry_interval: DEFAULT_TIMEOUT_RETRY_INTERVAL,
         poll_stride: DEFAULT_POLL_STRIDE,
      }
   }

   /// Retry at most `max_retries` times before surfacing a lock timeout
   pub fn retries(max_retries: u32) -> Self {
      Self {
         mode: RetryMode::CountBased { max_retries },
         retry_interval: DEFAULT_COUNT_RETRY_INTERVAL,
         poll_stride: DEFAULT_POLL_STRIDE,
      }
   }

   pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
      self.retry_interval = retry_interval;
      self
   }

   /// Sets how many attempts pass between clock reads.
   ///
   /// # Errors
   ///
   /// Returns [`Error::Configuration`] if `poll_stride` is zero.
   pub fn with_poll_stride(mut self, poll_stride: u32) -> Result<Self> {
      if poll_stride == 0 {
         return Err(Error::Configuration(
            "poll_stride must be greater than zero".to_string(),
         ));
      }
      self.poll_stride = poll_stride;
      Ok(self)
   }

   pub fn mode(&self) -> RetryMode {
      self.mode
   }

   pub fn retry_interval(&self) -> Duration {
      self.retry_interval
   }

   pub fn poll_stride(&self) -> u32 {
      self.poll_stride
   }

   /// The time budget, if this is a timeout-based policy
   pub fn timeout_budget(&self) -> Option<Duration> {
      match self.mode {
         RetryMode::TimeoutBased { timeout } => Some(timeout),
         RetryMode::CountBased { .. } => None,
      }
   }

   /// The attempt budget, if this is a count-based policy
   pub fn max_retries(&self) -> Option<u32> {
      match self.mode {
         RetryMode::CountBased { max_retries } => Some(max_retries),
         RetryMode::TimeoutBased { .. } => None,
      }
   }

   /// Upper bound on how long a writer can wait before giving up.
   ///
   /// Timeout mode only checks the clock every `poll_stride` attempts, so a
   /// writer may overshoot the budget by up to one stride of pacing. Count
   /// mode is bounded by the pacing of every allowed retry.
   pub fn max_wait(&self) -> Duration {
      match self.mode {
         RetryMode::TimeoutBased { timeout } => {
            timeout.saturating_add(self.retry_interval.saturating_mul(self.poll_stride))
         }
         RetryMode::CountBased { max_retries } => self
            .retry_interval
            .saturating_mul(max_retries.saturating_add(1)),
      }
   }
}

//! Deserializable busy handler options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;
use crate::policy::RetryPolicy;

/// User-facing busy handler options, as they appear in a config file.
///
/// `timeout` and `retries` are mutually exclusive. Leaving both unset means
/// no busy controller is installed and SQLite keeps its own default behavior.
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_busy::BusyConfig;
///
/// // Wait up to 5 seconds for the write lock
/// let config = BusyConfig {
///    timeout: Some(5000),
///    ..Default::default()
/// };
/// assert!(config.policy().unwrap().is_some());
///
/// // Nothing configured: leave SQLite's default alone
/// assert!(BusyConfig::default().policy().unwrap().is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusyConfig {
   /// Time budget in milliseconds
   pub timeout: Option<u64>,

   /// Attempt budget
   pub retries: Option<u32>,

   /// Pause between attempts in microseconds
   ///
   /// Default: 60 with `timeout`, 1000 with `retries`
   pub retry_interval_micros: Option<u64>,

   /// Attempts between clock reads
   ///
   /// Default: 100
   pub poll_stride: Option<u32>,
}

impl BusyConfig {
   /// Validates these options and builds the policy they describe.
   ///
   /// Returns `Ok(None)` when neither `timeout` nor `retries` is set.
   ///
   /// # Errors
   ///
   /// Returns [`Error::Configuration`] if both budgets are set, or if
   /// `poll_stride` is zero.
   pub fn policy(&self) -> Result<Option<RetryPolicy>> {
      let policy = match (self.timeout, self.retries) {
         (Some(_), Some(_)) => {
            return Err(Error::Configuration(
               "`timeout` and `retries` cannot both be set".to_string(),
            ));
         }
         (Some(timeout_ms), None) => RetryPolicy::timeout(Duration::from_millis(timeout_ms)),
         (None, Some(retries)) => RetryPolicy::retries(retries),
         (None, None) => return Ok(None),
      };

      let policy = match self.retry_interval_micros {
         Some(micros) => policy.with_retry_interval(Duration::from_micros(micros)),
         None => policy,
      };

      let policy = match self.poll_stride {
         Some(stride) => policy.with_poll_stride(stride)?,
         None => policy,
      };

      Ok(Some(policy))
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::policy::RetryMode;

   #[test]
   fn test_both_budgets_rejected() {
      let config = BusyConfig {
         timeout: Some(1000),
         retries: Some(3),
         ..Default::default()
      };

      let err = config.policy().unwrap_err();
      assert!(matches!(err, Error::Configuration(_)));
      assert!(err.to_string().contains("cannot both be set"));
   }

   #[test]
   fn test_both_budgets_rejected_every_time() {
      let config = BusyConfig {
         timeout: Some(1),
         retries: Some(0),
         ..Default::default()
      };

      for _ in 0..3 {
         assert!(config.policy().is_err());
      }
   }

   #[test]
   fn test_overrides_applied() {
      let config = BusyConfig {
         timeout: Some(250),
         retry_interval_micros: Some(500),
         poll_stride: Some(10),
         ..Default::default()
      };

      let policy = config.policy().unwrap().unwrap();
      assert_eq!(
         policy.mode(),
         RetryMode::TimeoutBased {
            timeout: Duration::from_millis(250)
         }
      );
      assert_eq!(policy.retry_interval(), Duration::from_micros(500));
      assert_eq!(policy.poll_stride(), 10);
   }

   #[test]
   fn test_zero_stride_rejected() {
      let config = BusyConfig {
         retries: Some(5),
         poll_stride: Some(0),
         ..Default::default()
      };
      assert!(matches!(config.policy(), Err(Error::Configuration(_))));
   }

   #[test]
   fn test_deserialize_from_json() {
      let config: BusyConfig = serde_json::from_str(r#"{ "retries": 7 }"#).unwrap();
      let policy = config.policy().unwrap().unwrap();
      assert_eq!(policy.max_retries(), Some(7));
      assert_eq!(policy.poll_stride(), 100);
   }
}

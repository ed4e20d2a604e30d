//! Configuration for SQLite database connection pools

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sqlx_sqlite_busy::BusyConfig;

/// Configuration for SqliteDatabase connection pools
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_enhanced::SqliteDatabaseConfig;
/// use sqlx_sqlite_busy::BusyConfig;
///
/// // Use defaults
/// let config = SqliteDatabaseConfig::default();
///
/// // Wait up to 5 seconds for the write lock
/// let config = SqliteDatabaseConfig {
///     busy: BusyConfig {
///         timeout: Some(5000),
///         ..Default::default()
///     },
///     ..Default::default()
/// };
///
/// // Override one pragma default
/// let mut config = SqliteDatabaseConfig::default();
/// config.pragmas.insert("cache_size".into(), "4000".into());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteDatabaseConfig {
   /// Maximum number of concurrent read connections
   ///
   /// This controls the size of the read-only connection pool.
   /// Higher values allow more concurrent read queries but consume more resources.
   ///
   /// Default: 6
   pub max_read_connections: u32,

   /// Idle timeout for both read and write connections (in seconds)
   ///
   /// Connections that remain idle for this duration will be closed automatically.
   /// This helps prevent resource exhaustion from idle threads.
   ///
   /// Default: 30
   pub idle_timeout_secs: u64,

   /// How writers wait when another connection holds the write lock
   ///
   /// When neither `timeout` nor `retries` is set, SQLite's own busy timeout
   /// (as configured by sqlx) is left in place.
   pub busy: BusyConfig,

   /// Pragmas applied to every connection, overriding the defaults by name
   ///
   /// Default: empty
   pub pragmas: IndexMap<String, String>,

   /// Names of extensions to load, resolved against the
   /// [`ExtensionRegistry`](crate::ExtensionRegistry) passed at connect time
   ///
   /// Default: empty
   pub extensions: Vec<String>,
}

impl Default for SqliteDatabaseConfig {
   fn default() -> Self {
      Self {
         max_read_connections: 6,
         idle_timeout_secs: 30,
         busy: BusyConfig::default(),
         pragmas: IndexMap::new(),
         extensions: Vec::new(),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_deserialize_partial_config() {
      let config: SqliteDatabaseConfig = serde_json::from_str(
         r#"{
            "busy": { "timeout": 2000, "poll_stride": 50 },
            "pragmas": { "cache_size": "4000" },
            "extensions": ["vector"]
         }"#,
      )
      .unwrap();

      assert_eq!(config.max_read_connections, 6);
      assert_eq!(config.idle_timeout_secs, 30);
      assert_eq!(config.busy.timeout, Some(2000));
      assert_eq!(config.busy.poll_stride, Some(50));
      assert_eq!(config.pragmas.get("cache_size").map(String::as_str), Some("4000"));
      assert_eq!(config.extensions, vec!["vector".to_string()]);
   }
}

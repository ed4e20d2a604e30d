use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use sqlx_sqlite_busy::{BusyConfig, retry_on_busy};
use sqlx_sqlite_enhanced::{
   Error, ExtensionRegistry, LoadableExtension, SqliteDatabase, SqliteDatabaseConfig,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn busy_config(busy: BusyConfig) -> Option<SqliteDatabaseConfig> {
   Some(SqliteDatabaseConfig {
      busy,
      ..Default::default()
   })
}

/// Opens `path` outside the database's pools, as another process would
async fn foreign_connection(path: &Path) -> SqliteConnection {
   SqliteConnectOptions::new()
      .filename(path)
      .busy_timeout(Duration::ZERO)
      .connect()
      .await
      .unwrap()
}

/// Connects, switches the file to WAL and creates an `items` table
async fn setup(path: &Path, config: Option<SqliteDatabaseConfig>) -> Arc<SqliteDatabase> {
   let db = SqliteDatabase::connect(path, config).await.unwrap();
   let mut writer = db.acquire_writer().await.unwrap();
   sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)")
      .execute(&mut *writer)
      .await
      .unwrap();
   drop(writer);
   db
}

async fn hold_write_lock(path: &Path) -> SqliteConnection {
   let mut holder = foreign_connection(path).await;
   sqlx::query("BEGIN IMMEDIATE")
      .execute(&mut holder)
      .await
      .unwrap();
   holder
}

async fn count_items(db: &SqliteDatabase) -> i64 {
   let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
      .fetch_one(db.read_pool().unwrap())
      .await
      .unwrap();
   count
}

#[tokio::test]
async fn test_database_closed_error() {
   let dir = TempDir::new().unwrap();
   let db = SqliteDatabase::connect(dir.path().join("closed.db"), None)
      .await
      .expect("Failed to connect to test database");

   // Clone db so we can use it after close
   let db_ref = Arc::clone(&db);
   db.close().await.unwrap();

   let read_result = db_ref.read_pool();
   assert!(matches!(read_result.unwrap_err(), Error::DatabaseClosed));

   let writer_result = db_ref.acquire_writer().await;
   assert!(matches!(writer_result.unwrap_err(), Error::DatabaseClosed));
}

#[tokio::test]
async fn test_memory_databases_never_cached() {
   let db1 = SqliteDatabase::connect(":memory:", None).await.unwrap();
   let db2 = SqliteDatabase::connect(":memory:", None).await.unwrap();

   assert!(
      !Arc::ptr_eq(&db1, &db2),
      ":memory: databases should not be cached, each connect should create new instance"
   );

   let mut writer1 = db1.acquire_writer().await.unwrap();
   sqlx::query("CREATE TABLE test (id INTEGER)")
      .execute(&mut *writer1)
      .await
      .unwrap();
   drop(writer1);

   // Second database should NOT have the table (independent instances)
   let result = sqlx::query("SELECT * FROM test")
      .fetch_optional(db2.read_pool().unwrap())
      .await;

   assert!(
      result.is_err(),
      "Second :memory: database should not have table from first"
   );
}

#[tokio::test]
async fn test_db_instance_caching() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("caching.db");

   let db1 = SqliteDatabase::connect(&path, None).await.unwrap();
   let db2 = SqliteDatabase::connect(&path, None).await.unwrap();

   assert!(
      Arc::ptr_eq(&db1, &db2),
      "Same path should return cached instance"
   );

   drop(db1);
   db2.close().await.unwrap();

   // Closing uncaches, so the next connect opens a fresh instance
   let db3 = SqliteDatabase::connect(&path, None).await.unwrap();
   assert!(db3.read_pool().is_ok());
   db3.close().await.unwrap();
}

#[tokio::test]
async fn test_default_pragmas_applied() {
   let dir = TempDir::new().unwrap();
   let db = SqliteDatabase::connect(dir.path().join("pragmas.db"), None)
      .await
      .unwrap();

   let mut writer = db.acquire_writer().await.unwrap();

   let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
      .fetch_one(&mut *writer)
      .await
      .unwrap();
   assert_eq!(mode.to_lowercase(), "wal");

   let (sync,): (i32,) = sqlx::query_as("PRAGMA synchronous")
      .fetch_one(&mut *writer)
      .await
      .unwrap();
   assert_eq!(sync, 1, "synchronous should be NORMAL");

   let (foreign_keys,): (i32,) = sqlx::query_as("PRAGMA foreign_keys")
      .fetch_one(&mut *writer)
      .await
      .unwrap();
   assert_eq!(foreign_keys, 1);
   drop(writer);

   // Readers are prepared the same way
   let (foreign_keys,): (i32,) = sqlx::query_as("PRAGMA foreign_keys")
      .fetch_one(db.read_pool().unwrap())
      .await
      .unwrap();
   assert_eq!(foreign_keys, 1);

   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_pragma_override() {
   let dir = TempDir::new().unwrap();
   let mut config = SqliteDatabaseConfig::default();
   config.pragmas.insert("cache_size".into(), "-4000".into());

   let db = SqliteDatabase::connect(dir.path().join("override.db"), Some(config))
      .await
      .unwrap();

   let (cache_size,): (i64,) = sqlx::query_as("PRAGMA cache_size")
      .fetch_one(db.read_pool().unwrap())
      .await
      .unwrap();
   assert_eq!(cache_size, -4000);

   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_file_pragma_override_applied_by_writer() {
   let dir = TempDir::new().unwrap();
   let mut config = SqliteDatabaseConfig::default();
   config.pragmas.insert("user_version".into(), "7".into());
   config.pragmas.insert("encoding".into(), "'UTF-8'".into());

   // Readers open read-only and must not try to write the file header
   let db = tokio::time::timeout(
      Duration::from_secs(5),
      SqliteDatabase::connect(dir.path().join("user_version.db"), Some(config)),
   )
   .await
   .expect("connect should not wait on the pool")
   .unwrap();

   let (one,): (i64,) = sqlx::query_as("SELECT 1")
      .fetch_one(db.read_pool().unwrap())
      .await
      .unwrap();
   assert_eq!(one, 1);

   drop(db.acquire_writer().await.unwrap());

   let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
      .fetch_one(db.read_pool().unwrap())
      .await
      .unwrap();
   assert_eq!(version, 7);

   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_rejected_before_file_is_created() {
   let dir = TempDir::new().unwrap();

   let path = dir.path().join("conflicting.db");
   let result = SqliteDatabase::connect(
      &path,
      busy_config(BusyConfig {
         timeout: Some(1000),
         retries: Some(10),
         ..Default::default()
      }),
   )
   .await;
   assert!(matches!(
      result.unwrap_err(),
      Error::Busy(sqlx_sqlite_busy::Error::Configuration(_))
   ));
   assert!(!path.exists(), "No file should be created for a rejected config");

   let path = dir.path().join("bad_pragma.db");
   let mut config = SqliteDatabaseConfig::default();
   config
      .pragmas
      .insert("user_version".into(), "1; DROP TABLE items".into());
   let result = SqliteDatabase::connect(&path, Some(config)).await;
   assert!(matches!(result.unwrap_err(), Error::InvalidPragma(_)));
   assert!(!path.exists());
}

#[tokio::test]
async fn test_wal_checkpoint_on_close() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("checkpoint.db");
   let db = setup(&path, None).await;

   let mut writer = db.acquire_writer().await.unwrap();
   sqlx::query("INSERT INTO items (name) VALUES ('a')")
      .execute(&mut *writer)
      .await
      .unwrap();
   drop(writer);

   let wal_path = dir.path().join("checkpoint.db-wal");
   assert!(wal_path.exists(), "WAL file should exist after write");

   db.close().await.unwrap();

   if wal_path.exists() {
      let wal_size = std::fs::metadata(&wal_path).unwrap().len();
      assert_eq!(wal_size, 0, "WAL file should be 0 bytes after checkpoint");
   }
}

#[tokio::test]
async fn test_remove() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("remove.db");
   let db = setup(&path, None).await;

   assert!(path.exists(), "Database file should exist");

   db.remove().await.unwrap();

   assert!(!path.exists(), "Database file should be removed");
   assert!(!dir.path().join("remove.db-wal").exists());
   assert!(!dir.path().join("remove.db-shm").exists());
}

#[tokio::test]
async fn test_write_serialization() {
   let dir = TempDir::new().unwrap();
   let db = setup(&dir.path().join("serial.db"), None).await;

   let start = Instant::now();
   let handles: Vec<_> = (0..3)
      .map(|_| {
         let db = Arc::clone(&db);
         tokio::spawn(async move {
            let mut writer = db.acquire_writer().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            sqlx::query("INSERT INTO items (name) VALUES ('serial')")
               .execute(&mut *writer)
               .await
               .unwrap();
         })
      })
      .collect();

   for handle in handles {
      handle.await.unwrap();
   }

   assert_eq!(count_items(&db).await, 3);
   assert!(
      start.elapsed() >= Duration::from_millis(25),
      "Serialized writes took {:?} (would be ~10ms if concurrent)",
      start.elapsed()
   );

   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_begin_immediate_and_commit() {
   let dir = TempDir::new().unwrap();
   let db = setup(&dir.path().join("commit.db"), None).await;

   let mut writer = db.acquire_writer().await.unwrap();
   writer.begin_immediate().await.unwrap();
   assert!(writer.in_transaction().await.unwrap());

   sqlx::query("INSERT INTO items (name) VALUES ('committed')")
      .execute(&mut *writer)
      .await
      .unwrap();
   writer.commit().await.unwrap();
   assert!(!writer.in_transaction().await.unwrap());
   drop(writer);

   assert_eq!(count_items(&db).await, 1);
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_open_transaction_rolled_back_on_release() {
   let dir = TempDir::new().unwrap();
   let db = setup(&dir.path().join("release.db"), None).await;

   let mut writer = db.acquire_writer().await.unwrap();
   writer.begin_immediate().await.unwrap();
   sqlx::query("INSERT INTO items (name) VALUES ('abandoned')")
      .execute(&mut *writer)
      .await
      .unwrap();
   drop(writer);

   let mut writer = db.acquire_writer().await.unwrap();
   assert!(
      !writer.in_transaction().await.unwrap(),
      "Next writer must not inherit the abandoned transaction"
   );
   drop(writer);

   assert_eq!(count_items(&db).await, 0);
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_retry_budget_exhausted_is_lock_timeout() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("exhausted.db");
   let db = setup(
      &path,
      busy_config(BusyConfig {
         retries: Some(3),
         ..Default::default()
      }),
   )
   .await;

   let mut holder = hold_write_lock(&path).await;

   let mut writer = db.acquire_writer().await.unwrap();
   let err = writer.begin_immediate().await.unwrap_err();
   assert!(err.is_lock_timeout(), "expected lock timeout, got {err}");
   drop(writer);

   sqlx::query("ROLLBACK").execute(&mut holder).await.unwrap();

   let mut writer = db.acquire_writer().await.unwrap();
   writer.begin_immediate().await.unwrap();
   writer.commit().await.unwrap();
   drop(writer);

   holder.close().await.unwrap();
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_timeout_waits_for_lock_release() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("waits.db");
   let db = setup(
      &path,
      busy_config(BusyConfig {
         timeout: Some(5000),
         ..Default::default()
      }),
   )
   .await;

   let mut holder = hold_write_lock(&path).await;
   let release = tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      sqlx::query("COMMIT").execute(&mut holder).await.unwrap();
      holder
   });

   let start = Instant::now();
   let mut writer = db.acquire_writer().await.unwrap();
   writer.begin_immediate().await.unwrap();
   sqlx::query("INSERT INTO items (name) VALUES ('waited')")
      .execute(&mut *writer)
      .await
      .unwrap();
   writer.commit().await.unwrap();
   drop(writer);

   assert!(start.elapsed() >= Duration::from_millis(90));
   assert!(start.elapsed() < Duration::from_secs(5));

   release.await.unwrap().close().await.unwrap();
   assert_eq!(count_items(&db).await, 1);
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_retry_on_busy_with_database_controller() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("retry.db");
   let db = setup(
      &path,
      busy_config(BusyConfig {
         retries: Some(2),
         ..Default::default()
      }),
   )
   .await;
   let controller = db.busy_controller().expect("retries configured");

   let mut holder = hold_write_lock(&path).await;
   let calls = AtomicU32::new(0);

   let result = {
      let (db, calls) = (&db, &calls);
      retry_on_busy(controller, move || async move {
         calls.fetch_add(1, Ordering::SeqCst);
         let mut writer = db.acquire_writer().await?;
         writer.begin_immediate().await?;
         writer.commit().await
      })
      .await
   };

   assert!(result.unwrap_err().is_lock_timeout());
   // Restarts continue while the retry count is within the limit of 2
   assert_eq!(calls.load(Ordering::SeqCst), 4);

   sqlx::query("ROLLBACK").execute(&mut holder).await.unwrap();
   holder.close().await.unwrap();
   db.remove().await.unwrap();
}

#[tokio::test]
async fn test_close_cancels_busy_wait() {
   let dir = TempDir::new().unwrap();
   let path = dir.path().join("cancel.db");
   let db = setup(
      &path,
      busy_config(BusyConfig {
         timeout: Some(60_000),
         ..Default::default()
      }),
   )
   .await;

   let mut holder = hold_write_lock(&path).await;

   let writer_db = Arc::clone(&db);
   let blocked = tokio::spawn(async move {
      let mut writer = writer_db.acquire_writer().await.unwrap();
      let start = Instant::now();
      let result = writer.begin_immediate().await;
      (result, start.elapsed())
   });

   tokio::time::sleep(Duration::from_millis(50)).await;
   let closer = tokio::spawn(Arc::clone(&db).close());

   let (result, waited) = blocked.await.unwrap();
   assert!(result.unwrap_err().is_lock_timeout());
   assert!(waited < Duration::from_secs(10), "waited {waited:?}");

   closer.await.unwrap().unwrap();
   sqlx::query("ROLLBACK").execute(&mut holder).await.unwrap();
   holder.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_extension_skipped() {
   let dir = TempDir::new().unwrap();
   let config = SqliteDatabaseConfig {
      extensions: vec!["not_registered".into()],
      ..Default::default()
   };
   let registry = ExtensionRegistry::new().with(LoadableExtension::new("vector", "./missing/vec0"));

   let db = SqliteDatabase::connect_with_extensions(
      dir.path().join("extensions.db"),
      Some(config),
      &registry,
   )
   .await
   .unwrap();

   let (one,): (i64,) = sqlx::query_as("SELECT 1")
      .fetch_one(db.read_pool().unwrap())
      .await
      .unwrap();
   assert_eq!(one, 1);

   db.remove().await.unwrap();
}

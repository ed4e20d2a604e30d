//! SQLite database with connection pooling and contention-aware write access

use crate::Result;
use crate::config::SqliteDatabaseConfig;
use crate::error::Error;
use crate::extensions::{ExtensionRegistry, SqliteExtension};
use crate::pragmas::PragmaSet;
use crate::registry::{get_or_open_database, is_memory_database, uncache_database};
use crate::write_guard::{WriteGuard, in_transaction};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions};
use sqlx::{ConnectOptions, Pool, Sqlite};
use sqlx_sqlite_busy::{BusyController, install_busy_handler};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// SQLite database with connection pooling for concurrent reads and exclusive writes.
///
/// Every pooled connection is prepared the same way when it opens: the
/// configured busy handler is installed, then the connection-scoped pragmas
/// are applied. Pragmas stored in the database file, such as the journal
/// mode, are set lazily on the first call to `acquire_writer()`.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_enhanced::SqliteDatabase;
///
/// # async fn example() -> Result<(), sqlx_sqlite_enhanced::Error> {
/// let db = SqliteDatabase::connect("test.db", None).await?;
///
/// // Use read_pool for SELECT queries (concurrent reads)
/// let rows = sqlx::query("SELECT * FROM users")
///     .fetch_all(db.read_pool()?)
///     .await?;
///
/// // Acquire the writer for INSERT/UPDATE/DELETE (exclusive)
/// let mut writer = db.acquire_writer().await?;
/// sqlx::query("INSERT INTO users (name) VALUES (?)")
///     .bind("Alice")
///     .execute(&mut *writer)
///     .await?;
/// drop(writer);
///
/// db.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SqliteDatabase {
   /// Pool of read-only connections for concurrent reads
   read_pool: Pool<Sqlite>,

   /// Single read-write connection pool (max_connections=1) for serialized writes
   write_conn: Pool<Sqlite>,

   /// Tracks if the file-level pragmas have been set (set on first write)
   persistent_applied: AtomicBool,

   /// Marks database as closed to prevent further operations
   closed: AtomicBool,

   /// Path to database file (used for cleanup and registry lookups)
   path: PathBuf,

   /// Journal mode to set on the writer, lowercased
   journal_mode: Option<String>,

   /// File-level pragmas are applied from here by the first writer
   pragmas: Arc<PragmaSet>,

   /// Shared by every connection of this database; `None` keeps sqlx's busy timeout
   busy: Option<Arc<BusyController>>,

   /// Cancelled on close so blocked writers give up instead of waiting out their budget
   shutdown: CancellationToken,
}

/// Per-connection preparation shared by both pools
#[derive(Debug, Clone)]
struct ConnectionSetup {
   busy: Option<Arc<BusyController>>,
   pragmas: Arc<PragmaSet>,
}

impl ConnectionSetup {
   async fn prepare(&self, conn: &mut SqliteConnection) -> sqlx::Result<()> {
      // Installed first so the pragmas below already run under the handler
      if let Some(controller) = &self.busy {
         install_busy_handler(conn, Arc::clone(controller))
            .await
            .map_err(|e| sqlx::Error::Configuration(e.into()))?;
      }
      self.pragmas.apply(conn).await
   }
}

impl SqliteDatabase {
   /// Connect to a SQLite database
   ///
   /// If the database is already connected, returns the existing connection.
   /// Multiple calls with the same path will return the same database instance.
   ///
   /// The database is created if it doesn't exist.
   ///
   /// # Arguments
   ///
   /// * `path` - Path to the SQLite database file (will be created if missing)
   /// * `custom_config` - Optional custom configuration. Pass `None` to use
   ///   defaults (6 max read connections, 30 second idle timeout, sqlx's busy
   ///   timeout, default pragmas, no extensions).
   ///
   /// # Errors
   ///
   /// Conflicting busy options and invalid pragmas are rejected before the
   /// database file is created or opened.
   ///
   /// # Examples
   ///
   /// ```no_run
   /// use sqlx_sqlite_enhanced::SqliteDatabase;
   ///
   /// # async fn example() -> Result<(), sqlx_sqlite_enhanced::Error> {
   /// // Connect with default configuration
   /// let db = SqliteDatabase::connect("test.db", None).await?;
   /// # Ok(())
   /// # }
   /// ```
   ///
   /// ```no_run
   /// use sqlx_sqlite_busy::BusyConfig;
   /// use sqlx_sqlite_enhanced::{SqliteDatabase, SqliteDatabaseConfig};
   ///
   /// # async fn example() -> Result<(), sqlx_sqlite_enhanced::Error> {
   /// // Give up after 50 busy callbacks instead of waiting on a timer
   /// let custom_config = SqliteDatabaseConfig {
   ///    max_read_connections: 10,
   ///    busy: BusyConfig {
   ///       retries: Some(50),
   ///       ..Default::default()
   ///    },
   ///    ..Default::default()
   /// };
   /// let db = SqliteDatabase::connect("test.db", Some(custom_config)).await?;
   /// # Ok(())
   /// # }
   /// ```
   pub async fn connect(
      path: impl AsRef<Path>,
      custom_config: Option<SqliteDatabaseConfig>,
   ) -> Result<Arc<Self>> {
      Self::connect_with_extensions(path, custom_config, &ExtensionRegistry::default()).await
   }

   /// Connect to a SQLite database, loading the configured extensions from
   /// `extensions`
   ///
   /// Names in [`SqliteDatabaseConfig::extensions`] without a matching entry
   /// in `extensions` are logged and skipped. When the database is already
   /// open, the cached instance is returned and `custom_config` is ignored.
   pub async fn connect_with_extensions(
      path: impl AsRef<Path>,
      custom_config: Option<SqliteDatabaseConfig>,
      extensions: &ExtensionRegistry,
   ) -> Result<Arc<Self>> {
      let config = custom_config.unwrap_or_default();
      let path = path.as_ref();

      // Validate path is not empty
      if path.as_os_str().is_empty() {
         return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Database path cannot be empty",
         )));
      }

      let memory = is_memory_database(path);
      let policy = config.busy.policy()?;
      let pragmas = PragmaSet::resolve(memory, &config.pragmas)?;
      let loaded = extensions.resolve(&config.extensions);

      get_or_open_database(path, open(path, config, policy, pragmas, loaded)).await
   }

   /// Get a reference to the connection pool for executing read queries
   ///
   /// Use this for concurrent read operations. Multiple readers can access
   /// the pool simultaneously.
   pub fn read_pool(&self) -> Result<&Pool<Sqlite>> {
      if self.closed.load(Ordering::SeqCst) {
         return Err(Error::DatabaseClosed);
      }
      Ok(&self.read_pool)
   }

   /// Acquire exclusive write access to the database
   ///
   /// Only one writer can exist at a time within this process. On the first
   /// call the pragmas stored in the database file are set on the write
   /// connection: the journal mode (WAL for file databases by default) and
   /// overrides such as `user_version`.
   ///
   /// # Errors
   ///
   /// Returns [`Error::DatabaseClosed`] after `close()`, and a lock timeout
   /// error if another process holds the write lock for longer than the busy
   /// budget while those pragmas are being applied.
   pub async fn acquire_writer(&self) -> Result<WriteGuard> {
      if self.closed.load(Ordering::SeqCst) {
         return Err(Error::DatabaseClosed);
      }

      // Acquire connection from pool (max=1 ensures exclusive access)
      let mut conn = self.write_conn.acquire().await?;

      if !self.persistent_applied.load(Ordering::SeqCst) {
         let actual = self
            .pragmas
            .apply_persistent(&mut conn)
            .await
            .map_err(Error::from_write)?;

         if let (Some(mode), Some(actual)) = (&self.journal_mode, actual)
            && !actual.eq_ignore_ascii_case(mode)
         {
            warn!(requested = %mode, %actual, "SQLite kept a different journal mode");
         }

         self.persistent_applied.store(true, Ordering::SeqCst);
      }

      Ok(WriteGuard::new(conn))
   }

   /// The busy controller shared by this database's connections, when a
   /// busy budget is configured
   ///
   /// Pass it to [`sqlx_sqlite_busy::retry_on_busy`] to retry deferred
   /// transactions, which fail with `SQLITE_BUSY` without consulting the
   /// busy handler.
   pub fn busy_controller(&self) -> Option<&Arc<BusyController>> {
      self.busy.as_ref()
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   /// Close the database and clean up resources
   ///
   /// Writers blocked on the busy handler give up at their next callback.
   /// All pooled connections are closed and the database is removed from
   /// the cache. After calling close, any operations on this database will
   /// return `Error::DatabaseClosed`.
   ///
   /// Takes `Arc<Self>` to consume ownership. The registry stores `Weak`
   /// references, so when the last Arc is dropped, the database is freed.
   pub async fn close(self: Arc<Self>) -> Result<()> {
      self.closed.store(true, Ordering::SeqCst);
      self.shutdown.cancel();

      if let Err(e) = uncache_database(&self.path).await {
         error!("Failed to remove database from cache: {}", e);
      }

      // This will await all readers to be returned
      self.read_pool.close().await;

      // Flush and truncate the WAL, but only if this connection switched to it
      let wal = self
         .journal_mode
         .as_deref()
         .is_some_and(|mode| mode.eq_ignore_ascii_case("wal"));

      if wal
         && self.persistent_applied.load(Ordering::SeqCst)
         && let Ok(mut conn) = self.write_conn.acquire().await
         && let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&mut *conn)
            .await
      {
         warn!("WAL checkpoint on close failed: {}", e);
      }

      self.write_conn.close().await;
      debug!(path = %self.path.display(), "Closed database");

      Ok(())
   }

   /// Close the database and delete all database files
   ///
   /// This closes all connections and then deletes the database file,
   /// WAL file, and SHM file from disk. Use with caution!
   pub async fn remove(self: Arc<Self>) -> Result<()> {
      // Clone path before closing (since close consumes self)
      let path = self.path.clone();

      self.close().await?;

      if is_memory_database(&path) {
         return Ok(());
      }

      // Remove main database file - propagate errors (file should exist)
      std::fs::remove_file(&path).map_err(Error::Io)?;

      // These may not exist if WAL was never initialized
      for suffix in ["-wal", "-shm"] {
         if let Err(e) = std::fs::remove_file(sidecar_path(&path, suffix))
            && e.kind() != std::io::ErrorKind::NotFound
         {
            return Err(Error::Io(e));
         }
      }

      Ok(())
   }
}

async fn open(
   path: &Path,
   config: SqliteDatabaseConfig,
   policy: Option<sqlx_sqlite_busy::RetryPolicy>,
   pragmas: PragmaSet,
   extensions: Vec<Arc<dyn SqliteExtension>>,
) -> Result<SqliteDatabase> {
   // The read pool is read-only and cannot create the file, so a first
   // query that only reads would fail on a missing database. Create it with
   // a temporary connection that is closed right away.
   if !path.exists() && !is_memory_database(path) {
      let conn = SqliteConnectOptions::new()
         .filename(path)
         .create_if_missing(true)
         .read_only(false)
         .connect()
         .await?;
      drop(conn);
   }

   let shutdown = CancellationToken::new();
   let busy = policy.map(|policy| {
      Arc::new(BusyController::new(policy).with_cancellation(shutdown.clone()))
   });
   let journal_mode = pragmas.journal_mode().map(str::to_ascii_lowercase);
   let pragmas = Arc::new(pragmas);
   let setup = ConnectionSetup {
      busy: busy.clone(),
      pragmas: Arc::clone(&pragmas),
   };
   let idle_timeout = Some(Duration::from_secs(config.idle_timeout_secs));

   let with_extensions = |options: SqliteConnectOptions| {
      extensions
         .iter()
         .fold(options, |options, extension| extension.configure(options))
   };

   let read_options = with_extensions(SqliteConnectOptions::new().filename(path).read_only(true));
   let read_setup = setup.clone();
   let read_pool = SqlitePoolOptions::new()
      .max_connections(config.max_read_connections)
      .min_connections(0)
      .idle_timeout(idle_timeout)
      .after_connect(move |conn, _meta| {
         let setup = read_setup.clone();
         Box::pin(async move { setup.prepare(conn).await })
      })
      .connect_with(read_options)
      .await?;

   let write_options = with_extensions(SqliteConnectOptions::new().filename(path).read_only(false));
   let write_conn = SqlitePoolOptions::new()
      .max_connections(1)
      .min_connections(0)
      .idle_timeout(idle_timeout)
      .after_connect(move |conn, _meta| {
         let setup = setup.clone();
         Box::pin(async move { setup.prepare(conn).await })
      })
      .after_release(|conn, _meta| {
         Box::pin(async move {
            // A guard dropped mid-transaction must not hand the next writer
            // an open transaction that still holds the write lock
            if in_transaction(conn).await? {
               warn!("Writer released with an open transaction; rolling back");
               sqlx::query("ROLLBACK").execute(&mut *conn).await?;
            }
            Ok::<_, sqlx::Error>(true)
         })
      })
      .connect_with(write_options)
      .await?;

   debug!(
      path = %path.display(),
      busy = ?busy.as_ref().map(|controller| controller.policy()),
      "Opened database"
   );

   Ok(SqliteDatabase {
      read_pool,
      write_conn,
      persistent_applied: AtomicBool::new(false),
      closed: AtomicBool::new(false),
      path: path.to_path_buf(),
      journal_mode,
      pragmas,
      busy,
      shutdown,
   })
}

/// `app.db` -> `app.db-wal`, matching how SQLite names its sidecar files
fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
   let mut name = OsString::from(path.as_os_str());
   name.push(suffix);
   PathBuf::from(name)
}

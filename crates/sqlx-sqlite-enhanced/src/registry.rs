//! Process-wide cache of open databases, keyed by absolute path

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Weak};

use tokio::sync::Mutex;
use tracing::debug;

use crate::Result;
use crate::database::SqliteDatabase;

/// One slot per path, each holding a weak reference so a database is freed
/// once every caller drops it. The map lock is only held to find a slot;
/// opening happens under the slot's own lock.
type Slot = Arc<Mutex<Weak<SqliteDatabase>>>;

static DATABASES: LazyLock<Mutex<HashMap<PathBuf, Slot>>> =
   LazyLock::new(|| Mutex::new(HashMap::new()));

/// In-memory databases are private to their connection and never cached
pub(crate) fn is_memory_database(path: &Path) -> bool {
   let path = path.to_string_lossy();
   path == ":memory:" || path.starts_with("file::memory:") || path.contains("mode=memory")
}

fn registry_key(path: &Path) -> Result<PathBuf> {
   Ok(std::path::absolute(path)?)
}

/// Returns the cached database for `path`, or awaits `open` and caches the
/// result. `open` is dropped unpolled on a cache hit.
///
/// Concurrent connects to one path open it once. Connects to other paths
/// are not held up by a slow open.
pub(crate) async fn get_or_open_database<Fut>(path: &Path, open: Fut) -> Result<Arc<SqliteDatabase>>
where
   Fut: Future<Output = Result<SqliteDatabase>>,
{
   if is_memory_database(path) {
      return Ok(Arc::new(open.await?));
   }

   let key = registry_key(path)?;

   let slot = {
      let mut databases = DATABASES.lock().await;
      // Keep slots that are mid-open or still point at a live database
      databases.retain(|_, slot| {
         Arc::strong_count(slot) > 1 || slot.try_lock().is_ok_and(|db| db.strong_count() > 0)
      });
      Arc::clone(databases.entry(key.clone()).or_default())
   };

   let mut cached = slot.lock().await;
   if let Some(db) = cached.upgrade() {
      debug!(path = %key.display(), "Reusing open database");
      return Ok(db);
   }

   let db = Arc::new(open.await?);
   *cached = Arc::downgrade(&db);
   Ok(db)
}

/// Removes `path` from the cache so the next connect opens it afresh
pub(crate) async fn uncache_database(path: &Path) -> Result<()> {
   if is_memory_database(path) {
      return Ok(());
   }

   let key = registry_key(path)?;
   DATABASES.lock().await.remove(&key);
   Ok(())
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::error::Error;

   #[test]
   fn test_memory_database_detection() {
      assert!(is_memory_database(Path::new(":memory:")));
      assert!(is_memory_database(Path::new("file::memory:?cache=shared")));
      assert!(is_memory_database(Path::new("file:shared?mode=memory")));
      assert!(!is_memory_database(Path::new("app.db")));
      assert!(!is_memory_database(Path::new("/tmp/memory.db")));
   }

   #[tokio::test]
   async fn test_slow_open_does_not_block_other_paths() {
      let dir = tempfile::TempDir::new().unwrap();
      let slow_path = dir.path().join("slow.db");

      let slow = tokio::spawn(async move {
         get_or_open_database(&slow_path, async {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            Err(Error::DatabaseClosed)
         })
         .await
      });
      tokio::time::sleep(std::time::Duration::from_millis(50)).await;

      let fast = tokio::time::timeout(
         std::time::Duration::from_millis(500),
         get_or_open_database(&dir.path().join("fast.db"), async {
            Err(Error::DatabaseClosed)
         }),
      )
      .await
      .expect("open of another path should not wait for the slow one");
      assert!(matches!(fast, Err(Error::DatabaseClosed)));

      assert!(matches!(slow.await.unwrap(), Err(Error::DatabaseClosed)));
   }

   #[test]
   fn test_registry_key_is_absolute() {
      let key = registry_key(Path::new("relative.db")).unwrap();
      assert!(key.is_absolute());
      assert!(key.ends_with("relative.db"));
   }
}

//! Connection pragmas applied to every pooled connection

use indexmap::IndexMap;
use sqlx::sqlite::SqliteConnection;
use tracing::trace;

use crate::Result;
use crate::error::Error;

const JOURNAL_MODE: &str = "journal_mode";

/// Pragmas that only affect the connection they run on, so read-only
/// connections can run them too. Anything else may write the database file
/// and runs once, on the writer.
const CONNECTION_PRAGMAS: &[&str] = &[
   "analysis_limit",
   "automatic_index",
   "busy_timeout",
   "cache_size",
   "cache_spill",
   "case_sensitive_like",
   "cell_size_check",
   "checkpoint_fullfsync",
   "defer_foreign_keys",
   "foreign_keys",
   "fullfsync",
   "hard_heap_limit",
   "ignore_check_constraints",
   "journal_size_limit",
   "legacy_alter_table",
   "locking_mode",
   "mmap_size",
   "query_only",
   "read_uncommitted",
   "recursive_triggers",
   "reverse_unordered_selects",
   "secure_delete",
   "soft_heap_limit",
   "synchronous",
   "temp_store",
   "threads",
   "trusted_schema",
];

/// An ordered set of `PRAGMA name = value` statements.
///
/// Defaults follow the recommended settings for concurrent server workloads:
///
/// | pragma               | value     | applies to          |
/// |----------------------|-----------|---------------------|
/// | `foreign_keys`       | `ON`      | all databases       |
/// | `journal_size_limit` | 64 MiB    | all databases       |
/// | `cache_size`         | `2000`    | all databases       |
/// | `journal_mode`       | `WAL`     | file databases only |
/// | `synchronous`        | `NORMAL`  | file databases only |
/// | `mmap_size`          | 128 MiB   | file databases only |
///
/// Connection-scoped pragmas run on every pooled connection. The rest, such
/// as `journal_mode` or `user_version`, change the database file itself and
/// run once on the writer, since a read-only connection cannot change them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PragmaSet {
   pragmas: IndexMap<String, String>,
}

impl PragmaSet {
   /// Defaults for a file or in-memory database, with `overrides` replacing
   /// defaults of the same name and appending new ones.
   ///
   /// # Errors
   ///
   /// Returns [`Error::InvalidPragma`] if a name or value is not safe to
   /// interpolate into a `PRAGMA` statement.
   pub(crate) fn resolve(memory: bool, overrides: &IndexMap<String, String>) -> Result<Self> {
      let mut pragmas: IndexMap<String, String> = IndexMap::new();
      pragmas.insert("foreign_keys".into(), "ON".into());
      pragmas.insert("journal_size_limit".into(), (64 * 1024 * 1024).to_string());
      pragmas.insert("cache_size".into(), "2000".into());

      if !memory {
         pragmas.insert(JOURNAL_MODE.into(), "WAL".into());
         pragmas.insert("synchronous".into(), "NORMAL".into());
         pragmas.insert("mmap_size".into(), (128 * 1024 * 1024).to_string());
      }

      for (name, value) in overrides {
         let name = name.to_ascii_lowercase();
         validate(&name, value)?;
         pragmas.insert(name, value.clone());
      }

      Ok(Self { pragmas })
   }

   /// The configured journal mode, if any
   pub(crate) fn journal_mode(&self) -> Option<&str> {
      self.pragmas.get(JOURNAL_MODE).map(String::as_str)
   }

   /// Runs the connection-scoped pragmas on `conn`
   pub(crate) async fn apply(&self, conn: &mut SqliteConnection) -> sqlx::Result<()> {
      for (name, value) in self.iter_scoped(true) {
         trace!(pragma = %name, %value, "Applying pragma");
         sqlx::query(&format!("PRAGMA {name} = {value}"))
            .execute(&mut *conn)
            .await?;
      }
      Ok(())
   }

   /// Runs the pragmas stored in the database file on the writer.
   ///
   /// Returns the journal mode SQLite reports after the change, which can
   /// differ from the requested one (e.g. WAL on an in-memory database).
   pub(crate) async fn apply_persistent(
      &self,
      conn: &mut SqliteConnection,
   ) -> sqlx::Result<Option<String>> {
      let mut journal_mode = None;
      for (name, value) in self.iter_scoped(false) {
         trace!(pragma = %name, %value, "Applying persistent pragma");
         let statement = format!("PRAGMA {name} = {value}");
         if name.as_str() == JOURNAL_MODE {
            let (mode,): (String,) = sqlx::query_as(&statement).fetch_one(&mut *conn).await?;
            journal_mode = Some(mode);
         } else {
            sqlx::query(&statement).execute(&mut *conn).await?;
         }
      }
      Ok(journal_mode)
   }

   fn iter_scoped(&self, connection: bool) -> impl Iterator<Item = (&String, &String)> {
      self
         .pragmas
         .iter()
         .filter(move |(name, _)| CONNECTION_PRAGMAS.contains(&name.as_str()) == connection)
   }

   #[cfg(test)]
   pub(crate) fn get(&self, name: &str) -> Option<&str> {
      self.pragmas.get(name).map(String::as_str)
   }
}

/// Pragma names are identifiers. Values are identifiers, numbers or
/// single-quoted strings without embedded quotes.
fn validate(name: &str, value: &str) -> Result<()> {
   let is_identifier = |s: &str| {
      let mut chars = s.chars();
      chars
         .next()
         .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
         && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
   };
   let is_number = |s: &str| {
      let unsigned = s.strip_prefix(['-', '+']).unwrap_or(s);
      let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
      !whole.is_empty()
         && whole.chars().all(|c| c.is_ascii_digit())
         && fraction.chars().all(|c| c.is_ascii_digit())
         && !unsigned.ends_with('.')
   };
   let is_quoted = |s: &str| {
      s.len() >= 2
         && s.starts_with('\'')
         && s.ends_with('\'')
         && !s[1..s.len() - 1].contains('\'')
   };

   if !is_identifier(name) {
      return Err(Error::InvalidPragma(name.to_string()));
   }
   if !is_identifier(value) && !is_number(value) && !is_quoted(value) {
      return Err(Error::InvalidPragma(format!("{name} = {value}")));
   }
   Ok(())
}

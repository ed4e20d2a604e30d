//! Explicit SQLite extension capabilities
//!
//! Extensions are never discovered or loaded by name at runtime. The
//! application registers each capability it supports in an
//! [`ExtensionRegistry`]; configuration then selects among them by name.

use std::fmt::Debug;
use std::sync::Arc;

use indexmap::IndexMap;
use sqlx::sqlite::SqliteConnectOptions;
use tracing::{debug, error};

/// A capability that adjusts how connections are opened, typically by
/// loading a SQLite extension
pub trait SqliteExtension: Send + Sync + Debug {
   /// Name used to select this extension from configuration
   fn name(&self) -> &str;

   /// Adds this extension to the options every pooled connection opens with
   fn configure(&self, options: SqliteConnectOptions) -> SqliteConnectOptions;
}

/// A run-time loadable extension shipped as a shared library
///
/// # Example
///
/// ```
/// use sqlx_sqlite_enhanced::{ExtensionRegistry, LoadableExtension};
///
/// let registry = ExtensionRegistry::new()
///    .with(LoadableExtension::new("vector", "/usr/lib/sqlite/vec0"))
///    .with(LoadableExtension::new("uuid", "./ext/uuid").with_entry_point("sqlite3_uuid_init"));
///
/// assert!(registry.get("vector").is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadableExtension {
   name: String,
   path: String,
   entry_point: Option<String>,
}

impl LoadableExtension {
   /// `path` is handed to `sqlite3_load_extension` as-is; SQLite appends the
   /// platform library suffix when it is missing
   pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
      Self {
         name: name.into(),
         path: path.into(),
         entry_point: None,
      }
   }

   /// Overrides the initialization function SQLite derives from the file name
   pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
      self.entry_point = Some(entry_point.into());
      self
   }

   pub fn path(&self) -> &str {
      &self.path
   }

   pub fn entry_point(&self) -> Option<&str> {
      self.entry_point.as_deref()
   }
}

impl SqliteExtension for LoadableExtension {
   fn name(&self) -> &str {
      &self.name
   }

   fn configure(&self, options: SqliteConnectOptions) -> SqliteConnectOptions {
      match &self.entry_point {
         Some(entry_point) => {
            options.extension_with_entrypoint(self.path.clone(), entry_point.clone())
         }
         None => options.extension(self.path.clone()),
      }
   }
}

/// The set of extensions an application is willing to load
#[derive(Debug, Clone, Default)]
pub struct ExtensionRegistry {
   extensions: IndexMap<String, Arc<dyn SqliteExtension>>,
}

impl ExtensionRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// Adds `extension`, replacing any previously registered under the same name
   pub fn with(mut self, extension: impl SqliteExtension + 'static) -> Self {
      self.register(Arc::new(extension));
      self
   }

   pub fn register(&mut self, extension: Arc<dyn SqliteExtension>) {
      self
         .extensions
         .insert(extension.name().to_string(), extension);
   }

   pub fn get(&self, name: &str) -> Option<&Arc<dyn SqliteExtension>> {
      self.extensions.get(name)
   }

   /// Looks up each requested name, in order. Names with no registered
   /// capability are logged and skipped.
   pub fn resolve(&self, names: &[String]) -> Vec<Arc<dyn SqliteExtension>> {
      names
         .iter()
         .filter_map(|name| match self.extensions.get(name) {
            Some(extension) => {
               debug!(extension = %name, "Enabling SQLite extension");
               Some(Arc::clone(extension))
            }
            None => {
               error!(extension = %name, "Unknown SQLite extension. Skipping...");
               None
            }
         })
         .collect()
   }
}

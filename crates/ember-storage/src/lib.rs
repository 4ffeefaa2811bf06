//! # ember-storage
//!
//! Durable store backends behind the `ember-core` persistence port.
//!
//! - [`SqliteStore`] - the reference durable backend (rusqlite, bundled)
//! - [`MemoryStore`] - process-lifetime storage for tests and fileless
//!   deployments
//!
//! Backends run their blocking work on the tokio blocking pool; the hub
//! only ever awaits the [`ember_core::Store`] trait.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use ember_core::StoreError;

/// Run a blocking storage closure off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| StoreError::Backend(format!("blocking task failed: {err}")))?
}

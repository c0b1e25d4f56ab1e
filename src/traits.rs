use async_trait::async_trait;
use std::fmt::Debug;
use std::pin::Pin;
use tokio_stream::Stream;

use crate::error::Result;
use crate::lifecycle::InstanceSpec;
use crate::types::ChangeEvent;
use crate::types::Record;
use crate::types::Revision;
use crate::types::StoredEntry;
use crate::types::WriteMode;

/// Long-lived stream of committed mutations of a single collection.
pub type ChangeFeed = Pin<Box<dyn Stream<Item = ChangeEvent> + Send + 'static>>;

/// Raw key-value cache backend.
///
/// Implementations report every failure, including an absent instance, as an error. Gating calls on liveness and
/// absorbing faults is the business of [`CacheClient`](crate::CacheClient).
#[async_trait]
pub trait CacheBackend: Debug + Send + Sync + 'static {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Cheap round-trip used by the connection monitor.
    async fn ping(&self) -> Result<()>;

    async fn fetch(&self, key: &str) -> Result<Option<StoredEntry>>;

    /// Store `entry` under `key`. With [`WriteMode::Versioned`] the write must be atomic per key and must not be
    /// applied when the current entry has the same or a newer revision. Returns `false` when rejected.
    async fn store(&self, key: &str, entry: StoredEntry, mode: WriteMode) -> Result<bool>;

    /// Remove `key`. With [`WriteMode::Versioned`] a tombstone of `revision` replaces the entry, under the same
    /// guard as for [`store`](Self::store).
    async fn remove(&self, key: &str, revision: Revision, mode: WriteMode) -> Result<bool>;
}

/// Authoritative document store.
#[async_trait]
pub trait RecordStore: Debug + Send + Sync + 'static {
    /// Logical collection the store serves.
    fn collection(&self) -> &str;

    async fn get_by_id(&self, id: &str) -> Result<Option<Record>>;

    /// Every subscription receives all mutations committed after it was made, ordered per identifier.
    async fn subscribe(&self) -> Result<ChangeFeed>;
}

/// External infrastructure API creating and tearing down cache backend instances.
#[async_trait]
pub trait Provisioner: Debug + Send + Sync + 'static {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<()>;
    async fn delete_instance(&self, name: &str) -> Result<()>;
}

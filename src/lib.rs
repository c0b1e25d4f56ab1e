//! # rt-cache
//!
//! Read-through cache with change-feed synchronization in front of a document store.
//!
//! A read for a record checks a fast key-value cache first. On a miss it falls back to the record store, returns the
//! record right away and populates the cache in the background. Meanwhile a change-feed listener mirrors every
//! create, update and delete committed to the store into the same cache keyspace.
//!
//! The cache backend instance is not expected to be always there. It is created and torn down on a weekday schedule
//! by the [`LifecycleScheduler`](lifecycle::LifecycleScheduler), so the cache connection can disappear at any moment.
//! Reads keep working regardless: an unavailable cache behaves exactly like a cache miss and no cache write is
//! attempted.
//!
//! # Consistency
//!
//! The read path and the sync path race for the same keys. Consider:
//!
//! 1. a read misses and fetches revision 1 of `o1` from the store;
//! 2. `o1` is updated to revision 2 and the listener puts revision 2 into the cache;
//! 3. the fill from step 1 lands.
//!
//! With plain last-write-wins semantics the cache ends up serving revision 1 until the next change of `o1`. The
//! default [`WriteMode::Versioned`](types::WriteMode::Versioned) stores the source revision alongside every cached
//! document and rejects writes derived from an older one. Deletes leave tombstones so a late fill can't resurrect a
//! deleted record either. [`WriteMode::LastArrival`](types::WriteMode::LastArrival) keeps the unguarded behavior.
//!
//! # Components
//!
//! - [`CacheClient`] owns the backend connection and its [`Liveness`](types::Liveness).
//! - [`ReadThroughService`] implements the read path.
//! - [`ChangeSyncService`] consumes a [`ChangeFeed`](traits::ChangeFeed) and reconciles changes it couldn't apply
//!   while the cache was away.
//! - [`endpoint`] maps read outcomes onto the response shape of the read endpoint.
//!
//! ```ignore
//! let backend = Arc::new(MemoryBackend::builder().build()?);
//! let store = Arc::new(MemoryStore::builder().build()?);
//! let cache = Arc::new(CacheClient::builder().backend(backend).build()?);
//! cache.connect().await;
//!
//! let sync = Arc::new(ChangeSyncService::builder().cache(cache.clone()).store(store.clone()).build()?);
//! sync.listen().await?;
//!
//! let reads = ReadThroughService::builder().cache(cache).store(store).build()?;
//! let response = reads.handle_read("o1").await?;
//! ```

pub mod backend;
pub mod cache_client;
pub mod change_sync;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod lifecycle;
pub mod read_through;
pub mod store;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache_client::CacheClient;
#[doc(inline)]
pub use change_sync::ChangeSyncService;
#[doc(inline)]
pub use read_through::ReadThroughService;

pub mod prelude {
    pub use crate::backend::memory::MemoryBackend;
    pub use crate::backend::memory::MemoryProvisioner;
    pub use crate::config::Config;
    pub use crate::error::Error;
    pub use crate::error::Result;
    pub use crate::lifecycle::InstanceSpec;
    pub use crate::lifecycle::LifecycleScheduler;
    pub use crate::lifecycle::Schedule;
    pub use crate::store::memory::MemoryStore;
    pub use crate::traits::*;
    pub use crate::types::*;
    pub use crate::CacheClient;
    pub use crate::ChangeSyncService;
    pub use crate::ReadThroughService;
}

//! In-process cache backend over [moka](https://crates.io/crates/moka).
//!
//! Besides serving as a real backend for single-process deployments, it lets tests and the simulation control the
//! availability and latency of the "instance", and count the operations which actually reached it.
use async_trait::async_trait;
use fieldx::fxstruct;
use moka::future::Cache;
use moka::ops::compute::CompResult;
use moka::ops::compute::Op;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::error::Result;
use crate::lifecycle::InstanceSpec;
use crate::traits::CacheBackend;
use crate::traits::Provisioner;
use crate::types::Revision;
use crate::types::StoredEntry;
use crate::types::WriteMode;

#[derive(Debug)]
#[fxstruct(sync, no_new, builder)]
pub struct MemoryBackend {
    #[fieldx(get(off), builder(into), default(String::from("memory")))]
    name: String,

    #[fieldx(lazy, get(clone), builder(off))]
    cache: Arc<Cache<String, StoredEntry>>,

    /// Artificial delay applied to every call, including pings.
    #[fieldx(lock, get(copy), set, default(Duration::ZERO))]
    latency: Duration,

    #[fieldx(get(off), builder(off), default(AtomicBool::new(true)))]
    available: AtomicBool,

    #[fieldx(get(off), builder(off), default(AtomicU64::new(0)))]
    operations: AtomicU64,
}

impl MemoryBackend {
    fn build_cache(&self) -> Arc<Cache<String, StoredEntry>> {
        Arc::new(Cache::builder().name(&self.name).build())
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// The number of get/store/remove calls that reached the instance.
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Peek at the raw entry without counting it as an operation.
    pub async fn peek(&self, key: &str) -> Option<StoredEntry> {
        self.cache().get(key).await
    }

    /// Put an arbitrary entry, bypassing encoding and revision checks.
    pub async fn insert_raw(&self, key: &str, entry: StoredEntry) {
        self.cache().insert(key.to_string(), entry).await;
    }

    /// Drop everything, as a freshly provisioned instance would hold nothing.
    pub fn reset(&self) {
        self.cache().invalidate_all();
    }

    async fn reach(&self, counted: bool) -> Result<()> {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.is_available() {
            return Err(Error::Backend(format!("instance '{}' is not reachable", self.name)));
        }
        if counted {
            self.operations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    // Applies `replacement` unless the guard rejects it. Runs under moka's per-key compute lock, so serialized with
    // any other write of the same key.
    async fn guarded_put(&self, key: &str, replacement: StoredEntry, mode: WriteMode) -> bool {
        let result = self
            .cache()
            .entry(key.to_string())
            .and_compute_with(|current| {
                let op = match current {
                    Some(current) if mode == WriteMode::Versioned && current.value().revision >= replacement.revision => {
                        Op::Nop
                    }
                    _ => Op::Put(replacement),
                };
                std::future::ready(op)
            })
            .await;

        matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_))
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        self.reach(false).await
    }

    async fn fetch(&self, key: &str) -> Result<Option<StoredEntry>> {
        self.reach(true).await?;
        Ok(self.cache().get(key).await)
    }

    async fn store(&self, key: &str, entry: StoredEntry, mode: WriteMode) -> Result<bool> {
        self.reach(true).await?;
        Ok(self.guarded_put(key, entry, mode).await)
    }

    async fn remove(&self, key: &str, revision: Revision, mode: WriteMode) -> Result<bool> {
        self.reach(true).await?;
        Ok(match mode {
            WriteMode::Versioned => self.guarded_put(key, StoredEntry::tombstone(revision), mode).await,
            WriteMode::LastArrival => {
                self.cache().invalidate(key).await;
                true
            }
        })
    }
}

/// Simulated infrastructure API: "creating" an instance makes the [`MemoryBackend`] reachable and empty, deleting it
/// makes it unreachable.
#[derive(Debug)]
#[fxstruct(sync, no_new, builder)]
pub struct MemoryProvisioner {
    #[fieldx(get(clone))]
    backend: Arc<MemoryBackend>,

    /// How long the simulated creation takes.
    #[fieldx(get(copy), default(Duration::ZERO))]
    provisioning_latency: Duration,

    #[fieldx(get(off), builder(off), default(parking_lot::Mutex::new(None)))]
    instance: parking_lot::Mutex<Option<InstanceSpec>>,
}

impl MemoryProvisioner {
    pub fn instance(&self) -> Option<InstanceSpec> {
        self.instance.lock().clone()
    }
}

#[async_trait]
impl Provisioner for MemoryProvisioner {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<()> {
        if self.instance.lock().as_ref().is_some_and(|i| i.name() == spec.name()) {
            log::debug!("instance '{}' already exists", spec.name());
            return Ok(());
        }

        let latency = self.provisioning_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.backend.reset();
        *self.instance.lock() = Some(spec.clone());
        self.backend.set_available(true);
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        let mut instance = self.instance.lock();
        if !instance.as_ref().is_some_and(|i| i.name() == name) {
            return Err(Error::Provisioning(format!("no instance named '{name}'")));
        }
        *instance = None;
        self.backend.set_available(false);
        self.backend.reset();
        Ok(())
    }
}

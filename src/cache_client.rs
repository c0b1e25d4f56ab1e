use fieldx::fxstruct;
use std::future::Future;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;

use crate::codec;
use crate::error::Error;
use crate::error::Result;
use crate::traits::CacheBackend;
use crate::types::*;

/// Connection manager in front of a [`CacheBackend`].
///
/// The client owns the liveness state of the backend connection. Every operation reads it afresh and doesn't touch
/// the backend at all when it is [`Liveness::Unavailable`]. Backend faults never escape [`get`](Self::get) and flip
/// the liveness to `Unavailable` until the next successful probe.
///
/// ```ignore
/// let client = Arc::new(
///     CacheClient::builder()
///         .backend(Arc::new(MemoryBackend::builder().build()?))
///         .op_timeout(Duration::from_millis(250))
///         .build()?,
/// );
/// client.connect().await;
///
/// if let Some(record) = client.get("o1").await? {
///     // ...
/// }
/// ```
#[derive(Debug)]
#[fxstruct(sync, no_new, default(off), builder)]
pub struct CacheClient<B>
where
    B: CacheBackend,
{
    #[fieldx(get(clone), builder(required))]
    backend: Arc<B>,

    /// Upper bound for a single backend call.
    #[fieldx(get(copy), default(Duration::from_millis(250)))]
    op_timeout: Duration,

    /// The delay between two consecutive liveness probes of the background monitor.
    #[fieldx(get(copy), default(Duration::from_secs(1)))]
    probe_interval: Duration,

    #[fieldx(get(copy), default(WriteMode::Versioned))]
    write_mode: WriteMode,

    #[fieldx(get(off), builder(off), default(watch::channel(Liveness::Unavailable).0))]
    liveness: watch::Sender<Liveness>,

    #[fieldx(private, clearer, lock, set, builder(off))]
    monitor_task: tokio::task::JoinHandle<()>,
}

impl<B> CacheClient<B>
where
    B: CacheBackend,
{
    #[inline]
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    #[inline]
    pub fn liveness(&self) -> Liveness {
        *self.liveness.borrow()
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.liveness() == Liveness::Live
    }

    pub fn subscribe_liveness(&self) -> watch::Receiver<Liveness> {
        self.liveness.subscribe()
    }

    fn mark(&self, state: Liveness) {
        let changed = self.liveness.send_if_modified(|current| {
            if *current == state {
                false
            }
            else {
                *current = state;
                true
            }
        });
        if changed {
            log::info!("[{}] cache backend is now {state}", self.name());
        }
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.op_timeout();
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(Error::Backend(format!("{op} timed out after {limit:?}"))))
    }

    /// Round-trip to the backend and update the liveness accordingly.
    pub async fn probe(&self) -> Liveness {
        let state = match self.bounded("PING", self.backend.ping()).await {
            Ok(()) => Liveness::Live,
            Err(err) => {
                log::debug!("[{}] probe failed: {err}", self.name());
                Liveness::Unavailable
            }
        };
        self.mark(state);
        state
    }

    /// Probe the backend and start the background monitor which keeps the liveness current. Restarts the monitor if
    /// it is already running.
    pub async fn connect(self: &Arc<Self>) -> Liveness {
        let state = self.probe().await;

        if let Some(previous) = self.clear_monitor_task() {
            previous.abort();
        }
        let client = Arc::downgrade(self);
        self.set_monitor_task(tokio::spawn(Self::monitor(client)));

        state
    }

    // Holds only a weak reference so that dropping the last client handle ends the task.
    async fn monitor(client: Weak<Self>) {
        loop {
            let Some(interval) = client.upgrade().map(|c| c.probe_interval())
            else {
                break;
            };
            tokio::time::sleep(interval).await;
            let Some(c) = client.upgrade()
            else {
                break;
            };
            c.probe().await;
        }
    }

    /// Stop the monitor and consider the backend gone.
    pub async fn close(&self) {
        if let Some(monitor) = self.clear_monitor_task() {
            monitor.abort();
            let _ = monitor.await;
        }
        self.mark(Liveness::Unavailable);
    }

    pub async fn get(&self, id: &str) -> Result<Option<Record>> {
        if !self.is_live() {
            log::debug!("[{}] GET({id}) skipped, backend unavailable", self.name());
            return Ok(None);
        }

        match self.bounded("GET", self.backend.fetch(id)).await {
            Ok(Some(StoredEntry {
                revision,
                payload: Some(payload),
            })) => Ok(Some(Record::new(id, revision, codec::decode(id, &payload)?))),
            // Missing or a tombstone.
            Ok(_) => Ok(None),
            Err(err) => {
                log::warn!("[{}] GET({id}) failed, treating as a miss: {err}", self.name());
                self.mark(Liveness::Unavailable);
                Ok(None)
            }
        }
    }

    pub async fn set(&self, record: &Record) -> Result<CacheOutcome> {
        if !self.is_live() {
            log::debug!("[{}] SET({}) skipped, backend unavailable", self.name(), record.id);
            return Ok(CacheOutcome::Skipped);
        }

        let entry = StoredEntry::value(record.revision, codec::encode(&record.document)?);
        match self
            .bounded("SET", self.backend.store(&record.id, entry, self.write_mode()))
            .await
        {
            Ok(true) => Ok(CacheOutcome::Stored),
            Ok(false) => {
                log::debug!(
                    "[{}] SET({}@{}) rejected, cache holds a newer revision",
                    self.name(),
                    record.id,
                    record.revision
                );
                Ok(CacheOutcome::Superseded)
            }
            Err(err) => {
                self.mark(Liveness::Unavailable);
                Err(Error::CacheWriteFailed {
                    key:    record.id.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// `revision` is the revision at which the record was deleted.
    pub async fn delete(&self, id: &str, revision: Revision) -> Result<CacheOutcome> {
        if !self.is_live() {
            log::debug!("[{}] DEL({id}) skipped, backend unavailable", self.name());
            return Ok(CacheOutcome::Skipped);
        }

        match self
            .bounded("DEL", self.backend.remove(id, revision, self.write_mode()))
            .await
        {
            Ok(true) => Ok(CacheOutcome::Removed),
            Ok(false) => Ok(CacheOutcome::Superseded),
            Err(err) => {
                self.mark(Liveness::Unavailable);
                Err(Error::CacheDeleteFailed {
                    key:    id.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use serde_json::json;

    fn record(id: &str, revision: Revision, total: i64) -> Record {
        Record::new(id, revision, json!({ "total": total }).as_object().cloned().unwrap())
    }

    async fn live_client(mode: WriteMode) -> (Arc<MemoryBackend>, Arc<CacheClient<MemoryBackend>>) {
        let backend = Arc::new(MemoryBackend::builder().build().unwrap());
        let client = Arc::new(
            CacheClient::builder()
                .backend(backend.clone())
                .write_mode(mode)
                .op_timeout(Duration::from_millis(50))
                .build()
                .unwrap(),
        );
        assert_eq!(client.connect().await, Liveness::Live);
        (backend, client)
    }

    #[tokio::test]
    async fn starts_unavailable() {
        let backend = Arc::new(MemoryBackend::builder().build().unwrap());
        let client = CacheClient::builder().backend(backend.clone()).build().unwrap();

        assert!(!client.is_live());
        assert_eq!(client.get("o1").await.unwrap(), None);
        assert_eq!(client.set(&record("o1", 1, 1)).await.unwrap(), CacheOutcome::Skipped);
        assert_eq!(client.delete("o1", 2).await.unwrap(), CacheOutcome::Skipped);
        assert_eq!(backend.operations(), 0, "unavailable client must not touch the backend");
    }

    #[test]
    fn backend_is_required() {
        assert!(CacheClient::<MemoryBackend>::builder().build().is_err());
    }

    #[tokio::test]
    async fn set_get_delete() {
        let (_backend, client) = live_client(WriteMode::Versioned).await;

        assert_eq!(client.get("o1").await.unwrap(), None);
        assert_eq!(client.set(&record("o1", 1, 42)).await.unwrap(), CacheOutcome::Stored);
        assert_eq!(client.get("o1").await.unwrap(), Some(record("o1", 1, 42)));
        assert_eq!(client.delete("o1", 2).await.unwrap(), CacheOutcome::Removed);
        assert_eq!(client.get("o1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_write_is_superseded() {
        let (_backend, client) = live_client(WriteMode::Versioned).await;

        assert_eq!(client.set(&record("o1", 5, 50)).await.unwrap(), CacheOutcome::Stored);
        assert_eq!(client.set(&record("o1", 4, 40)).await.unwrap(), CacheOutcome::Superseded);
        assert_eq!(client.get("o1").await.unwrap(), Some(record("o1", 5, 50)));

        // Tombstone of revision 6 shields against the fill of revision 5.
        assert_eq!(client.delete("o1", 6).await.unwrap(), CacheOutcome::Removed);
        assert_eq!(client.set(&record("o1", 5, 50)).await.unwrap(), CacheOutcome::Superseded);
        assert_eq!(client.get("o1").await.unwrap(), None);

        assert_eq!(client.set(&record("o1", 7, 70)).await.unwrap(), CacheOutcome::Stored);
        assert_eq!(client.get("o1").await.unwrap(), Some(record("o1", 7, 70)));
    }

    #[tokio::test]
    async fn last_arrival_regresses() {
        let (_backend, client) = live_client(WriteMode::LastArrival).await;

        client.set(&record("o1", 5, 50)).await.unwrap();
        assert_eq!(client.set(&record("o1", 4, 40)).await.unwrap(), CacheOutcome::Stored);
        assert_eq!(client.get("o1").await.unwrap(), Some(record("o1", 4, 40)));
    }

    #[tokio::test]
    async fn corrupt_value_is_a_fault() {
        let (backend, client) = live_client(WriteMode::Versioned).await;

        backend
            .insert_raw("o1", StoredEntry::value(1, "{broken".to_string()))
            .await;
        assert!(matches!(client.get("o1").await, Err(Error::CorruptEntry { .. })));
        assert!(client.is_live(), "corruption is not a connectivity problem");
    }

    #[tokio::test]
    async fn backend_loss_flips_liveness() {
        let (backend, client) = live_client(WriteMode::Versioned).await;
        client.set(&record("o1", 1, 42)).await.unwrap();

        backend.set_available(false);
        assert_eq!(client.get("o1").await.unwrap(), None);
        assert_eq!(client.liveness(), Liveness::Unavailable);

        let before = backend.operations();
        assert_eq!(client.set(&record("o1", 2, 43)).await.unwrap(), CacheOutcome::Skipped);
        assert_eq!(backend.operations(), before);

        backend.set_available(true);
        assert_eq!(client.probe().await, Liveness::Live);
        assert_eq!(client.get("o1").await.unwrap(), Some(record("o1", 1, 42)));
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let (backend, client) = live_client(WriteMode::Versioned).await;

        backend.set_latency(Duration::from_millis(200));
        let err = client.set(&record("o1", 1, 42)).await.unwrap_err();
        assert!(matches!(err, Error::CacheWriteFailed { .. }));
        assert!(err.is_retryable());
        assert!(!client.is_live());
    }

    #[tokio::test]
    async fn monitor_restores_liveness() {
        let backend = Arc::new(MemoryBackend::builder().build().unwrap());
        backend.set_available(false);
        let client = Arc::new(
            CacheClient::builder()
                .backend(backend.clone())
                .probe_interval(Duration::from_millis(10))
                .build()
                .unwrap(),
        );
        let mut liveness = client.subscribe_liveness();

        assert_eq!(client.connect().await, Liveness::Unavailable);
        backend.set_available(true);

        tokio::time::timeout(Duration::from_secs(2), liveness.wait_for(|l| *l == Liveness::Live))
            .await
            .expect("monitor didn't notice the backend")
            .unwrap();

        client.close().await;
        assert!(!client.is_live());
    }
}

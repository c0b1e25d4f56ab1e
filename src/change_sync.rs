use fieldx::fxstruct;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::cache_client::CacheClient;
use crate::error::Result;
use crate::traits::CacheBackend;
use crate::traits::ChangeFeed;
use crate::traits::RecordStore;
use crate::types::CacheOutcome;
use crate::types::ChangeEvent;
use crate::types::ChangeNotification;
use crate::types::Liveness;
use crate::types::Revision;
use crate::types::SyncOutcome;

/// Mirrors committed store mutations into the cache.
///
/// Events which couldn't reach the cache, either because it was unavailable or because the write failed, leave their
/// identifier in a pending set. [`reconcile`](Self::reconcile) brings those keys up to date from the store once the
/// cache is back.
#[derive(Debug)]
#[fxstruct(sync, no_new, default(off), builder)]
pub struct ChangeSyncService<B, S>
where
    B: CacheBackend,
    S: RecordStore,
{
    #[fieldx(get(clone), builder(required))]
    cache: Arc<CacheClient<B>>,

    #[fieldx(get(clone), builder(required))]
    store: Arc<S>,

    // Identifier -> the highest revision of a change that didn't make it into the cache.
    #[fieldx(get(off), builder(off), default(Mutex::new(BTreeMap::new())))]
    pending: Mutex<BTreeMap<String, Revision>>,
}

impl<B, S> ChangeSyncService<B, S>
where
    B: CacheBackend,
    S: RecordStore,
{
    fn defer(&self, id: &str, revision: Revision) {
        let mut pending = self.pending.lock();
        let known = pending.entry(id.to_string()).or_insert(revision);
        *known = (*known).max(revision);
    }

    // Only forget the key if nothing newer was deferred in the meantime.
    fn settled(&self, id: &str, revision: Revision) {
        let mut pending = self.pending.lock();
        if pending.get(id).is_some_and(|known| *known <= revision) {
            pending.remove(id);
        }
    }

    #[instrument(level = "debug", skip(self, event), fields(id = %event.id(), kind = event.kind(), revision = event.revision()))]
    pub async fn handle(&self, event: &ChangeEvent) -> Result<SyncOutcome> {
        let outcome = match event.record() {
            Some(record) => self.cache.set(&record).await,
            None => self.cache.delete(event.id(), event.revision()).await,
        };

        let outcome = match outcome {
            Ok(CacheOutcome::Stored | CacheOutcome::Removed) => SyncOutcome::Applied,
            Ok(CacheOutcome::Superseded) => SyncOutcome::Superseded,
            Ok(CacheOutcome::Skipped) => SyncOutcome::Skipped,
            Err(err) => {
                self.defer(event.id(), event.revision());
                return Err(err);
            }
        };

        match outcome {
            SyncOutcome::Skipped => self.defer(event.id(), event.revision()),
            _ => self.settled(event.id(), event.revision()),
        }
        debug!(%outcome, "change mirrored");
        Ok(outcome)
    }

    /// Same as [`handle`](Self::handle) for a raw trigger notification.
    pub async fn handle_notification(&self, notification: ChangeNotification) -> Result<SyncOutcome> {
        self.handle(&ChangeEvent::try_from(notification)?).await
    }

    /// Identifiers waiting for reconciliation.
    pub fn pending(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }

    /// Re-read every pending identifier from the store and write the result into the cache. Returns the number of
    /// identifiers brought up to date. Stops early, leaving the rest pending, when the cache goes away again.
    #[instrument(level = "debug", skip(self))]
    pub async fn reconcile(&self) -> Result<usize> {
        if !self.cache.is_live() {
            return Ok(0);
        }

        let snapshot: Vec<(String, Revision)> = self.pending.lock().iter().map(|(k, v)| (k.clone(), *v)).collect();
        let mut reconciled = 0;

        for (id, revision) in snapshot {
            let outcome = match self.store.get_by_id(&id).await? {
                Some(record) => self.cache.set(&record).await,
                None => self.cache.delete(&id, revision).await,
            };
            match outcome {
                Ok(CacheOutcome::Skipped) => break,
                Ok(outcome) => {
                    debug!(%id, %outcome, "reconciled");
                    self.settled(&id, revision);
                    reconciled += 1;
                }
                Err(err) => {
                    warn!(%id, %err, "reconciliation interrupted");
                    break;
                }
            }
        }

        if reconciled > 0 {
            info!(reconciled, left = self.pending.lock().len(), "cache reconciled");
        }
        Ok(reconciled)
    }

    async fn reconcile_logged(&self) {
        if let Err(err) = self.reconcile().await {
            warn!(%err, "reconciliation failed");
        }
    }

    /// Consume the feed to its end, one event at a time. Returns the number of events processed.
    pub async fn run(&self, mut feed: ChangeFeed) -> usize {
        let mut liveness = self.cache.subscribe_liveness();
        let mut watching = true;
        let mut processed = 0;

        loop {
            tokio::select! {
                event = feed.next() => {
                    let Some(event) = event
                    else {
                        break;
                    };
                    processed += 1;
                    if let Err(err) = self.handle(&event).await {
                        warn!(id = %event.id(), kind = event.kind(), %err, "change not mirrored, deferred");
                    }
                }
                changed = liveness.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    if *liveness.borrow_and_update() == Liveness::Live {
                        self.reconcile_logged().await;
                    }
                }
            }
        }

        debug!(processed, "change feed ended");
        processed
    }

    pub fn spawn(self: Arc<Self>, feed: ChangeFeed) -> JoinHandle<usize> {
        tokio::spawn(async move { self.run(feed).await })
    }

    /// Subscribe to the store's change feed and process it in the background.
    pub async fn listen(self: &Arc<Self>) -> Result<JoinHandle<usize>> {
        let feed = self.store.subscribe().await?;
        info!(collection = self.store.collection(), "listening for changes");
        Ok(self.clone().spawn(feed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::error::Error;
    use crate::store::memory::MemoryStore;
    use crate::types::Document;
    use crate::types::Record;
    use serde_json::json;
    use std::time::Duration;

    fn doc(total: i64) -> Document {
        json!({ "total": total }).as_object().cloned().unwrap()
    }

    struct Fixture {
        backend: Arc<MemoryBackend>,
        store:   Arc<MemoryStore>,
        cache:   Arc<CacheClient<MemoryBackend>>,
        sync:    Arc<ChangeSyncService<MemoryBackend, MemoryStore>>,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::builder().build().unwrap());
        let store = Arc::new(MemoryStore::builder().build().unwrap());
        let cache = Arc::new(
            CacheClient::builder()
                .backend(backend.clone())
                .op_timeout(Duration::from_millis(50))
                .build()
                .unwrap(),
        );
        cache.connect().await;
        let sync = Arc::new(
            ChangeSyncService::builder()
                .cache(cache.clone())
                .store(store.clone())
                .build()
                .unwrap(),
        );
        Fixture {
            backend,
            store,
            cache,
            sync,
        }
    }

    fn created(id: &str, revision: Revision, total: i64) -> ChangeEvent {
        ChangeEvent::Created {
            id: id.to_string(),
            revision,
            document: doc(total),
        }
    }

    fn updated(id: &str, revision: Revision, total: i64) -> ChangeEvent {
        ChangeEvent::Updated {
            id: id.to_string(),
            revision,
            document: doc(total),
        }
    }

    #[tokio::test]
    async fn mirrors_mutations() {
        let f = fixture().await;

        assert_eq!(f.sync.handle(&created("o1", 1, 42)).await.unwrap(), SyncOutcome::Applied);
        assert_eq!(f.cache.get("o1").await.unwrap(), Some(Record::new("o1", 1, doc(42))));

        assert_eq!(f.sync.handle(&updated("o1", 2, 43)).await.unwrap(), SyncOutcome::Applied);
        assert_eq!(f.cache.get("o1").await.unwrap().unwrap().document, doc(43));

        let deleted = ChangeEvent::Deleted {
            id:       "o1".to_string(),
            revision: 3,
        };
        assert_eq!(f.sync.handle(&deleted).await.unwrap(), SyncOutcome::Applied);
        assert_eq!(f.cache.get("o1").await.unwrap(), None);
        assert!(f.sync.pending().is_empty());
    }

    #[tokio::test]
    async fn redelivered_event_is_superseded() {
        let f = fixture().await;

        f.sync.handle(&updated("o1", 5, 50)).await.unwrap();
        assert_eq!(f.sync.handle(&updated("o1", 4, 40)).await.unwrap(), SyncOutcome::Superseded);
        assert_eq!(f.cache.get("o1").await.unwrap().unwrap().revision, 5);
    }

    #[tokio::test]
    async fn skipped_changes_are_reconciled() {
        let f = fixture().await;
        f.cache.close().await;

        let r1 = f.store.put("o1", doc(1));
        let r2 = f.store.put("o2", doc(2));
        f.store.remove("o2");
        assert_eq!(f.sync.handle(&created("o1", r1.revision, 1)).await.unwrap(), SyncOutcome::Skipped);
        assert_eq!(f.sync.handle(&created("o2", r2.revision, 2)).await.unwrap(), SyncOutcome::Skipped);
        assert_eq!(f.sync.pending(), vec!["o1".to_string(), "o2".to_string()]);

        // Nothing happens while the cache stays away.
        assert_eq!(f.sync.reconcile().await.unwrap(), 0);
        assert_eq!(f.sync.pending().len(), 2);

        f.cache.probe().await;
        assert_eq!(f.sync.reconcile().await.unwrap(), 2);
        assert!(f.sync.pending().is_empty());
        assert_eq!(f.cache.get("o1").await.unwrap(), Some(r1));
        assert_eq!(f.cache.get("o2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_write_is_retryable_and_deferred() {
        let f = fixture().await;
        f.backend.set_available(false);

        let err = f.sync.handle(&created("o1", 1, 1)).await.unwrap_err();
        assert!(matches!(err, Error::CacheWriteFailed { .. }));
        assert!(err.is_retryable());
        assert_eq!(f.sync.pending(), vec!["o1".to_string()]);
    }

    #[tokio::test]
    async fn malformed_notification_is_rejected() {
        let f = fixture().await;
        let bogus = ChangeNotification {
            id:            "o1".into(),
            revision:      1,
            before_exists: false,
            after_exists:  false,
            after:         None,
        };
        assert!(matches!(
            f.sync.handle_notification(bogus).await,
            Err(Error::MalformedChange(_))
        ));

        let without_document = ChangeNotification {
            id:            "o1".into(),
            revision:      1,
            before_exists: false,
            after_exists:  true,
            after:         None,
        };
        assert!(matches!(
            f.sync.handle_notification(without_document).await,
            Err(Error::MalformedChange(_))
        ));
        assert_eq!(f.backend.operations(), 0);
        assert_eq!(f.backend.peek("o1").await, None);
    }

    #[tokio::test]
    async fn listener_reconciles_when_cache_returns() {
        let f = fixture().await;
        let listener = f.sync.listen().await.unwrap();

        f.cache.close().await;
        let record = f.store.put("o1", doc(42));

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.sync.pending().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        f.cache.probe().await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while !f.sync.pending().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(f.cache.get("o1").await.unwrap(), Some(record));

        listener.abort();
    }
}

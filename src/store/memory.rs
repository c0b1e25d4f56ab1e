//! In-process document store.
//!
//! Assigns revisions from a single store-wide counter and publishes every mutation to all subscribed change feeds
//! while still holding the write lock, which keeps the feed order identical to the commit order.
use async_trait::async_trait;
use fieldx::fxstruct;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::Error;
use crate::error::Result;
use crate::traits::ChangeFeed;
use crate::traits::RecordStore;
use crate::types::ChangeEvent;
use crate::types::Document;
use crate::types::Record;
use crate::types::Revision;

#[derive(Debug)]
#[fxstruct(sync, no_new, builder)]
pub struct MemoryStore {
    #[fieldx(get(off), builder(into), default(String::from("orders")))]
    collection: String,

    #[fieldx(get(off), builder(off), default(RwLock::new(HashMap::new())))]
    records: RwLock<HashMap<String, Record>>,

    #[fieldx(get(off), builder(off), default(Mutex::new(0)))]
    last_revision: Mutex<Revision>,

    #[fieldx(get(off), builder(off), default(Mutex::new(Vec::new())))]
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,

    #[fieldx(get(off), builder(off), default(AtomicBool::new(true)))]
    available: AtomicBool,
}

impl MemoryStore {
    fn next_revision(&self) -> Revision {
        let mut last = self.last_revision.lock();
        *last += 1;
        *last
    }

    fn publish(&self, event: ChangeEvent) {
        // Closed feeds are dropped on the way.
        self.subscribers.lock().retain(|feed| feed.send(event.clone()).is_ok());
    }

    /// Create or replace a record. Emits `Created` or `Updated`.
    pub fn put(&self, id: impl Into<String>, document: Document) -> Record {
        let id = id.into();
        let mut records = self.records.write();
        let record = Record::new(id.clone(), self.next_revision(), document);
        let event = if records.insert(id.clone(), record.clone()).is_some() {
            ChangeEvent::Updated {
                id,
                revision: record.revision,
                document: record.document.clone(),
            }
        }
        else {
            ChangeEvent::Created {
                id,
                revision: record.revision,
                document: record.document.clone(),
            }
        };
        self.publish(event);
        record
    }

    /// Delete a record. Emits `Deleted` and returns the deletion revision if the record existed.
    pub fn remove(&self, id: &str) -> Option<Revision> {
        let mut records = self.records.write();
        records.remove(id)?;
        let revision = self.next_revision();
        self.publish(ChangeEvent::Deleted {
            id: id.to_string(),
            revision,
        });
        Some(revision)
    }

    /// Simulate loss of connectivity to the store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Record>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(format!(
                "collection '{}' is not reachable",
                self.collection
            )));
        }
        Ok(self.records.read().get(id).cloned())
    }

    async fn subscribe(&self) -> Result<ChangeFeed> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn doc(total: i64) -> Document {
        json!({ "total": total }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn feed_follows_commit_order() {
        let store = MemoryStore::builder().build().unwrap();
        let mut feed = store.subscribe().await.unwrap();

        let created = store.put("o1", doc(1));
        let updated = store.put("o1", doc(2));
        let deleted = store.remove("o1").unwrap();
        assert!(store.remove("o1").is_none());
        let recreated = store.put("o1", doc(3));

        assert!(created.revision < updated.revision);
        assert!(updated.revision < deleted);
        assert!(deleted < recreated.revision);

        let kinds: Vec<_> = [
            feed.next().await.unwrap(),
            feed.next().await.unwrap(),
            feed.next().await.unwrap(),
            feed.next().await.unwrap(),
        ]
        .iter()
        .map(|e| (e.kind(), e.revision()))
        .collect();
        assert_eq!(
            kinds,
            vec![
                ("created", created.revision),
                ("updated", updated.revision),
                ("deleted", deleted),
                ("created", recreated.revision),
            ]
        );
    }

    #[tokio::test]
    async fn lookup() {
        let store = MemoryStore::builder().collection("invoices").build().unwrap();
        assert_eq!(store.collection(), "invoices");

        let record = store.put("i1", doc(10));
        assert_eq!(store.get_by_id("i1").await.unwrap(), Some(record));
        assert_eq!(store.get_by_id("i2").await.unwrap(), None);

        store.set_available(false);
        assert!(matches!(store.get_by_id("i1").await, Err(Error::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn dropped_feed_is_pruned() {
        let store = MemoryStore::builder().build().unwrap();
        let feed = store.subscribe().await.unwrap();
        drop(feed);

        store.put("o1", doc(1));
        assert!(store.subscribers.lock().is_empty());
    }
}

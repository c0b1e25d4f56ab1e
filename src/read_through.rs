use fieldx::fxstruct;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::cache_client::CacheClient;
use crate::error::Error;
use crate::error::Result;
use crate::traits::CacheBackend;
use crate::traits::RecordStore;
use crate::types::FillMode;
use crate::types::Provenance;
use crate::types::ReadResponse;
use crate::types::Record;

/// Serves reads: cache first, the record store on a miss.
///
/// The cache is strictly an optimization. Whatever happens to it, a record the store has is returned; only store
/// failures fail a read.
#[derive(Debug)]
#[fxstruct(sync, no_new, default(off), builder)]
pub struct ReadThroughService<B, S>
where
    B: CacheBackend,
    S: RecordStore,
{
    #[fieldx(get(clone), builder(required))]
    cache: Arc<CacheClient<B>>,

    #[fieldx(get(clone), builder(required))]
    store: Arc<S>,

    #[fieldx(get(copy), default(FillMode::Background))]
    fill_mode: FillMode,

    /// Upper bound for a store lookup.
    #[fieldx(get(copy), default(Duration::from_secs(5)))]
    store_timeout: Duration,

    // Background fills in flight.
    #[fieldx(get(off), builder(off), default(Mutex::new(JoinSet::new())))]
    fills: Mutex<JoinSet<()>>,
}

impl<B, S> ReadThroughService<B, S>
where
    B: CacheBackend,
    S: RecordStore,
{
    fn validate_id(id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(Error::InvalidRequest("record identifier is required".to_string()));
        }
        if id.trim() != id {
            return Err(Error::InvalidRequest(format!("record identifier '{id}' has surrounding whitespace")));
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn handle_read(&self, id: &str) -> Result<ReadResponse> {
        Self::validate_id(id)?;

        if let Some(record) = self.cache.get(id).await? {
            debug!("cache hit");
            return Ok(ReadResponse::new(record, Provenance::Cache));
        }

        let record = tokio::time::timeout(self.store_timeout(), self.store.get_by_id(id))
            .await
            .map_err(|_| Error::StoreUnavailable(format!("lookup of '{id}' timed out")))??
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        debug!(revision = record.revision, "served by the store");

        match self.fill_mode() {
            FillMode::Inline => Self::fill(self.cache(), record.clone()).await,
            FillMode::Background => {
                let mut fills = self.fills.lock();
                // Reap whatever has completed already so the set doesn't grow with the request count.
                while fills.try_join_next().is_some() {}
                fills.spawn(Self::fill(self.cache(), record.clone()));
            }
        }

        Ok(ReadResponse::new(record, Provenance::Store))
    }

    // The outcome goes to the log only.
    async fn fill(cache: Arc<CacheClient<B>>, record: Record) {
        match cache.set(&record).await {
            Ok(outcome) => debug!(id = %record.id, revision = record.revision, %outcome, "cache fill"),
            Err(err) => warn!(id = %record.id, %err, "cache fill failed"),
        }
    }

    /// Wait for all background fills started so far.
    pub async fn settle(&self) {
        let mut fills = std::mem::take(&mut *self.fills.lock());
        while fills.join_next().await.is_some() {}
    }
}

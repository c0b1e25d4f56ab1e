//! Drives the whole stack in-process: seeds a store, provisions the cache on demand, hammers it with concurrent reads
//! and updates, then tears the cache down again and reports whether any stale entries survived.
use anyhow::Context;
use rt_cache::lifecycle::LifecycleAction;
use rt_cache::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::info;
use tracing::warn;

const ORDERS: usize = 200;
const ROUNDS: usize = 5;

type Reads = ReadThroughService<MemoryBackend, MemoryStore>;

fn setup_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}

fn order_id(n: usize) -> String {
    format!("o{n}")
}

fn order(n: usize, round: usize) -> Document {
    json!({ "total": n * 10 + round, "round": round })
        .as_object()
        .cloned()
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct Tally {
    cache:     usize,
    store:     usize,
    not_found: usize,
    failed:    usize,
}

impl Tally {
    fn add(&mut self, result: Result<ReadResponse>) {
        match result {
            Ok(response) if response.provenance == Provenance::Cache => self.cache += 1,
            Ok(_) => self.store += 1,
            Err(Error::NotFound(_)) => self.not_found += 1,
            Err(err) => {
                warn!(%err, "read failed");
                self.failed += 1;
            }
        }
    }
}

async fn read_all(reads: &Arc<Reads>) -> Tally {
    let mut tasks = JoinSet::new();
    for n in 0..ORDERS {
        let reads = reads.clone();
        tasks.spawn(async move { reads.handle_read(&order_id(n)).await });
    }
    let mut tally = Tally::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => tally.add(result),
            Err(err) => {
                warn!(%err, "read task died");
                tally.failed += 1;
            }
        }
    }
    reads.settle().await;
    tally
}

// Entries whose revision lags behind the store.
async fn stale_entries(backend: &MemoryBackend, store: &MemoryStore) -> anyhow::Result<usize> {
    let mut stale = 0;
    for n in 0..ORDERS {
        let id = order_id(n);
        let Some(entry) = backend.peek(&id).await
        else {
            continue;
        };
        let current = store.get_by_id(&id).await?.map(|r| r.revision);
        if !entry.is_tombstone() && current != Some(entry.revision) {
            stale += 1;
        }
    }
    Ok(stale)
}

async fn simulate(config: Config) -> anyhow::Result<()> {
    let backend = Arc::new(MemoryBackend::builder().name(config.instance_name()).build()?);
    // No instance until the scheduler creates one.
    backend.set_available(false);

    let provisioner = Arc::new(
        MemoryProvisioner::builder()
            .backend(backend.clone())
            .provisioning_latency(Duration::from_millis(50))
            .build()?,
    );
    let scheduler = LifecycleScheduler::builder()
        .provisioner(provisioner)
        .instance(config.instance_spec()?)
        .schedule(config.schedule()?)
        .build()?;

    let store = Arc::new(MemoryStore::builder().collection(config.collection()).build()?);
    let cache = Arc::new(
        CacheClient::builder()
            .backend(backend.clone())
            .op_timeout(config.cache_timeout())
            .probe_interval(config.probe_interval())
            .write_mode(config.write_mode())
            .build()?,
    );
    cache.connect().await;

    let sync = Arc::new(ChangeSyncService::builder().cache(cache.clone()).store(store.clone()).build()?);
    let listener = sync.listen().await?;

    let reads = Arc::new(
        ReadThroughService::builder()
            .cache(cache.clone())
            .store(store.clone())
            .fill_mode(config.fill_mode())
            .store_timeout(config.store_timeout())
            .build()?,
    );

    for n in 0..ORDERS {
        store.put(order_id(n), order(n, 0));
    }

    let tally = read_all(&reads).await;
    info!(?tally, liveness = %cache.liveness(), "reads without a cache instance");

    scheduler.fire(LifecycleAction::Provision).await?;
    let mut liveness = cache.subscribe_liveness();
    tokio::time::timeout(config.probe_interval() * 5, liveness.wait_for(|l| *l == Liveness::Live))
        .await
        .context("cache instance didn't come up")??;

    for round in 1..=ROUNDS {
        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for n in (0..ORDERS).filter(|n| n % ROUNDS == round % ROUNDS) {
                    store.put(order_id(n), order(n, round));
                    tokio::task::yield_now().await;
                }
            })
        };
        let tally = read_all(&reads).await;
        writer.await?;
        info!(round, ?tally, "reads with concurrent updates");
    }

    // Let the listener drain.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stale = stale_entries(&backend, &store).await?;
    info!(
        write_mode = ?config.write_mode(),
        stale,
        pending = sync.pending().len(),
        "consistency check"
    );

    scheduler.fire(LifecycleAction::Deprovision).await?;
    cache.probe().await;
    let tally = read_all(&reads).await;
    info!(?tally, liveness = %cache.liveness(), "reads after deprovisioning");

    listener.abort();
    cache.close().await;

    if stale > 0 && config.write_mode() == WriteMode::Versioned {
        anyhow::bail!("{stale} stale cache entries in versioned mode");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing()?;

    let config = match Config::load() {
        Ok(config) => config,
        Err(Error::Cli(err)) => err.exit(),
        Err(err) => return Err(err.into()),
    };

    simulate(config).await
}

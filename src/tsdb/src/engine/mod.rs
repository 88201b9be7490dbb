pub mod data_family;
pub mod interval_segment;
pub mod segment;
pub mod shard;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use metricdb_common::error::StoreError;

use crate::engine::shard::{new_shard, Shard, ShardId, ShardOptions};
use crate::metadb::Metadata;

pub use data_family::DataFamily;
pub use interval_segment::IntervalSegment;
pub use segment::Segment;
pub use shard::ShardContext;

pub(crate) const SHARD_DIR: &str = "shard";

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub path: PathBuf,
    /// period of the background flush walk over all shards
    pub flush_interval: Duration,
}

impl EngineOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Engine owns every shard of this storage node and drives the periodic
/// background flush.
pub struct Engine {
    options: EngineOptions,
    metadata: Arc<dyn Metadata>,
    shards: RwLock<HashMap<(String, ShardId), Arc<Shard>>>,
    shutdown_tx: broadcast::Sender<()>,
    flusher_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Engine {
    pub async fn new(
        options: EngineOptions,
        metadata: Arc<dyn Metadata>,
    ) -> anyhow::Result<Arc<Self>> {
        tokio::fs::create_dir_all(&options.path).await?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let engine = Arc::new(Self {
            options,
            metadata,
            shards: RwLock::new(HashMap::new()),
            shutdown_tx,
            flusher_handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let handle = tokio::spawn(run_flusher(
            Arc::downgrade(&engine),
            engine.options.flush_interval,
            shutdown_rx,
        ));
        *engine.flusher_handle.lock().await = Some(handle);

        tracing::info!(path = %engine.options.path.display(), "started tsdb engine");
        Ok(engine)
    }

    /// create_shard opens the shard, or returns the existing handle: one
    /// shard per `(database, shard id)`.
    pub async fn create_shard(
        &self,
        database: &str,
        shard_id: ShardId,
        options: ShardOptions,
    ) -> anyhow::Result<Arc<Shard>> {
        self.check_open()?;

        let mut shards = self.shards.write().await;
        let key = (database.to_string(), shard_id);
        if let Some(shard) = shards.get(&key) {
            return Ok(shard.clone());
        }

        let path = self
            .options
            .path
            .join(database)
            .join(SHARD_DIR)
            .join(shard_id.to_string());
        let shard = Arc::new(
            new_shard(database, shard_id, path, self.metadata.clone(), options).await?,
        );
        shards.insert(key, shard.clone());
        Ok(shard)
    }

    pub async fn get_shard(&self, database: &str, shard_id: ShardId) -> Option<Arc<Shard>> {
        let shards = self.shards.read().await;
        shards.get(&(database.to_string(), shard_id)).cloned()
    }

    /// flush_all flushes every shard, reporting the first failure after
    /// trying all of them.
    pub async fn flush_all(&self) -> anyhow::Result<()> {
        self.check_open()?;

        let shards: Vec<Arc<Shard>> = {
            let shards = self.shards.read().await;
            shards.values().cloned().collect()
        };

        let mut first_err = None;
        for shard in shards {
            if let Err(err) = shard.flush().await {
                tracing::error!(
                    database = %shard.database(),
                    shard_id = shard.shard_id(),
                    error = %err,
                    "flush shard failure"
                );
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// close stops the background flusher, then closes every shard. The
    /// flusher has drained before any shard shuts down.
    pub async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Closed.into());
        }

        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.flusher_handle.lock().await.take() {
            let _ = handle.await;
        }

        let mut shards = self.shards.write().await;
        let mut first_err = None;
        for ((database, shard_id), shard) in shards.drain() {
            if let Err(err) = shard.close().await {
                tracing::error!(
                    database = %database,
                    shard_id,
                    error = %err,
                    "close shard failure"
                );
                first_err.get_or_insert(err);
            }
        }

        tracing::info!(path = %self.options.path.display(), "stopped tsdb engine");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed.into());
        }
        Ok(())
    }
}

/// background loop flushing all shards every flush interval
async fn run_flusher(
    engine: Weak<Engine>,
    flush_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick completes immediately, skip it
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                if let Err(err) = engine.flush_all().await {
                    tracing::error!(error = %err, "background flush failure");
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("received shutdown, stopped background flusher");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadb::MemoryMetadata;
    use crate::series::{KeyValue, MetricRecord, SimpleField, SimpleFieldType};
    use metricdb_common::error::is_closed;
    use metricdb_utils::time::{parse_timestamp, TIMESTAMP_FORMAT};

    fn record(host: Option<&str>, timestamp: i64) -> MetricRecord {
        let mut record = MetricRecord::new("ns", "cpu", timestamp);
        if let Some(host) = host {
            record.tags.push(KeyValue::new("host", host));
        }
        record.simple_fields.push(SimpleField {
            name: "load".to_string(),
            field_type: SimpleFieldType::Gauge,
            value: 0.42,
        });
        record
    }

    async fn new_engine(
        dir: &std::path::Path,
    ) -> anyhow::Result<(Arc<Engine>, Arc<MemoryMetadata>)> {
        let metadata = Arc::new(MemoryMetadata::new("test"));
        let options = EngineOptions {
            path: dir.to_path_buf(),
            flush_interval: Duration::from_secs(3600),
        };
        let engine = Engine::new(options, metadata.clone()).await?;
        Ok((engine, metadata))
    }

    #[tokio::test]
    async fn test_write_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (engine, metadata) = new_engine(dir.path()).await?;
        let shard = engine.create_shard("db", 1, ShardOptions::default()).await?;

        let ts = parse_timestamp("20190904 19:10:48", TIMESTAMP_FORMAT)?;
        shard.write_record(&record(Some("h-1"), ts)).await?;
        shard.write_record(&record(Some("h-2"), ts)).await?;
        shard.flush().await?;

        let ids = shard.index_database().get_series_ids_for_metric("ns", "cpu")?;
        assert_eq!(vec![1, 2], ids.iter().collect::<Vec<u32>>());

        // the data family holds the payloads
        let segment = shard.interval_segment().get_or_create_segment("20190904")?;
        let family = segment.get_or_create_data_family(ts)?;
        assert_eq!(1, family.scan(1)?.len());
        assert_eq!(1, family.scan(2)?.len());

        let host_key = metadata.gen_tag_key_id("ns", "cpu", "host")?;
        let tagged = shard.index_database().get_series_ids_for_tag(host_key)?;
        assert_eq!(vec![1, 2], tagged.iter().collect::<Vec<u32>>());

        engine.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_write_without_tags_uses_sentinel() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (engine, _metadata) = new_engine(dir.path()).await?;
        let shard = engine.create_shard("db", 1, ShardOptions::default()).await?;

        let ts = parse_timestamp("20190904 19:10:48", TIMESTAMP_FORMAT)?;
        shard.write_record(&record(None, ts)).await?;

        let ids = shard.index_database().get_series_ids_for_metric("ns", "cpu")?;
        assert_eq!(vec![0], ids.iter().collect::<Vec<u32>>());

        let segment = shard.interval_segment().get_or_create_segment("20190904")?;
        let family = segment.get_or_create_data_family(ts)?;
        assert_eq!(1, family.scan(0)?.len());

        engine.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_series_ids_stable_across_restart() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ts = parse_timestamp("20190904 19:10:48", TIMESTAMP_FORMAT)?;

        let metadata = Arc::new(MemoryMetadata::new("test"));
        let tags_hash = record(Some("h-1"), ts).tags_hash();
        let metric_id;
        {
            let options = EngineOptions {
                path: dir.path().to_path_buf(),
                flush_interval: Duration::from_secs(3600),
            };
            let engine = Engine::new(options, metadata.clone()).await?;
            let shard = engine.create_shard("db", 1, ShardOptions::default()).await?;
            shard.write_record(&record(Some("h-1"), ts)).await?;
            metric_id = metadata.gen_metric_id("ns", "cpu")?;
            shard.flush().await?;
            engine.close().await?;
        }

        let options = EngineOptions {
            path: dir.path().to_path_buf(),
            flush_interval: Duration::from_secs(3600),
        };
        let engine = Engine::new(options, metadata).await?;
        let shard = engine.create_shard("db", 1, ShardOptions::default()).await?;
        assert_eq!(
            (1, false),
            shard
                .index_database()
                .get_or_create_series_id(metric_id, tags_hash)
                .await?
        );

        engine.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_create_shard_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (engine, _metadata) = new_engine(dir.path()).await?;

        let shard = engine.create_shard("db", 1, ShardOptions::default()).await?;
        let shard1 = engine.create_shard("db", 1, ShardOptions::default()).await?;
        assert!(Arc::ptr_eq(&shard, &shard1));

        let other = engine.create_shard("db", 2, ShardOptions::default()).await?;
        assert!(!Arc::ptr_eq(&shard, &other));
        assert_eq!(
            Some(2),
            engine.get_shard("db", 2).await.map(|s| s.shard_id())
        );
        assert!(engine.get_shard("db", 3).await.is_none());

        engine.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_engine() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (engine, _metadata) = new_engine(dir.path()).await?;
        engine.close().await?;

        assert!(is_closed(&engine.close().await.unwrap_err()));
        assert!(is_closed(
            &engine
                .create_shard("db", 1, ShardOptions::default())
                .await
                .unwrap_err()
        ));
        Ok(())
    }
}

pub mod backend;
pub mod grouping;
pub mod inverted_index;
pub mod mapping;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use roaring::RoaringBitmap;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use metricdb_common::error::{is_not_found, StoreError};
use metricdb_storage::Family;

use crate::indexdb::backend::{IdMappingBackend, KvMappingBackend};
use crate::indexdb::grouping::GroupingContext;
use crate::indexdb::inverted_index::InvertedIndex;
use crate::indexdb::mapping::{MappingEvent, MetricIdMapping};
use crate::metadb::Metadata;
use crate::series::{KeyValue, SERIES_ID_WITHOUT_TAGS};
use crate::wal::{FileSeriesWal, RecoveryHandler, SeriesWal};

pub(crate) const WAL_PATH: &str = "wal";
pub(crate) const SERIES_WAL_PATH: &str = "series";

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct IndexDatabaseOptions {
    /// period of the background WAL-to-backend sync check
    pub sync_interval: Duration,
}

impl Default for IndexDatabaseOptions {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// mapping-write state guarded as one unit: allocators serialise here,
/// reads of the inverted index never take this lock
struct MappingState {
    backend: Box<dyn IdMappingBackend>,
    series_wal: Box<dyn SeriesWal>,
    metric_mappings: HashMap<u32, MetricIdMapping>,
    closed: bool,
}

/// MappingEventFlusher batches replayed WAL records into the backend.
struct MappingEventFlusher<'a> {
    backend: &'a dyn IdMappingBackend,
    event: MappingEvent,
}

impl<'a> MappingEventFlusher<'a> {
    fn new(backend: &'a dyn IdMappingBackend) -> Self {
        Self {
            backend,
            event: MappingEvent::new(),
        }
    }
}

impl RecoveryHandler for MappingEventFlusher<'_> {
    fn on_record(
        &mut self,
        metric_id: u32,
        tags_hash: u64,
        series_id: u32,
    ) -> anyhow::Result<()> {
        self.event.add_series_id(metric_id, tags_hash, series_id);
        if self.event.is_full() {
            self.backend.save_mapping(&self.event)?;
            self.event = MappingEvent::new();
        }
        Ok(())
    }

    fn on_batch_end(&mut self) -> anyhow::Result<()> {
        if !self.event.is_empty() {
            self.backend.save_mapping(&self.event)?;
            self.event = MappingEvent::new();
        }
        Ok(())
    }
}

async fn series_recovery(state: &mut MappingState) -> anyhow::Result<()> {
    let MappingState {
        backend,
        series_wal,
        ..
    } = state;
    let mut flusher = MappingEventFlusher::new(backend.as_ref());
    series_wal.recovery(&mut flusher).await
}

/// IndexDatabase maps metric identities to compact series IDs and owns the
/// inverted index over tag identifiers.
///
/// Series allocation is durable: an ID is handed out only after its WAL
/// append succeeded, and a background task replays the WAL into the mapping
/// backend every [`IndexDatabaseOptions::sync_interval`].
pub struct IndexDatabase {
    path: PathBuf,
    metadata: Arc<dyn Metadata>,
    index: InvertedIndex,
    state: Arc<RwLock<MappingState>>,
    shutdown_tx: broadcast::Sender<()>,
    check_sync_handle: Mutex<Option<JoinHandle<()>>>,
}

impl IndexDatabase {
    /// open opens the index database at `path` with the default backend and
    /// WAL implementations.
    pub async fn open(
        path: impl AsRef<Path>,
        metadata: Arc<dyn Metadata>,
        forward_family: Family,
        inverted_family: Family,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let backend = KvMappingBackend::open(&path)?;

        let series_wal = match FileSeriesWal::open(path.join(WAL_PATH).join(SERIES_WAL_PATH)).await
        {
            Ok(wal) => wal,
            Err(err) => {
                // failed half-open, release the backend before bailing out
                if let Err(close_err) = backend.close() {
                    tracing::warn!(
                        path = %path.display(),
                        error = %close_err,
                        "close mapping backend failure after init error"
                    );
                }
                return Err(err);
            }
        };

        Self::new(
            path,
            metadata,
            forward_family,
            inverted_family,
            Box::new(backend),
            Box::new(series_wal),
            IndexDatabaseOptions::default(),
        )
        .await
    }

    /// new wires an index database from injected parts. Tests pass fakes for
    /// the backend and WAL; production uses [`IndexDatabase::open`].
    pub async fn new(
        path: impl AsRef<Path>,
        metadata: Arc<dyn Metadata>,
        forward_family: Family,
        inverted_family: Family,
        backend: Box<dyn IdMappingBackend>,
        series_wal: Box<dyn SeriesWal>,
        options: IndexDatabaseOptions,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = MappingState {
            backend,
            series_wal,
            metric_mappings: HashMap::new(),
            closed: false,
        };

        if state.series_wal.need_recovery() {
            if let Err(err) = series_recovery(&mut state).await {
                tracing::error!(
                    path = %path.display(),
                    error = %err,
                    "recover series wal failure when opening index database"
                );
            }
        }
        if state.series_wal.need_recovery() {
            if let Err(err) = state.backend.close() {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "close mapping backend failure after failed recovery"
                );
            }
            return Err(StoreError::NeedRecoveryWal.into());
        }

        let index = InvertedIndex::new(metadata.clone(), forward_family, inverted_family);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let state = Arc::new(RwLock::new(state));
        let handle = tokio::spawn(run_check_sync(
            state.clone(),
            options.sync_interval,
            shutdown_rx,
            path.display().to_string(),
        ));

        Ok(Self {
            path,
            metadata,
            index,
            state,
            shutdown_tx,
            check_sync_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// get_or_create_series_id returns the stable series ID of
    /// `(metric, tags hash)`, allocating and WAL-logging a new one on first
    /// sight. The bool is true iff this call created the ID.
    pub async fn get_or_create_series_id(
        &self,
        metric_id: u32,
        tags_hash: u64,
    ) -> anyhow::Result<(u32, bool)> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(StoreError::Closed.into());
        }

        if let Some(mapping) = state.metric_mappings.get(&metric_id) {
            if let Some(series_id) = mapping.get_series_id(tags_hash) {
                return Ok((series_id, false));
            }
        } else {
            // not cached yet, load from the backend
            match state.backend.load_metric_id_mapping(metric_id) {
                Ok(mapping) => {
                    state.metric_mappings.insert(metric_id, mapping);

                    // the mapping may be cached partially, probe the backend
                    // for this specific hash before allocating
                    match state.backend.get_series_id(metric_id, tags_hash) {
                        Ok(series_id) => {
                            state
                                .metric_mappings
                                .get_mut(&metric_id)
                                .expect("mapping just cached")
                                .add_series_id(tags_hash, series_id);
                            return Ok((series_id, false));
                        }
                        Err(err) if is_not_found(&err) => {}
                        Err(err) => return Err(err),
                    }
                }
                Err(err) if is_not_found(&err) => {
                    state
                        .metric_mappings
                        .insert(metric_id, MetricIdMapping::new(metric_id, 0));
                }
                Err(err) => return Err(err),
            }
        }

        let series_id = state
            .metric_mappings
            .get_mut(&metric_id)
            .expect("mapping cached above")
            .gen_series_id(tags_hash);

        if let Err(err) = state
            .series_wal
            .append(metric_id, tags_hash, series_id)
            .await
        {
            // the ID was never durable, roll the allocation back
            if let Some(mapping) = state.metric_mappings.get_mut(&metric_id) {
                mapping.remove_series_id(tags_hash);
            }
            return Err(err);
        }

        Ok((series_id, true))
    }

    /// get_series_ids_for_metric returns every series of the metric; for a
    /// metric without tag keys this is the tag-less sentinel `{0}`.
    pub fn get_series_ids_for_metric(
        &self,
        namespace: &str,
        metric_name: &str,
    ) -> anyhow::Result<RoaringBitmap> {
        let tags = self.metadata.get_all_tag_keys(namespace, metric_name)?;
        if tags.is_empty() {
            return Ok(RoaringBitmap::from_iter([SERIES_ID_WITHOUT_TAGS]));
        }

        let tag_key_ids: Vec<u32> = tags.iter().map(|tag| tag.id).collect();
        self.index.get_series_ids_for_tags(&tag_key_ids)
    }

    pub fn get_series_ids_for_tag(&self, tag_key_id: u32) -> anyhow::Result<RoaringBitmap> {
        self.index.get_series_ids_for_tag(tag_key_id)
    }

    pub fn get_series_ids_by_tag_value_ids(
        &self,
        tag_key_id: u32,
        tag_value_ids: &RoaringBitmap,
    ) -> anyhow::Result<RoaringBitmap> {
        self.index
            .get_series_ids_by_tag_value_ids(tag_key_id, tag_value_ids)
    }

    pub fn suggest_tag_values(
        &self,
        tag_key_id: u32,
        tag_value_prefix: &str,
        limit: usize,
    ) -> Vec<String> {
        self.metadata
            .suggest_tag_values(tag_key_id, tag_value_prefix, limit)
    }

    pub fn get_grouping_context(
        &self,
        tag_key_ids: &[u32],
        series_ids: &RoaringBitmap,
    ) -> anyhow::Result<GroupingContext> {
        self.index.get_grouping_context(tag_key_ids, series_ids)
    }

    /// build_invert_index indexes a series under every tag of the record;
    /// re-indexing an existing series is a no-op.
    pub fn build_invert_index(
        &self,
        namespace: &str,
        metric_name: &str,
        tags: &[KeyValue],
        series_id: u32,
    ) -> anyhow::Result<()> {
        self.index
            .build_invert_index(namespace, metric_name, tags, series_id)
    }

    /// flush syncs the series WAL and flushes the inverted index families.
    pub async fn flush(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(StoreError::Closed.into());
            }
            if let Err(err) = state.series_wal.sync().await {
                tracing::error!(
                    path = %self.path.display(),
                    error = %err,
                    "sync series wal failure when flushing index database"
                );
            }
        }
        self.index.flush()
    }

    /// close stops the background sync, then closes the WAL and backend and
    /// flushes the index. The sync task has drained before this returns.
    pub async fn close(&self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.check_sync_handle.lock().await.take() {
            let _ = handle.await;
        }

        let mut state = self.state.write().await;
        if state.closed {
            return Err(StoreError::Closed.into());
        }
        state.closed = true;

        if let Err(err) = state.series_wal.close().await {
            tracing::error!(
                path = %self.path.display(),
                error = %err,
                "close series wal failure when closing index database"
            );
        }
        state.backend.close()?;
        self.index.flush()
    }
}

/// background loop replaying pending WAL records into the backend
async fn run_check_sync(
    state: Arc<RwLock<MappingState>>,
    sync_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    path: String,
) {
    let mut ticker = tokio::time::interval(sync_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut state = state.write().await;
                if state.closed {
                    return;
                }
                if state.series_wal.need_recovery() {
                    if let Err(err) = series_recovery(&mut state).await {
                        tracing::error!(
                            path = %path,
                            error = %err,
                            "recover series wal failure in check sync"
                        );
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!(path = %path, "received shutdown, stopped check sync");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadb::MemoryMetadata;
    use metricdb_common::error::is_closed;
    use metricdb_storage::{FamilyOptions, KvStore};

    const METRIC_ID: u32 = 7;
    const TAGS_HASH: u64 = 0xDEAD;

    struct Fixture {
        _dir: tempfile::TempDir,
        metadata: Arc<MemoryMetadata>,
        store: KvStore,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let dir = tempfile::tempdir()?;
            let store = KvStore::open(dir.path().join("store"))?;
            Ok(Self {
                _dir: dir,
                metadata: Arc::new(MemoryMetadata::new("test")),
                store,
            })
        }

        fn index_path(&self) -> PathBuf {
            self._dir.path().join("index")
        }

        fn families(&self) -> anyhow::Result<(Family, Family)> {
            Ok((
                self.store.create_family("forward", FamilyOptions::default())?,
                self.store.create_family("inverted", FamilyOptions::default())?,
            ))
        }

        async fn open_db(&self) -> anyhow::Result<IndexDatabase> {
            let (forward, inverted) = self.families()?;
            IndexDatabase::open(self.index_path(), self.metadata.clone(), forward, inverted).await
        }
    }

    #[tokio::test]
    async fn test_get_or_create_series_id() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let db = fixture.open_db().await?;

        assert_eq!((1, true), db.get_or_create_series_id(METRIC_ID, TAGS_HASH).await?);
        assert_eq!(
            (1, false),
            db.get_or_create_series_id(METRIC_ID, TAGS_HASH).await?
        );

        // a second hash under the same metric gets the next ID
        assert_eq!((2, true), db.get_or_create_series_id(METRIC_ID, 0xBEEF).await?);
        // a different metric starts its own sequence
        assert_eq!((1, true), db.get_or_create_series_id(9, TAGS_HASH).await?);

        db.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_series_id_recovered_from_wal_after_restart() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        {
            let db = fixture.open_db().await?;
            assert_eq!(
                (1, true),
                db.get_or_create_series_id(METRIC_ID, TAGS_HASH).await?
            );
            // no flush: the allocation lives only in the WAL
            db.close().await?;
        }

        let db = fixture.open_db().await?;
        assert_eq!(
            (1, false),
            db.get_or_create_series_id(METRIC_ID, TAGS_HASH).await?
        );
        db.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_series_id_durable_after_flush_and_restart() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        {
            let db = fixture.open_db().await?;
            assert_eq!(
                (1, true),
                db.get_or_create_series_id(METRIC_ID, TAGS_HASH).await?
            );
            db.flush().await?;
            db.close().await?;
        }

        let db = fixture.open_db().await?;
        assert_eq!(
            (1, false),
            db.get_or_create_series_id(METRIC_ID, TAGS_HASH).await?
        );
        db.close().await?;
        Ok(())
    }

    /// in-memory WAL whose first append can be made to fail
    struct FlakyWal {
        records: Vec<(u32, u64, u32)>,
        fail_next_append: bool,
        closed: bool,
    }

    impl FlakyWal {
        fn new(fail_next_append: bool) -> Self {
            Self {
                records: Vec::new(),
                fail_next_append,
                closed: false,
            }
        }
    }

    #[async_trait]
    impl SeriesWal for FlakyWal {
        async fn append(
            &mut self,
            metric_id: u32,
            tags_hash: u64,
            series_id: u32,
        ) -> anyhow::Result<()> {
            if self.fail_next_append {
                self.fail_next_append = false;
                return Err(anyhow!("injected append failure"));
            }
            self.records.push((metric_id, tags_hash, series_id));
            Ok(())
        }

        async fn sync(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn recovery(
            &mut self,
            handler: &mut (dyn RecoveryHandler + Send),
        ) -> anyhow::Result<()> {
            for (metric_id, tags_hash, series_id) in self.records.clone() {
                handler.on_record(metric_id, tags_hash, series_id)?;
            }
            handler.on_batch_end()?;
            self.records.clear();
            Ok(())
        }

        fn need_recovery(&self) -> bool {
            !self.records.is_empty()
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            if self.closed {
                return Err(StoreError::Closed.into());
            }
            self.closed = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rollback_on_wal_append_failure() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let (forward, inverted) = fixture.families()?;
        let backend = KvMappingBackend::open(&fixture.index_path())?;
        let db = IndexDatabase::new(
            fixture.index_path(),
            fixture.metadata.clone(),
            forward,
            inverted,
            Box::new(backend),
            Box::new(FlakyWal::new(true)),
            IndexDatabaseOptions {
                sync_interval: Duration::from_secs(3600),
            },
        )
        .await?;

        assert!(db
            .get_or_create_series_id(METRIC_ID, TAGS_HASH)
            .await
            .is_err());

        // the failed ID was rolled back; the sequence stays monotonic, so
        // the retry allocates a fresh ID and keeps returning it
        assert_eq!(
            (2, true),
            db.get_or_create_series_id(METRIC_ID, TAGS_HASH).await?
        );
        assert_eq!(
            (2, false),
            db.get_or_create_series_id(METRIC_ID, TAGS_HASH).await?
        );

        db.close().await?;
        Ok(())
    }

    /// backend handle shared with the test so it can observe syncs
    struct SharedBackend(Arc<KvMappingBackend>);

    impl IdMappingBackend for SharedBackend {
        fn load_metric_id_mapping(&self, metric_id: u32) -> anyhow::Result<MetricIdMapping> {
            self.0.load_metric_id_mapping(metric_id)
        }

        fn get_series_id(&self, metric_id: u32, tags_hash: u64) -> anyhow::Result<u32> {
            self.0.get_series_id(metric_id, tags_hash)
        }

        fn save_mapping(&self, event: &MappingEvent) -> anyhow::Result<()> {
            self.0.save_mapping(event)
        }

        fn close(&self) -> anyhow::Result<()> {
            self.0.close()
        }
    }

    #[tokio::test]
    async fn test_check_sync_replays_wal_into_backend() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let (forward, inverted) = fixture.families()?;
        let backend = Arc::new(KvMappingBackend::open(&fixture.index_path())?);
        let series_wal =
            FileSeriesWal::open(fixture.index_path().join(WAL_PATH).join(SERIES_WAL_PATH)).await?;

        let db = IndexDatabase::new(
            fixture.index_path(),
            fixture.metadata.clone(),
            forward,
            inverted,
            Box::new(SharedBackend(backend.clone())),
            Box::new(series_wal),
            IndexDatabaseOptions {
                sync_interval: Duration::from_millis(50),
            },
        )
        .await?;

        assert_eq!(
            (1, true),
            db.get_or_create_series_id(METRIC_ID, TAGS_HASH).await?
        );
        assert!(is_not_found(
            &backend.get_series_id(METRIC_ID, TAGS_HASH).unwrap_err()
        ));

        // the background sync must land the mapping in the backend
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match backend.get_series_id(METRIC_ID, TAGS_HASH) {
                Ok(series_id) => {
                    assert_eq!(1, series_id);
                    break;
                }
                Err(err) if is_not_found(&err) => {
                    assert!(
                        tokio::time::Instant::now() < deadline,
                        "check sync never replayed the wal"
                    );
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(err) => return Err(err),
            }
        }

        db.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_tags_sentinel() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let db = fixture.open_db().await?;

        let ids = db.get_series_ids_for_metric("ns", "uptime")?;
        assert_eq!(
            vec![SERIES_ID_WITHOUT_TAGS],
            ids.iter().collect::<Vec<u32>>()
        );

        db.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_index_queries_through_db() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let db = fixture.open_db().await?;

        let tags = vec![KeyValue::new("host", "h-1")];
        let (series_id, _) = db.get_or_create_series_id(METRIC_ID, TAGS_HASH).await?;
        db.build_invert_index("ns", "cpu", &tags, series_id)?;

        let ids = db.get_series_ids_for_metric("ns", "cpu")?;
        assert_eq!(vec![series_id], ids.iter().collect::<Vec<u32>>());

        assert_eq!(
            vec!["h-1"],
            db.suggest_tag_values(
                fixture.metadata.gen_tag_key_id("ns", "cpu", "host")?,
                "h",
                10
            )
        );

        db.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_database() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let db = fixture.open_db().await?;
        db.close().await?;

        let err = db
            .get_or_create_series_id(METRIC_ID, TAGS_HASH)
            .await
            .unwrap_err();
        assert!(is_closed(&err));
        assert!(is_closed(&db.flush().await.unwrap_err()));
        assert!(is_closed(&db.close().await.unwrap_err()));
        Ok(())
    }
}

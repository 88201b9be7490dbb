use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use metricdb_common::time::Interval;
use metricdb_storage::{FamilyOptions, KvStore};

use crate::engine::interval_segment::{new_interval_segment, IntervalSegment};
use crate::indexdb::IndexDatabase;
use crate::metadb::Metadata;
use crate::series::{
    sanitize_metric_name, sanitize_namespace, MetricRecord, SERIES_ID_WITHOUT_TAGS,
};

pub type ShardId = u32;

pub(crate) const SEGMENT_DIR: &str = "segment";
pub(crate) const INDEX_DIR: &str = "index";
pub(crate) const INDEX_STORE_DIR: &str = "store";

const FORWARD_INDEX_FAMILY: &str = "forward";
const INVERTED_INDEX_FAMILY: &str = "inverted";

/// ShardContext is the opaque parent handle passed down to segments; it
/// only answers identity questions, never reaches back into the shard.
#[derive(Debug)]
pub struct ShardContext {
    pub database: String,
    pub shard_id: ShardId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardOptions {
    pub interval: Interval,
}

/// Shard owns one slice of a database: its index database and its
/// interval-segmented data store.
pub struct Shard {
    ctx: Arc<ShardContext>,
    path: PathBuf,
    metadata: Arc<dyn Metadata>,
    index_store: KvStore,
    index_db: IndexDatabase,
    segment: IntervalSegment,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("ctx", &self.ctx)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// new_shard opens a shard under `path`, wiring the index database with its
/// forward/inverted families and reloading existing segments.
pub(crate) async fn new_shard(
    database: &str,
    shard_id: ShardId,
    path: PathBuf,
    metadata: Arc<dyn Metadata>,
    options: ShardOptions,
) -> anyhow::Result<Shard> {
    let ctx = Arc::new(ShardContext {
        database: database.to_string(),
        shard_id,
    });

    let index_path = path.join(INDEX_DIR);
    let index_store = KvStore::open(index_path.join(INDEX_STORE_DIR))?;
    let forward_family = index_store.create_family(FORWARD_INDEX_FAMILY, FamilyOptions::default())?;
    let inverted_family =
        index_store.create_family(INVERTED_INDEX_FAMILY, FamilyOptions::default())?;

    let index_db = match IndexDatabase::open(
        &index_path,
        metadata.clone(),
        forward_family,
        inverted_family,
    )
    .await
    {
        Ok(db) => db,
        Err(err) => {
            if let Err(close_err) = index_store.close() {
                tracing::warn!(
                    database,
                    shard_id,
                    error = %close_err,
                    "close index store failure after index database init error"
                );
            }
            return Err(err);
        }
    };

    let segment_path = path.join(SEGMENT_DIR).join(options.interval.name());
    let segment = match new_interval_segment(ctx.clone(), options.interval, segment_path) {
        Ok(segment) => segment,
        Err(err) => {
            if let Err(close_err) = index_db.close().await {
                tracing::warn!(
                    database,
                    shard_id,
                    error = %close_err,
                    "close index database failure after segment init error"
                );
            }
            if let Err(close_err) = index_store.close() {
                tracing::warn!(
                    database,
                    shard_id,
                    error = %close_err,
                    "close index store failure after segment init error"
                );
            }
            return Err(err);
        }
    };

    tracing::info!(database, shard_id, path = %path.display(), "opened shard");

    Ok(Shard {
        ctx,
        path,
        metadata,
        index_store,
        index_db,
        segment,
    })
}

impl Shard {
    pub fn database(&self) -> &str {
        &self.ctx.database
    }

    pub fn shard_id(&self) -> ShardId {
        self.ctx.shard_id
    }

    pub fn index_database(&self) -> &IndexDatabase {
        &self.index_db
    }

    pub fn interval_segment(&self) -> &IntervalSegment {
        &self.segment
    }

    /// write_record runs the full write path: sanitise names, resolve the
    /// metric ID, allocate (or look up) the series ID, build the inverted
    /// index and store the field payload in the timestamp's data family.
    pub async fn write_record(&self, record: &MetricRecord) -> anyhow::Result<()> {
        let namespace = sanitize_namespace(&record.namespace);
        let metric_name = sanitize_metric_name(&record.name);
        let metric_id = self.metadata.gen_metric_id(&namespace, &metric_name)?;

        let series_id = if record.tags.is_empty() {
            SERIES_ID_WITHOUT_TAGS
        } else {
            let (series_id, _created) = self
                .index_db
                .get_or_create_series_id(metric_id, record.tags_hash())
                .await?;

            // the series id is durable once allocated; an indexing failure
            // must not fail the write
            if let Err(err) =
                self.index_db
                    .build_invert_index(&namespace, &metric_name, &record.tags, series_id)
            {
                tracing::warn!(
                    database = %self.ctx.database,
                    shard_id = self.ctx.shard_id,
                    metric = %metric_name,
                    error = %err,
                    "build inverted index failure"
                );
            }
            series_id
        };

        let segment = self
            .segment
            .get_or_create_segment_by_timestamp(record.timestamp)?;
        let family = segment.get_or_create_data_family(record.timestamp)?;

        let payload = record.encode_fields()?;
        family.write(series_id, record.timestamp, &payload)
    }

    /// flush persists the index database and every open segment.
    pub async fn flush(&self) -> anyhow::Result<()> {
        self.index_db.flush().await?;
        self.segment.flush()
    }

    /// close closes index database, segments and the index store, reporting
    /// the first failure after trying all of them.
    pub async fn close(&self) -> anyhow::Result<()> {
        let mut first_err = None;

        if let Err(err) = self.index_db.close().await {
            tracing::error!(
                database = %self.ctx.database,
                shard_id = self.ctx.shard_id,
                error = %err,
                "close index database failure"
            );
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.segment.close() {
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.index_store.close() {
            first_err.get_or_insert(err);
        }

        tracing::info!(
            database = %self.ctx.database,
            shard_id = self.ctx.shard_id,
            path = %self.path.display(),
            "closed shard"
        );

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

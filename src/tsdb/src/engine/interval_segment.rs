use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use metricdb_common::time::Interval;
use metricdb_utils::time as timeutil;

use crate::engine::segment::{new_segment, Segment};
use crate::engine::shard::ShardContext;

/// IntervalSegment partitions a shard's data into per-day segments for one
/// write interval. Date keys partition time disjointly.
pub struct IntervalSegment {
    ctx: Arc<ShardContext>,
    interval: Interval,
    path: PathBuf,
    segments: DashMap<String, Arc<Segment>>,
}

/// new_interval_segment opens the interval directory and reloads every
/// segment already on disk.
pub(crate) fn new_interval_segment(
    ctx: Arc<ShardContext>,
    interval: Interval,
    path: PathBuf,
) -> anyhow::Result<IntervalSegment> {
    std::fs::create_dir_all(&path)?;

    let interval_segment = IntervalSegment {
        ctx,
        interval,
        path,
        segments: DashMap::new(),
    };

    for entry in std::fs::read_dir(&interval_segment.path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let date_key = entry.file_name().to_string_lossy().to_string();
        interval_segment.get_or_create_segment(&date_key)?;
    }

    Ok(interval_segment)
}

impl IntervalSegment {
    /// get_or_create_segment returns the segment of one date key, opening it
    /// on first use. Invalid date keys fail before touching the disk.
    pub fn get_or_create_segment(&self, date_key: &str) -> anyhow::Result<Arc<Segment>> {
        if let Some(segment) = self.segments.get(date_key) {
            return Ok(segment.clone());
        }

        timeutil::parse_date_key(date_key)?;

        match self.segments.entry(date_key.to_string()) {
            Entry::Occupied(occupied) => Ok(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let segment = Arc::new(new_segment(
                    self.ctx.clone(),
                    date_key,
                    self.interval,
                    &self.path.join(date_key),
                )?);
                vacant.insert(segment.clone());
                Ok(segment)
            }
        }
    }

    /// get_or_create_segment_by_timestamp resolves the UTC day of the
    /// timestamp and delegates.
    pub fn get_or_create_segment_by_timestamp(&self, timestamp: i64) -> anyhow::Result<Arc<Segment>> {
        let date_key = timeutil::format_date_key(timestamp)?;
        self.get_or_create_segment(&date_key)
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        let mut first_err = None;
        for entry in self.segments.iter() {
            if let Err(err) = entry.value().flush() {
                tracing::error!(
                    database = %self.ctx.database,
                    shard_id = self.ctx.shard_id,
                    date_key = %entry.key(),
                    error = %err,
                    "flush segment failure"
                );
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// close closes every segment, reporting the first failure after trying
    /// all of them.
    pub fn close(&self) -> anyhow::Result<()> {
        let mut first_err = None;
        for entry in self.segments.iter() {
            if let Err(err) = entry.value().close() {
                tracing::error!(
                    database = %self.ctx.database,
                    shard_id = self.ctx.shard_id,
                    date_key = %entry.key(),
                    error = %err,
                    "close segment failure"
                );
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

use std::path::Path;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use metricdb_common::error::StoreError;
use metricdb_common::time::{Interval, TimeRange, ONE_DAY, ONE_HOUR};
use metricdb_storage::{FamilyOptions, KvStore};
use metricdb_utils::time as timeutil;

use crate::engine::data_family::DataFamily;
use crate::engine::shard::ShardContext;

/// width of one data family window
pub(crate) const FAMILY_SPAN: i64 = ONE_HOUR;
pub(crate) const SLOTS_PER_SEGMENT: i64 = ONE_DAY / FAMILY_SPAN;

/// FamilySlot tracks one hour slot of a segment. `Pending` marks a family
/// found on disk but not materialised yet; `Corrupt` marks a slot whose
/// family failed to open and surfaces as NotFound to callers.
pub(crate) enum FamilySlot {
    Pending,
    Ready(Arc<DataFamily>),
    Corrupt,
}

/// parse_family_slot validates a family directory name as a slot index.
pub(crate) fn parse_family_slot(name: &str) -> anyhow::Result<u32> {
    match name.parse::<u32>() {
        Ok(slot) if (slot as i64) < SLOTS_PER_SEGMENT => Ok(slot),
        _ => Err(StoreError::InvalidFamilyName(name.to_string()).into()),
    }
}

/// Segment holds one day of shard data inside a kv store, split into
/// per-hour data families.
pub struct Segment {
    ctx: Arc<ShardContext>,
    date_key: String,
    base_timestamp: i64,
    interval: Interval,
    store: KvStore,
    families: DashMap<u32, FamilySlot>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("date_key", &self.date_key)
            .field("base_timestamp", &self.base_timestamp)
            .finish_non_exhaustive()
    }
}

/// new_segment opens (or creates) the kv store of one day and reconstructs
/// its slot map from the family names on disk. A non-integer family name is
/// corruption: the store is closed and the segment refuses to open.
pub(crate) fn new_segment(
    ctx: Arc<ShardContext>,
    date_key: &str,
    interval: Interval,
    path: &Path,
) -> anyhow::Result<Segment> {
    let base_timestamp = timeutil::parse_date_key(date_key)?;
    let store = KvStore::open(path)?;

    let families = DashMap::new();
    for name in store.list_family_names()? {
        match parse_family_slot(&name) {
            Ok(slot) => {
                families.insert(slot, FamilySlot::Pending);
            }
            Err(err) => {
                if let Err(close_err) = store.close() {
                    tracing::warn!(
                        database = %ctx.database,
                        shard_id = ctx.shard_id,
                        date_key,
                        error = %close_err,
                        "close kv store failure after invalid family name"
                    );
                }
                return Err(err);
            }
        }
    }

    tracing::debug!(
        database = %ctx.database,
        shard_id = ctx.shard_id,
        date_key,
        families = families.len(),
        "opened segment"
    );

    Ok(Segment {
        ctx,
        date_key: date_key.to_string(),
        base_timestamp,
        interval,
        store,
        families,
    })
}

impl Segment {
    pub fn date_key(&self) -> &str {
        &self.date_key
    }

    pub fn base_timestamp(&self) -> i64 {
        self.base_timestamp
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// get_or_create_data_family returns the family covering `timestamp`,
    /// creating its kv family on first use. Initialisation happens at most
    /// once per slot; concurrent callers block on the slot entry.
    pub fn get_or_create_data_family(&self, timestamp: i64) -> anyhow::Result<Arc<DataFamily>> {
        let day = TimeRange::new(self.base_timestamp, self.base_timestamp + ONE_DAY - 1);
        if !day.contains(timestamp) {
            return Err(StoreError::TimestampOutOfRange {
                timestamp,
                start: day.start,
                end: day.end,
            }
            .into());
        }

        let slot = ((timestamp - self.base_timestamp) / FAMILY_SPAN) as u32;
        match self.families.entry(slot) {
            Entry::Occupied(mut occupied) => {
                match occupied.get() {
                    FamilySlot::Ready(family) => return Ok(family.clone()),
                    FamilySlot::Corrupt => return Err(StoreError::NotFound.into()),
                    FamilySlot::Pending => {}
                }

                match self.create_family(slot) {
                    Ok(family) => {
                        occupied.insert(FamilySlot::Ready(family.clone()));
                        Ok(family)
                    }
                    Err(err) => {
                        occupied.insert(FamilySlot::Corrupt);
                        Err(err)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let family = self.create_family(slot)?;
                vacant.insert(FamilySlot::Ready(family.clone()));
                Ok(family)
            }
        }
    }

    fn create_family(&self, slot: u32) -> anyhow::Result<Arc<DataFamily>> {
        let family = self
            .store
            .create_family(&slot.to_string(), FamilyOptions::default())?;
        let start = self.base_timestamp + slot as i64 * FAMILY_SPAN;
        let time_range = TimeRange::new(start, start + FAMILY_SPAN - 1);
        Ok(Arc::new(DataFamily::new(time_range, family)))
    }

    /// flush persists the segment's kv store.
    pub fn flush(&self) -> anyhow::Result<()> {
        self.store.persist()
    }

    /// close closes the underlying kv store; open family handles cascade.
    pub fn close(&self) -> anyhow::Result<()> {
        self.store.close()
    }

    #[cfg(test)]
    pub(crate) fn inject_family_slot(&self, slot: u32, value: FamilySlot) {
        self.families.insert(slot, value);
    }
}

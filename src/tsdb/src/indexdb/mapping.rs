use std::collections::HashMap;

/// number of tuples a mapping event batches before it is flushed
pub(crate) const MAPPING_EVENT_CAPACITY: usize = 4096;

/// MetricIdMapping is the in-memory series allocator of one metric.
///
/// `sequence` is the highest allocated series ID (0 = none allocated yet);
/// series ID 0 stays reserved for the tag-less sentinel.
#[derive(Debug)]
pub struct MetricIdMapping {
    metric_id: u32,
    sequence: u32,
    hash_to_id: HashMap<u64, u32>,
}

impl MetricIdMapping {
    pub fn new(metric_id: u32, sequence: u32) -> Self {
        Self {
            metric_id,
            sequence,
            hash_to_id: HashMap::new(),
        }
    }

    pub fn with_state(metric_id: u32, sequence: u32, hash_to_id: HashMap<u64, u32>) -> Self {
        Self {
            metric_id,
            sequence,
            hash_to_id,
        }
    }

    pub fn metric_id(&self) -> u32 {
        self.metric_id
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn get_series_id(&self, tags_hash: u64) -> Option<u32> {
        self.hash_to_id.get(&tags_hash).copied()
    }

    /// add_series_id caches a series ID loaded from the backend.
    pub fn add_series_id(&mut self, tags_hash: u64, series_id: u32) {
        self.hash_to_id.insert(tags_hash, series_id);
        if series_id > self.sequence {
            self.sequence = series_id;
        }
    }

    /// gen_series_id allocates the next series ID for a new tags hash.
    pub fn gen_series_id(&mut self, tags_hash: u64) -> u32 {
        self.sequence += 1;
        self.hash_to_id.insert(tags_hash, self.sequence);
        self.sequence
    }

    /// remove_series_id rolls an allocation back after a WAL append failure.
    /// The sequence stays monotonic; the ID is simply never observed.
    pub fn remove_series_id(&mut self, tags_hash: u64) {
        self.hash_to_id.remove(&tags_hash);
    }
}

/// MappingEvent is a bounded batch of allocation tuples flushed to the
/// backend in one atomic write.
#[derive(Debug, Default)]
pub struct MappingEvent {
    events: HashMap<u32, Vec<(u64, u32)>>,
    len: usize,
}

impl MappingEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_series_id(&mut self, metric_id: u32, tags_hash: u64, series_id: u32) {
        self.events
            .entry(metric_id)
            .or_default()
            .push((tags_hash, series_id));
        self.len += 1;
    }

    pub fn is_full(&self) -> bool {
        self.len >= MAPPING_EVENT_CAPACITY
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// iter yields `(metric_id, tuples)` per metric in the batch.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[(u64, u32)])> {
        self.events
            .iter()
            .map(|(metric_id, tuples)| (*metric_id, tuples.as_slice()))
    }
}

use bytes::Buf;

use metricdb_common::error::StoreError;
use metricdb_common::time::TimeRange;
use metricdb_storage::Family;

/// DataFamily is one sub-window of a segment, backed by a kv family named
/// after its slot. The time range is fixed at creation; writes outside it
/// are rejected.
pub struct DataFamily {
    time_range: TimeRange,
    family: Family,
}

impl std::fmt::Debug for DataFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFamily")
            .field("time_range", &self.time_range)
            .finish_non_exhaustive()
    }
}

impl DataFamily {
    pub(crate) fn new(time_range: TimeRange, family: Family) -> Self {
        Self { time_range, family }
    }

    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    /// write stores one measurement payload under `(series, timestamp)`.
    pub fn write(&self, series_id: u32, timestamp: i64, payload: &[u8]) -> anyhow::Result<()> {
        if !self.time_range.contains(timestamp) {
            return Err(StoreError::TimestampOutOfRange {
                timestamp,
                start: self.time_range.start,
                end: self.time_range.end,
            }
            .into());
        }

        self.family.put(point_key(series_id, timestamp), payload)
    }

    /// scan returns the series' points inside this family in time order.
    pub fn scan(&self, series_id: u32) -> anyhow::Result<Vec<(i64, Vec<u8>)>> {
        let mut points = Vec::new();
        for (key, value) in self.family.prefix(series_id.to_be_bytes())? {
            if key.len() != 12 {
                return Err(anyhow!("invalid point key length: {}", key.len()));
            }
            let mut ts_bytes = &key[4..];
            points.push((ts_bytes.get_i64(), value));
        }
        Ok(points)
    }
}

fn point_key(series_id: u32, timestamp: i64) -> [u8; 12] {
    let mut key = [0_u8; 12];
    key[..4].copy_from_slice(&series_id.to_be_bytes());
    key[4..].copy_from_slice(&timestamp.to_be_bytes());
    key
}

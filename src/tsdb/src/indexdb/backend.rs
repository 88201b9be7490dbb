use std::collections::HashMap;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

use metricdb_common::error::StoreError;
use metricdb_storage::{Family, FamilyOptions, KvStore};

use crate::indexdb::mapping::{MappingEvent, MetricIdMapping};

/// directory under the index root holding the backend store
pub(crate) const BACKEND_PATH: &str = "backend";

const MAPPING_FAMILY: &str = "mapping";
const SERIES_FAMILY: &str = "series";

/// IdMappingBackend durably stores per-metric series allocator state and
/// the `tags hash -> series id` map.
pub trait IdMappingBackend: Send + Sync {
    /// load_metric_id_mapping fetches the complete mapping of one metric;
    /// NotFound if the metric has never been persisted.
    fn load_metric_id_mapping(&self, metric_id: u32) -> anyhow::Result<MetricIdMapping>;

    /// get_series_id fetches one series ID; NotFound if absent.
    fn get_series_id(&self, metric_id: u32, tags_hash: u64) -> anyhow::Result<u32>;

    /// save_mapping atomically applies a batch of allocation tuples and
    /// advances each metric's persisted sequence.
    fn save_mapping(&self, event: &MappingEvent) -> anyhow::Result<()>;

    fn close(&self) -> anyhow::Result<()>;
}

/// KvMappingBackend keeps mappings in two kv families:
/// `mapping`: metric id -> highest allocated series id,
/// `series`:  metric id + tags hash -> series id.
pub struct KvMappingBackend {
    store: KvStore,
    mapping_family: Family,
    series_family: Family,
}

impl KvMappingBackend {
    pub fn open(index_path: &Path) -> anyhow::Result<Self> {
        let store = KvStore::open(index_path.join(BACKEND_PATH))?;
        let mapping_family = store.create_family(MAPPING_FAMILY, FamilyOptions::default())?;
        let series_family = store.create_family(SERIES_FAMILY, FamilyOptions::default())?;
        Ok(Self {
            store,
            mapping_family,
            series_family,
        })
    }
}

fn metric_key(metric_id: u32) -> [u8; 4] {
    metric_id.to_be_bytes()
}

fn series_key(metric_id: u32, tags_hash: u64) -> [u8; 12] {
    let mut key = [0_u8; 12];
    key[..4].copy_from_slice(&metric_id.to_be_bytes());
    key[4..].copy_from_slice(&tags_hash.to_be_bytes());
    key
}

fn decode_u32(value: &[u8]) -> anyhow::Result<u32> {
    if value.len() != 4 {
        return Err(anyhow!("invalid u32 value length: {}", value.len()));
    }
    let mut buf = value;
    Ok(buf.get_u32())
}

impl IdMappingBackend for KvMappingBackend {
    fn load_metric_id_mapping(&self, metric_id: u32) -> anyhow::Result<MetricIdMapping> {
        let sequence = match self.mapping_family.get(metric_key(metric_id))? {
            Some(value) => decode_u32(&value)?,
            None => return Err(StoreError::NotFound.into()),
        };

        let mut hash_to_id = HashMap::new();
        for (key, value) in self.series_family.prefix(metric_key(metric_id))? {
            if key.len() != 12 {
                return Err(anyhow!("invalid series key length: {}", key.len()));
            }
            let mut hash_bytes = &key[4..];
            let tags_hash = hash_bytes.get_u64();
            hash_to_id.insert(tags_hash, decode_u32(&value)?);
        }

        Ok(MetricIdMapping::with_state(metric_id, sequence, hash_to_id))
    }

    fn get_series_id(&self, metric_id: u32, tags_hash: u64) -> anyhow::Result<u32> {
        match self.series_family.get(series_key(metric_id, tags_hash))? {
            Some(value) => decode_u32(&value),
            None => Err(StoreError::NotFound.into()),
        }
    }

    fn save_mapping(&self, event: &MappingEvent) -> anyhow::Result<()> {
        let mut batch = self.store.write_batch()?;

        for (metric_id, tuples) in event.iter() {
            let mut sequence = match self.mapping_family.get(metric_key(metric_id))? {
                Some(value) => decode_u32(&value)?,
                None => 0,
            };

            for (tags_hash, series_id) in tuples {
                let mut value = BytesMut::with_capacity(4);
                value.put_u32(*series_id);
                batch.put(&self.series_family, series_key(metric_id, *tags_hash), value);
                sequence = sequence.max(*series_id);
            }

            let mut value = BytesMut::with_capacity(4);
            value.put_u32(sequence);
            batch.put(&self.mapping_family, metric_key(metric_id), value);
        }

        batch.commit()?;
        self.store.persist()?;
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        self.store.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metricdb_common::error::is_not_found;

    #[test]
    fn test_save_and_load_mapping() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = KvMappingBackend::open(dir.path())?;

        let err = backend.load_metric_id_mapping(7).unwrap_err();
        assert!(is_not_found(&err));
        let err = backend.get_series_id(7, 0xDEAD).unwrap_err();
        assert!(is_not_found(&err));

        let mut event = MappingEvent::new();
        event.add_series_id(7, 0xDEAD, 1);
        event.add_series_id(7, 0xBEEF, 2);
        event.add_series_id(9, 0xCAFE, 1);
        backend.save_mapping(&event)?;

        let mapping = backend.load_metric_id_mapping(7)?;
        assert_eq!(7, mapping.metric_id());
        assert_eq!(2, mapping.sequence());
        assert_eq!(Some(1), mapping.get_series_id(0xDEAD));
        assert_eq!(Some(2), mapping.get_series_id(0xBEEF));
        assert_eq!(None, mapping.get_series_id(0xCAFE));

        assert_eq!(1, backend.get_series_id(9, 0xCAFE)?);
        let err = backend.get_series_id(9, 0xDEAD).unwrap_err();
        assert!(is_not_found(&err));
        Ok(())
    }

    #[test]
    fn test_sequence_stays_monotonic() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = KvMappingBackend::open(dir.path())?;

        let mut event = MappingEvent::new();
        event.add_series_id(7, 0xDEAD, 5);
        backend.save_mapping(&event)?;

        // replaying an older tuple must not move the sequence backwards
        let mut event = MappingEvent::new();
        event.add_series_id(7, 0xBEEF, 2);
        backend.save_mapping(&event)?;

        let mapping = backend.load_metric_id_mapping(7)?;
        assert_eq!(5, mapping.sequence());
        Ok(())
    }

    #[test]
    fn test_reopen_keeps_mappings() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let backend = KvMappingBackend::open(dir.path())?;
            let mut event = MappingEvent::new();
            event.add_series_id(7, 0xDEAD, 1);
            backend.save_mapping(&event)?;
            backend.close()?;
        }

        let backend = KvMappingBackend::open(dir.path())?;
        assert_eq!(1, backend.get_series_id(7, 0xDEAD)?);
        Ok(())
    }
}

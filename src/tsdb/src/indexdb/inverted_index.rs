use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use roaring::RoaringBitmap;

use metricdb_storage::Family;

use crate::indexdb::grouping::GroupingContext;
use crate::metadb::Metadata;
use crate::series::KeyValue;

/// InvertedIndex maps tag identifiers to series-ID bitmaps.
///
/// Two persisted families back it: `forward` (tag key -> every series
/// carrying that key) and `inverted` (tag key + tag value -> series).
/// New entries accumulate in a write-behind buffer merged by [`flush`];
/// readers union the persisted bitmap with a snapshot of the buffer, so a
/// query sees consistent state without blocking writers.
///
/// [`flush`]: InvertedIndex::flush
pub struct InvertedIndex {
    metadata: Arc<dyn Metadata>,
    forward_family: Family,
    inverted_family: Family,
    buffer: RwLock<IndexBuffer>,
}

#[derive(Default)]
struct IndexBuffer {
    /// tag key id -> series ids
    forward: HashMap<u32, RoaringBitmap>,
    /// tag key id -> tag value id -> series ids
    inverted: HashMap<u32, BTreeMap<u32, RoaringBitmap>>,
}

impl IndexBuffer {
    fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.inverted.is_empty()
    }

    fn merge(&mut self, other: IndexBuffer) {
        for (tag_key_id, bitmap) in other.forward {
            *self.forward.entry(tag_key_id).or_default() |= bitmap;
        }
        for (tag_key_id, values) in other.inverted {
            let slot = self.inverted.entry(tag_key_id).or_default();
            for (tag_value_id, bitmap) in values {
                *slot.entry(tag_value_id).or_default() |= bitmap;
            }
        }
    }
}

fn forward_key(tag_key_id: u32) -> [u8; 4] {
    tag_key_id.to_be_bytes()
}

/// tag_key_prefix covers every inverted key of one tag key; it must stay
/// the first four bytes of [`inverted_key`].
fn tag_key_prefix(tag_key_id: u32) -> [u8; 4] {
    tag_key_id.to_be_bytes()
}

fn inverted_key(tag_key_id: u32, tag_value_id: u32) -> [u8; 8] {
    let mut key = [0_u8; 8];
    key[..4].copy_from_slice(&tag_key_prefix(tag_key_id));
    key[4..].copy_from_slice(&tag_value_id.to_be_bytes());
    key
}

fn encode_bitmap(bitmap: &RoaringBitmap) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(bitmap.serialized_size());
    bitmap.serialize_into(&mut buf)?;
    Ok(buf)
}

fn decode_bitmap(value: &[u8]) -> anyhow::Result<RoaringBitmap> {
    Ok(RoaringBitmap::deserialize_from(value)?)
}

fn load_bitmap(family: &Family, key: &[u8]) -> anyhow::Result<Option<RoaringBitmap>> {
    match family.get(key)? {
        Some(value) => Ok(Some(decode_bitmap(&value)?)),
        None => Ok(None),
    }
}

impl InvertedIndex {
    pub fn new(metadata: Arc<dyn Metadata>, forward_family: Family, inverted_family: Family) -> Self {
        Self {
            metadata,
            forward_family,
            inverted_family,
            buffer: RwLock::new(IndexBuffer::default()),
        }
    }

    /// build_invert_index registers a series under every tag of the record.
    /// Inserting an already-present series is a no-op.
    pub fn build_invert_index(
        &self,
        namespace: &str,
        metric_name: &str,
        tags: &[KeyValue],
        series_id: u32,
    ) -> anyhow::Result<()> {
        for kv in tags {
            let tag_key_id = self
                .metadata
                .gen_tag_key_id(namespace, metric_name, &kv.key)?;
            let tag_value_id = self.metadata.gen_tag_value_id(tag_key_id, &kv.value)?;

            let mut buffer = self.buffer.write().expect("index buffer lock poisoned");
            buffer
                .forward
                .entry(tag_key_id)
                .or_default()
                .insert(series_id);
            buffer
                .inverted
                .entry(tag_key_id)
                .or_default()
                .entry(tag_value_id)
                .or_default()
                .insert(series_id);
        }
        Ok(())
    }

    /// get_series_ids_for_tag returns every series carrying the tag key.
    pub fn get_series_ids_for_tag(&self, tag_key_id: u32) -> anyhow::Result<RoaringBitmap> {
        let mut result = load_bitmap(&self.forward_family, &forward_key(tag_key_id))?
            .unwrap_or_default();

        let buffer = self.buffer.read().expect("index buffer lock poisoned");
        if let Some(bitmap) = buffer.forward.get(&tag_key_id) {
            result |= bitmap;
        }
        Ok(result)
    }

    /// get_series_ids_for_tags unions the series of all given tag keys.
    pub fn get_series_ids_for_tags(&self, tag_key_ids: &[u32]) -> anyhow::Result<RoaringBitmap> {
        let mut result = RoaringBitmap::new();
        for tag_key_id in tag_key_ids {
            result |= self.get_series_ids_for_tag(*tag_key_id)?;
        }
        Ok(result)
    }

    /// get_series_ids_by_tag_value_ids unions the series of the given tag
    /// values, restricted to the universe under the tag key.
    pub fn get_series_ids_by_tag_value_ids(
        &self,
        tag_key_id: u32,
        tag_value_ids: &RoaringBitmap,
    ) -> anyhow::Result<RoaringBitmap> {
        let mut result = RoaringBitmap::new();
        {
            let buffer = self.buffer.read().expect("index buffer lock poisoned");
            for tag_value_id in tag_value_ids.iter() {
                if let Some(bitmap) =
                    load_bitmap(&self.inverted_family, &inverted_key(tag_key_id, tag_value_id))?
                {
                    result |= bitmap;
                }
                if let Some(bitmap) = buffer
                    .inverted
                    .get(&tag_key_id)
                    .and_then(|values| values.get(&tag_value_id))
                {
                    result |= bitmap;
                }
            }
        }

        result &= self.get_series_ids_for_tag(tag_key_id)?;
        Ok(result)
    }

    /// get_grouping_context builds the read-only per-series tag value lookup
    /// for the requested tag keys, restricted to candidate series.
    pub fn get_grouping_context(
        &self,
        tag_key_ids: &[u32],
        series_ids: &RoaringBitmap,
    ) -> anyhow::Result<GroupingContext> {
        let buffer = self.buffer.read().expect("index buffer lock poisoned");

        let mut scanners = Vec::with_capacity(tag_key_ids.len());
        for tag_key_id in tag_key_ids {
            let mut values: BTreeMap<u32, RoaringBitmap> = BTreeMap::new();

            for (key, value) in self.inverted_family.prefix(tag_key_prefix(*tag_key_id))? {
                if key.len() != 8 {
                    return Err(anyhow!("invalid inverted key length: {}", key.len()));
                }
                let tag_value_id = u32::from_be_bytes([key[4], key[5], key[6], key[7]]);
                let bitmap = decode_bitmap(&value)? & series_ids;
                if !bitmap.is_empty() {
                    *values.entry(tag_value_id).or_default() |= bitmap;
                }
            }

            if let Some(buffered) = buffer.inverted.get(tag_key_id) {
                for (tag_value_id, bitmap) in buffered {
                    let bitmap = bitmap.clone() & series_ids;
                    if !bitmap.is_empty() {
                        *values.entry(*tag_value_id).or_default() |= bitmap;
                    }
                }
            }

            scanners.push(values.into_iter().collect());
        }

        Ok(GroupingContext::new(
            tag_key_ids.to_vec(),
            series_ids.clone(),
            scanners,
        ))
    }

    /// flush merges the write-behind buffer into the persisted families.
    /// On failure the buffered entries are kept for the next attempt.
    pub fn flush(&self) -> anyhow::Result<()> {
        let snapshot = {
            let mut buffer = self.buffer.write().expect("index buffer lock poisoned");
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };

        if let Err(err) = self.flush_buffer(&snapshot) {
            let mut buffer = self.buffer.write().expect("index buffer lock poisoned");
            buffer.merge(snapshot);
            return Err(err);
        }
        Ok(())
    }

    fn flush_buffer(&self, snapshot: &IndexBuffer) -> anyhow::Result<()> {
        for (tag_key_id, bitmap) in &snapshot.forward {
            let key = forward_key(*tag_key_id);
            let mut merged = load_bitmap(&self.forward_family, &key)?.unwrap_or_default();
            merged |= bitmap;
            self.forward_family.put(key, encode_bitmap(&merged)?)?;
        }

        for (tag_key_id, values) in &snapshot.inverted {
            for (tag_value_id, bitmap) in values {
                let key = inverted_key(*tag_key_id, *tag_value_id);
                let mut merged = load_bitmap(&self.inverted_family, &key)?.unwrap_or_default();
                merged |= bitmap;
                self.inverted_family.put(key, encode_bitmap(&merged)?)?;
            }
        }

        self.forward_family.persist()?;
        Ok(())
    }
}

use std::collections::HashMap;
use std::sync::Mutex;

use crate::series::join_namespace_metric;

/// TagKeyMeta is one tag key registered under a metric.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagKeyMeta {
    pub key: String,
    pub id: u32,
}

/// Metadata hands out stable identifiers for namespaces, metrics, tag keys
/// and tag values. The cluster-backed implementation lives outside this
/// crate; the core only depends on this seam.
pub trait Metadata: Send + Sync {
    fn database_name(&self) -> String;

    /// gen_metric_id returns the stable metric ID, allocating on first use.
    fn gen_metric_id(&self, namespace: &str, metric_name: &str) -> anyhow::Result<u32>;

    /// get_all_tag_keys returns every tag key registered under the metric.
    fn get_all_tag_keys(&self, namespace: &str, metric_name: &str)
        -> anyhow::Result<Vec<TagKeyMeta>>;

    /// gen_tag_key_id returns the stable tag key ID, allocating on first use.
    fn gen_tag_key_id(
        &self,
        namespace: &str,
        metric_name: &str,
        tag_key: &str,
    ) -> anyhow::Result<u32>;

    /// gen_tag_value_id returns the stable tag value ID under a tag key,
    /// allocating on first use.
    fn gen_tag_value_id(&self, tag_key_id: u32, tag_value: &str) -> anyhow::Result<u32>;

    /// suggest_tag_values returns up to `limit` known values with the prefix.
    fn suggest_tag_values(&self, tag_key_id: u32, tag_value_prefix: &str, limit: usize)
        -> Vec<String>;
}

#[derive(Default)]
struct MemoryMetadataState {
    metric_ids: HashMap<String, u32>,
    tag_keys: HashMap<String, Vec<TagKeyMeta>>,
    tag_key_seq: u32,
    tag_values: HashMap<u32, HashMap<String, u32>>,
    tag_value_seq: u32,
}

/// MemoryMetadata is a process-local [`Metadata`] implementation used by
/// tests and single-node setups.
pub struct MemoryMetadata {
    database: String,
    state: Mutex<MemoryMetadataState>,
}

impl MemoryMetadata {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            state: Mutex::new(MemoryMetadataState::default()),
        }
    }
}

impl Metadata for MemoryMetadata {
    fn database_name(&self) -> String {
        self.database.clone()
    }

    fn gen_metric_id(&self, namespace: &str, metric_name: &str) -> anyhow::Result<u32> {
        let mut state = self.state.lock().expect("metadata lock poisoned");
        let key = join_namespace_metric(namespace, metric_name);
        let next = state.metric_ids.len() as u32 + 1;
        Ok(*state.metric_ids.entry(key).or_insert(next))
    }

    fn get_all_tag_keys(
        &self,
        namespace: &str,
        metric_name: &str,
    ) -> anyhow::Result<Vec<TagKeyMeta>> {
        let state = self.state.lock().expect("metadata lock poisoned");
        let key = join_namespace_metric(namespace, metric_name);
        Ok(state.tag_keys.get(&key).cloned().unwrap_or_default())
    }

    fn gen_tag_key_id(
        &self,
        namespace: &str,
        metric_name: &str,
        tag_key: &str,
    ) -> anyhow::Result<u32> {
        let mut state = self.state.lock().expect("metadata lock poisoned");
        let key = join_namespace_metric(namespace, metric_name);

        let keys = state.tag_keys.entry(key).or_default();
        if let Some(meta) = keys.iter().find(|meta| meta.key == tag_key) {
            return Ok(meta.id);
        }

        state.tag_key_seq += 1;
        let id = state.tag_key_seq;
        state
            .tag_keys
            .entry(join_namespace_metric(namespace, metric_name))
            .or_default()
            .push(TagKeyMeta {
                key: tag_key.to_string(),
                id,
            });
        Ok(id)
    }

    fn gen_tag_value_id(&self, tag_key_id: u32, tag_value: &str) -> anyhow::Result<u32> {
        let mut state = self.state.lock().expect("metadata lock poisoned");
        if let Some(id) = state
            .tag_values
            .get(&tag_key_id)
            .and_then(|values| values.get(tag_value))
        {
            return Ok(*id);
        }

        state.tag_value_seq += 1;
        let id = state.tag_value_seq;
        state
            .tag_values
            .entry(tag_key_id)
            .or_default()
            .insert(tag_value.to_string(), id);
        Ok(id)
    }

    fn suggest_tag_values(
        &self,
        tag_key_id: u32,
        tag_value_prefix: &str,
        limit: usize,
    ) -> Vec<String> {
        let state = self.state.lock().expect("metadata lock poisoned");
        let mut values: Vec<String> = state
            .tag_values
            .get(&tag_key_id)
            .map(|values| {
                values
                    .keys()
                    .filter(|v| v.starts_with(tag_value_prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        values.sort();
        values.truncate(limit);
        values
    }
}

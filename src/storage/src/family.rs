use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fjall::{PersistMode, TxKeyspace, TxPartition};

use metricdb_common::error::StoreError;

/// Family is a named sub-store of a [`crate::KvStore`].
///
/// Handles are cheap to clone and safe to share across threads; writes from
/// different handles of the same store serialise on the store's single
/// writer.
#[derive(Clone)]
pub struct Family {
    name: String,
    keyspace: TxKeyspace,
    partition: TxPartition,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Family").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Family {
    pub(crate) fn new(
        name: String,
        keyspace: TxKeyspace,
        partition: TxPartition,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name,
            keyspace,
            partition,
            closed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn partition(&self) -> &TxPartition {
        &self.partition
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> anyhow::Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.partition.get(key.as_ref())?.map(|v| v.to_vec()))
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> anyhow::Result<()> {
        self.check_open()?;
        let mut tx = self.keyspace.write_tx();
        tx.insert(&self.partition, key.as_ref(), value.as_ref());
        tx.commit()?;
        Ok(())
    }

    pub fn delete(&self, key: impl AsRef<[u8]>) -> anyhow::Result<()> {
        self.check_open()?;
        let mut tx = self.keyspace.write_tx();
        tx.remove(&self.partition, key.as_ref());
        tx.commit()?;
        Ok(())
    }

    /// prefix returns all pairs whose key starts with `prefix`, in key order.
    pub fn prefix(&self, prefix: impl AsRef<[u8]>) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_open()?;
        let read_tx = self.keyspace.read_tx();

        let mut pairs = Vec::new();
        for kv in read_tx.prefix(&self.partition, prefix.as_ref()) {
            let (k, v) = kv?;
            pairs.push((k.to_vec(), v.to_vec()));
        }
        Ok(pairs)
    }

    /// persist fsyncs the owning store's journal.
    pub fn persist(&self) -> anyhow::Result<()> {
        self.check_open()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    fn check_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{FamilyOptions, KvStore};

    #[test]
    fn test_prefix_scan() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = KvStore::open(dir.path())?;
        let family = store.create_family("f", FamilyOptions::default())?;

        family.put([1, 0, 0, 7, 1], b"a")?;
        family.put([1, 0, 0, 7, 2], b"b")?;
        family.put([1, 0, 0, 8, 1], b"c")?;

        let pairs = family.prefix([1, 0, 0, 7])?;
        assert_eq!(2, pairs.len());
        assert_eq!(b"a".to_vec(), pairs[0].1);
        assert_eq!(b"b".to_vec(), pairs[1].1);

        assert!(family.prefix([9])?.is_empty());
        Ok(())
    }

    #[test]
    fn test_get_missing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = KvStore::open(dir.path())?;
        let family = store.create_family("f", FamilyOptions::default())?;
        assert!(family.get(b"nope")?.is_none());
        Ok(())
    }
}

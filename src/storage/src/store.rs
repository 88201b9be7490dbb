use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fjall::{PersistMode, TxKeyspace, WriteTransaction};

use metricdb_common::error::StoreError;

use crate::family::Family;
use crate::FamilyOptions;

/// Folder the keyspace keeps its partitions in: one directory per
/// partition, named by the partition name. Partition names are restricted
/// to path-safe characters, so the directory name is the family name.
const PARTITIONS_DIR: &str = "partitions";

/// KvStore is a directory-rooted key-value store holding named families.
pub struct KvStore {
    path: PathBuf,
    keyspace: TxKeyspace,
    closed: Arc<AtomicBool>,
}

impl KvStore {
    /// open opens (or creates) the store directory.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let keyspace = fjall::Config::new(&path).open_transactional()?;
        Ok(Self {
            path,
            keyspace,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// create_family opens (or creates) a named family.
    pub fn create_family(&self, name: &str, options: FamilyOptions) -> anyhow::Result<Family> {
        self.check_open()?;

        let opts = fjall::PartitionCreateOptions::default()
            .block_size(options.block_size)
            .compression(fjall::CompressionType::Lz4)
            .max_memtable_size(options.max_memtable_size);
        let partition = self.keyspace.open_partition(name, opts)?;

        Ok(Family::new(
            name.to_string(),
            self.keyspace.clone(),
            partition,
            self.closed.clone(),
        ))
    }

    /// list_family_names returns the family names present on disk,
    /// including families never opened by this handle. Names are read from
    /// the keyspace's partition folder (see [`PARTITIONS_DIR`]), so a stray
    /// directory a partition could not have created is reported verbatim
    /// and callers can treat it as corruption.
    pub fn list_family_names(&self) -> anyhow::Result<Vec<String>> {
        self.check_open()?;

        let dir = self.path.join(PARTITIONS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// write_batch starts an atomic multi-family batch.
    pub fn write_batch(&self) -> anyhow::Result<WriteBatch<'_>> {
        self.check_open()?;
        Ok(WriteBatch {
            tx: self.keyspace.write_tx(),
        })
    }

    /// persist flushes the journal to disk with fsync.
    pub fn persist(&self) -> anyhow::Result<()> {
        self.check_open()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// close persists and marks the store closed. Family handles created from
    /// this store fail all further operations; the close cascades, it does not
    /// wait for them.
    pub fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Closed.into());
        }
        self.keyspace.persist(PersistMode::SyncAll)?;
        tracing::debug!(path = %self.path.display(), "closed kv store");
        Ok(())
    }

    fn check_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed.into());
        }
        Ok(())
    }
}

/// WriteBatch applies a set of puts/deletes atomically across families
/// of one store.
pub struct WriteBatch<'a> {
    tx: WriteTransaction<'a>,
}

impl<'a> WriteBatch<'a> {
    pub fn put(&mut self, family: &Family, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.tx.insert(family.partition(), key.as_ref(), value.as_ref());
    }

    pub fn delete(&mut self, family: &Family, key: impl AsRef<[u8]>) {
        self.tx.remove(family.partition(), key.as_ref());
    }

    pub fn commit(self) -> anyhow::Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metricdb_common::error::is_closed;

    #[test]
    fn test_store_families() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = KvStore::open(dir.path())?;

        let a = store.create_family("0", FamilyOptions::default())?;
        let _b = store.create_family("12", FamilyOptions::default())?;
        a.put(b"k", b"v")?;

        let names = store.list_family_names()?;
        assert!(names.contains(&"0".to_string()), "{:?}", names);
        assert!(names.contains(&"12".to_string()), "{:?}", names);
        Ok(())
    }

    #[test]
    fn test_batch_is_atomic_across_families() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = KvStore::open(dir.path())?;
        let a = store.create_family("a", FamilyOptions::default())?;
        let b = store.create_family("b", FamilyOptions::default())?;

        let mut batch = store.write_batch()?;
        batch.put(&a, b"k1", b"v1");
        batch.put(&b, b"k2", b"v2");
        batch.commit()?;

        assert_eq!(Some(b"v1".to_vec()), a.get(b"k1")?);
        assert_eq!(Some(b"v2".to_vec()), b.get(b"k2")?);
        Ok(())
    }

    #[test]
    fn test_reopen_keeps_data() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = KvStore::open(dir.path())?;
            let family = store.create_family("7", FamilyOptions::default())?;
            family.put(b"k", b"v")?;
            store.close()?;
        }

        let store = KvStore::open(dir.path())?;
        let family = store.create_family("7", FamilyOptions::default())?;
        assert_eq!(Some(b"v".to_vec()), family.get(b"k")?);
        Ok(())
    }

    #[test]
    fn test_close_semantics() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = KvStore::open(dir.path())?;
        let family = store.create_family("f", FamilyOptions::default())?;

        store.close()?;
        assert!(is_closed(&store.close().unwrap_err()));
        assert!(is_closed(&store.create_family("g", FamilyOptions::default()).unwrap_err()));
        assert!(is_closed(&family.put(b"k", b"v").unwrap_err()));
        Ok(())
    }
}

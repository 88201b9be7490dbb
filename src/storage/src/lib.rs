//! Embedded key-value storage with named families.
//!
//! A [`KvStore`] owns one directory on disk; a [`Family`] is a named
//! sub-store inside it (one directory per family). Stores are backed by a
//! transactional fjall keyspace, one partition per family.

mod family;
mod store;

use serde::{Deserialize, Serialize};

pub use family::Family;
pub use store::{KvStore, WriteBatch};

pub(crate) const DEFAULT_BLOCK_SIZE: u32 = 4_096;
pub(crate) const DEFAULT_MAX_MEMTABLE_SIZE: u32 = 8_000_000;

/// Tuning knobs for a single family.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyOptions {
    pub block_size: u32,
    pub max_memtable_size: u32,
}

impl Default for FamilyOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_memtable_size: DEFAULT_MAX_MEMTABLE_SIZE,
        }
    }
}

use std::hash::Hasher;

use twox_hash::XxHash64;

const TAGS_HASH_SEED: u64 = 0;

/// hash_tags returns the canonical 64-bit hash of a tag set.
///
/// Pairs are sorted by key and length-prefixed before hashing, so insertion
/// order never changes a series identity and `("ab","c")` cannot collide with
/// `("a","bc")`.
pub fn hash_tags(tags: &[(&str, &str)]) -> u64 {
    let mut sorted: Vec<&(&str, &str)> = tags.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0).then(a.1.cmp(b.1)));

    let mut h = XxHash64::with_seed(TAGS_HASH_SEED);
    for (key, value) in sorted {
        h.write(&(key.len() as u32).to_be_bytes());
        h.write(key.as_bytes());
        h.write(&(value.len() as u32).to_be_bytes());
        h.write(value.as_bytes());
    }
    h.finish()
}

/// hash_bytes returns the 64-bit hash of a raw key.
pub fn hash_bytes(key: &[u8]) -> u64 {
    let mut h = XxHash64::with_seed(TAGS_HASH_SEED);
    h.write(key);
    h.finish()
}

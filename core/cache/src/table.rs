//! Hash to key/IV table and its persisted form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use keyiv_common::{Error, Result};
use keyiv_crypto::KeyEntry;

/// Version written into every persisted table.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Mapping from password hash to the key/IV issued for it.
///
/// Entries are never removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheTable {
    entries: BTreeMap<String, KeyEntry>,
}

#[derive(Serialize)]
struct PersistedTableRef<'a> {
    version: u32,
    entries: &'a BTreeMap<String, KeyEntry>,
}

#[derive(Deserialize)]
struct PersistedTable {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, KeyEntry>,
}

impl CacheTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the entry for `hash`.
    pub fn get(&self, hash: &str) -> Option<&KeyEntry> {
        self.entries.get(hash)
    }

    /// Whether an entry exists for `hash`.
    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    /// Insert or overwrite the entry for `hash`, returning the previous one.
    pub fn insert(&mut self, hash: impl Into<String>, entry: KeyEntry) -> Option<KeyEntry> {
        self.entries.insert(hash.into(), entry)
    }

    /// Iterate over `(hash, entry)` pairs in hash order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &KeyEntry)> {
        self.entries.iter()
    }

    /// Number of hashes present here but absent from `other`.
    pub fn count_missing_from(&self, other: &CacheTable) -> usize {
        self.entries
            .keys()
            .filter(|hash| !other.contains(hash))
            .count()
    }

    /// Union with `other`; on a colliding hash this table's entry wins.
    ///
    /// Returns the number of entries added.
    pub fn merge_left(&mut self, other: &CacheTable) -> usize {
        let mut added = 0;
        for (hash, entry) in &other.entries {
            if !self.entries.contains_key(hash) {
                self.entries.insert(hash.clone(), entry.clone());
                added += 1;
            }
        }
        added
    }

    /// Union with `other`; on a colliding hash `other`'s entry wins.
    ///
    /// Returns the number of entries added or replaced.
    pub fn merge_right(&mut self, other: &CacheTable) -> usize {
        let mut changed = 0;
        for (hash, entry) in &other.entries {
            if self.entries.get(hash) != Some(entry) {
                self.entries.insert(hash.clone(), entry.clone());
                changed += 1;
            }
        }
        changed
    }

    /// Serialize to the versioned JSON payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&PersistedTableRef {
            version: CACHE_FORMAT_VERSION,
            entries: &self.entries,
        })
        .map_err(|e| Error::Serialization(format!("Failed to serialize cache table: {}", e)))
    }

    /// Parse the versioned JSON payload.
    ///
    /// # Errors
    /// - `Corrupt` if the payload is malformed or has an unknown version
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let persisted: PersistedTable = serde_json::from_slice(bytes)
            .map_err(|e| Error::Corrupt(format!("Cache table is unreadable: {}", e)))?;

        if persisted.version != CACHE_FORMAT_VERSION {
            return Err(Error::Corrupt(format!(
                "Unsupported cache format version {} (expected {})",
                persisted.version, CACHE_FORMAT_VERSION
            )));
        }

        Ok(Self {
            entries: persisted.entries,
        })
    }
}

impl FromIterator<(String, KeyEntry)> for CacheTable {
    fn from_iter<I: IntoIterator<Item = (String, KeyEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

//! Reference index: which catalog items point at each stored blob.
//!
//! Persisted as `{ "<blob path>": ["<content_id>/<product>/<version>/<item>", ...] }`.
//! A blob is reclaimable once its reference set is empty.

use crate::catalog::Pedigree;
use crate::error::Result;
use crate::store::FileStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Store-relative path of the persisted index
pub const REFERENCES_PATH: &str = ".vmtest-data/references.json";

/// Catalog key that holds a reference on a blob
pub fn reference_key(content_id: &str, pedigree: &Pedigree) -> String {
    format!("{}/{}", content_id, pedigree)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceIndex {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the persisted index, healing a corrupt file by starting over.
    pub fn load(store: &FileStore) -> Result<Self> {
        Ok(store
            .load_json_healing::<Self>(REFERENCES_PATH)?
            .value
            .unwrap_or_default())
    }

    pub fn save(&self, store: &FileStore) -> Result<()> {
        store.write_json(REFERENCES_PATH, self)
    }

    /// Record that `reference` uses `blob`. Returns true if it was new.
    pub fn add(&mut self, blob: &str, reference: &str) -> bool {
        self.entries
            .entry(blob.to_string())
            .or_default()
            .insert(reference.to_string())
    }

    /// Drop one reference. Returns true when `blob` has no references left
    /// (and so was removed from the index).
    pub fn remove(&mut self, blob: &str, reference: &str) -> bool {
        let Some(refs) = self.entries.get_mut(blob) else {
            return true;
        };
        refs.remove(reference);
        if refs.is_empty() {
            self.entries.remove(blob);
            true
        } else {
            false
        }
    }

    /// Drop every reference starting with `prefix` that is not in `live`
    /// (pairs of blob and reference). Returns the blobs left with no
    /// references at all.
    pub fn drop_stale(&mut self, prefix: &str, live: &BTreeSet<(String, String)>) -> Vec<String> {
        let mut orphaned = Vec::new();
        self.entries.retain(|blob, refs| {
            refs.retain(|r| !r.starts_with(prefix) || live.contains(&(blob.clone(), r.clone())));
            if refs.is_empty() {
                orphaned.push(blob.clone());
                false
            } else {
                true
            }
        });
        orphaned
    }

    pub fn count(&self, blob: &str) -> usize {
        self.entries.get(blob).map(BTreeSet::len).unwrap_or(0)
    }

    pub fn is_referenced(&self, blob: &str) -> bool {
        self.count(blob) > 0
    }

    pub fn blobs(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Queries against a local mirror

use crate::catalog::{FlattenedRecord, ProductTree};
use crate::config::{default_query_roots, QueryRoot};
use crate::error::Result;
use crate::filter::FilterSet;
use crate::store::FileStore;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

/// Records of the newest `max_versions` versions per product that pass
/// `filters`, sorted by product and item name.
///
/// Reads the first recognized catalog root present under `mirror_root`; a
/// mirror without one yields no results.
pub fn query(mirror_root: &Path, max_versions: Option<usize>, filters: &FilterSet) -> Result<Vec<FlattenedRecord>> {
    query_roots(mirror_root, &default_query_roots(), max_versions, filters)
}

/// [`query`] with an explicit list of catalog roots, in priority order.
pub fn query_roots(
    mirror_root: &Path,
    roots: &[QueryRoot],
    max_versions: Option<usize>,
    filters: &FilterSet,
) -> Result<Vec<FlattenedRecord>> {
    let store = FileStore::new(mirror_root);
    let Some(root) = roots.iter().find(|r| store.exists(&r.path)) else {
        debug!("No catalog root under {}", mirror_root.display());
        return Ok(Vec::new());
    };
    debug!("Querying {} ({})", root.path, root.content_id);

    let tree: ProductTree = store.load_json(&root.path)?;
    let mut results: Vec<FlattenedRecord> = tree
        .select(max_versions, filters)
        .into_iter()
        .map(|(_, mut record)| {
            if let Some(path) = record.path().map(str::to_string) {
                let local = mirror_root.join(path);
                record.insert("item_url", Value::String(local.display().to_string()));
            }
            record
        })
        .collect();

    results.sort_by_key(|r| (r.get_str("product_name"), r.get_str("item_name")));
    Ok(results)
}

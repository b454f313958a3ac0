//! Mirror sync engine
//!
//! Pulls a remote catalog into a local directory:
//! - walks each products tree, keeping the newest versions whose items pass
//!   the filter set
//! - downloads accepted item files, skipping those already present with
//!   matching size and checksums
//! - writes the filtered tree under `.vmtest-data/<content_id>`
//! - retires catalogs the previous sync wrote that the source no longer lists
//! - reclaims blobs no catalog item references any more
//!
//! A sync is staged first (all downloads) and committed afterwards (trees,
//! index, then references). Blobs are only deleted once the references are
//! saved. A failure before that point commits nothing and removes the blobs
//! this run downloaded.

use crate::catalog::{Catalog, FlattenedRecord, Index, IndexEntry, Item, Pedigree, ProductTree};
use crate::config::MirrorOptions;
use crate::error::{MirrorError, Result};
use crate::progress::{format_size, ProgressSink};
use crate::refs::{reference_key, ReferenceIndex};
use crate::source::{CatalogReader, DEFAULT_INDEX_PATH};
use crate::state::SyncState;
use crate::store::{FileStore, HealingLoad};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Directory holding mirror bookkeeping
pub const DATA_DIR: &str = ".vmtest-data";

/// Store-relative path of the filtered products file for `content_id`
pub fn products_data_path(content_id: &str) -> String {
    format!("{}/{}", DATA_DIR, content_id)
}

/// Override points for a mirror run
pub trait MirrorHooks {
    /// Decide whether an index entry is synced at all.
    fn on_index_entry(&mut self, _content_id: &str, _entry: &IndexEntry) -> bool {
        true
    }

    /// Called for every item that passed the filters, after its file is in
    /// place. `record` includes `item_url`.
    fn on_item_accepted(&mut self, _pedigree: &Pedigree, _record: &FlattenedRecord) {}

    /// Load the tree a previous sync wrote for `content_id`.
    fn load_existing_tree(&mut self, store: &FileStore, content_id: &str) -> Result<HealingLoad<ProductTree>> {
        store.load_json_healing(&products_data_path(content_id))
    }
}

/// Hooks with every default in place
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl MirrorHooks for DefaultHooks {}

/// Outcome of one sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Content ids written, in sync order
    pub content_ids: Vec<String>,
    pub items_accepted: u64,
    /// Blob paths fetched from the source
    pub downloaded: Vec<String>,
    /// Items whose file was already present
    pub deduplicated: u64,
    /// Blob paths deleted because nothing references them any more
    pub removed: Vec<String>,
    pub bytes_transferred: u64,
    /// Content ids whose previous local tree was corrupt and discarded
    pub healed: Vec<String>,
    /// Content ids from the previous sync that this one no longer covers
    pub retired: Vec<String>,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn summary(&self) -> String {
        format!(
            "Synced {} catalog(s): {} items, {} downloaded ({}), {} already present, {} removed, {}ms",
            self.content_ids.len(),
            self.items_accepted,
            self.downloaded.len(),
            format_size(self.bytes_transferred),
            self.deduplicated,
            self.removed.len(),
            self.duration_ms
        )
    }
}

/// Trees fetched and filtered but not yet written
struct StagedTree {
    previous: Option<ProductTree>,
    target: ProductTree,
}

/// A previously synced catalog that is gone from the source
struct RetiredTree {
    content_id: String,
    previous: Option<ProductTree>,
}

#[derive(Default)]
struct Session {
    report: SyncReport,
    staged: Vec<StagedTree>,
    retired: Vec<RetiredTree>,
    /// Blobs this run downloaded that no earlier sync referenced
    fresh_blobs: Vec<String>,
    index: Option<Index>,
}

/// Writes a filtered mirror into a local directory.
pub struct MirrorWriter<H = DefaultHooks> {
    store: FileStore,
    options: MirrorOptions,
    hooks: H,
}

impl MirrorWriter<DefaultHooks> {
    pub fn new(root: impl Into<PathBuf>, options: MirrorOptions) -> Self {
        Self {
            store: FileStore::new(root),
            options,
            hooks: DefaultHooks,
        }
    }
}

impl<H: MirrorHooks> MirrorWriter<H> {
    /// Replace the hooks.
    pub fn with_hooks<H2: MirrorHooks>(self, hooks: H2) -> MirrorWriter<H2> {
        MirrorWriter {
            store: self.store,
            options: self.options,
            hooks,
        }
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn options(&self) -> &MirrorOptions {
        &self.options
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Sync the catalog at `path` (an index or a single products file).
    pub fn sync(
        &mut self,
        reader: &CatalogReader,
        path: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<SyncReport> {
        let started = Instant::now();
        let url = reader.source().url(path);

        let mut state = SyncState::load(&self.store)?.unwrap_or_else(|| SyncState::new(url.clone()));
        if state.sync_in_progress {
            warn!("Previous sync from {} did not complete", state.source_url);
        }
        state.begin_sync(&self.store, &url)?;

        let mut refs = ReferenceIndex::load(&self.store)?;
        let mut session = Session::default();
        let staged = match self.stage(reader, path, &refs, &mut session, progress) {
            Ok(()) => self.stage_retired(&state.content_ids, &mut session),
            Err(e) => Err(e),
        };
        if let Err(e) = staged {
            self.rollback(&session.fresh_blobs, &refs);
            return Err(e);
        }

        let mut report = self.commit(session, &mut refs)?;
        report.duration_ms = started.elapsed().as_millis() as u64;
        state.complete_sync(&self.store, report.content_ids.clone(), report.bytes_transferred)?;
        info!("{}", report.summary());
        Ok(report)
    }

    fn stage(
        &mut self,
        reader: &CatalogReader,
        path: &str,
        refs: &ReferenceIndex,
        session: &mut Session,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        match reader.read_catalog(path)? {
            Catalog::Products(tree) => self.stage_tree(reader, tree, refs, session, progress),
            Catalog::Index(index) => {
                let mut local = index.empty_like();
                for (content_id, entry) in &index.index {
                    if !self.hooks.on_index_entry(content_id, entry) {
                        debug!("Skipping index entry {}", content_id);
                        continue;
                    }
                    let tree = match reader.read_catalog(&entry.path)? {
                        Catalog::Products(tree) => tree,
                        Catalog::Index(nested) => {
                            return Err(MirrorError::UnsupportedFormat {
                                path: entry.path.clone(),
                                format: nested.format,
                            });
                        }
                    };
                    self.stage_tree(reader, tree, refs, session, progress)?;

                    if let Some(staged) = session.staged.last() {
                        let target = &staged.target;
                        local.index.insert(
                            target.content_id.clone(),
                            IndexEntry {
                                path: self.local_products_path(&target.content_id),
                                products: target.products.keys().cloned().collect(),
                                attrs: entry.attrs.clone(),
                            },
                        );
                    }
                }
                session.index = Some(local);
                Ok(())
            }
        }
    }

    fn stage_tree(
        &mut self,
        reader: &CatalogReader,
        src: ProductTree,
        refs: &ReferenceIndex,
        session: &mut Session,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let content_id = src.content_id.clone();
        info!("Syncing {}", content_id);

        let existing = self.hooks.load_existing_tree(&self.store, &content_id)?;
        if existing.healed {
            warn!("Discarded corrupt local tree for {}", content_id);
            session.report.healed.push(content_id.clone());
        }

        let mut target = src.empty_like();
        for (pedigree, mut record) in src.select(self.options.max_versions, &self.options.filters) {
            let Some(item) = src.item(&pedigree).cloned() else {
                continue;
            };
            if let Some(blob) = item.path() {
                record.insert("item_url", Value::String(reader.source().url(blob)));
                self.ensure_blob(reader, blob, &item, refs, session, progress)?;
            } else {
                debug!("{} {} has no file", content_id, pedigree);
            }
            session.report.items_accepted += 1;
            self.hooks.on_item_accepted(&pedigree, &record);
            target.insert_from(&src, &pedigree, item);
        }
        target.prune_empty();

        session.staged.push(StagedTree {
            previous: existing.value,
            target,
        });
        Ok(())
    }

    /// Make sure `blob` is in the store with the content `item` declares.
    fn ensure_blob(
        &self,
        reader: &CatalogReader,
        blob: &str,
        item: &Item,
        refs: &ReferenceIndex,
        session: &mut Session,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let expected = item.expected();
        let fresh = session.fresh_blobs.iter().any(|b| b == blob);
        let present = if expected.is_empty() {
            // nothing to compare against: trust files this mirror placed
            self.store.exists(blob) && (fresh || refs.is_referenced(blob))
        } else {
            self.store.has_matching(blob, &expected)?
        };
        if present {
            debug!("{} already present", blob);
            session.report.deduplicated += 1;
            return Ok(());
        }

        let fetched = reader.source().open(blob)?;
        let total = expected.size.or(fetched.size);
        let digest = self.store.insert(
            blob,
            fetched.reader,
            total,
            &expected,
            &self.options.algorithms,
            progress,
        )?;
        info!("Downloaded {} ({})", blob, format_size(digest.size));

        session.report.bytes_transferred += digest.size;
        session.report.downloaded.push(blob.to_string());
        if !fresh && !refs.is_referenced(blob) {
            session.fresh_blobs.push(blob.to_string());
        }
        Ok(())
    }

    /// Queue every content id the previous sync wrote that this run did
    /// not stage, so its tree, copies and blobs are removed on commit.
    fn stage_retired(&mut self, previous_ids: &[String], session: &mut Session) -> Result<()> {
        for content_id in previous_ids {
            if session.staged.iter().any(|t| &t.target.content_id == content_id) {
                continue;
            }
            info!("Retiring {}", content_id);
            let existing = self.hooks.load_existing_tree(&self.store, content_id)?;
            session.retired.push(RetiredTree {
                content_id: content_id.clone(),
                previous: existing.value,
            });
        }
        Ok(())
    }

    fn commit(&self, session: Session, refs: &mut ReferenceIndex) -> Result<SyncReport> {
        let Session {
            mut report,
            staged,
            retired,
            fresh_blobs,
            index,
        } = session;
        let before = refs.clone();

        // add every new reference before dropping any, so blobs that move
        // between catalogs survive
        let mut live: Vec<BTreeSet<(String, String)>> = Vec::with_capacity(staged.len());
        for tree in &staged {
            let target = &tree.target;
            let mut keys = BTreeSet::new();
            for pedigree in target.pedigrees() {
                if let Some(blob) = target.item(&pedigree).and_then(Item::path) {
                    let key = reference_key(&target.content_id, &pedigree);
                    refs.add(blob, &key);
                    keys.insert((blob.to_string(), key));
                }
            }
            live.push(keys);
        }

        let mut orphaned = BTreeSet::new();
        for (tree, keys) in staged.iter().zip(&live) {
            let content_id = &tree.target.content_id;
            if let Some(previous) = &tree.previous {
                orphaned.extend(release_dropped(refs, content_id, previous, Some(&tree.target)));
            }
            orphaned.extend(refs.drop_stale(&format!("{}/", content_id), keys));
        }
        let nothing_live = BTreeSet::new();
        for tree in &retired {
            if let Some(previous) = &tree.previous {
                orphaned.extend(release_dropped(refs, &tree.content_id, previous, None));
            }
            orphaned.extend(refs.drop_stale(&format!("{}/", tree.content_id), &nothing_live));
        }
        orphaned.retain(|blob| !refs.is_referenced(blob));

        // nothing is deleted until the new catalogs and references are on disk
        if let Err(e) = self.write_catalogs(&staged, index.as_ref(), refs) {
            self.rollback(&fresh_blobs, &before);
            return Err(e);
        }
        report
            .content_ids
            .extend(staged.iter().map(|t| t.target.content_id.clone()));

        for tree in retired {
            self.store.remove(&products_data_path(&tree.content_id))?;
            if let Some(root) = self.options.query_root(&tree.content_id) {
                self.store.remove(&root.path)?;
            }
            report.retired.push(tree.content_id);
        }
        for blob in orphaned {
            if !self.store.exists(&blob) {
                debug!("{} already gone", blob);
                continue;
            }
            self.store.remove(&blob)?;
            info!("Removed {}", blob);
            report.removed.push(blob);
        }
        Ok(report)
    }

    /// Write trees, query-root copies and the local index, then the
    /// reference index last.
    fn write_catalogs(&self, staged: &[StagedTree], index: Option<&Index>, refs: &ReferenceIndex) -> Result<()> {
        for tree in staged {
            let content_id = &tree.target.content_id;
            self.store.write_json(&products_data_path(content_id), &tree.target)?;
            if let Some(root) = self.options.query_root(content_id) {
                self.store.write_json(&root.path, &tree.target)?;
            }
        }
        if let Some(index) = index {
            self.store.write_json(DEFAULT_INDEX_PATH, index)?;
        }
        refs.save(&self.store)
    }

    /// Remove blobs downloaded by a failed run.
    fn rollback(&self, fresh_blobs: &[String], refs: &ReferenceIndex) {
        for blob in fresh_blobs {
            if refs.is_referenced(blob) {
                continue;
            }
            match self.store.remove(blob) {
                Ok(()) => debug!("Rolled back {}", blob),
                Err(e) => warn!("Failed to roll back {}: {}", blob, e),
            }
        }
    }

    /// Where the local index points for `content_id`
    fn local_products_path(&self, content_id: &str) -> String {
        match self.options.query_root(content_id) {
            Some(root) => root.path.clone(),
            None => products_data_path(content_id),
        }
    }
}

/// Drop the references `previous` held for items that `target` no longer
/// has at the same path. Returns the blobs left without references.
fn release_dropped(
    refs: &mut ReferenceIndex,
    content_id: &str,
    previous: &ProductTree,
    target: Option<&ProductTree>,
) -> Vec<String> {
    let mut released = Vec::new();
    for pedigree in previous.pedigrees() {
        let Some(blob) = previous.item(&pedigree).and_then(Item::path) else {
            continue;
        };
        let current = target.and_then(|t| t.item(&pedigree)).and_then(Item::path);
        if current == Some(blob) {
            continue;
        }
        info!("Removing {} {}", content_id, pedigree);
        // an index that lost track of the blob also reports it as unreferenced
        if refs.remove(blob, &reference_key(content_id, &pedigree)) {
            released.push(blob.to_string());
        }
    }
    released
}

/// Mirror `source_url` into `output_dir`.
pub fn sync_images(
    source_url: &str,
    output_dir: impl Into<PathBuf>,
    options: MirrorOptions,
    keyring: Option<PathBuf>,
    progress: &mut dyn ProgressSink,
) -> Result<SyncReport> {
    let (reader, path) = CatalogReader::from_url(source_url, keyring)?;
    MirrorWriter::new(output_dir, options).sync(&reader, &path, progress)
}

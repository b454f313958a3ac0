//! vmimg core library
//!
//! Selective, incremental mirroring of simplestreams-style image catalogs:
//! - Filter expressions (`field=value`, `field~regex`) over flattened items
//! - Streaming size/checksum verification of downloads
//! - A path-addressed blob store with a reference index and self-healing loads
//! - Catalog tree model (products, versions, items) with attribute inheritance
//! - Mirror sync engine with pluggable hooks, rollback and sync state
//! - Queries and percent-style formatting over a local mirror

pub mod catalog;
pub mod config;
pub mod digest;
pub mod error;
pub mod filter;
pub mod format;
pub mod mirror;
pub mod progress;
pub mod query;
pub mod refs;
pub mod source;
pub mod state;
pub mod store;

pub use catalog::{Catalog, FlattenedRecord, Index, IndexEntry, Item, Pedigree, Product, ProductTree, Version};
pub use config::{host_arches, ImageConfig, MirrorOptions, QueryRoot};
pub use digest::{digest_file, Algorithm, Expected, FileDigest};
pub use error::{MirrorError, Result};
pub use filter::{arch_predicate, FilterSet, Predicate};
pub use format::{Template, DEFAULT_FORMAT};
pub use mirror::{products_data_path, sync_images, DefaultHooks, MirrorHooks, MirrorWriter, SyncReport};
pub use progress::{format_size, NoProgress, ProgressReporter, ProgressSink, ProgressStyle};
pub use query::query;
pub use refs::{ReferenceIndex, REFERENCES_PATH};
pub use source::{source_for_url, CatalogReader, CatalogSource, ContentVerifier, DirSource, GpgVerifier, HttpSource};
pub use state::SyncState;
pub use store::{FileStore, HealingLoad};

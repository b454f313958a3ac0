//! Catalog tree model
//!
//! A products catalog is a three-level tree:
//!
//! ```text
//! ProductTree { content_id, products: { name -> Product } }
//! Product     { attrs..., versions: { name -> Version } }
//! Version     { attrs..., items: { name -> Item } }
//! Item        { attrs... }
//! ```
//!
//! Attributes declared at an outer level are inherited by everything below
//! it. [`ProductTree::flatten`] resolves an item's pedigree into one
//! [`FlattenedRecord`] where item attributes override version attributes,
//! which override product attributes, which override tree attributes.
//!
//! All maps are ordered so serialization is deterministic.

use crate::digest::{Algorithm, Expected};
use crate::error::{MirrorError, Result};
use crate::filter::FilterSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub const PRODUCTS_FORMAT: &str = "products:1.0";
pub const INDEX_FORMAT: &str = "index:1.0";

/// Scalar attributes at one level of the tree
pub type Attrs = BTreeMap<String, Value>;

/// Fully-qualified key of an item
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pedigree {
    pub product: String,
    pub version: String,
    pub item: String,
}

impl Pedigree {
    pub fn new(product: impl Into<String>, version: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            version: version.into(),
            item: item.into(),
        }
    }
}

impl fmt::Display for Pedigree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.product, self.version, self.item)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Item {
    #[serde(flatten)]
    pub attrs: Attrs,
}

impl Item {
    /// Relative path of the file this item points at, if any
    pub fn path(&self) -> Option<&str> {
        self.attrs.get("path").and_then(Value::as_str)
    }

    /// Declared size and checksums, used to verify downloads
    pub fn expected(&self) -> Expected {
        let size = self.attrs.get("size").and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        });
        let checksums = Algorithm::ALL
            .into_iter()
            .filter_map(|a| {
                self.attrs
                    .get(a.field())
                    .and_then(Value::as_str)
                    .map(|s| (a, s.to_string()))
            })
            .collect();
        Expected { size, checksums }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Version {
    #[serde(default)]
    pub items: BTreeMap<String, Item>,
    #[serde(flatten)]
    pub attrs: Attrs,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Product {
    #[serde(default)]
    pub versions: BTreeMap<String, Version>,
    #[serde(flatten)]
    pub attrs: Attrs,
}

impl Product {
    /// Version names, newest first.
    pub fn versions_newest_first(&self) -> impl Iterator<Item = (&String, &Version)> {
        self.versions.iter().rev()
    }
}

/// A `products:1.0` document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductTree {
    pub content_id: String,
    #[serde(default = "default_products_format")]
    pub format: String,
    #[serde(default)]
    pub products: BTreeMap<String, Product>,
    #[serde(flatten)]
    pub attrs: Attrs,
}

fn default_products_format() -> String {
    PRODUCTS_FORMAT.to_string()
}

impl ProductTree {
    pub fn new(content_id: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            format: default_products_format(),
            products: BTreeMap::new(),
            attrs: Attrs::new(),
        }
    }

    /// Empty tree carrying the same top-level attributes as `self`
    pub fn empty_like(&self) -> Self {
        Self {
            content_id: self.content_id.clone(),
            format: self.format.clone(),
            products: BTreeMap::new(),
            attrs: self.attrs.clone(),
        }
    }

    pub fn item(&self, pedigree: &Pedigree) -> Option<&Item> {
        self.products
            .get(&pedigree.product)?
            .versions
            .get(&pedigree.version)?
            .items
            .get(&pedigree.item)
    }

    /// Every item in the tree, sorted by pedigree
    pub fn pedigrees(&self) -> Vec<Pedigree> {
        let mut out = Vec::new();
        for (pname, product) in &self.products {
            for (vname, version) in &product.versions {
                for iname in version.items.keys() {
                    out.push(Pedigree::new(pname, vname, iname));
                }
            }
        }
        out
    }

    pub fn item_count(&self) -> usize {
        self.products
            .values()
            .flat_map(|p| p.versions.values())
            .map(|v| v.items.len())
            .sum()
    }

    /// Resolve inherited attributes for one item.
    ///
    /// Returns `None` if the pedigree does not exist in this tree.
    pub fn flatten(&self, pedigree: &Pedigree) -> Option<FlattenedRecord> {
        let product = self.products.get(&pedigree.product)?;
        let version = product.versions.get(&pedigree.version)?;
        let item = version.items.get(&pedigree.item)?;

        let mut record = FlattenedRecord::new();
        record.merge_scalars(&self.attrs);
        record.insert("content_id", Value::String(self.content_id.clone()));
        record.insert("format", Value::String(self.format.clone()));
        record.merge_scalars(&product.attrs);
        record.merge_scalars(&version.attrs);
        record.merge_scalars(&item.attrs);
        record.insert("product_name", Value::String(pedigree.product.clone()));
        record.insert("version_name", Value::String(pedigree.version.clone()));
        record.insert("item_name", Value::String(pedigree.item.clone()));
        Some(record)
    }

    /// Copy one item from `src`, creating the product and version entries
    /// (with their attributes) as needed.
    pub fn insert_from(&mut self, src: &ProductTree, pedigree: &Pedigree, item: Item) {
        let Some(src_product) = src.products.get(&pedigree.product) else {
            return;
        };
        let Some(src_version) = src_product.versions.get(&pedigree.version) else {
            return;
        };
        let product = self
            .products
            .entry(pedigree.product.clone())
            .or_insert_with(|| Product {
                versions: BTreeMap::new(),
                attrs: src_product.attrs.clone(),
            });
        let version = product
            .versions
            .entry(pedigree.version.clone())
            .or_insert_with(|| Version {
                items: BTreeMap::new(),
                attrs: src_version.attrs.clone(),
            });
        version.items.insert(pedigree.item.clone(), item);
    }

    /// Remove an item, pruning its version and product if they become empty.
    pub fn remove_item(&mut self, pedigree: &Pedigree) -> Option<Item> {
        let product = self.products.get_mut(&pedigree.product)?;
        let version = product.versions.get_mut(&pedigree.version)?;
        let removed = version.items.remove(&pedigree.item);
        if version.items.is_empty() {
            product.versions.remove(&pedigree.version);
        }
        if product.versions.is_empty() {
            self.products.remove(&pedigree.product);
        }
        removed
    }

    /// Drop versions with no items and products with no versions.
    pub fn prune_empty(&mut self) {
        for product in self.products.values_mut() {
            product.versions.retain(|_, v| !v.items.is_empty());
        }
        self.products.retain(|_, p| !p.versions.is_empty());
    }

    /// Walk the tree the way both sync and query do: products by name,
    /// at most `max_versions` newest versions per product (counted whether
    /// or not any of their items pass), items by name, keeping only items
    /// whose flattened record passes `filters`.
    pub fn select(&self, max_versions: Option<usize>, filters: &FilterSet) -> Vec<(Pedigree, FlattenedRecord)> {
        let mut selected = Vec::new();
        for (pname, product) in &self.products {
            let limit = max_versions.unwrap_or(usize::MAX);
            for (vname, version) in product.versions_newest_first().take(limit) {
                for iname in version.items.keys() {
                    let pedigree = Pedigree::new(pname, vname, iname);
                    if let Some(record) = self.flatten(&pedigree) {
                        if filters.evaluate(&record) {
                            selected.push((pedigree, record));
                        }
                    }
                }
            }
        }
        selected
    }
}

/// One entry of an `index:1.0` document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(flatten)]
    pub attrs: Attrs,
}

/// An `index:1.0` document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    #[serde(default = "default_index_format")]
    pub format: String,
    #[serde(default)]
    pub index: BTreeMap<String, IndexEntry>,
    #[serde(flatten)]
    pub attrs: Attrs,
}

fn default_index_format() -> String {
    INDEX_FORMAT.to_string()
}

impl Index {
    pub fn empty_like(&self) -> Self {
        Self {
            format: self.format.clone(),
            index: BTreeMap::new(),
            attrs: self.attrs.clone(),
        }
    }
}

/// Either kind of catalog document, dispatched on its `format` field
#[derive(Debug, Clone, PartialEq)]
pub enum Catalog {
    Index(Index),
    Products(ProductTree),
}

impl Catalog {
    /// Parse a JSON catalog document, dispatching on its `format` field.
    /// `origin` names the document in errors.
    pub fn from_slice(origin: &str, data: &[u8]) -> Result<Self> {
        let decode = |source| MirrorError::Decode {
            path: PathBuf::from(origin),
            source,
        };
        let value: Value = serde_json::from_slice(data).map_err(decode)?;
        let format = value
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match format.as_str() {
            INDEX_FORMAT => Ok(Catalog::Index(serde_json::from_value(value).map_err(decode)?)),
            PRODUCTS_FORMAT => Ok(Catalog::Products(
                serde_json::from_value(value).map_err(decode)?,
            )),
            _ => Err(MirrorError::UnsupportedFormat {
                path: origin.to_string(),
                format,
            }),
        }
    }
}

/// Item attributes with everything inherited from its pedigree resolved
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlattenedRecord {
    fields: BTreeMap<String, Value>,
}

impl FlattenedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// String form of a scalar field. Strings are returned verbatim,
    /// numbers and booleans in their JSON spelling; null and absent
    /// fields are `None`.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.fields.get("path").and_then(Value::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Merge scalar attributes; nested maps and lists are not inherited.
    fn merge_scalars(&mut self, attrs: &Attrs) {
        for (k, v) in attrs {
            match v {
                Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                    self.fields.insert(k.clone(), v.clone());
                }
                _ => {}
            }
        }
    }
}

//! Query engine integration tests: sync a fake remote, then query the mirror

mod common;

use common::{Remote, PRODUCTS_PATH};
use tempfile::TempDir;
use vmimg_core::format::render;
use vmimg_core::{query, FilterSet, FlattenedRecord, MirrorOptions, MirrorWriter, NoProgress, DEFAULT_FORMAT};

fn mirrored(max: Option<usize>, filters: &[&str]) -> (Remote, TempDir) {
    let remote = Remote::new();
    remote.standard();
    let local = TempDir::new().unwrap();
    MirrorWriter::new(local.path(), MirrorOptions::new(max, FilterSet::parse(filters).unwrap()))
        .sync(&remote.reader(), PRODUCTS_PATH, &mut NoProgress)
        .unwrap();
    (remote, local)
}

fn without_url(mut records: Vec<FlattenedRecord>) -> Vec<FlattenedRecord> {
    for r in &mut records {
        let mut stripped = FlattenedRecord::new();
        for (k, v) in r.fields() {
            if k != "item_url" {
                stripped.insert(k.clone(), v.clone());
            }
        }
        *r = stripped;
    }
    records
}

#[test]
fn test_query_empty_mirror() {
    let local = TempDir::new().unwrap();
    assert!(query(local.path(), Some(1), &FilterSet::new()).unwrap().is_empty());
}

#[test]
fn test_query_reflects_filtered_mirror() {
    let (remote, local) = mirrored(Some(2), &["arch~(amd64)"]);

    // reloading the written tree yields exactly the records that passed
    let remote_tree: vmimg_core::ProductTree =
        vmimg_core::FileStore::new(remote.path()).load_json(PRODUCTS_PATH).unwrap();
    let mut expected: Vec<FlattenedRecord> = remote_tree
        .select(Some(2), &FilterSet::parse(&["arch~(amd64)"]).unwrap())
        .into_iter()
        .map(|(_, r)| r)
        .collect();
    expected.sort_by_key(|r| (r.get_str("product_name"), r.get_str("item_name")));

    let results = query(local.path(), None, &FilterSet::new()).unwrap();
    assert_eq!(without_url(results.clone()), expected);

    for r in &results {
        let url = r.get_str("item_url").unwrap();
        assert!(std::path::Path::new(&url).is_file(), "{url} should exist locally");
    }
}

#[test]
fn test_query_max_and_filters() {
    let (_remote, local) = mirrored(None, &[]);

    let newest = query(local.path(), Some(1), &FilterSet::parse(&["arch=arm64"]).unwrap()).unwrap();
    assert_eq!(newest.len(), 1);
    assert_eq!(newest[0].get_str("version_name").unwrap(), "20200301");

    let all = query(local.path(), None, &FilterSet::new()).unwrap();
    assert_eq!(all.len(), 6);
    let products: Vec<_> = all.iter().map(|r| r.get_str("product_name").unwrap()).collect();
    let mut sorted = products.clone();
    sorted.sort();
    assert_eq!(products, sorted);

    let none = query(local.path(), None, &FilterSet::parse(&["release=bionic"]).unwrap()).unwrap();
    assert!(none.is_empty());
}

#[test]
fn test_query_records_render_with_default_format() {
    let (_remote, local) = mirrored(Some(1), &["arch=amd64"]);
    let results = query(local.path(), None, &FilterSet::new()).unwrap();
    assert_eq!(results.len(), 1);
    let line = render(DEFAULT_FORMAT, &results[0]).unwrap();
    assert_eq!(
        line,
        "focal   amd64    20200301 root-image.gz focal/amd64/20200301/root-image.gz"
    );
}

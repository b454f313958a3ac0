//! Fake remote mirror shared by the integration tests

#![allow(dead_code)]

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use vmimg_core::digest::{digest_reader, Algorithm};
use vmimg_core::source::UnverifiedClearsign;
use vmimg_core::{CatalogReader, DirSource};

pub const DAILY: &str = "com.ubuntu.maas:daily:v3:download";
pub const PRODUCTS_PATH: &str = "streams/v1/com.ubuntu.maas:daily:v3:download.json";

pub struct Remote {
    pub dir: TempDir,
}

impl Remote {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn reader(&self) -> CatalogReader {
        CatalogReader::new(Box::new(DirSource::new(self.path())), Box::new(UnverifiedClearsign))
    }

    pub fn write(&self, rel: &str, data: &[u8]) {
        let p = self.path().join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, data).unwrap();
    }

    pub fn write_json(&self, rel: &str, value: &Value) {
        self.write(rel, serde_json::to_string_pretty(value).unwrap().as_bytes());
    }

    /// Store an item file and return its item record with size and sha256.
    pub fn item(&self, rel: &str, ftype: &str) -> Value {
        let data = format!("image data for {}", rel);
        self.write(rel, data.as_bytes());
        let digest = digest_reader(data.as_bytes(), &[Algorithm::Sha256]).unwrap();
        json!({
            "ftype": ftype,
            "path": rel,
            "size": digest.size,
            "sha256": digest.get(Algorithm::Sha256).unwrap(),
        })
    }

    /// A product for `release`/`arch` with one root image per version.
    pub fn product(&self, release: &str, arch: &str, versions: &[&str]) -> (String, Value) {
        let mut vs = serde_json::Map::new();
        for v in versions {
            let path = format!("{}/{}/{}/root-image.gz", release, arch, v);
            vs.insert(
                v.to_string(),
                json!({"items": {"root-image.gz": self.item(&path, "root-image.gz")}}),
            );
        }
        let name = format!("com.ubuntu.maas.daily:v3:{}:{}", release, arch);
        (
            name,
            json!({"arch": arch, "release": release, "os": "ubuntu", "versions": Value::Object(vs)}),
        )
    }

    pub fn products_doc(content_id: &str, products: Vec<(String, Value)>) -> Value {
        let map: serde_json::Map<String, Value> = products.into_iter().collect();
        json!({
            "format": "products:1.0",
            "content_id": content_id,
            "datatype": "image-downloads",
            "products": Value::Object(map),
        })
    }

    /// The usual fixture: focal amd64 and arm64, three versions each.
    pub fn standard(&self) {
        let versions = ["20200101", "20200201", "20200301"];
        let doc = Self::products_doc(
            DAILY,
            vec![
                self.product("focal", "amd64", &versions),
                self.product("focal", "arm64", &versions),
            ],
        );
        self.write_json(PRODUCTS_PATH, &doc);
    }

    pub fn write_index(&self, entries: &[(&str, &str)]) {
        let mut index = serde_json::Map::new();
        for (cid, path) in entries {
            index.insert(cid.to_string(), json!({"path": path, "format": "products:1.0"}));
        }
        self.write_json(
            "streams/v1/index.json",
            &json!({"format": "index:1.0", "index": Value::Object(index)}),
        );
    }
}

/// Every regular file under `root`, relative, skipping mirror bookkeeping.
pub fn blob_files(root: &Path) -> Vec<String> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path: PathBuf = entry.unwrap().path();
            let rel = path.strip_prefix(root).unwrap().to_string_lossy().to_string();
            if rel.starts_with(".vmtest-data") || rel.starts_with("streams") {
                continue;
            }
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                out.push(rel);
            }
        }
    }
    let mut out = Vec::new();
    if root.exists() {
        walk(root, root, &mut out);
    }
    out.sort();
    out
}

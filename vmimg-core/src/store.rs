//! Filesystem object store
//!
//! Blobs live at their catalog-relative path below the store root, so the
//! mirror directory can be served as-is over HTTP. Every write goes to a
//! temporary file beside its destination and is renamed into place only
//! once complete, so readers never observe a half-written blob.

use crate::digest::{self, Algorithm, Expected, FileDigest, MultiHasher, CHUNK_SIZE};
use crate::error::{MirrorError, Result};
use crate::progress::ProgressSink;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;

/// Content store rooted at a mirror directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

/// Result of a JSON load that may have discarded a corrupt file
#[derive(Debug)]
pub struct HealingLoad<T> {
    pub value: Option<T>,
    /// The stored file failed to decode and was deleted
    pub healed: bool,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a store-relative path onto the filesystem.
    ///
    /// Absolute paths and `..` components are rejected.
    pub fn resolve(&self, logical: &str) -> Result<PathBuf> {
        let mut out = self.root.clone();
        let mut depth = 0usize;
        for component in Path::new(logical).components() {
            match component {
                Component::Normal(part) => {
                    out.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(MirrorError::PathEscape(logical.to_string()));
                }
            }
        }
        if depth == 0 {
            return Err(MirrorError::PathEscape(logical.to_string()));
        }
        Ok(out)
    }

    pub fn exists(&self, logical: &str) -> bool {
        self.resolve(logical).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Stream `reader` into the store under `logical`.
    ///
    /// `expected` is checked before the blob becomes visible; on mismatch the
    /// temporary file is discarded and any existing blob is left untouched.
    pub fn insert<R: Read>(
        &self,
        logical: &str,
        mut reader: R,
        total: Option<u64>,
        expected: &Expected,
        algorithms: &[Algorithm],
        progress: &mut dyn ProgressSink,
    ) -> Result<FileDigest> {
        let dest = self.resolve(logical)?;
        let mut tmp = self.temp_file_for(&dest)?;

        let mut wanted = algorithms.to_vec();
        wanted.extend(expected.algorithms());
        let mut hasher = MultiHasher::new(&wanted);

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            tmp.write_all(&buf[..read])?;
            hasher.update(&buf[..read]);
            progress.update(logical, hasher.size(), total);
        }
        tmp.flush()?;

        let digest = hasher.finish();
        progress.update(logical, digest.size, Some(digest.size));

        expected.verify(logical, &digest)?;
        tmp.persist(&dest).map_err(|e| MirrorError::Io(e.error))?;
        Ok(digest)
    }

    /// Atomically replace `logical` with `data`.
    pub fn write_bytes(&self, logical: &str, data: &[u8]) -> Result<()> {
        let dest = self.resolve(logical)?;
        let mut tmp = self.temp_file_for(&dest)?;
        tmp.write_all(data)?;
        tmp.flush()?;
        tmp.persist(&dest).map_err(|e| MirrorError::Io(e.error))?;
        Ok(())
    }

    /// Serialize `value` as pretty JSON under `logical`.
    pub fn write_json<T: Serialize>(&self, logical: &str, value: &T) -> Result<()> {
        let mut data = serde_json::to_vec_pretty(value).map_err(|source| MirrorError::Decode {
            path: PathBuf::from(logical),
            source,
        })?;
        data.push(b'\n');
        self.write_bytes(logical, &data)
    }

    pub fn load(&self, logical: &str) -> Result<Vec<u8>> {
        let path = self.resolve(logical)?;
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MirrorError::NotFound(path),
            _ => MirrorError::Io(e),
        })
    }

    pub fn load_json<T: DeserializeOwned>(&self, logical: &str) -> Result<T> {
        let data = self.load(logical)?;
        serde_json::from_slice(&data).map_err(|source| MirrorError::Decode {
            path: self.root.join(logical),
            source,
        })
    }

    /// Load JSON, treating a missing file as `None`. A file that fails to
    /// decode is deleted and the load retried once; a second decode failure
    /// is returned as an error.
    pub fn load_json_healing<T: DeserializeOwned>(&self, logical: &str) -> Result<HealingLoad<T>> {
        retry_after_heal(
            || match self.load_json(logical) {
                Ok(v) => Ok(Some(v)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            },
            || {
                tracing::warn!(
                    "Removing undecodable file {}; it will be fetched again",
                    self.root.join(logical).display()
                );
                self.remove(logical)
            },
        )
    }

    /// Delete a blob and any directories it leaves empty, up to the root.
    /// Removing a blob that is already gone is not an error.
    pub fn remove(&self, logical: &str) -> Result<()> {
        let path = self.resolve(logical)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} already removed", path.display());
            }
            Err(e) => return Err(e.into()),
        }
        self.prune_empty_parents(&path)
    }

    pub fn digest(&self, logical: &str, algorithms: &[Algorithm]) -> Result<FileDigest> {
        let path = self.resolve(logical)?;
        digest::digest_file(&path, algorithms)
    }

    /// True if a blob exists at `logical` and satisfies every declared
    /// size and checksum. Items that declare nothing never match, so they
    /// are always fetched.
    pub fn has_matching(&self, logical: &str, expected: &Expected) -> Result<bool> {
        if expected.is_empty() || !self.exists(logical) {
            return Ok(false);
        }
        if let Some(size) = expected.size {
            let len = fs::metadata(self.resolve(logical)?)?.len();
            if len != size {
                return Ok(false);
            }
        }
        let actual = self.digest(logical, &expected.algorithms())?;
        Ok(expected.is_satisfied_by(&actual))
    }

    fn temp_file_for(&self, dest: &Path) -> Result<NamedTempFile> {
        let parent = dest
            .parent()
            .ok_or_else(|| MirrorError::PathEscape(dest.display().to_string()))?;
        fs::create_dir_all(parent)?;
        Ok(NamedTempFile::new_in(parent)?)
    }

    fn prune_empty_parents(&self, path: &Path) -> Result<()> {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            match fs::read_dir(d) {
                Ok(mut entries) => {
                    if entries.next().is_some() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    dir = d.parent();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            fs::remove_dir(d)?;
            dir = d.parent();
        }
        Ok(())
    }
}

/// Run `load`; if it fails to decode, run `heal` and `load` exactly once more.
pub fn retry_after_heal<T, L, H>(mut load: L, heal: H) -> Result<HealingLoad<T>>
where
    L: FnMut() -> Result<Option<T>>,
    H: FnOnce() -> Result<()>,
{
    match load() {
        Ok(value) => Ok(HealingLoad {
            value,
            healed: false,
        }),
        Err(MirrorError::Decode { path, source }) => {
            tracing::warn!("Decode error in {}: {}", path.display(), source);
            heal()?;
            Ok(HealingLoad {
                value: load()?,
                healed: true,
            })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn decode_error() -> MirrorError {
        MirrorError::Decode {
            path: PathBuf::from("x"),
            source: serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
        }
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let store = FileStore::new("/srv/images");
        assert_eq!(
            store.resolve("./a/b.img").unwrap(),
            PathBuf::from("/srv/images/a/b.img")
        );
        for bad in ["../etc/passwd", "a/../../b", "/etc/passwd", "", "."] {
            assert!(
                matches!(store.resolve(bad), Err(MirrorError::PathEscape(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_insert_reports_progress_and_completion() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        let data = vec![1u8; CHUNK_SIZE + 10];
        let mut calls = Vec::new();
        let mut sink = |p: &str, w: u64, t: Option<u64>| calls.push((p.to_string(), w, t));

        let digest = store
            .insert(
                "a/b/blob",
                &data[..],
                Some(data.len() as u64),
                &Expected::default(),
                &[Algorithm::Sha256],
                &mut sink,
            )
            .unwrap();

        assert_eq!(digest.size, data.len() as u64);
        assert!(digest.get(Algorithm::Sha256).is_some());
        assert_eq!(calls.len(), 3);
        let last = calls.last().unwrap();
        assert_eq!(last.1, data.len() as u64);
        assert_eq!(last.2, Some(data.len() as u64));
        assert_eq!(store.load("a/b/blob").unwrap(), data);
    }

    #[test]
    fn test_insert_rejects_mismatch_without_leaving_files() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        let expected = Expected {
            size: Some(999),
            ..Default::default()
        };
        let err = store
            .insert("d/blob", &b"short"[..], None, &expected, &[], &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, MirrorError::Integrity { .. }));
        assert!(!store.exists("d/blob"));
        assert_eq!(fs::read_dir(tmp.path().join("d")).unwrap().count(), 0);
    }

    #[test]
    fn test_remove_prunes_empty_dirs() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        store.write_bytes("x/y/z/one", b"1").unwrap();
        store.write_bytes("x/two", b"2").unwrap();

        store.remove("x/y/z/one").unwrap();
        assert!(!tmp.path().join("x/y").exists());
        assert!(tmp.path().join("x/two").exists());

        store.remove("x/two").unwrap();
        assert!(!tmp.path().join("x").exists());
        assert!(tmp.path().exists());

        // already gone
        store.remove("x/two").unwrap();
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        assert!(matches!(store.load("nope"), Err(MirrorError::NotFound(_))));
    }

    #[test]
    fn test_has_matching() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        store.write_bytes("f", b"abc").unwrap();

        let md5 = Expected {
            size: Some(3),
            checksums: [(Algorithm::Md5, "900150983cd24fb0d6963f7d28e17f72".to_string())]
                .into_iter()
                .collect(),
        };
        assert!(store.has_matching("f", &md5).unwrap());
        assert!(!store.has_matching("f", &Expected { size: Some(4), ..Default::default() }).unwrap());
        assert!(!store.has_matching("f", &Expected::default()).unwrap());
        assert!(!store.has_matching("missing", &md5).unwrap());
    }

    #[test]
    fn test_load_json_healing_deletes_corrupt_file() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        store.write_bytes(".vmtest-data/cid", b"{\"truncated\": ").unwrap();

        let loaded: HealingLoad<serde_json::Value> = store.load_json_healing(".vmtest-data/cid").unwrap();
        assert!(loaded.healed);
        assert!(loaded.value.is_none());
        assert!(!store.exists(".vmtest-data/cid"));

        let again: HealingLoad<serde_json::Value> = store.load_json_healing(".vmtest-data/cid").unwrap();
        assert!(!again.healed);
    }

    #[test]
    fn test_retry_after_heal_runs_once() {
        let loads = Cell::new(0);
        let heals = Cell::new(0);
        let result: HealingLoad<u32> = retry_after_heal(
            || {
                loads.set(loads.get() + 1);
                if loads.get() == 1 { Err(decode_error()) } else { Ok(Some(7)) }
            },
            || {
                heals.set(heals.get() + 1);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(result.value, Some(7));
        assert!(result.healed);
        assert_eq!((loads.get(), heals.get()), (2, 1));
    }

    #[test]
    fn test_retry_after_heal_second_failure_is_fatal() {
        let heals = Cell::new(0);
        let result: Result<HealingLoad<u32>> = retry_after_heal(
            || Err(decode_error()),
            || {
                heals.set(heals.get() + 1);
                Ok(())
            },
        );
        assert!(matches!(result, Err(MirrorError::Decode { .. })));
        assert_eq!(heals.get(), 1);
    }
}

//! Content addressor
//!
//! Computes size plus one or more digests of a byte stream in a single pass.

use crate::error::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Read buffer size for streaming hashes and downloads.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Checksum algorithms understood in catalog items
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::Md5,
        Algorithm::Sha1,
        Algorithm::Sha256,
        Algorithm::Sha512,
    ];

    /// Catalog field name carrying this checksum
    pub fn field(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "md5",
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.field().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown checksum algorithm: {}", s))
    }
}

enum HashState {
    Md5(md5::Context),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl HashState {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Md5 => HashState::Md5(md5::Context::new()),
            Algorithm::Sha1 => HashState::Sha1(sha1::Sha1::new()),
            Algorithm::Sha256 => HashState::Sha256(sha2::Sha256::new()),
            Algorithm::Sha512 => HashState::Sha512(sha2::Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            HashState::Md5(ctx) => ctx.consume(data),
            HashState::Sha1(h) => h.update(data),
            HashState::Sha256(h) => h.update(data),
            HashState::Sha512(h) => h.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            HashState::Md5(ctx) => format!("{:x}", ctx.compute()),
            HashState::Sha1(h) => hex::encode(h.finalize()),
            HashState::Sha256(h) => hex::encode(h.finalize()),
            HashState::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// One running hash state per requested algorithm, fed incrementally.
pub struct MultiHasher {
    states: Vec<(Algorithm, HashState)>,
    size: u64,
}

impl MultiHasher {
    pub fn new(algorithms: &[Algorithm]) -> Self {
        let mut algorithms = algorithms.to_vec();
        algorithms.sort();
        algorithms.dedup();
        Self {
            states: algorithms.into_iter().map(|a| (a, HashState::new(a))).collect(),
            size: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
        for (_, state) in &mut self.states {
            state.update(data);
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finish(self) -> FileDigest {
        FileDigest {
            size: self.size,
            digests: self
                .states
                .into_iter()
                .map(|(a, s)| (a, s.finish()))
                .collect(),
        }
    }
}

/// Size and hex digests of some content
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileDigest {
    pub size: u64,
    pub digests: BTreeMap<Algorithm, String>,
}

impl FileDigest {
    pub fn get(&self, algorithm: Algorithm) -> Option<&str> {
        self.digests.get(&algorithm).map(String::as_str)
    }
}

/// What a catalog item declares about its content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Expected {
    pub size: Option<u64>,
    pub checksums: BTreeMap<Algorithm, String>,
}

impl Expected {
    pub fn algorithms(&self) -> Vec<Algorithm> {
        self.checksums.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_none() && self.checksums.is_empty()
    }

    /// Compare a computed digest against the declaration.
    pub fn verify(&self, path: &str, actual: &FileDigest) -> Result<()> {
        if let Some(size) = self.size {
            if size != actual.size {
                return Err(MirrorError::Integrity {
                    path: path.to_string(),
                    reason: format!("size {} != expected {}", actual.size, size),
                });
            }
        }
        for (algorithm, expected) in &self.checksums {
            match actual.get(*algorithm) {
                Some(got) if got.eq_ignore_ascii_case(expected) => {}
                Some(got) => {
                    return Err(MirrorError::Integrity {
                        path: path.to_string(),
                        reason: format!("{} {} != expected {}", algorithm, got, expected),
                    });
                }
                None => {
                    return Err(MirrorError::Integrity {
                        path: path.to_string(),
                        reason: format!("{} was not computed", algorithm),
                    });
                }
            }
        }
        Ok(())
    }

    /// Same check as [`Expected::verify`], as a boolean.
    pub fn is_satisfied_by(&self, actual: &FileDigest) -> bool {
        self.verify("", actual).is_ok()
    }
}

/// Digest everything readable from `reader`.
pub fn digest_reader<R: Read>(mut reader: R, algorithms: &[Algorithm]) -> Result<FileDigest> {
    let mut hasher = MultiHasher::new(algorithms);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finish())
}

/// Digest a local file without loading it into memory.
pub fn digest_file(path: &Path, algorithms: &[Algorithm]) -> Result<FileDigest> {
    let file = File::open(path)?;
    digest_reader(file, algorithms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_known_digests() {
        let d = digest_reader(&b"hello world"[..], &Algorithm::ALL).unwrap();
        assert_eq!(d.size, 11);
        assert_eq!(d.get(Algorithm::Md5), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
        assert_eq!(
            d.get(Algorithm::Sha1),
            Some("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed")
        );
        assert_eq!(
            d.get(Algorithm::Sha256),
            Some("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
        );
        assert_eq!(d.get(Algorithm::Sha512).map(str::len), Some(128));
    }

    #[test]
    fn test_digest_file_is_idempotent() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data = vec![7u8; CHUNK_SIZE * 2 + 13];
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let a = digest_file(tmp.path(), &[Algorithm::Sha256]).unwrap();
        let b = digest_file(tmp.path(), &[Algorithm::Sha256]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.size, data.len() as u64);
        assert!(a.get(Algorithm::Md5).is_none());
    }

    #[test]
    fn test_digest_missing_file() {
        let err = digest_file(Path::new("/nonexistent/vmimg/file"), &[Algorithm::Md5]).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_expected_verify() {
        let actual = digest_reader(&b"abc"[..], &[Algorithm::Md5]).unwrap();
        let mut expected = Expected {
            size: Some(3),
            ..Default::default()
        };
        expected
            .checksums
            .insert(Algorithm::Md5, "900150983CD24FB0D6963F7D28E17F72".to_string());
        assert!(expected.verify("abc", &actual).is_ok());

        expected.size = Some(4);
        assert!(matches!(
            expected.verify("abc", &actual),
            Err(MirrorError::Integrity { .. })
        ));

        let only_sha = Expected {
            size: None,
            checksums: [(Algorithm::Sha256, "00".to_string())].into_iter().collect(),
        };
        assert!(!only_sha.is_satisfied_by(&actual));
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("SHA256".parse::<Algorithm>().unwrap(), Algorithm::Sha256);
        assert!("crc32".parse::<Algorithm>().is_err());
    }
}

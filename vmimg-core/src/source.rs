//! Remote catalog sources
//!
//! A source hands out raw bytes for mirror-relative paths. Whether those
//! bytes need signature checking is decided separately by a
//! [`ContentVerifier`], based on the path (`*.sjson` is clear-signed).

use crate::catalog::Catalog;
use crate::error::{MirrorError, Result};
use crate::store::FileStore;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

const USER_AGENT: &str = concat!("vmimg/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Path of the root index inside a mirror when the URL names none
pub const DEFAULT_INDEX_PATH: &str = "streams/v1/index.json";

const SIGNED_BEGIN: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";

/// An open download
pub struct Fetched<'a> {
    pub reader: Box<dyn Read + 'a>,
    /// Length advertised by the source, if any
    pub size: Option<u64>,
}

/// Where catalogs and item files are read from
pub trait CatalogSource {
    /// Read a whole (small) document.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Open a (possibly large) file for streaming.
    fn open(&self, path: &str) -> Result<Fetched<'_>>;

    /// Absolute URL of `path`, for logs and `item_url`.
    fn url(&self, path: &str) -> String;
}

/// Mirror laid out in a local directory
#[derive(Debug, Clone)]
pub struct DirSource {
    root: FileStore,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: FileStore::new(root),
        }
    }
}

impl CatalogSource for DirSource {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.root.load(path)
    }

    fn open(&self, path: &str) -> Result<Fetched<'_>> {
        let full = self.root.resolve(path)?;
        let file = File::open(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MirrorError::NotFound(full.clone()),
            _ => MirrorError::Io(e),
        })?;
        let size = file.metadata().ok().map(|m| m.len());
        Ok(Fetched {
            reader: Box::new(file),
            size,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("file://{}", self.root.root().join(path).display())
    }
}

/// Mirror served over HTTP(S)
pub struct HttpSource {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl HttpSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            base_url: format!("{}/", base_url.trim_end_matches('/')),
            http,
        })
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response> {
        let url = self.url(path);
        let resp = self
            .http
            .get(&url)
            .send()
            .map_err(|e| MirrorError::Network(format!("GET {} failed: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(MirrorError::Network(format!(
                "GET {} failed ({})",
                url,
                resp.status()
            )));
        }
        Ok(resp)
    }
}

impl CatalogSource for HttpSource {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(self.get(path)?.bytes()?.to_vec())
    }

    fn open(&self, path: &str) -> Result<Fetched<'_>> {
        let resp = self.get(path)?;
        let size = resp.content_length();
        Ok(Fetched {
            reader: Box::new(resp),
            size,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Split a mirror URL into a source and the path of its root document.
///
/// `http://host/images/streams/v1/index.sjson` becomes an HTTP source rooted
/// at `http://host/images/` plus `streams/v1/index.sjson`. URLs without a
/// `streams/` component are taken as the mirror root.
pub fn source_for_url(url: &str) -> Result<(Box<dyn CatalogSource>, String)> {
    let (base, path) = match url.find("streams/") {
        Some(idx) => (&url[..idx], url[idx..].to_string()),
        None => (url, DEFAULT_INDEX_PATH.to_string()),
    };

    let source: Box<dyn CatalogSource> = if base.starts_with("http://") || base.starts_with("https://") {
        Box::new(HttpSource::new(base)?)
    } else if let Some(local) = base.strip_prefix("file://") {
        Box::new(DirSource::new(local))
    } else {
        Box::new(DirSource::new(if base.is_empty() { "." } else { base }))
    };
    Ok((source, path))
}

/// Turns raw catalog bytes into JSON bytes, checking signatures where the
/// path calls for it.
pub trait ContentVerifier {
    fn decode(&self, path: &str, raw: Vec<u8>) -> Result<Vec<u8>>;
}

/// True for paths of clear-signed documents
pub fn is_signed_path(path: &str) -> bool {
    path.ends_with(".sjson")
}

/// Verifies clear-signed documents with `gpgv` against a keyring.
#[derive(Debug, Clone)]
pub struct GpgVerifier {
    keyring: PathBuf,
    program: String,
}

impl GpgVerifier {
    pub fn new(keyring: impl Into<PathBuf>) -> Self {
        Self {
            keyring: keyring.into(),
            program: "gpgv".to_string(),
        }
    }

    /// Use a different `gpgv`-compatible binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn verify(&self, path: &str, raw: &[u8]) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(raw)?;
        tmp.flush()?;

        let output = Command::new(&self.program)
            .arg("--keyring")
            .arg(&self.keyring)
            .arg(tmp.path())
            .output()
            .map_err(|e| MirrorError::Signature {
                path: path.to_string(),
                reason: format!("failed to run {}: {}", self.program, e),
            })?;
        if !output.status.success() {
            return Err(MirrorError::Signature {
                path: path.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl ContentVerifier for GpgVerifier {
    fn decode(&self, path: &str, raw: Vec<u8>) -> Result<Vec<u8>> {
        if !is_signed_path(path) {
            return Ok(raw);
        }
        if !fs::metadata(&self.keyring).map(|m| m.is_file()).unwrap_or(false) {
            return Err(MirrorError::Signature {
                path: path.to_string(),
                reason: format!("keyring {} not found", self.keyring.display()),
            });
        }
        self.verify(path, &raw)?;
        strip_clearsign(&raw).ok_or_else(|| MirrorError::Signature {
            path: path.to_string(),
            reason: "content is not clear-signed".to_string(),
        })
    }
}

/// Accepts signed documents without checking them.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnverifiedClearsign;

impl ContentVerifier for UnverifiedClearsign {
    fn decode(&self, path: &str, raw: Vec<u8>) -> Result<Vec<u8>> {
        if !is_signed_path(path) {
            return Ok(raw);
        }
        tracing::warn!("Not verifying signature of {} (no keyring)", path);
        Ok(strip_clearsign(&raw).unwrap_or(raw))
    }
}

/// Pick a verifier for an optional keyring.
pub fn verifier_for(keyring: Option<PathBuf>) -> Box<dyn ContentVerifier> {
    match keyring {
        Some(k) => Box::new(GpgVerifier::new(k)),
        None => Box::new(UnverifiedClearsign),
    }
}

/// A source paired with the verifier for its signed documents
pub struct CatalogReader {
    source: Box<dyn CatalogSource>,
    verifier: Box<dyn ContentVerifier>,
}

impl CatalogReader {
    pub fn new(source: Box<dyn CatalogSource>, verifier: Box<dyn ContentVerifier>) -> Self {
        Self { source, verifier }
    }

    /// Reader for a mirror URL, plus the path of its root document.
    pub fn from_url(url: &str, keyring: Option<PathBuf>) -> Result<(Self, String)> {
        let (source, path) = source_for_url(url)?;
        Ok((Self::new(source, verifier_for(keyring)), path))
    }

    pub fn source(&self) -> &dyn CatalogSource {
        self.source.as_ref()
    }

    /// Fetch, verify and parse a catalog document.
    pub fn read_catalog(&self, path: &str) -> Result<Catalog> {
        let raw = self.source.read(path)?;
        let data = self.verifier.decode(path, raw)?;
        Catalog::from_slice(path, &data)
    }
}

/// Extract the signed body of a PGP clear-signed message.
///
/// Returns `None` if `raw` is not clear-signed.
pub fn strip_clearsign(raw: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(raw).ok()?;
    let mut lines = text.lines();
    lines.by_ref().find(|l| l.trim_end() == SIGNED_BEGIN)?;
    // armor headers end at the first blank line
    lines.by_ref().find(|l| l.trim().is_empty())?;

    let mut body = Vec::new();
    for line in lines {
        if line.trim_end() == SIGNATURE_BEGIN {
            return Some(body.join("\n").into_bytes());
        }
        body.push(line.strip_prefix("- ").unwrap_or(line));
    }
    None
}

//! Image configuration and mirror options
//!
//! Environment lookups happen once, in [`ImageConfig::from_env`]; everything
//! downstream takes the resulting struct.

use crate::digest::Algorithm;
use crate::filter::FilterSet;
use std::path::PathBuf;

/// Prefix checked before the bare variable name
pub const ENV_PREFIX: &str = "CURTIN_VMTEST_";

pub const DEFAULT_SOURCE_URL: &str =
    "http://maas.ubuntu.com/images/ephemeral-v3/daily/streams/v1/index.sjson";
pub const DEFAULT_IMAGE_DIR: &str = "/srv/images";
pub const DEFAULT_KEYRING: &str = "/usr/share/keyrings/ubuntu-cloudimage-keyring.gpg";

/// Where images come from and where they are kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    /// Remote root document (index or products file)
    pub source_url: String,
    /// Local mirror directory
    pub image_dir: PathBuf,
    /// Keyring for `.sjson` verification
    pub keyring: PathBuf,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            image_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
            keyring: PathBuf::from(DEFAULT_KEYRING),
        }
    }
}

impl ImageConfig {
    /// Build from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. For each setting,
    /// `CURTIN_VMTEST_<NAME>` wins over `<NAME>`, which wins over the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str, default: &str| -> String {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .or_else(|| lookup(name))
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            source_url: get("IMAGE_SRC_URL", DEFAULT_SOURCE_URL),
            image_dir: PathBuf::from(get("IMAGE_DIR", DEFAULT_IMAGE_DIR)),
            keyring: PathBuf::from(get("IMAGE_SRC_KEYRING", DEFAULT_KEYRING)),
        }
    }
}

/// A catalog root that `query` knows how to find
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRoot {
    pub content_id: String,
    /// Store-relative path the filtered tree is copied to
    pub path: String,
}

impl QueryRoot {
    pub fn new(content_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            path: path.into(),
        }
    }
}

/// Recognized catalog roots, in query priority order.
pub fn default_query_roots() -> Vec<QueryRoot> {
    vec![
        QueryRoot::new("com.ubuntu.maas:daily:v3:download", "streams/v1/vmtest.json"),
        QueryRoot::new("com.ubuntu.maas:released:v3:download", "streams/v1/vmtest-centos.json"),
    ]
}

/// Knobs for one mirror run
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    /// Newest versions kept per product; `None` keeps all
    pub max_versions: Option<usize>,
    pub filters: FilterSet,
    /// Digests computed for every download on top of the declared ones
    pub algorithms: Vec<Algorithm>,
    pub query_roots: Vec<QueryRoot>,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            max_versions: Some(1),
            filters: FilterSet::new(),
            algorithms: Vec::new(),
            query_roots: default_query_roots(),
        }
    }
}

impl MirrorOptions {
    pub fn new(max_versions: Option<usize>, filters: FilterSet) -> Self {
        Self {
            max_versions,
            filters,
            ..Self::default()
        }
    }

    pub fn query_root(&self, content_id: &str) -> Option<&QueryRoot> {
        self.query_roots.iter().find(|r| r.content_id == content_id)
    }
}

/// Image architectures runnable on the build host, or `None` when the host
/// architecture has no image mapping.
pub fn host_arches() -> Option<Vec<String>> {
    arches_for(std::env::consts::ARCH, cfg!(target_endian = "little"))
}

/// Map a Rust target architecture name to image architecture names.
pub fn arches_for(arch: &str, little_endian: bool) -> Option<Vec<String>> {
    let arches: &[&str] = match arch {
        "x86_64" => &["amd64", "i386"],
        "x86" => &["i386"],
        "aarch64" => &["arm64"],
        "arm" => &["armhf"],
        "powerpc64" if little_endian => &["ppc64el"],
        "s390x" => &["s390x"],
        "riscv64" => &["riscv64"],
        _ => return None,
    };
    Some(arches.iter().map(|a| a.to_string()).collect())
}

//! Write-through domain cache.
//!
//! On-disk format: one JSON object, `{ "<domain id>": <VmSpec>, ... }`.
//! Every save replaces the whole file via write-to-temp + rename, so a
//! reader sees either the previous or the new map, never a partial write.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use vmfleet_message::VmSpec;

/// Errors from cache persistence.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to access cache file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse cache file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize cache: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CacheError {
    /// Returns true if the cache file does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::Io { source, .. } if source.kind() == ErrorKind::NotFound)
    }
}

/// In-memory map of domain id to descriptor, mirrored to a file.
#[derive(Debug, Clone)]
pub struct DomainCache {
    path: PathBuf,
    domains: BTreeMap<String, VmSpec>,
}

impl DomainCache {
    /// An empty cache that will persist to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            domains: BTreeMap::new(),
        }
    }

    /// Load the cache from `path`.
    ///
    /// A missing file is an error here; see [`DomainCache::load_or_empty`].
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let content = fs::read_to_string(&path).map_err(|source| CacheError::Io {
            path: path.clone(),
            source,
        })?;

        let domains: BTreeMap<String, VmSpec> =
            serde_json::from_str(&content).map_err(|source| CacheError::Decode {
                path: path.clone(),
                source,
            })?;

        info!(
            path = %path.display(),
            domain_count = domains.len(),
            "Loaded domain cache"
        );
        Ok(Self { path, domains })
    }

    /// Load the cache, starting empty if the file is missing or unreadable.
    pub fn load_or_empty(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(&path) {
            Ok(cache) => cache,
            Err(e) if e.is_not_found() => {
                debug!(path = %path.display(), "No domain cache file, starting empty");
                Self::empty(path)
            }
            Err(e) => {
                warn!(error = %e, "Domain cache unreadable, starting empty");
                Self::empty(path)
            }
        }
    }

    /// Persist the full map, replacing the file.
    pub fn save(&self) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| CacheError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let content = serde_json::to_vec_pretty(&self.domains)?;

        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, &content).map_err(|source| CacheError::Io {
            path: tmp_path.clone(),
            source,
        })?;

        fs::rename(&tmp_path, &self.path).map_err(|source| CacheError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!(
            path = %self.path.display(),
            domain_count = self.domains.len(),
            "Saved domain cache"
        );
        Ok(())
    }

    /// Insert or replace a descriptor under its id.
    ///
    /// Returns the replaced descriptor, if any.
    pub fn insert(&mut self, spec: VmSpec) -> Option<VmSpec> {
        self.domains.insert(spec.id.clone(), spec)
    }

    /// Remove a descriptor by id.
    pub fn remove(&mut self, id: &str) -> Option<VmSpec> {
        self.domains.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&VmSpec> {
        self.domains.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.domains.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// All cached descriptors.
    pub fn specs(&self) -> impl Iterator<Item = &VmSpec> {
        self.domains.values()
    }

    /// Path of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

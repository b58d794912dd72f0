//! Package manifests discovered in the materialized workspace.
//!
//! The registry is built once at initialize from the directories the
//! materializer recorded and is immutable afterwards.

use std::path::PathBuf;

use serde_json::Value;
use tower_lsp::lsp_types::Url;
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::uris::WorkspaceRoots;

/// Subset of `package.json` the gateway reads. Rewrites go through raw
/// JSON so unknown fields survive untouched.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub name: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub dependencies: serde_json::Map<String, Value>,
    #[serde(default)]
    pub dev_dependencies: serde_json::Map<String, Value>,
    pub types: Option<Value>,
    pub typings: Option<Value>,
    pub repository: Option<Repository>,
    pub git_head: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
pub enum Repository {
    Url(String),
    Info {
        url: Option<String>,
        directory: Option<String>,
    },
}

impl PackageManifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| GatewayError::mapping(format!("malformed package.json: {err}")))
    }

    pub fn repository_url(&self) -> Option<String> {
        match self.repository.as_ref()? {
            Repository::Url(url) => Some(url.clone()),
            Repository::Info { url, .. } => url.clone(),
        }
    }

    pub fn repository_directory(&self) -> Option<String> {
        match self.repository.as_ref()? {
            Repository::Url(_) => None,
            Repository::Info { directory, .. } => directory.clone(),
        }
    }

    /// Whether this manifest declares `package` as a direct dependency.
    pub fn declares(&self, package: &str) -> bool {
        self.dependencies.contains_key(package) || self.dev_dependencies.contains_key(package)
    }
}

/// A directory inside the workspace that holds a `package.json`, with
/// its URI in both namespaces.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    /// Directory path relative to the workspace root; empty for the root
    /// itself.
    pub rel_dir: String,
    /// Directory URI under `httpRoot`, trailing slash.
    pub http_dir: Url,
    /// Directory URI under `fileRoot`, trailing slash.
    pub file_dir: Url,
    /// Filesystem directory.
    pub dir_path: PathBuf,
    pub manifest: PackageManifest,
}

#[derive(Debug, Default)]
pub struct ManifestRegistry {
    entries: Vec<ManifestEntry>,
}

impl ManifestRegistry {
    /// Reads each recorded manifest directory. A manifest that fails to
    /// parse keeps its entry with empty dependency tables.
    pub fn build(roots: &WorkspaceRoots, rel_dirs: &[String]) -> Result<Self> {
        let mut entries = Vec::with_capacity(rel_dirs.len());
        for rel_dir in rel_dirs {
            let (http_dir, file_dir) = if rel_dir.is_empty() {
                (roots.http_root().clone(), roots.file_root().clone())
            } else {
                let suffixed = format!("{rel_dir}/");
                let http_dir = roots.http_root().join(&suffixed).map_err(|err| {
                    GatewayError::mapping(format!("bad manifest directory {rel_dir}: {err}"))
                })?;
                let file_dir = roots.file_root().join(&suffixed).map_err(|err| {
                    GatewayError::mapping(format!("bad manifest directory {rel_dir}: {err}"))
                })?;
                (http_dir, file_dir)
            };
            let dir_path = if rel_dir.is_empty() {
                roots.file_root_path().to_path_buf()
            } else {
                roots.file_root_path().join(rel_dir)
            };

            let manifest_path = dir_path.join("package.json");
            let manifest = match std::fs::read(&manifest_path) {
                Ok(bytes) => PackageManifest::parse(&bytes).unwrap_or_else(|err| {
                    warn!("{}: {err}", manifest_path.display());
                    PackageManifest::default()
                }),
                Err(err) => {
                    warn!("cannot read {}: {err}", manifest_path.display());
                    PackageManifest::default()
                }
            };

            entries.push(ManifestEntry {
                rel_dir: rel_dir.clone(),
                http_dir,
                file_dir,
                dir_path,
                manifest,
            });
        }
        Ok(Self { entries })
    }

    /// Entries whose directory is a prefix of `uri`, in either namespace.
    pub fn parents_of(&self, uri: &Url) -> Vec<&ManifestEntry> {
        self.entries
            .iter()
            .filter(|entry| {
                uri.as_str().starts_with(entry.http_dir.as_str())
                    || uri.as_str().starts_with(entry.file_dir.as_str())
            })
            .collect()
    }

    /// Entries whose manifest declares `package` in `dependencies` or
    /// `devDependencies`.
    pub fn declared_in(&self, package: &str) -> Vec<&ManifestEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.manifest.declares(package))
            .collect()
    }

    /// Snapshot for concurrent traversal.
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }
}

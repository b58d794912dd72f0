//! Remote workspace materialization.
//!
//! The workspace tarball is streamed from the HTTP root, filtered down
//! to the file kinds the downstream service can use, and expanded under
//! the per-session extraction root. Manifest locations are recorded on
//! the way through.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use flate2::read::GzDecoder;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::Url;
use tracing::{info, warn};

use crate::error::{throw_if_cancelled, GatewayError, Result};
use crate::progress::ProgressReporter;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug)]
pub struct MaterializedWorkspace {
    /// Manifest directories relative to the extraction root; empty
    /// string for the root itself. Sorted, deduplicated.
    pub manifest_dirs: Vec<String>,
    pub files_written: usize,
}

/// Streams the archive behind `http_root` and expands it into `dest`.
/// Cancellation aborts the stream; the partially extracted tree is left
/// for session disposal to clean up.
pub async fn materialize(
    http_root: &Url,
    dest: &Path,
    client: &reqwest::Client,
    bearer: Option<&str>,
    cancel: &CancellationToken,
    progress: &ProgressReporter,
) -> Result<MaterializedWorkspace> {
    throw_if_cancelled(cancel)?;

    let mut request = client
        .get(http_root.clone())
        .header(ACCEPT, "application/x-tar");
    if let Some(bearer) = bearer {
        request = request.header(AUTHORIZATION, format!("Bearer {bearer}"));
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("fetching workspace archive from {http_root}"))?
        .error_for_status()
        .with_context(|| format!("fetching workspace archive from {http_root}"))?;

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !content_type.starts_with("application/") {
        return Err(GatewayError::Validation(format!(
            "workspace archive has content type {content_type:?}, expected application/*"
        )));
    }

    let content_length = response.content_length();
    let mut body = Vec::with_capacity(content_length.unwrap_or(0) as usize);
    let mut stream = response.bytes_stream();
    let mut last_reported = 0u32;
    while let Some(chunk) = stream.next().await {
        throw_if_cancelled(cancel)?;
        let chunk = chunk.context("streaming workspace archive")?;
        body.extend_from_slice(&chunk);
        if let Some(total) = content_length {
            if total > 0 {
                let pct = ((body.len() as u64 * 100) / total).min(100) as u32;
                if pct >= last_reported + 5 {
                    last_reported = pct;
                    progress.percent(pct, None).await;
                }
            }
        }
    }
    throw_if_cancelled(cancel)?;
    info!(bytes = body.len(), "workspace archive downloaded");

    let dest = dest.to_path_buf();
    let stats = tokio::task::spawn_blocking(move || extract_archive(&body, &dest))
        .await
        .map_err(|err| anyhow::anyhow!("archive extraction task failed: {err}"))??;
    info!(
        files = stats.files_written,
        manifests = stats.manifest_dirs.len(),
        "workspace materialized"
    );
    Ok(stats)
}

/// Expands the (possibly gzipped) tar stream. Only type-bearing file
/// kinds are written; `package.json` locations outside `node_modules`
/// are recorded as manifest directories.
fn extract_archive(bytes: &[u8], dest: &Path) -> Result<MaterializedWorkspace> {
    let reader: Box<dyn Read + '_> = if bytes.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(bytes))
    } else {
        Box::new(bytes)
    };
    let mut archive = tar::Archive::new(reader);

    let mut manifest_dirs = BTreeSet::new();
    let mut files_written = 0;
    for entry in archive.entries().context("reading archive")? {
        let mut entry = entry.context("reading archive entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let entry_path = entry.path().context("archive entry path")?;
        let Some(rel) = safe_relative_path(&entry_path) else {
            warn!("skipping archive entry with unsafe path: {}", entry_path.display());
            continue;
        };
        let Some(name) = rel.file_name().and_then(|name| name.to_str()) else {
            continue;
        };

        if name == "package.json" && !under_node_modules(&rel) {
            let dir = rel
                .parent()
                .map(|parent| slash_join(parent))
                .unwrap_or_default();
            manifest_dirs.insert(dir);
        }

        if !keeps_file(name) {
            continue;
        }

        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = std::fs::File::create(&target)
            .with_context(|| format!("creating {}", target.display()))?;
        std::io::copy(&mut entry, &mut file)
            .with_context(|| format!("writing {}", target.display()))?;
        files_written += 1;
    }

    Ok(MaterializedWorkspace {
        manifest_dirs: manifest_dirs.into_iter().collect(),
        files_written,
    })
}

/// Final path segments the downstream can use: `.d.ts`, `.ts(x)`,
/// `.js(x)`, `.json`, each optionally preceded by `.d`.
fn keeps_file(name: &str) -> bool {
    [".ts", ".tsx", ".js", ".jsx", ".json"]
        .iter()
        .any(|ext| name.strip_suffix(ext).is_some_and(|stem| !stem.is_empty()))
}

/// Accepts only plain relative paths; anything with `..`, a root, or a
/// prefix component never touches the filesystem.
fn safe_relative_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn under_node_modules(rel: &Path) -> bool {
    rel.components()
        .any(|component| component.as_os_str() == "node_modules")
}

fn slash_join(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

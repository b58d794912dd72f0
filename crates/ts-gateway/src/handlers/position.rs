//! Text-document-position mapping across namespaces.
//!
//! In-workspace URIs take the plain rewrite. Cross-repository URIs
//! install every manifest declaring the inferred package, warm the
//! downstream up on the surrounding projects, then resolve the position
//! through the declaration maps.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{Position, Url};
use tracing::debug;

use crate::error::{throw_if_cancelled, GatewayError, Result};
use crate::manifests::ManifestEntry;
use crate::resources::ResourceRetriever;
use crate::session::Session;
use crate::sourcemaps;
use crate::uris::{self, ExternalRepo};

/// Width of the project warmup fan-out.
const WARMUP_CONCURRENCY: usize = 10;

pub async fn map_text_document_position(
    session: &Arc<Session>,
    uri: &Url,
    position: Position,
    cancel: &CancellationToken,
) -> Result<(Url, Position)> {
    throw_if_cancelled(cancel)?;
    if session.roots.http_rel(uri).is_some() {
        return Ok((session.roots.http_to_file(uri)?, position));
    }

    let external = ExternalRepo::parse(uri).ok_or_else(|| {
        GatewayError::mapping(format!(
            "{uri} is neither under the workspace root nor an external-repo URI"
        ))
    })?;
    let location = sourcemaps::find_package_root_and_name(
        &external,
        &session.retrievers,
        &session.instance,
        session.access_token(),
        cancel,
    )
    .await?;

    let declaring: Vec<ManifestEntry> = session
        .registry
        .declared_in(&location.package)
        .into_iter()
        .cloned()
        .collect();
    let preparations = declaring.into_iter().map(|entry| {
        let session = Arc::clone(session);
        let cancel = cancel.clone();
        async move {
            let install = session.installs.ensure_installed(&entry);
            let warmup = warm_up_projects(&session, &entry, &cancel);
            let (_, warmed) = tokio::join!(install, warmup);
            if let Err(err) = warmed {
                if !err.is_cancelled() {
                    debug!("project warmup under {}: {err}", entry.rel_dir);
                }
            }
        }
    });
    futures::future::join_all(preparations).await;
    throw_if_cancelled(cancel)?;

    let resolved = sourcemaps::resolve_incoming(
        &session.retrievers,
        session.roots.file_root(),
        &session.temp_root,
        &location,
        position,
        cancel,
    )
    .await?;
    resolved.ok_or_else(|| {
        GatewayError::mapping(format!(
            "cannot locate {}/{} (package {}) in any installed dependency",
            external.repo, external.path, location.package
        ))
    })
}

/// Opens one source file per discovered tsconfig project so the
/// downstream loads those projects before the real request arrives.
async fn warm_up_projects(
    session: &Arc<Session>,
    entry: &ManifestEntry,
    cancel: &CancellationToken,
) -> Result<()> {
    throw_if_cancelled(cancel)?;

    let mut project_dirs = BTreeSet::new();
    let configs = session.retrievers.file().glob(
        &entry.file_dir,
        "**/tsconfig.json",
        Some("**/node_modules/**"),
    )?;
    for config in configs {
        if let Some(path) = uris::uri_to_path(&config) {
            if let Some(parent) = path.parent() {
                project_dirs.insert(parent.to_path_buf());
            }
        }
    }
    // Parent directories up to the workspace root can hold the
    // governing tsconfig as well.
    let mut dir = Some(entry.dir_path.as_path());
    while let Some(current) = dir {
        if current.join("tsconfig.json").exists() {
            project_dirs.insert(current.to_path_buf());
        }
        if current == session.roots.file_root_path() {
            break;
        }
        dir = current.parent();
    }

    let mut warmups = stream::iter(project_dirs.into_iter().map(|project| {
        let session = Arc::clone(session);
        async move {
            let Some(root) = uris::path_to_uri(&project).map(uris::as_dir_url) else {
                return;
            };
            let first_source = ["**/*.ts", "**/*.tsx"].iter().find_map(|pattern| {
                session
                    .retrievers
                    .file()
                    .glob(&root, pattern, Some("**/node_modules/**"))
                    .ok()
                    .and_then(|hits| hits.into_iter().next())
            });
            let Some(source) = first_source else {
                return;
            };
            if let Err(err) = session.ensure_open(&source).await {
                if !err.is_cancelled() {
                    debug!("warmup open {source}: {err}");
                }
            }
        }
    }))
    .buffer_unordered(WARMUP_CONCURRENCY);
    while warmups.next().await.is_some() {
        throw_if_cancelled(cancel)?;
    }
    Ok(())
}

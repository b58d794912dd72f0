//! Session construction: validation, materialization, registry build,
//! downstream start.

use std::sync::Arc;

use anyhow::Context;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{InitializeParams, InitializeResult, ServerInfo, Url};
use tower_lsp::Client;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::downstream::DownstreamSupervisor;
use crate::error::{GatewayError, Result};
use crate::install::{
    InstallContext, InstallationCoordinator, NpmRegistryMetadata, ProcessInstaller,
};
use crate::manifests::ManifestRegistry;
use crate::progress::ProgressReporter;
use crate::resources::Retrievers;
use crate::session::{spawn_restart_listener, GatewayOptions, Session};
use crate::uris::{self, WorkspaceRoots};
use crate::workspace;
use crate::{tsconfig, handlers};

pub async fn initialize(
    client: &Client,
    options: &Arc<GatewayOptions>,
    params: InitializeParams,
) -> Result<(Arc<Session>, InitializeResult)> {
    let http_root = validate_root(&params)?;
    let config = GatewayConfig::from_initialization_options(params.initialization_options.as_ref());

    let progress_supported = params
        .capabilities
        .window
        .as_ref()
        .and_then(|window| window.work_done_progress)
        .unwrap_or(false);
    let progress_enabled = config.progress.unwrap_or(progress_supported);

    let session_id = options.next_session_id();
    info!(session = session_id, %http_root, "initializing session");

    // Filesystem layout: repo/ cache/ global/ tsserver_cache/ (.npmrc).
    let temp_dir = match &options.temp_parent {
        Some(parent) => tempfile::Builder::new()
            .prefix("ts-gateway-")
            .tempdir_in(parent),
        None => tempfile::Builder::new().prefix("ts-gateway-").tempdir(),
    }
    .context("creating session temp directory")?;
    let temp_root = temp_dir.path().to_path_buf();
    let repo_dir = temp_root.join("repo");
    let tsserver_cache = temp_root.join("tsserver_cache");
    for dir in [
        &repo_dir,
        &temp_root.join("cache"),
        &temp_root.join("global"),
        &tsserver_cache,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .context("creating session directories")?;
    }
    let npmrc_path = match config.npmrc_contents() {
        Some(contents) => {
            let path = temp_root.join(".npmrc");
            tokio::fs::write(&path, contents)
                .await
                .context("writing .npmrc")?;
            Some(path)
        }
        None => None,
    };

    let cancel = CancellationToken::new();
    let reporter = ProgressReporter::new(client.clone(), progress_enabled, "initialize");
    reporter.begin("Fetching workspace").await;

    let materialized = match workspace::materialize(
        &http_root,
        &repo_dir,
        &options.http_client,
        config.access_token.as_deref(),
        &cancel,
        &reporter,
    )
    .await
    {
        Ok(materialized) => materialized,
        Err(err) => {
            reporter.end(Some("workspace fetch failed".to_string())).await;
            return Err(err);
        }
    };

    let roots = WorkspaceRoots::new(http_root, &repo_dir)?;
    let registry = ManifestRegistry::build(&roots, &materialized.manifest_dirs)?;
    tsconfig::sanitize_tree(&repo_dir);

    // External-repo links default to the instance serving the workspace.
    let instance = match &config.sourcegraph_url {
        Some(url) => url.clone(),
        None => roots
            .http_root()
            .join("/")
            .map_err(|err| GatewayError::mapping(format!("bad workspace origin: {err}")))?,
    };

    let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
    let (restart_tx, restart_rx) = mpsc::unbounded_channel();

    let registry_url = config
        .npmrc
        .as_ref()
        .and_then(|map| map.get("registry"))
        .and_then(|value| value.as_str())
        .and_then(|raw| Url::parse(raw).ok());
    let installs = InstallationCoordinator::new(InstallContext {
        installer: Arc::new(ProcessInstaller::new(options.installer_command.clone())),
        metadata: Arc::new(NpmRegistryMetadata::new(
            options.http_client.clone(),
            registry_url,
        )),
        global_root: temp_root.join("global"),
        cache_root: temp_root.join("cache"),
        npmrc_path,
        restart_tx,
        restart_after_install: config.restart_after_install,
        cancel: cancel.clone(),
    });

    let supervisor = Arc::new(DownstreamSupervisor::new(
        options.downstream_command.clone(),
        repo_dir.clone(),
        notifications_tx,
    ));
    let downstream_init = json!({
        "processId": std::process::id(),
        "rootUri": roots.file_root(),
        "rootPath": repo_dir,
        "capabilities": {},
        "initializationOptions": {
            "tsserver": { "cacheDirectory": tsserver_cache },
        },
        "workspaceFolders": null,
    });
    let downstream_result = match supervisor.start(downstream_init, &cancel).await {
        Ok(result) => result,
        Err(err) => {
            reporter
                .end(Some("language service failed to start".to_string()))
                .await;
            return Err(err);
        }
    };
    let mut init_result: InitializeResult = serde_json::from_value(downstream_result)
        .map_err(|err| GatewayError::Downstream(format!("malformed initialize result: {err}")))?;
    init_result.server_info = Some(ServerInfo {
        name: "ts-gateway".to_string(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
    });

    let session = Arc::new(Session::new(
        session_id,
        roots,
        config,
        registry,
        Retrievers::new(options.http_client.clone()),
        installs,
        supervisor,
        cancel,
        temp_root,
        instance,
    ));

    // Reverse disposal order: notification pump, downstream, temp dir.
    session.disposables.push(
        "temp-dir",
        Box::new(move || {
            async move {
                if let Err(err) = temp_dir.close() {
                    warn!("removing session temp directory: {err}");
                }
            }
            .boxed()
        }),
    );
    let supervisor_handle = Arc::clone(&session.supervisor);
    session.disposables.push(
        "downstream",
        Box::new(move || {
            async move {
                supervisor_handle.dispose().await;
            }
            .boxed()
        }),
    );
    let pump = handlers::spawn_notification_pump(
        client.clone(),
        Arc::clone(&session),
        notifications_rx,
    );
    let restarts = spawn_restart_listener(&session, restart_rx);
    session.disposables.push(
        "background-tasks",
        Box::new(move || {
            async move {
                pump.abort();
                restarts.abort();
            }
            .boxed()
        }),
    );

    reporter.end(Some("workspace ready".to_string())).await;
    info!(
        session = session.id,
        files = materialized.files_written,
        manifests = session.registry.entries().len(),
        "session ready"
    );
    Ok((session, init_result))
}

/// Root checks run before anything touches the filesystem: the URI must
/// exist, be http(s), and at most one workspace folder may accompany it.
fn validate_root(params: &InitializeParams) -> Result<Url> {
    if params
        .workspace_folders
        .as_ref()
        .is_some_and(|folders| folders.len() > 1)
    {
        return Err(GatewayError::Validation(
            "multiple workspace folders are not supported".to_string(),
        ));
    }
    #[allow(deprecated)]
    let root = params
        .root_uri
        .clone()
        .or_else(|| {
            params
                .workspace_folders
                .as_ref()
                .and_then(|folders| folders.first())
                .map(|folder| folder.uri.clone())
        })
        .ok_or_else(|| GatewayError::Validation("rootUri is required".to_string()))?;
    if root.scheme() != "http" && root.scheme() != "https" {
        return Err(GatewayError::Validation(format!(
            "rootUri must be http or https, got {}",
            root.scheme()
        )));
    }
    Ok(uris::as_dir_url(root))
}

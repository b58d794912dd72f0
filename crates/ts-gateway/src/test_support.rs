//! Shared fixtures for handler tests.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::Url;

use crate::config::GatewayConfig;
use crate::downstream::DownstreamSupervisor;
use crate::install::{
    DependencyInstaller, InstallContext, InstallRequest, InstallationCoordinator, RegistryMetadata,
};
use crate::manifests::ManifestRegistry;
use crate::resources::Retrievers;
use crate::session::Session;
use crate::uris::WorkspaceRoots;

pub(crate) struct NoopInstaller;

#[tower_lsp::async_trait]
impl DependencyInstaller for NoopInstaller {
    async fn install(
        &self,
        _request: &InstallRequest,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

pub(crate) struct NoTypesMetadata;

#[tower_lsp::async_trait]
impl RegistryMetadata for NoTypesMetadata {
    async fn ships_types(&self, _package: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

pub(crate) struct Fixture {
    /// Owns the workspace on disk for the test's lifetime.
    #[allow(dead_code)]
    pub tmp: tempfile::TempDir,
    pub session: Arc<Session>,
    pub restart_rx: mpsc::UnboundedReceiver<()>,
}

/// Builds a session over a throwaway workspace. `build` populates the
/// `repo/` extraction dir before the manifest registry is read.
pub(crate) fn fixture(build: impl FnOnce(&Path), manifest_dirs: &[&str]) -> Fixture {
    let tmp = tempfile::tempdir().expect("tempdir");
    let repo = tmp.path().join("repo");
    std::fs::create_dir_all(&repo).expect("repo dir");
    build(&repo);

    let http_root = Url::parse("https://h/repo@abc/-/raw/").expect("root url");
    let roots = WorkspaceRoots::new(http_root, &repo).expect("roots");
    let rel_dirs: Vec<String> = manifest_dirs.iter().map(|dir| (*dir).to_string()).collect();
    let registry = ManifestRegistry::build(&roots, &rel_dirs).expect("registry");

    let cancel = CancellationToken::new();
    let (notes_tx, _notes_rx) = mpsc::unbounded_channel();
    let (restart_tx, restart_rx) = mpsc::unbounded_channel();
    let supervisor = Arc::new(DownstreamSupervisor::new(
        vec!["true".to_string()],
        repo.clone(),
        notes_tx,
    ));
    let installs = InstallationCoordinator::new(InstallContext {
        installer: Arc::new(NoopInstaller),
        metadata: Arc::new(NoTypesMetadata),
        global_root: tmp.path().join("global"),
        cache_root: tmp.path().join("cache"),
        npmrc_path: None,
        restart_tx,
        restart_after_install: true,
        cancel: cancel.clone(),
    });

    let session = Arc::new(Session::new(
        1,
        roots,
        GatewayConfig::default(),
        registry,
        Retrievers::new(reqwest::Client::new()),
        installs,
        supervisor,
        cancel,
        tmp.path().to_path_buf(),
        Url::parse("https://sourcegraph.example.com").expect("instance url"),
    ));
    Fixture {
        tmp,
        session,
        restart_rx,
    }
}

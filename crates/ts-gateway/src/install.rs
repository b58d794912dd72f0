//! Lazy, single-flight dependency installation.
//!
//! Each manifest directory gets at most one installation attempt per
//! session; concurrent callers share the same future. Failures are
//! terminal and logged, never propagated into the request that
//! triggered them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use reqwest::StatusCode;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::Url;
use tracing::{debug, warn};

use crate::error::{throw_if_cancelled, GatewayError, Result};
use crate::manifests::ManifestEntry;
use crate::tsconfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Completed,
    Failed,
}

pub type SharedInstall = Shared<BoxFuture<'static, InstallOutcome>>;

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub manifest_dir: PathBuf,
    pub global_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub npmrc_path: Option<PathBuf>,
}

/// The dependency installer is an external collaborator; the gateway
/// only needs isolation directories and a registry config honored.
#[tower_lsp::async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(
        &self,
        request: &InstallRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Runs the configured package-manager command in the manifest
/// directory.
pub struct ProcessInstaller {
    command: Vec<String>,
}

impl ProcessInstaller {
    pub fn new(command: Vec<String>) -> Self {
        let command = if command.is_empty() {
            vec!["yarn".to_string()]
        } else {
            command
        };
        Self { command }
    }
}

impl Default for ProcessInstaller {
    fn default() -> Self {
        Self::new(vec!["yarn".to_string()])
    }
}

#[tower_lsp::async_trait]
impl DependencyInstaller for ProcessInstaller {
    async fn install(
        &self,
        request: &InstallRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut command = tokio::process::Command::new(&self.command[0]);
        command.args(&self.command[1..]);
        command
            .arg("install")
            .arg("--ignore-scripts")
            .arg("--ignore-engines")
            .arg("--non-interactive")
            .arg("--no-progress")
            .arg("--cache-folder")
            .arg(&request.cache_dir)
            .arg("--global-folder")
            .arg(&request.global_dir)
            .current_dir(&request.manifest_dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(npmrc) = &request.npmrc_path {
            command.env("NPM_CONFIG_USERCONFIG", npmrc);
        }

        let child = command
            .spawn()
            .with_context(|| format!("spawning {}", self.command.join(" ")))?;
        let output = tokio::select! {
            output = child.wait_with_output() => output.context("waiting for installer")?,
            () = cancel.cancelled() => anyhow::bail!("installation cancelled"),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "installer exited with {}: {}",
                output.status,
                stderr.trim_end()
            );
        }
        Ok(())
    }
}

/// Registry metadata lookup, consulted to decide whether a dependency
/// ships its own type declarations.
#[tower_lsp::async_trait]
pub trait RegistryMetadata: Send + Sync {
    async fn ships_types(&self, package: &str) -> anyhow::Result<bool>;
}

pub struct NpmRegistryMetadata {
    client: reqwest::Client,
    registry: Url,
}

impl NpmRegistryMetadata {
    pub fn new(client: reqwest::Client, registry: Option<Url>) -> Self {
        let registry = registry
            .unwrap_or_else(|| Url::parse("https://registry.npmjs.org/").expect("static URL"));
        Self { client, registry }
    }
}

#[tower_lsp::async_trait]
impl RegistryMetadata for NpmRegistryMetadata {
    async fn ships_types(&self, package: &str) -> anyhow::Result<bool> {
        // Scoped names keep their slash encoded in registry paths.
        let encoded = package.replace('/', "%2F");
        let url = format!("{}{encoded}/latest", self.registry);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("fetching registry metadata for {package}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let body: Value = response
            .error_for_status()
            .with_context(|| format!("fetching registry metadata for {package}"))?
            .json()
            .await
            .with_context(|| format!("parsing registry metadata for {package}"))?;
        Ok(body.get("types").is_some() || body.get("typings").is_some())
    }
}

pub struct InstallContext {
    pub installer: Arc<dyn DependencyInstaller>,
    pub metadata: Arc<dyn RegistryMetadata>,
    /// `global/<relManifest>/` isolation root.
    pub global_root: PathBuf,
    /// `cache/<relManifest>/` isolation root.
    pub cache_root: PathBuf,
    pub npmrc_path: Option<PathBuf>,
    /// Signals the session controller that the downstream should be
    /// restarted to pick up new `node_modules`.
    pub restart_tx: mpsc::UnboundedSender<()>,
    pub restart_after_install: bool,
    /// Session-scoped token; installations die with the session.
    pub cancel: CancellationToken,
}

pub struct InstallationCoordinator {
    installs: Mutex<FxHashMap<Url, SharedInstall>>,
    ctx: Arc<InstallContext>,
}

impl InstallationCoordinator {
    pub fn new(ctx: InstallContext) -> Self {
        Self {
            installs: Mutex::new(FxHashMap::default()),
            ctx: Arc::new(ctx),
        }
    }

    /// Returns the shared future for the manifest's one installation
    /// attempt, starting it on first call.
    pub fn ensure_installed(&self, entry: &ManifestEntry) -> SharedInstall {
        let key = entry.http_dir.clone();
        let mut installs = self.installs.lock();
        if let Some(existing) = installs.get(&key) {
            return existing.clone();
        }
        let ctx = Arc::clone(&self.ctx);
        let entry = entry.clone();
        let install = async move {
            let rel = if entry.rel_dir.is_empty() {
                "<root>".to_string()
            } else {
                entry.rel_dir.clone()
            };
            match run_install(&ctx, &entry).await {
                Ok(ran_installer) => {
                    debug!("dependency installation for {rel} finished");
                    if ran_installer && ctx.restart_after_install {
                        let _ = ctx.restart_tx.send(());
                    }
                    InstallOutcome::Completed
                }
                Err(err) if err.is_cancelled() => {
                    debug!("dependency installation for {rel} cancelled");
                    InstallOutcome::Failed
                }
                Err(err) => {
                    warn!("dependency installation for {rel} failed: {err}");
                    InstallOutcome::Failed
                }
            }
        }
        .boxed()
        .shared();
        installs.insert(key, install.clone());
        install
    }

    /// Whether an installation has been started for the manifest.
    #[cfg(test)]
    pub fn started(&self, manifest_http_dir: &Url) -> bool {
        self.installs.lock().contains_key(manifest_http_dir)
    }
}

/// Returns whether the installer actually ran.
async fn run_install(ctx: &InstallContext, entry: &ManifestEntry) -> Result<bool> {
    throw_if_cancelled(&ctx.cancel)?;

    let remaining = filter_typed_dependencies(ctx, entry).await?;
    if remaining == 0 {
        debug!(
            "no type-bearing dependencies under {}; skipping installer",
            entry.dir_path.display()
        );
        return Ok(false);
    }

    let suffix = entry.rel_dir.as_str();
    let request = InstallRequest {
        manifest_dir: entry.dir_path.clone(),
        global_dir: ctx.global_root.join(suffix),
        cache_dir: ctx.cache_root.join(suffix),
        npmrc_path: ctx.npmrc_path.clone(),
    };
    tokio::fs::create_dir_all(&request.global_dir)
        .await
        .context("creating installer global dir")?;
    tokio::fs::create_dir_all(&request.cache_dir)
        .await
        .context("creating installer cache dir")?;

    throw_if_cancelled(&ctx.cancel)?;
    ctx.installer
        .install(&request, &ctx.cancel)
        .await
        .map_err(GatewayError::Other)?;

    // Plugins inside freshly installed packages must never reach the
    // downstream service.
    tsconfig::sanitize_tree(&entry.dir_path.join("node_modules"));
    Ok(true)
}

/// Keeps `@types/*` dependencies unconditionally and anything the
/// registry says ships declarations; drops the rest. The manifest is
/// rewritten only when something was dropped and something remains.
async fn filter_typed_dependencies(ctx: &InstallContext, entry: &ManifestEntry) -> Result<usize> {
    let manifest_path = entry.dir_path.join("package.json");
    let bytes = tokio::fs::read(&manifest_path)
        .await
        .with_context(|| format!("reading {}", manifest_path.display()))?;
    let mut manifest: Value = serde_json::from_slice(&bytes)
        .map_err(|err| GatewayError::mapping(format!("{}: {err}", manifest_path.display())))?;

    let mut removed = 0usize;
    let mut remaining = 0usize;
    for section in ["dependencies", "devDependencies"] {
        let Some(deps) = manifest.get_mut(section).and_then(Value::as_object_mut) else {
            continue;
        };
        let names: Vec<String> = deps.keys().cloned().collect();
        for name in names {
            throw_if_cancelled(&ctx.cancel)?;
            let keep = if name.starts_with("@types/") {
                true
            } else {
                match ctx.metadata.ships_types(&name).await {
                    Ok(ships) => ships,
                    Err(err) => {
                        warn!("registry metadata for {name} unreachable, keeping it: {err}");
                        true
                    }
                }
            };
            if keep {
                remaining += 1;
            } else {
                deps.remove(&name);
                removed += 1;
            }
        }
    }

    if removed > 0 && remaining > 0 {
        let rendered = serde_json::to_string_pretty(&manifest)
            .context("serializing filtered package.json")?;
        tokio::fs::write(&manifest_path, rendered)
            .await
            .with_context(|| format!("rewriting {}", manifest_path.display()))?;
    }
    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifests::PackageManifest;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingInstaller {
        invocations: AtomicUsize,
        fail: bool,
    }

    #[tower_lsp::async_trait]
    impl DependencyInstaller for CountingInstaller {
        async fn install(
            &self,
            request: &InstallRequest,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            assert!(request.global_dir.exists());
            assert!(request.cache_dir.exists());
            if self.fail {
                anyhow::bail!("simulated installer failure");
            }
            Ok(())
        }
    }

    struct StaticMetadata;

    #[tower_lsp::async_trait]
    impl RegistryMetadata for StaticMetadata {
        async fn ships_types(&self, package: &str) -> anyhow::Result<bool> {
            match package {
                "typed-pkg" => Ok(true),
                "flaky-pkg" => anyhow::bail!("registry down"),
                _ => Ok(false),
            }
        }
    }

    fn entry_at(dir: &Path, manifest: &str) -> ManifestEntry {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("package.json"), manifest).unwrap();
        let file_dir = Url::from_directory_path(dir).unwrap();
        ManifestEntry {
            rel_dir: String::new(),
            http_dir: Url::parse("https://h/repo@abc/-/raw/").unwrap(),
            file_dir,
            dir_path: dir.to_path_buf(),
            manifest: PackageManifest::default(),
        }
    }

    fn coordinator(
        tmp: &Path,
        installer: Arc<CountingInstaller>,
    ) -> (InstallationCoordinator, mpsc::UnboundedReceiver<()>) {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let coordinator = InstallationCoordinator::new(InstallContext {
            installer,
            metadata: Arc::new(StaticMetadata),
            global_root: tmp.join("global"),
            cache_root: tmp.join("cache"),
            npmrc_path: None,
            restart_tx,
            restart_after_install: true,
            cancel: CancellationToken::new(),
        });
        (coordinator, restart_rx)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_attempt() {
        let tmp = tempfile::tempdir().unwrap();
        let entry = entry_at(
            &tmp.path().join("repo"),
            r#"{ "dependencies": { "@types/node": "*" } }"#,
        );
        let installer = Arc::new(CountingInstaller {
            invocations: AtomicUsize::new(0),
            fail: false,
        });
        let (coordinator, mut restart_rx) = coordinator(tmp.path(), Arc::clone(&installer));

        let (a, b) = tokio::join!(
            coordinator.ensure_installed(&entry),
            coordinator.ensure_installed(&entry)
        );
        assert_eq!(a, InstallOutcome::Completed);
        assert_eq!(b, InstallOutcome::Completed);
        assert_eq!(installer.invocations.load(Ordering::SeqCst), 1);
        assert!(restart_rx.try_recv().is_ok(), "restart requested");
    }

    #[tokio::test]
    async fn untyped_dependencies_are_filtered_before_install() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("repo");
        let entry = entry_at(
            &dir,
            r#"{
                "name": "app",
                "dependencies": { "@types/node": "*", "plain-pkg": "1.0.0" },
                "devDependencies": { "typed-pkg": "2.0.0" }
            }"#,
        );
        let installer = Arc::new(CountingInstaller {
            invocations: AtomicUsize::new(0),
            fail: false,
        });
        let (coordinator, _rx) = coordinator(tmp.path(), Arc::clone(&installer));
        assert_eq!(
            coordinator.ensure_installed(&entry).await,
            InstallOutcome::Completed
        );
        assert_eq!(installer.invocations.load(Ordering::SeqCst), 1);

        let rewritten: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("package.json")).unwrap())
                .unwrap();
        assert!(rewritten["dependencies"].get("@types/node").is_some());
        assert!(rewritten["dependencies"].get("plain-pkg").is_none());
        assert!(rewritten["devDependencies"].get("typed-pkg").is_some());
        assert_eq!(rewritten["name"], "app", "unrelated fields survive");
    }

    #[tokio::test]
    async fn unreachable_metadata_keeps_the_dependency() {
        let tmp = tempfile::tempdir().unwrap();
        let entry = entry_at(
            &tmp.path().join("repo"),
            r#"{ "dependencies": { "flaky-pkg": "*" } }"#,
        );
        let installer = Arc::new(CountingInstaller {
            invocations: AtomicUsize::new(0),
            fail: false,
        });
        let (coordinator, _rx) = coordinator(tmp.path(), Arc::clone(&installer));
        assert_eq!(
            coordinator.ensure_installed(&entry).await,
            InstallOutcome::Completed
        );
        assert_eq!(installer.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_qualifying_dependencies_skip_the_installer() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("repo");
        let original = r#"{ "dependencies": { "plain-pkg": "1.0.0" } }"#;
        let entry = entry_at(&dir, original);
        let installer = Arc::new(CountingInstaller {
            invocations: AtomicUsize::new(0),
            fail: false,
        });
        let (coordinator, mut restart_rx) = coordinator(tmp.path(), Arc::clone(&installer));
        assert_eq!(
            coordinator.ensure_installed(&entry).await,
            InstallOutcome::Completed
        );
        assert_eq!(installer.invocations.load(Ordering::SeqCst), 0);
        assert!(restart_rx.try_recv().is_err(), "no restart without install");
        // Nothing remains, so the manifest is left untouched.
        assert_eq!(
            std::fs::read_to_string(dir.join("package.json")).unwrap(),
            original
        );
    }

    #[tokio::test]
    async fn failure_is_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let entry = entry_at(
            &tmp.path().join("repo"),
            r#"{ "dependencies": { "@types/node": "*" } }"#,
        );
        let installer = Arc::new(CountingInstaller {
            invocations: AtomicUsize::new(0),
            fail: true,
        });
        let (coordinator, _rx) = coordinator(tmp.path(), Arc::clone(&installer));
        assert_eq!(
            coordinator.ensure_installed(&entry).await,
            InstallOutcome::Failed
        );
        assert_eq!(
            coordinator.ensure_installed(&entry).await,
            InstallOutcome::Failed
        );
        assert_eq!(
            installer.invocations.load(Ordering::SeqCst),
            1,
            "no retry after a terminal failure"
        );
    }
}

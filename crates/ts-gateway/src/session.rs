//! Per-connection session state and lifecycle.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::Url;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::downstream::DownstreamSupervisor;
use crate::error::{GatewayError, Result};
use crate::install::InstallationCoordinator;
use crate::manifests::ManifestRegistry;
use crate::resources::Retrievers;
use crate::uris::WorkspaceRoots;

/// Process-wide wiring, computed before any session exists and torn
/// down after the last one.
pub struct GatewayOptions {
    pub http_client: reqwest::Client,
    pub downstream_command: Vec<String>,
    pub installer_command: Vec<String>,
    /// Parent directory for per-session temp directories.
    pub temp_parent: Option<PathBuf>,
    pub listen: Option<String>,
    session_counter: AtomicU64,
}

impl GatewayOptions {
    pub fn from_env() -> Self {
        Self {
            http_client: reqwest::Client::new(),
            downstream_command: env_command("TS_GATEWAY_TSSERVER").unwrap_or_else(|| {
                vec!["typescript-language-server".to_string(), "--stdio".to_string()]
            }),
            installer_command: env_command("TS_GATEWAY_INSTALLER")
                .unwrap_or_else(|| vec!["yarn".to_string()]),
            temp_parent: std::env::var_os("TS_GATEWAY_CACHE_DIR").map(PathBuf::from),
            listen: std::env::var("TS_GATEWAY_LISTEN").ok(),
            session_counter: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::Relaxed)
    }
}

fn env_command(name: &str) -> Option<Vec<String>> {
    let raw = std::env::var(name).ok()?;
    let parts: Vec<String> = raw.split_whitespace().map(str::to_owned).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

/// The last parameters sent downstream for an open document; replayed
/// verbatim after a supervisor restart.
#[derive(Debug, Clone)]
pub struct OpenDocument {
    pub language_id: String,
    pub version: i32,
    pub text: String,
}

type DisposeFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Ordered cleanup registry; disposal pops in reverse insertion order,
/// awaiting each entry.
#[derive(Default)]
pub struct Disposables {
    stack: Mutex<Vec<(&'static str, DisposeFn)>>,
}

impl Disposables {
    pub fn push(&self, name: &'static str, dispose: DisposeFn) {
        self.stack.lock().push((name, dispose));
    }

    pub async fn run(&self) {
        let mut stack = std::mem::take(&mut *self.stack.lock());
        while let Some((name, dispose)) = stack.pop() {
            debug!("disposing {name}");
            dispose().await;
        }
    }
}

/// One client connection's worth of state. Everything hangs off this;
/// there is no process-global mutable state in the core.
pub struct Session {
    pub id: u64,
    pub roots: WorkspaceRoots,
    pub config: GatewayConfig,
    pub registry: ManifestRegistry,
    pub retrievers: Retrievers,
    pub installs: InstallationCoordinator,
    pub supervisor: Arc<DownstreamSupervisor>,
    /// Insertion-ordered replay log; written before each `didOpen` goes
    /// downstream.
    pub open_documents: tokio::sync::Mutex<IndexMap<Url, OpenDocument>>,
    pub cancel: CancellationToken,
    /// The per-session temp directory root (`repo/`, `cache/`,
    /// `global/`, `tsserver_cache/` live under it).
    pub temp_root: PathBuf,
    /// Instance used for external-repo URI construction.
    pub instance: Url,
    pub disposables: Disposables,
    disposed: AtomicBool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        roots: WorkspaceRoots,
        config: GatewayConfig,
        registry: ManifestRegistry,
        retrievers: Retrievers,
        installs: InstallationCoordinator,
        supervisor: Arc<DownstreamSupervisor>,
        cancel: CancellationToken,
        temp_root: PathBuf,
        instance: Url,
    ) -> Self {
        Self {
            id,
            roots,
            config,
            registry,
            retrievers,
            installs,
            supervisor,
            open_documents: tokio::sync::Mutex::new(IndexMap::new()),
            cancel,
            temp_root,
            instance,
            disposables: Disposables::default(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Token for one request; cancelled with the session.
    pub fn request_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.config.access_token.as_deref()
    }

    /// Records the document and sends `didOpen`, exactly once per file
    /// URI. The log entry is written before the notification goes out.
    pub async fn open_document(&self, uri: Url, doc: OpenDocument) -> Result<()> {
        let mut docs = self.open_documents.lock().await;
        if docs.contains_key(&uri) {
            return Ok(());
        }
        let params = did_open_params(&uri, &doc);
        docs.insert(uri, doc);
        self.supervisor
            .notify("textDocument/didOpen", params)
            .await
    }

    /// Opens a workspace file downstream if it is not already open,
    /// reading its text from the extraction.
    pub async fn ensure_open(&self, file_uri: &Url) -> Result<()> {
        {
            let docs = self.open_documents.lock().await;
            if docs.contains_key(file_uri) {
                return Ok(());
            }
        }
        let path = self.roots.file_uri_to_path(file_uri)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(GatewayError::not_found(file_uri.to_string()));
            }
            Err(err) => return Err(anyhow::Error::new(err).into()),
        };
        self.open_document(
            file_uri.clone(),
            OpenDocument {
                language_id: language_id_for(&path).to_string(),
                version: 0,
                text,
            },
        )
        .await
    }

    /// Full-sync content update; keeps the replay log coherent.
    pub async fn update_open_document(&self, uri: &Url, version: i32, text: Option<String>) {
        let mut docs = self.open_documents.lock().await;
        if let Some(doc) = docs.get_mut(uri) {
            doc.version = version;
            if let Some(text) = text {
                doc.text = text;
            }
        }
    }

    pub async fn close_document(&self, uri: &Url) {
        self.open_documents.lock().await.shift_remove(uri);
    }

    /// `didOpen` params for every open document, in insertion order.
    pub async fn open_documents_replay(&self) -> Vec<Value> {
        let docs = self.open_documents.lock().await;
        docs.iter()
            .map(|(uri, doc)| did_open_params(uri, doc))
            .collect()
    }

    /// Cancels everything in flight and runs the disposables in reverse
    /// insertion order; the temp directory goes last.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session = self.id, "disposing session");
        self.cancel.cancel();
        self.disposables.run().await;
    }
}

pub fn did_open_params(uri: &Url, doc: &OpenDocument) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": doc.language_id,
            "version": doc.version,
            "text": doc.text,
        }
    })
}

pub fn language_id_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("ts") => "typescript",
        Some("tsx") => "typescriptreact",
        Some("js") => "javascript",
        Some("jsx") => "javascriptreact",
        Some("json") => "json",
        _ => "typescript",
    }
}

/// Listens for restart requests from the installation coordinator and
/// replays the open-document log into the fresh downstream.
pub fn spawn_restart_listener(
    session: &Arc<Session>,
    mut restart_rx: mpsc::UnboundedReceiver<()>,
) -> tokio::task::JoinHandle<()> {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = session.cancel.cancelled() => break,
                request = restart_rx.recv() => {
                    if request.is_none() {
                        break;
                    }
                    // Collapse a burst of install completions into one
                    // restart.
                    while restart_rx.try_recv().is_ok() {}
                    let replay = session.open_documents_replay().await;
                    match session.supervisor.restart(replay, &session.cancel).await {
                        Ok(_) => {}
                        Err(GatewayError::FatalSpawn(message)) => {
                            warn!(session = session.id, "downstream respawn failed, closing session: {message}");
                            session.cancel.cancel();
                            break;
                        }
                        Err(err) if err.is_cancelled() => break,
                        Err(err) => warn!(session = session.id, "downstream restart failed: {err}"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn disposables_run_in_reverse_insertion_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let disposables = Disposables::default();
        for name in ["temp-dir", "supervisor", "notification-pump"] {
            let order = Arc::clone(&order);
            disposables.push(
                name,
                Box::new(move || {
                    async move {
                        order.lock().push(name);
                    }
                    .boxed()
                }),
            );
        }
        disposables.run().await;
        assert_eq!(
            *order.lock(),
            vec!["notification-pump", "supervisor", "temp-dir"]
        );
        // A second run is a no-op.
        disposables.run().await;
        assert_eq!(order.lock().len(), 3);
    }

    #[test]
    fn language_ids_follow_extensions() {
        assert_eq!(language_id_for(Path::new("/a/b.ts")), "typescript");
        assert_eq!(language_id_for(Path::new("/a/b.d.ts")), "typescript");
        assert_eq!(language_id_for(Path::new("/a/b.tsx")), "typescriptreact");
        assert_eq!(language_id_for(Path::new("/a/b.jsx")), "javascriptreact");
        assert_eq!(language_id_for(Path::new("/a/package.json")), "json");
    }

    #[test]
    fn did_open_params_carry_the_stored_version() {
        let uri = Url::parse("file:///tmp/s/repo/a.ts").unwrap();
        let doc = OpenDocument {
            language_id: "typescript".to_string(),
            version: 42,
            text: "export {}".to_string(),
        };
        let params = did_open_params(&uri, &doc);
        assert_eq!(params["textDocument"]["version"], 42);
        assert_eq!(params["textDocument"]["uri"], "file:///tmp/s/repo/a.ts");
    }
}

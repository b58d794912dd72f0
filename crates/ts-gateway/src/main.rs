//! `ts-gateway` - per-connection language-intelligence gateway for
//! remote TypeScript repositories.
//!
//! Each client connection gets an isolated session: the remote
//! workspace is materialized on local disk, a child language service is
//! supervised for it, and URIs are translated between the public HTTP
//! namespace and the private file namespace in both directions.

mod config;
mod downstream;
mod error;
mod handlers;
mod install;
mod manifests;
mod progress;
mod resources;
mod session;
mod sourcemaps;
#[cfg(test)]
mod test_support;
mod tsconfig;
mod uris;
mod workspace;

use std::sync::Arc;

use parking_lot::RwLock;
use tower_lsp::jsonrpc::{Error, ErrorCode, Result};
use tower_lsp::lsp_types::request::{
    GotoImplementationParams, GotoImplementationResponse, GotoTypeDefinitionParams,
    GotoTypeDefinitionResponse,
};
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService, Server};
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::session::{GatewayOptions, Session};

type SessionSlot = Arc<RwLock<Option<Arc<Session>>>>;

/// The per-connection LSP surface. All real work happens in
/// `handlers`; this type owns the session slot and the error mapping
/// to JSON-RPC.
pub struct GatewayLanguageServer {
    client: Client,
    options: Arc<GatewayOptions>,
    session: SessionSlot,
}

impl GatewayLanguageServer {
    fn new(client: Client, options: Arc<GatewayOptions>, session: SessionSlot) -> Self {
        Self {
            client,
            options,
            session,
        }
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.session.read().clone().ok_or_else(|| Error {
            code: ErrorCode::ServerError(-32002),
            message: "server not initialized".into(),
            data: None,
        })
    }
}

fn log_notification_error(method: &str, err: &GatewayError) {
    if err.is_cancelled() {
        debug!("{method} cancelled");
    } else {
        warn!("{method}: {err}");
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for GatewayLanguageServer {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        let (session, result) = handlers::initialize(&self.client, &self.options, params)
            .await
            .map_err(Error::from)?;
        *self.session.write() = Some(session);
        Ok(result)
    }

    async fn initialized(&self, _params: InitializedParams) {
        info!("client initialized");
    }

    async fn shutdown(&self) -> Result<()> {
        let session = self.session.write().take();
        if let Some(session) = session {
            session.dispose().await;
        }
        Ok(())
    }

    // =========================================================================
    // Document Synchronization
    // =========================================================================

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let Ok(session) = self.session() else { return };
        if let Err(err) = handlers::did_open(&session, params).await {
            log_notification_error("didOpen", &err);
        }
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let Ok(session) = self.session() else { return };
        if let Err(err) = handlers::did_change(&session, params).await {
            log_notification_error("didChange", &err);
        }
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let Ok(session) = self.session() else { return };
        if let Err(err) = handlers::did_close(&session, params).await {
            log_notification_error("didClose", &err);
        }
    }

    // =========================================================================
    // Language Features
    // =========================================================================

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        let session = self.session()?;
        handlers::hover(&session, params.text_document_position_params)
            .await
            .map_err(Error::from)
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        let session = self.session()?;
        handlers::navigation(
            &session,
            "textDocument/definition",
            params.text_document_position_params,
        )
        .await
        .map_err(Error::from)
    }

    async fn goto_type_definition(
        &self,
        params: GotoTypeDefinitionParams,
    ) -> Result<Option<GotoTypeDefinitionResponse>> {
        let session = self.session()?;
        handlers::navigation(
            &session,
            "textDocument/typeDefinition",
            params.text_document_position_params,
        )
        .await
        .map_err(Error::from)
    }

    async fn goto_implementation(
        &self,
        params: GotoImplementationParams,
    ) -> Result<Option<GotoImplementationResponse>> {
        let session = self.session()?;
        handlers::navigation(
            &session,
            "textDocument/implementation",
            params.text_document_position_params,
        )
        .await
        .map_err(Error::from)
    }

    async fn references(&self, params: ReferenceParams) -> Result<Option<Vec<Location>>> {
        let session = self.session()?;
        handlers::references(&session, params)
            .await
            .map_err(Error::from)
    }

    async fn code_action(&self, params: CodeActionParams) -> Result<Option<CodeActionResponse>> {
        let session = self.session()?;
        handlers::code_action(&session, params)
            .await
            .map_err(Error::from)
    }
}

/// Runs any session left in the slot through disposal; the connection
/// may have dropped without a clean shutdown.
async fn dispose_slot(slot: &SessionSlot) {
    let session = slot.write().take();
    if let Some(session) = session {
        session.dispose().await;
    }
}

async fn serve_stdio(options: Arc<GatewayOptions>) {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let slot: SessionSlot = Arc::new(RwLock::new(None));
    let holder = Arc::clone(&slot);
    let (service, socket) =
        LspService::new(move |client| GatewayLanguageServer::new(client, options, holder));
    Server::new(stdin, stdout, socket).serve(service).await;
    dispose_slot(&slot).await;
}

async fn serve_tcp(options: Arc<GatewayOptions>, addr: &str) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("cannot listen on {addr}: {err}");
            return;
        }
    };
    info!("listening on {addr}");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("accept failed: {err}");
                continue;
            }
        };
        info!(%peer, "client connected");
        let options = Arc::clone(&options);
        tokio::spawn(async move {
            let (read, write) = tokio::io::split(stream);
            let slot: SessionSlot = Arc::new(RwLock::new(None));
            let holder = Arc::clone(&slot);
            let (service, socket) =
                LspService::new(move |client| GatewayLanguageServer::new(client, options, holder));
            Server::new(read, write, socket).serve(service).await;
            dispose_slot(&slot).await;
            info!(%peer, "client disconnected");
        });
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting TypeScript gateway");

    let options = Arc::new(GatewayOptions::from_env());
    match options.listen.clone() {
        Some(addr) => serve_tcp(options, &addr).await,
        None => serve_stdio(options).await,
    }
}

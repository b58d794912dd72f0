//! Supervision of the child language service.
//!
//! The downstream does not reliably notice files that appear under
//! `node_modules/` after it started, so installations are followed by a
//! full restart: dispose the handle, spawn a fresh one, re-initialize,
//! and replay the open documents.

mod transport;

use std::path::PathBuf;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{GatewayError, Result};

pub use transport::{ServerMessage, ServiceTransport};

pub struct DownstreamSupervisor {
    command: Vec<String>,
    cwd: PathBuf,
    notifications: mpsc::UnboundedSender<ServerMessage>,
    /// Write-locked for the whole restart so new requests wait for the
    /// re-initialize to complete.
    state: tokio::sync::RwLock<Option<std::sync::Arc<ServiceTransport>>>,
    init_params: Mutex<Option<Value>>,
}

impl DownstreamSupervisor {
    pub fn new(
        command: Vec<String>,
        cwd: PathBuf,
        notifications: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            command,
            cwd,
            notifications,
            state: tokio::sync::RwLock::new(None),
            init_params: Mutex::new(None),
        }
    }

    /// Spawns the service and runs the initialize handshake. The params
    /// are retained for later restarts.
    pub async fn start(&self, init_params: Value, cancel: &CancellationToken) -> Result<Value> {
        let transport =
            ServiceTransport::spawn(&self.command, &self.cwd, self.notifications.clone())?;
        let result = transport
            .request("initialize", init_params.clone(), cancel)
            .await?;
        transport.notify("initialized", json!({})).await?;
        *self.init_params.lock() = Some(init_params);
        *self.state.write().await = Some(transport);
        info!("downstream language service started");
        Ok(result)
    }

    /// Disposes the current handle, spawns a new one, re-sends the
    /// original initialize params, then replays every open document in
    /// insertion order.
    pub async fn restart(
        &self,
        open_documents: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let init_params = self
            .init_params
            .lock()
            .clone()
            .ok_or_else(|| GatewayError::Downstream("restart before start".to_string()))?;

        let mut state = self.state.write().await;
        if let Some(old) = state.take() {
            old.dispose();
        }
        let transport =
            ServiceTransport::spawn(&self.command, &self.cwd, self.notifications.clone())?;
        let result = transport.request("initialize", init_params, cancel).await?;
        transport.notify("initialized", json!({})).await?;
        let replayed = open_documents.len();
        for params in open_documents {
            transport.notify("textDocument/didOpen", params).await?;
        }
        *state = Some(transport);
        info!(replayed, "downstream language service restarted");
        Ok(result)
    }

    /// Forwards one request, propagating cancellation downstream. Waits
    /// out any restart in progress.
    pub async fn forward(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let transport = self
            .state
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::Downstream("downstream not started".to_string()))?;
        transport.request(method, params, cancel).await
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let transport = self
            .state
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::Downstream("downstream not started".to_string()))?;
        transport.notify(method, params).await
    }

    pub async fn dispose(&self) {
        if let Some(transport) = self.state.write().await.take() {
            // Best effort; the process is killed right after.
            let _ = transport.notify("exit", Value::Null).await;
            transport.dispose();
        }
    }
}

//! Downstream notification pump: diagnostics filtering/rewriting and
//! log-message forwarding.

use std::sync::Arc;

use tokio::sync::mpsc;
use tower_lsp::lsp_types::{LogMessageParams, PublishDiagnosticsParams};
use tower_lsp::Client;
use tracing::{debug, warn};

use crate::downstream::ServerMessage;
use crate::error::Result;
use crate::session::Session;
use crate::uris;

/// Consumes downstream notifications for the session's lifetime. The
/// channel is shared across supervisor restarts, so the subscription
/// survives them. A failure on one message never stops the stream.
pub fn spawn_notification_pump(
    client: Client,
    session: Arc<Session>,
    mut notifications: mpsc::UnboundedReceiver<ServerMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = session.cancel.cancelled() => break,
                message = notifications.recv() => {
                    let Some(message) = message else { break };
                    if let Err(err) = handle(&client, &session, message).await {
                        warn!("downstream notification: {err}");
                    }
                }
            }
        }
    })
}

async fn handle(client: &Client, session: &Session, message: ServerMessage) -> Result<()> {
    match message.method.as_str() {
        "textDocument/publishDiagnostics" => {
            let params: PublishDiagnosticsParams = serde_json::from_value(message.params)
                .map_err(|err| anyhow::anyhow!("malformed publishDiagnostics: {err}"))?;
            if let Some(mapped) = rewrite_diagnostics(session, params)? {
                client
                    .publish_diagnostics(mapped.uri, mapped.diagnostics, mapped.version)
                    .await;
            }
        }
        "window/logMessage" => {
            let params: LogMessageParams = serde_json::from_value(message.params)
                .map_err(|err| anyhow::anyhow!("malformed logMessage: {err}"))?;
            client.log_message(params.typ, params.message).await;
        }
        other => debug!("dropping downstream notification {other}"),
    }
    Ok(())
}

/// Applies the session policy: diagnostics are dropped entirely when
/// disabled or when they originate under `node_modules`; surviving ones
/// have every URI rewritten into the public namespace.
fn rewrite_diagnostics(
    session: &Session,
    mut params: PublishDiagnosticsParams,
) -> Result<Option<PublishDiagnosticsParams>> {
    if !session.config.diagnostics_enable {
        return Ok(None);
    }
    let Some(rel) = session.roots.file_rel(&params.uri) else {
        return Ok(None);
    };
    if uris::has_node_modules_segment(&rel) {
        return Ok(None);
    }
    params.uri = session.roots.file_to_http(&params.uri)?;
    for diagnostic in &mut params.diagnostics {
        if let Some(related) = diagnostic.related_information.take() {
            let mapped: Vec<_> = related
                .into_iter()
                .filter_map(|mut info| {
                    let rel = session.roots.file_rel(&info.location.uri)?;
                    if uris::has_node_modules_segment(&rel) {
                        return None;
                    }
                    info.location.uri = session.roots.file_to_http(&info.location.uri).ok()?;
                    Some(info)
                })
                .collect();
            if !mapped.is_empty() {
                diagnostic.related_information = Some(mapped);
            }
        }
    }
    Ok(Some(params))
}

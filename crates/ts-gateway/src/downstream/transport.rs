//! JSON-RPC framing over the child language service's stdio.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

/// A notification from the downstream service.
#[derive(Debug)]
pub struct ServerMessage {
    pub method: String,
    pub params: Value,
}

type PendingResponses = Mutex<FxHashMap<i64, oneshot::Sender<std::result::Result<Value, String>>>>;

/// One spawned child process plus the request/response bookkeeping on
/// top of its pipes. Disposed (and re-created) on supervisor restart.
pub struct ServiceTransport {
    writer: Arc<tokio::sync::Mutex<ChildStdin>>,
    pending: Arc<PendingResponses>,
    next_id: AtomicI64,
    child: Mutex<Option<Child>>,
}

impl ServiceTransport {
    pub fn spawn(
        command: &[String],
        cwd: &Path,
        notifications: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<Arc<Self>> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| GatewayError::FatalSpawn("empty downstream command".to_string()))?;
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| GatewayError::FatalSpawn(format!("{program}: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::FatalSpawn("downstream stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::FatalSpawn("downstream stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "ts_gateway::downstream", "{line}");
                }
            });
        }

        let transport = Arc::new(Self {
            writer: Arc::new(tokio::sync::Mutex::new(stdin)),
            pending: Arc::new(Mutex::new(FxHashMap::default())),
            next_id: AtomicI64::new(1),
            child: Mutex::new(Some(child)),
        });

        let reader_pending = Arc::clone(&transport.pending);
        let reader_writer = Arc::clone(&transport.writer);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(message)) => {
                        dispatch(message, &reader_pending, &reader_writer, &notifications).await;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("downstream frame error: {err:#}");
                        break;
                    }
                }
            }
            fail_pending(&reader_pending, "downstream connection closed");
        });

        Ok(transport)
    }

    pub async fn request(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(err) = self.write(&frame).await {
            self.pending.lock().remove(&id);
            return Err(err);
        }

        tokio::select! {
            response = rx => match response {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(message)) => Err(GatewayError::Downstream(message)),
                Err(_) => Err(GatewayError::Downstream("downstream connection closed".to_string())),
            },
            () = cancel.cancelled() => {
                self.pending.lock().remove(&id);
                let _ = self.notify("$/cancelRequest", json!({ "id": id })).await;
                Err(GatewayError::Cancelled)
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.write(&frame).await
    }

    async fn write(&self, frame: &Value) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame)
            .await
            .context("writing to downstream")?;
        Ok(())
    }

    /// Kills the child and fails every in-flight request.
    pub fn dispose(&self) {
        if let Some(mut child) = self.child.lock().take() {
            if let Err(err) = child.start_kill() {
                debug!("killing downstream: {err}");
            }
        }
        fail_pending(&self.pending, "downstream disposed");
    }
}

impl Drop for ServiceTransport {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn fail_pending(pending: &PendingResponses, reason: &str) {
    let senders: Vec<_> = pending.lock().drain().collect();
    for (_, tx) in senders {
        let _ = tx.send(Err(reason.to_string()));
    }
}

async fn dispatch<W: AsyncWrite + Unpin>(
    message: Value,
    pending: &PendingResponses,
    writer: &Arc<tokio::sync::Mutex<W>>,
    notifications: &mpsc::UnboundedSender<ServerMessage>,
) {
    let id = message.get("id").cloned();
    let method = message.get("method").and_then(Value::as_str);
    match (id, method) {
        (Some(id), Some(method)) => {
            // Reverse request from the downstream (configuration,
            // capability registration, ...). Answer with an empty result
            // so it never blocks.
            debug!("answering downstream request {method} with null");
            let reply = json!({ "jsonrpc": "2.0", "id": id, "result": Value::Null });
            let mut writer = writer.lock().await;
            if let Err(err) = write_frame(&mut *writer, &reply).await {
                warn!("replying to downstream {method}: {err:#}");
            }
        }
        (None, Some(method)) => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            let _ = notifications.send(ServerMessage {
                method: method.to_string(),
                params,
            });
        }
        (Some(id), None) => {
            let Some(id) = id.as_i64() else {
                warn!("downstream response with non-numeric id: {id}");
                return;
            };
            let Some(tx) = pending.lock().remove(&id) else {
                debug!("downstream response for unknown id {id}");
                return;
            };
            let outcome = if let Some(error) = message.get("error") {
                let rendered = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("downstream error")
                    .to_string();
                Err(rendered)
            } else {
                Ok(message.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = tx.send(outcome);
        }
        (None, None) => warn!("downstream frame without id or method"),
    }
}

async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<Option<Value>> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = Some(value.trim().parse().context("bad Content-Length")?);
            }
        }
    }
    let length = content_length.context("frame without Content-Length")?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Value) -> anyhow::Result<()> {
    let body = serde_json::to_vec(frame)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

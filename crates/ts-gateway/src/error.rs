//! Gateway error taxonomy.
//!
//! Installation failures are deliberately absent: they are logged at the
//! site of the failure and never surfaced to the request that triggered
//! them.

use tokio_util::sync::CancellationToken;
use tower_lsp::jsonrpc;

/// JSON-RPC error code for a cancelled request (LSP `RequestCancelled`).
const REQUEST_CANCELLED: i64 = -32800;
/// JSON-RPC error code for a request that failed for domain reasons
/// (LSP `RequestFailed`).
const REQUEST_FAILED: i64 = -32803;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Cooperative cancellation. Re-raised at suspension points, never
    /// logged as an error.
    #[error("request cancelled")]
    Cancelled,

    /// A best-effort lookup found nothing. The caller decides whether to
    /// fall back.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Bad initialize parameters.
    #[error("invalid initialize params: {0}")]
    Validation(String),

    /// URI escape, cross-repository resolution failure, or a source map
    /// that produced a null component.
    #[error("mapping failed: {0}")]
    Mapping(String),

    /// Error forwarded verbatim from the downstream language service.
    #[error("{0}")]
    Downstream(String),

    /// The downstream language service could not be spawned. This ends
    /// the session.
    #[error("failed to spawn downstream language service: {0}")]
    FatalSpawn(String),

    /// Transport-level failure in a collaborator.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn mapping(message: impl Into<String>) -> Self {
        GatewayError::Mapping(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        GatewayError::ResourceNotFound(what.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GatewayError::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::ResourceNotFound(_))
    }
}

impl From<GatewayError> for jsonrpc::Error {
    fn from(err: GatewayError) -> Self {
        let code = match &err {
            GatewayError::Cancelled => jsonrpc::ErrorCode::ServerError(REQUEST_CANCELLED),
            GatewayError::Validation(_) => jsonrpc::ErrorCode::InvalidParams,
            GatewayError::ResourceNotFound(_) | GatewayError::Mapping(_) => {
                jsonrpc::ErrorCode::ServerError(REQUEST_FAILED)
            }
            GatewayError::Downstream(_)
            | GatewayError::FatalSpawn(_)
            | GatewayError::Other(_) => jsonrpc::ErrorCode::InternalError,
        };
        jsonrpc::Error {
            code,
            message: err.to_string().into(),
            data: None,
        }
    }
}

/// Checked at every suspension boundary.
pub fn throw_if_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(GatewayError::Cancelled)
    } else {
        Ok(())
    }
}

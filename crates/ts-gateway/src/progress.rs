//! Work-done progress reporting toward the client.

use tower_lsp::lsp_types::request::WorkDoneProgressCreate;
use tower_lsp::lsp_types::{
    notification::Progress, ProgressParams, ProgressParamsValue, ProgressToken, WorkDoneProgress,
    WorkDoneProgressBegin, WorkDoneProgressCreateParams, WorkDoneProgressEnd,
    WorkDoneProgressReport,
};
use tower_lsp::Client;

/// Server-initiated progress stream. Constructed disabled when the
/// client lacks the capability or the session turned progress off;
/// every method is then a no-op.
pub struct ProgressReporter {
    client: Option<Client>,
    token: ProgressToken,
}

impl ProgressReporter {
    pub fn new(client: Client, enabled: bool, label: &str) -> Self {
        Self {
            client: enabled.then_some(client),
            token: ProgressToken::String(format!("ts-gateway/{label}")),
        }
    }

    pub async fn begin(&self, title: &str) {
        let Some(client) = &self.client else {
            return;
        };
        let _ = client
            .send_request::<WorkDoneProgressCreate>(WorkDoneProgressCreateParams {
                token: self.token.clone(),
            })
            .await;
        self.send(
            client,
            WorkDoneProgress::Begin(WorkDoneProgressBegin {
                title: title.to_string(),
                cancellable: Some(false),
                message: None,
                percentage: None,
            }),
        )
        .await;
    }

    pub async fn percent(&self, percentage: u32, message: Option<String>) {
        let Some(client) = &self.client else {
            return;
        };
        self.send(
            client,
            WorkDoneProgress::Report(WorkDoneProgressReport {
                cancellable: Some(false),
                message,
                percentage: Some(percentage),
            }),
        )
        .await;
    }

    pub async fn end(&self, message: Option<String>) {
        let Some(client) = &self.client else {
            return;
        };
        self.send(
            client,
            WorkDoneProgress::End(WorkDoneProgressEnd { message }),
        )
        .await;
    }

    async fn send(&self, client: &Client, value: WorkDoneProgress) {
        client
            .send_notification::<Progress>(ProgressParams {
                token: self.token.clone(),
                value: ProgressParamsValue::WorkDone(value),
            })
            .await;
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match &self.token {
            ProgressToken::String(token) => token.clone(),
            ProgressToken::Number(n) => n.to_string(),
        };
        f.debug_struct("ProgressReporter")
            .field("enabled", &self.client.is_some())
            .field("token", &token)
            .finish()
    }
}

//! Document synchronization from the client.
//!
//! The gateway keeps the last parameters sent downstream for every open
//! document; that log is replayed verbatim after a supervisor restart.

use std::sync::Arc;

use serde_json::json;
use tower_lsp::lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
};

use crate::error::Result;
use crate::session::{OpenDocument, Session};

pub async fn did_open(session: &Arc<Session>, params: DidOpenTextDocumentParams) -> Result<()> {
    let file_uri = session.roots.http_to_file(&params.text_document.uri)?;
    session
        .open_document(
            file_uri,
            OpenDocument {
                language_id: params.text_document.language_id,
                version: params.text_document.version,
                text: params.text_document.text,
            },
        )
        .await
}

pub async fn did_change(session: &Arc<Session>, params: DidChangeTextDocumentParams) -> Result<()> {
    let file_uri = session.roots.http_to_file(&params.text_document.uri)?;
    // Full-sync clients put the whole document in the last change.
    let full_text = params
        .content_changes
        .iter()
        .rev()
        .find(|change| change.range.is_none())
        .map(|change| change.text.clone());
    session
        .update_open_document(&file_uri, params.text_document.version, full_text)
        .await;
    session
        .supervisor
        .notify(
            "textDocument/didChange",
            json!({
                "textDocument": { "uri": file_uri, "version": params.text_document.version },
                "contentChanges": params.content_changes,
            }),
        )
        .await
}

pub async fn did_close(session: &Arc<Session>, params: DidCloseTextDocumentParams) -> Result<()> {
    let file_uri = session.roots.http_to_file(&params.text_document.uri)?;
    session.close_document(&file_uri).await;
    session
        .supervisor
        .notify(
            "textDocument/didClose",
            json!({ "textDocument": { "uri": file_uri } }),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;
    use tower_lsp::lsp_types::{TextDocumentItem, Url, VersionedTextDocumentIdentifier};

    #[tokio::test]
    async fn open_documents_are_logged_with_file_uris_in_order() {
        let fx = fixture(|_repo| {}, &[]);
        for (name, version) in [("a.ts", 3), ("b.ts", 8)] {
            let params = DidOpenTextDocumentParams {
                text_document: TextDocumentItem {
                    uri: Url::parse(&format!("https://h/repo@abc/-/raw/{name}")).unwrap(),
                    language_id: "typescript".to_string(),
                    version,
                    text: format!("// {name}"),
                },
            };
            // The downstream is not running in this fixture; the log
            // write happens before the notify either way.
            let _ = did_open(&fx.session, params).await;
        }

        let replay = fx.session.open_documents_replay().await;
        assert_eq!(replay.len(), 2);
        assert!(replay[0]["textDocument"]["uri"]
            .as_str()
            .unwrap()
            .ends_with("repo/a.ts"));
        assert_eq!(replay[0]["textDocument"]["version"], 3);
        assert!(replay[1]["textDocument"]["uri"]
            .as_str()
            .unwrap()
            .ends_with("repo/b.ts"));
        assert_eq!(replay[1]["textDocument"]["version"], 8);
    }

    #[tokio::test]
    async fn change_and_close_keep_the_replay_log_coherent() {
        let fx = fixture(|_repo| {}, &[]);
        let open = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: Url::parse("https://h/repo@abc/-/raw/a.ts").unwrap(),
                language_id: "typescript".to_string(),
                version: 1,
                text: "old".to_string(),
            },
        };
        let _ = did_open(&fx.session, open).await;

        let change = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: Url::parse("https://h/repo@abc/-/raw/a.ts").unwrap(),
                version: 2,
            },
            content_changes: vec![tower_lsp::lsp_types::TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: "new".to_string(),
            }],
        };
        let _ = did_change(&fx.session, change).await;
        let replay = fx.session.open_documents_replay().await;
        assert_eq!(replay[0]["textDocument"]["version"], 2);
        assert_eq!(replay[0]["textDocument"]["text"], "new");

        let close = DidCloseTextDocumentParams {
            text_document: tower_lsp::lsp_types::TextDocumentIdentifier {
                uri: Url::parse("https://h/repo@abc/-/raw/a.ts").unwrap(),
            },
        };
        let _ = did_close(&fx.session, close).await;
        assert!(fx.session.open_documents_replay().await.is_empty());
    }

    #[tokio::test]
    async fn foreign_roots_are_rejected() {
        let fx = fixture(|_repo| {}, &[]);
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: Url::parse("https://elsewhere/other/-/raw/a.ts").unwrap(),
                language_id: "typescript".to_string(),
                version: 1,
                text: String::new(),
            },
        };
        assert!(did_open(&fx.session, params).await.is_err());
    }
}

//! Routed language features: hover, the navigation family, and code
//! actions.

use std::sync::Arc;

use serde_json::json;
use tower_lsp::lsp_types::{
    CodeActionParams, CodeActionResponse, GotoDefinitionResponse, Hover, HoverContents, Location,
    MarkedString, ReferenceParams, TextDocumentPositionParams, Url,
};
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::session::Session;

use super::position::map_text_document_position;
use super::translate;

pub async fn hover(
    session: &Arc<Session>,
    params: TextDocumentPositionParams,
) -> Result<Option<Hover>> {
    let cancel = session.request_token();
    let public_uri = params.text_document.uri.clone();
    let (file_uri, position) =
        map_text_document_position(session, &params.text_document.uri, params.position, &cancel)
            .await?;

    let value = session
        .supervisor
        .forward(
            "textDocument/hover",
            json!({ "textDocument": { "uri": file_uri }, "position": position }),
            &cancel,
        )
        .await?;
    let hover: Option<Hover> = serde_json::from_value(value)
        .map_err(|err| GatewayError::Downstream(format!("malformed hover response: {err}")))?;

    // `any` or `import` in the rendered type usually means missing type
    // declarations; kick off an install and let the client re-poll.
    if hover.as_ref().is_some_and(mentions_untyped_symbols) {
        trigger_dependency_install(session, public_uri);
    }
    Ok(hover)
}

/// Definition, type definition, and implementation share one shape.
pub async fn navigation(
    session: &Arc<Session>,
    method: &'static str,
    params: TextDocumentPositionParams,
) -> Result<Option<GotoDefinitionResponse>> {
    let cancel = session.request_token();
    let (file_uri, position) =
        map_text_document_position(session, &params.text_document.uri, params.position, &cancel)
            .await?;
    session.ensure_open(&file_uri).await?;

    let value = session
        .supervisor
        .forward(
            method,
            json!({ "textDocument": { "uri": file_uri }, "position": position }),
            &cancel,
        )
        .await?;
    let response: Option<GotoDefinitionResponse> = serde_json::from_value(value)
        .map_err(|err| GatewayError::Downstream(format!("malformed {method} response: {err}")))?;

    match response {
        None => Ok(None),
        Some(GotoDefinitionResponse::Scalar(location)) => Ok(Some(GotoDefinitionResponse::Scalar(
            translate::location_to_client(session, location).await?,
        ))),
        Some(GotoDefinitionResponse::Array(locations)) => Ok(Some(GotoDefinitionResponse::Array(
            translate::locations_to_client(session, locations).await?,
        ))),
        Some(GotoDefinitionResponse::Link(links)) => {
            let mut mapped = Vec::with_capacity(links.len());
            for link in links {
                mapped.push(translate::location_link_to_client(session, link).await?);
            }
            Ok(Some(GotoDefinitionResponse::Link(mapped)))
        }
    }
}

pub async fn references(
    session: &Arc<Session>,
    params: ReferenceParams,
) -> Result<Option<Vec<Location>>> {
    let cancel = session.request_token();
    let position_params = params.text_document_position;
    let (file_uri, position) = map_text_document_position(
        session,
        &position_params.text_document.uri,
        position_params.position,
        &cancel,
    )
    .await?;
    session.ensure_open(&file_uri).await?;

    let value = session
        .supervisor
        .forward(
            "textDocument/references",
            json!({
                "textDocument": { "uri": file_uri },
                "position": position,
                "context": { "includeDeclaration": params.context.include_declaration },
            }),
            &cancel,
        )
        .await?;
    let locations: Option<Vec<Location>> = serde_json::from_value(value)
        .map_err(|err| GatewayError::Downstream(format!("malformed references response: {err}")))?;
    match locations {
        None => Ok(None),
        Some(locations) => Ok(Some(
            translate::locations_to_client(session, locations).await?,
        )),
    }
}

pub async fn code_action(
    session: &Arc<Session>,
    params: CodeActionParams,
) -> Result<Option<CodeActionResponse>> {
    let cancel = session.request_token();
    let file_uri = session.roots.http_to_file(&params.text_document.uri)?;
    session.ensure_open(&file_uri).await?;

    let value = session
        .supervisor
        .forward(
            "textDocument/codeAction",
            json!({
                "textDocument": { "uri": file_uri },
                "range": params.range,
                "context": params.context,
            }),
            &cancel,
        )
        .await?;
    serde_json::from_value(value)
        .map_err(|err| GatewayError::Downstream(format!("malformed codeAction response: {err}")))
}

/// Fire-and-forget installation of every manifest containing the
/// document. Outcomes are logged by the coordinator; cancellation is
/// swallowed.
fn trigger_dependency_install(session: &Arc<Session>, public_uri: Url) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        let entries: Vec<_> = session
            .registry
            .parents_of(&public_uri)
            .into_iter()
            .cloned()
            .collect();
        if entries.is_empty() {
            debug!("no manifest contains {public_uri}; nothing to install");
        }
        for entry in entries {
            let _ = session.installs.ensure_installed(&entry).await;
        }
    });
}

fn mentions_untyped_symbols(hover: &Hover) -> bool {
    let text = hover_text(&hover.contents);
    contains_word(&text, "any") || contains_word(&text, "import")
}

fn hover_text(contents: &HoverContents) -> String {
    fn marked(value: &MarkedString) -> &str {
        match value {
            MarkedString::String(text) => text,
            MarkedString::LanguageString(ls) => &ls.value,
        }
    }
    match contents {
        HoverContents::Scalar(value) => marked(value).to_string(),
        HoverContents::Array(values) => values
            .iter()
            .map(marked)
            .collect::<Vec<_>>()
            .join("\n"),
        HoverContents::Markup(markup) => markup.value.clone(),
    }
}

fn contains_word(text: &str, word: &str) -> bool {
    let bytes = text.as_bytes();
    let is_word_byte = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    text.match_indices(word).any(|(at, _)| {
        let before_ok = at == 0 || !is_word_byte(bytes[at - 1]);
        let end = at + word.len();
        let after_ok = end == bytes.len() || !is_word_byte(bytes[end]);
        before_ok && after_ok
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower_lsp::lsp_types::{LanguageString, MarkupContent, MarkupKind};

    fn hover_with(value: &str) -> Hover {
        Hover {
            contents: HoverContents::Scalar(MarkedString::LanguageString(LanguageString {
                language: "typescript".to_string(),
                value: value.to_string(),
            })),
            range: None,
        }
    }

    #[test]
    fn any_and_import_as_words_trigger_installs() {
        assert!(mentions_untyped_symbols(&hover_with("const x: any")));
        assert!(mentions_untyped_symbols(&hover_with(
            "import lodash"
        )));
        assert!(!mentions_untyped_symbols(&hover_with(
            "const company: Company"
        )));
        assert!(!mentions_untyped_symbols(&hover_with(
            "function important(): void"
        )));
    }

    #[test]
    fn markup_contents_are_scanned_too() {
        let hover = Hover {
            contents: HoverContents::Markup(MarkupContent {
                kind: MarkupKind::Markdown,
                value: "```ts\nlet v: any\n```".to_string(),
            }),
            range: None,
        };
        assert!(mentions_untyped_symbols(&hover));
    }

    #[test]
    fn word_boundaries_respect_identifier_characters() {
        assert!(contains_word("x: any", "any"));
        assert!(!contains_word("many things", "any"));
        assert!(!contains_word("anything", "any"));
        assert!(contains_word("(any)", "any"));
    }
}

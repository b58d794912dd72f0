//! Resource retrieval by URI, dispatched on scheme.
//!
//! `fetch` distinguishes an absent target (`ResourceNotFound`) from
//! transport failure so best-effort lookups can fall back cleanly.

use std::path::PathBuf;

use anyhow::Context;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use tower_lsp::lsp_types::Url;
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::uris;

#[tower_lsp::async_trait]
pub trait ResourceRetriever: Send + Sync {
    async fn fetch(&self, uri: &Url) -> Result<Vec<u8>>;
    async fn exists(&self, uri: &Url) -> Result<bool>;
    /// Matches `pattern` under `root`. Only file roots support this.
    fn glob(&self, root: &Url, pattern: &str, ignore: Option<&str>) -> Result<Vec<Url>>;
}

pub struct FileRetriever;

#[tower_lsp::async_trait]
impl ResourceRetriever for FileRetriever {
    async fn fetch(&self, uri: &Url) -> Result<Vec<u8>> {
        let path = file_path(uri)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(GatewayError::not_found(uri.to_string()))
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("reading {}", path.display()))
                .into()),
        }
    }

    async fn exists(&self, uri: &Url) -> Result<bool> {
        let path = file_path(uri)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    fn glob(&self, root: &Url, pattern: &str, ignore: Option<&str>) -> Result<Vec<Url>> {
        let root = file_path(root)?;
        let full = format!("{}/{}", root.display(), pattern.trim_start_matches('/'));
        let ignore = ignore
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|err| anyhow::anyhow!("bad ignore pattern: {err}"))?;
        let mut out = Vec::new();
        let paths =
            glob::glob(&full).map_err(|err| anyhow::anyhow!("bad glob pattern {full}: {err}"))?;
        for path in paths {
            let path = match path {
                Ok(path) => path,
                Err(err) => {
                    warn!("glob {full}: {err}");
                    continue;
                }
            };
            if let Some(ignore) = &ignore {
                if ignore.matches_path(&path) {
                    continue;
                }
            }
            if let Some(url) = uris::path_to_uri(&path) {
                out.push(url);
            }
        }
        Ok(out)
    }
}

pub struct HttpRetriever {
    client: reqwest::Client,
}

impl HttpRetriever {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[tower_lsp::async_trait]
impl ResourceRetriever for HttpRetriever {
    async fn fetch(&self, uri: &Url) -> Result<Vec<u8>> {
        let (url, bearer) = split_bearer(uri);
        let mut request = self.client.get(url);
        if let Some(bearer) = bearer {
            request = request.header(AUTHORIZATION, format!("Bearer {bearer}"));
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("fetching {uri}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::not_found(uri.to_string()));
        }
        let response = response
            .error_for_status()
            .with_context(|| format!("fetching {uri}"))?;
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("reading body of {uri}"))?;
        Ok(bytes.to_vec())
    }

    async fn exists(&self, uri: &Url) -> Result<bool> {
        match self.fetch(uri).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn glob(&self, root: &Url, _pattern: &str, _ignore: Option<&str>) -> Result<Vec<Url>> {
        Err(anyhow::anyhow!("glob is not supported for {} URIs", root.scheme()).into())
    }
}

/// Scheme-dispatched retriever set.
pub struct Retrievers {
    file: FileRetriever,
    http: HttpRetriever,
}

impl Retrievers {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            file: FileRetriever,
            http: HttpRetriever::new(client),
        }
    }

    pub fn for_uri(&self, uri: &Url) -> Result<&dyn ResourceRetriever> {
        match uri.scheme() {
            "file" => Ok(&self.file),
            "http" | "https" => Ok(&self.http),
            other => Err(anyhow::anyhow!("no retriever registered for scheme {other}").into()),
        }
    }

    pub fn file(&self) -> &FileRetriever {
        &self.file
    }
}

fn file_path(uri: &Url) -> Result<PathBuf> {
    uris::uri_to_path(uri)
        .ok_or_else(|| GatewayError::mapping(format!("{uri} is not a file URI")))
}

/// External-repo URIs carry the bearer in the userinfo field; it must
/// move to a header before the request goes out.
fn split_bearer(uri: &Url) -> (Url, Option<String>) {
    if uri.username().is_empty() {
        return (uri.clone(), None);
    }
    let bearer = uri.username().to_string();
    let mut clean = uri.clone();
    let _ = clean.set_username("");
    let _ = clean.set_password(None);
    (clean, Some(bearer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_fetch_distinguishes_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let present = tmp.path().join("a.ts");
        std::fs::write(&present, "export {}").unwrap();

        let retriever = FileRetriever;
        let uri = uris::path_to_uri(&present).unwrap();
        assert_eq!(retriever.fetch(&uri).await.unwrap(), b"export {}");

        let missing = uris::path_to_uri(&tmp.path().join("b.ts")).unwrap();
        let err = retriever.fetch(&missing).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!retriever.exists(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn file_glob_honors_ignore() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::create_dir_all(tmp.path().join("node_modules/x")).unwrap();
        std::fs::write(tmp.path().join("src/a.ts"), "").unwrap();
        std::fs::write(tmp.path().join("node_modules/x/b.ts"), "").unwrap();

        let retriever = FileRetriever;
        let root = uris::path_to_uri(tmp.path()).unwrap();
        let all = retriever.glob(&root, "**/*.ts", None).unwrap();
        assert_eq!(all.len(), 2);
        let filtered = retriever
            .glob(&root, "**/*.ts", Some("**/node_modules/**"))
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].as_str().ends_with("src/a.ts"));
    }

    #[test]
    fn bearer_moves_out_of_userinfo() {
        let uri = Url::parse("https://tok@h/x").unwrap();
        let (clean, bearer) = split_bearer(&uri);
        assert_eq!(clean.as_str(), "https://h/x");
        assert_eq!(bearer.as_deref(), Some("tok"));
    }
}

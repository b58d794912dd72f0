//! URI mapping between the public HTTP workspace, the private file
//! workspace, and external repositories.
//!
//! Roots always carry a trailing slash so `<root>/<relPath>` resolution
//! is unambiguous. Comparisons are textual on the normalized `href`.

use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;
use tower_lsp::lsp_types::Url;
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::manifests::PackageManifest;

/// The `(httpRoot, fileRoot)` pair under which all in-workspace URIs
/// resolve.
#[derive(Debug, Clone)]
pub struct WorkspaceRoots {
    http_root: Url,
    file_root: Url,
    file_root_path: PathBuf,
}

impl WorkspaceRoots {
    pub fn new(http_root: Url, repo_dir: &Path) -> Result<Self> {
        let file_root = Url::from_directory_path(repo_dir)
            .map_err(|()| GatewayError::mapping(format!("not a directory path: {}", repo_dir.display())))?;
        Ok(Self {
            http_root: as_dir_url(http_root),
            file_root,
            file_root_path: repo_dir.to_path_buf(),
        })
    }

    pub fn http_root(&self) -> &Url {
        &self.http_root
    }

    pub fn file_root(&self) -> &Url {
        &self.file_root
    }

    pub fn file_root_path(&self) -> &Path {
        &self.file_root_path
    }

    /// Relative path of `uri` under the HTTP root, if it is in-workspace.
    pub fn http_rel(&self, uri: &Url) -> Option<String> {
        uri.as_str()
            .strip_prefix(self.http_root.as_str())
            .map(str::to_owned)
    }

    /// Relative path of `uri` under the file root, if it is in-workspace.
    pub fn file_rel(&self, uri: &Url) -> Option<String> {
        uri.as_str()
            .strip_prefix(self.file_root.as_str())
            .map(str::to_owned)
    }

    /// `<httpRoot>/<rel>` → `<fileRoot>/<rel>`.
    pub fn http_to_file(&self, uri: &Url) -> Result<Url> {
        let rel = self.http_rel(uri).ok_or_else(|| {
            GatewayError::mapping(format!("{uri} is outside the workspace root {}", self.http_root))
        })?;
        reject_escaping_segments(&rel)?;
        let mapped = self
            .file_root
            .join(&rel)
            .map_err(|err| GatewayError::mapping(format!("cannot resolve {rel}: {err}")))?;
        if !mapped.as_str().starts_with(self.file_root.as_str()) {
            return Err(GatewayError::mapping(format!(
                "{uri} escapes the workspace file root"
            )));
        }
        Ok(mapped)
    }

    /// `<fileRoot>/<rel>` → `<httpRoot>/<rel>`. Fails for `node_modules`
    /// paths, which must never be exposed as in-workspace HTTP URIs.
    pub fn file_to_http(&self, uri: &Url) -> Result<Url> {
        let rel = self.file_rel(uri).ok_or_else(|| {
            GatewayError::mapping(format!("{uri} is outside the workspace file root"))
        })?;
        reject_escaping_segments(&rel)?;
        if has_node_modules_segment(&rel) {
            return Err(GatewayError::mapping(format!(
                "{uri} points into node_modules and cannot be exposed"
            )));
        }
        let mapped = self
            .http_root
            .join(&rel)
            .map_err(|err| GatewayError::mapping(format!("cannot resolve {rel}: {err}")))?;
        if !mapped.as_str().starts_with(self.http_root.as_str()) {
            return Err(GatewayError::mapping(format!(
                "{uri} escapes the workspace root"
            )));
        }
        Ok(mapped)
    }

    /// Filesystem path for an in-workspace file URI.
    pub fn file_uri_to_path(&self, uri: &Url) -> Result<PathBuf> {
        let path = uri_to_path(uri)
            .ok_or_else(|| GatewayError::mapping(format!("{uri} is not a file URI")))?;
        if !path.starts_with(&self.file_root_path) {
            return Err(GatewayError::mapping(format!(
                "{uri} escapes the workspace file root"
            )));
        }
        Ok(path)
    }
}

/// A URI pointing into a different repository than the current
/// workspace: `<instance>/<repo>[@<revision>]/-/raw/<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRepo {
    pub repo: String,
    pub revision: Option<String>,
    pub path: String,
}

impl ExternalRepo {
    pub fn parse(uri: &Url) -> Option<Self> {
        let segments: Vec<&str> = uri.path_segments()?.collect();
        let raw_at = segments
            .windows(2)
            .position(|pair| pair[0] == "-" && pair[1] == "raw")?;
        if raw_at == 0 {
            return None;
        }
        let mut repo = segments[..raw_at].join("/");
        let mut revision = None;
        if let Some(at) = repo.rfind('@') {
            // The revision is attached to the last repo segment.
            if !repo[at..].contains('/') {
                revision = Some(repo[at + 1..].to_string());
                repo.truncate(at);
            }
        }
        let path = segments[raw_at + 2..].join("/");
        let path = percent_decode_str(&path).decode_utf8_lossy().into_owned();
        Some(Self {
            repo,
            revision,
            path,
        })
    }

    pub fn to_uri(&self, instance: &Url, token: Option<&str>) -> Result<Url> {
        let spec = match &self.revision {
            Some(revision) => format!("{}@{}", self.repo, revision),
            None => self.repo.clone(),
        };
        let raw = format!("{spec}/-/raw/{}", self.path.trim_start_matches('/'));
        let mut url = as_dir_url(instance.clone())
            .join(&raw)
            .map_err(|err| GatewayError::mapping(format!("cannot build external URI: {err}")))?;
        if let Some(token) = token {
            url.set_username(token)
                .map_err(|()| GatewayError::mapping("cannot attach bearer to external URI"))?;
        }
        Ok(url)
    }
}

/// Constructs the external-repo URI for a file inside an installed
/// package, using the package manifest's repository declaration.
pub fn resolve_external(
    file_uri: &Url,
    package_root: &Path,
    manifest: &PackageManifest,
    instance: &Url,
    token: Option<&str>,
) -> Result<Url> {
    let file_path = uri_to_path(file_uri)
        .ok_or_else(|| GatewayError::mapping(format!("{file_uri} is not a file URI")))?;
    let rel = file_path.strip_prefix(package_root).map_err(|_| {
        GatewayError::mapping(format!(
            "{file_uri} is not under its package root {}",
            package_root.display()
        ))
    })?;
    let rel = path_to_slashes(rel);

    let name = manifest.name.as_deref().unwrap_or_default();
    let repository = manifest.repository_url().ok_or_else(|| {
        GatewayError::mapping(format!("package {name} declares no repository"))
    })?;
    let (repo, tree_subdir) = parse_repository_url(&repository).ok_or_else(|| {
        GatewayError::mapping(format!(
            "package {name} has an unparseable repository: {repository}"
        ))
    })?;

    let subdir = manifest
        .repository_directory()
        .or_else(|| {
            name.strip_prefix("@types/")
                .map(|rest| format!("types/{rest}"))
        })
        .or(tree_subdir);

    let revision = manifest.git_head.clone();
    if revision.is_none() {
        // Without a published commit the result tracks the moving HEAD.
        warn!("package {name} has no gitHead metadata; external links will not be revision-pinned");
    }

    let path = match subdir {
        Some(subdir) => format!("{}/{rel}", subdir.trim_matches('/')),
        None => rel,
    };
    ExternalRepo {
        repo,
        revision,
        path,
    }
    .to_uri(instance, token)
}

/// `repository` fields arrive in many shapes: `https://`, `git+https://`,
/// `git://`, scp-style `git@host:owner/repo.git`, and the npm shorthand
/// `owner/repo` / `github:owner/repo`. GitHub `tree/<ref>/<subdir>` URLs
/// additionally name a subdirectory.
pub fn parse_repository_url(raw: &str) -> Option<(String, Option<String>)> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("git+").unwrap_or(raw);

    if let Some(rest) = raw.strip_prefix("git@") {
        let (host, path) = rest.split_once(':')?;
        let path = path.trim_end_matches(".git").trim_matches('/');
        if path.is_empty() {
            return None;
        }
        return Some((format!("{host}/{path}"), None));
    }

    if !raw.contains("://") {
        let rest = raw.strip_prefix("github:").unwrap_or(raw);
        let rest = rest.trim_end_matches(".git");
        if rest.split('/').count() == 2 && !rest.contains(':') && !rest.is_empty() {
            return Some((format!("github.com/{rest}"), None));
        }
        return None;
    }

    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    let mut segments: Vec<&str> = url
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .collect();
    if segments.len() < 2 {
        return None;
    }
    let mut subdir = None;
    if segments.len() >= 4 && segments[2] == "tree" {
        if segments.len() > 4 {
            subdir = Some(segments[4..].join("/"));
        }
        segments.truncate(2);
    }
    let repo_path = segments.join("/");
    let repo_path = repo_path.trim_end_matches(".git");
    Some((format!("{host}/{repo_path}"), subdir))
}

/// Appends a trailing slash to the URL path if missing, so relative
/// joins resolve under the root rather than next to it.
pub fn as_dir_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

pub fn uri_to_path(uri: &Url) -> Option<PathBuf> {
    if let Ok(path) = uri.to_file_path() {
        return Some(path);
    }
    if uri.scheme() == "file" {
        let raw = uri.path();
        if raw.is_empty() {
            return None;
        }
        let decoded = percent_decode_str(raw).decode_utf8_lossy();
        return Some(PathBuf::from(decoded.as_ref()));
    }
    None
}

pub fn path_to_uri(path: &Path) -> Option<Url> {
    if let Ok(url) = Url::from_file_path(path) {
        return Some(url);
    }
    let raw = path.to_string_lossy();
    if !raw.starts_with('/') {
        return None;
    }
    Url::parse(&format!("file://{raw}")).ok()
}

/// Lexical normalization; resolves `.` and `..` without touching the
/// filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            _ => normalized.push(component.as_os_str()),
        }
    }
    normalized
}

pub fn has_node_modules_segment(rel: &str) -> bool {
    let decoded = percent_decode_str(rel).decode_utf8_lossy();
    decoded.split('/').any(|segment| segment == "node_modules")
}

fn reject_escaping_segments(rel: &str) -> Result<()> {
    let decoded = percent_decode_str(rel).decode_utf8_lossy();
    for segment in decoded.split('/') {
        if segment == ".." || segment == "." {
            return Err(GatewayError::mapping(format!(
                "path escapes the workspace root: {rel}"
            )));
        }
    }
    Ok(())
}

fn path_to_slashes(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

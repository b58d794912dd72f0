//! Declaration-map and source-map traversal.
//!
//! Incoming: a position in some external package's source is mapped to
//! the generated declaration file installed under `node_modules`.
//! Outgoing: a result location inside a declaration file is mapped back
//! to the original source, when the mapped target stays inside the
//! session temp root.

use std::path::{Path, PathBuf};

use futures::{stream, StreamExt};
use sourcemap::SourceMap;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{Position, Url};
use tracing::warn;

use crate::error::{throw_if_cancelled, GatewayError, Result};
use crate::resources::{ResourceRetriever, Retrievers};
use crate::uris::{self, ExternalRepo};

/// Width of the declaration-map scan fan-out.
const MAP_SCAN_CONCURRENCY: usize = 10;

/// Identifies the package owning an external-repo path, plus the path
/// remainder inside that package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLocation {
    pub package: String,
    pub rel_path: String,
}

/// DefinitelyTyped keeps every package under `types/<name>/[v<ver>/]`;
/// other repositories are probed for the nearest ancestor holding a
/// `package.json`.
pub async fn find_package_root_and_name(
    external: &ExternalRepo,
    retrievers: &Retrievers,
    instance: &Url,
    token: Option<&str>,
    cancel: &CancellationToken,
) -> Result<PackageLocation> {
    let segments: Vec<&str> = external
        .path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    if let Some(at) = segments.iter().position(|segment| *segment == "types") {
        if let Some(name) = segments.get(at + 1) {
            let mut rest = &segments[at + 2..];
            if rest.first().is_some_and(|dir| {
                dir.len() > 1
                    && dir.starts_with('v')
                    && dir[1..].chars().all(|c| c.is_ascii_digit() || c == '.')
            }) {
                rest = &rest[1..];
            }
            return Ok(PackageLocation {
                package: format!("@types/{name}"),
                rel_path: rest.join("/"),
            });
        }
    }

    // Probe ancestors, deepest first, for a package.json.
    let dirs: Vec<&[&str]> = (0..segments.len())
        .rev()
        .map(|len| &segments[..len])
        .collect();
    for dir in dirs {
        throw_if_cancelled(cancel)?;
        let manifest_path = if dir.is_empty() {
            "package.json".to_string()
        } else {
            format!("{}/package.json", dir.join("/"))
        };
        let probe = ExternalRepo {
            repo: external.repo.clone(),
            revision: external.revision.clone(),
            path: manifest_path,
        }
        .to_uri(instance, token)?;
        let bytes = match retrievers.for_uri(&probe)?.fetch(&probe).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => continue,
            Err(err) => return Err(err),
        };
        let manifest = crate::manifests::PackageManifest::parse(&bytes)?;
        let Some(package) = manifest.name else {
            continue;
        };
        return Ok(PackageLocation {
            package,
            rel_path: segments[dir.len()..].join("/"),
        });
    }

    Err(GatewayError::mapping(format!(
        "cannot determine the package owning {}/{}",
        external.repo, external.path
    )))
}

/// Maps an external package position onto an installed declaration
/// file. Returns `None` when neither the verbatim file nor any
/// declaration map matches.
pub async fn resolve_incoming(
    retrievers: &Retrievers,
    file_root: &Url,
    temp_root: &Path,
    location: &PackageLocation,
    position: Position,
    cancel: &CancellationToken,
) -> Result<Option<(Url, Position)>> {
    throw_if_cancelled(cancel)?;

    // The file may have been installed verbatim.
    let verbatim = retrievers.file().glob(
        file_root,
        &format!("**/node_modules/{}/{}", location.package, location.rel_path),
        None,
    )?;
    if let Some(hit) = verbatim.into_iter().next() {
        return Ok(Some((hit, position)));
    }

    let maps = retrievers.file().glob(
        file_root,
        &format!("**/node_modules/{}/**/*.d.ts.map", location.package),
        None,
    )?;
    let rel = location.rel_path.clone();
    let mut scans = stream::iter(maps.into_iter().map(|map_url| {
        let rel = rel.clone();
        async move { scan_declaration_map(&map_url, temp_root, &rel, position).await }
    }))
    .buffer_unordered(MAP_SCAN_CONCURRENCY);

    while let Some(result) = scans.next().await {
        throw_if_cancelled(cancel)?;
        match result {
            Ok(Some(hit)) => return Ok(Some(hit)),
            Ok(None) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => warn!("declaration map scan: {err}"),
        }
    }
    Ok(None)
}

/// Checks one `.d.ts.map` for a source matching `rel_in_pkg` and, on a
/// match, computes the generated position of `position`.
async fn scan_declaration_map(
    map_url: &Url,
    temp_root: &Path,
    rel_in_pkg: &str,
    position: Position,
) -> Result<Option<(Url, Position)>> {
    let map_path = uris::uri_to_path(map_url)
        .ok_or_else(|| GatewayError::mapping(format!("{map_url} is not a file URI")))?;
    let bytes = match tokio::fs::read(&map_path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(GatewayError::not_found(map_url.to_string()));
        }
        Err(err) => return Err(anyhow::Error::new(err).into()),
    };
    let map = SourceMap::from_slice(&bytes)
        .map_err(|err| GatewayError::mapping(format!("{}: {err}", map_path.display())))?;
    let map_dir = map_path.parent().unwrap_or(Path::new("/"));

    let mut matched_source = None;
    for source in map.sources() {
        let resolved = uris::normalize_path(&map_dir.join(source));
        // Sources resolving outside the session temp root are ignored.
        if !resolved.starts_with(temp_root) {
            continue;
        }
        if resolved.ends_with(Path::new(rel_in_pkg)) {
            matched_source = Some(source.to_string());
            break;
        }
    }
    let Some(matched_source) = matched_source else {
        return Ok(None);
    };

    // Greatest token at or before the requested source position, within
    // the matched source.
    let mut best: Option<(u32, u32, Position)> = None;
    for token in map.tokens() {
        if token.get_source() != Some(matched_source.as_str()) {
            continue;
        }
        let (line, col) = (token.get_src_line(), token.get_src_col());
        if (line, col) > (position.line, position.character) {
            continue;
        }
        if best.is_none_or(|(bl, bc, _)| (line, col) >= (bl, bc)) {
            best = Some((
                line,
                col,
                Position::new(token.get_dst_line(), token.get_dst_col()),
            ));
        }
    }
    let Some((_, _, generated)) = best else {
        return Ok(None);
    };

    let declaration_path = map_path.with_extension("");
    let declaration = uris::path_to_uri(&declaration_path).ok_or_else(|| {
        GatewayError::mapping(format!("bad declaration path {}", declaration_path.display()))
    })?;
    Ok(Some((declaration, generated)))
}

/// Maps a declaration-file location back to its source. `None` keeps
/// the declaration location: no sibling map, no token, or a mapped
/// target leaving the temp root.
pub async fn map_outgoing(
    declaration_path: &Path,
    position: Position,
    temp_root: &Path,
) -> Option<(PathBuf, Position)> {
    let mut map_path = declaration_path.as_os_str().to_owned();
    map_path.push(".map");
    let map_path = PathBuf::from(map_path);

    let bytes = match tokio::fs::read(&map_path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!("reading {}: {err}", map_path.display());
            return None;
        }
    };
    let map = match SourceMap::from_slice(&bytes) {
        Ok(map) => map,
        Err(err) => {
            warn!("parsing {}: {err}", map_path.display());
            return None;
        }
    };

    let token = map.lookup_token(position.line, position.character)?;
    let source = token.get_source()?;
    let map_dir = map_path.parent().unwrap_or(Path::new("/"));
    let resolved = uris::normalize_path(&map_dir.join(source));
    if !resolved.starts_with(temp_root) {
        return None;
    }
    Some((
        resolved,
        Position::new(token.get_src_line(), token.get_src_col()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DECLARATION_MAP: &str = r#"{
        "version": 3,
        "file": "index.d.ts",
        "sourceRoot": "",
        "sources": ["../../src/index.ts"],
        "names": [],
        "mappings": "AAAA;AACA"
    }"#;

    fn fixture() -> (tempfile::TempDir, Url) {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = tmp.path().join("repo/node_modules/lodash");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("index.d.ts"), "declare const x: number;\n").unwrap();
        std::fs::write(pkg.join("index.d.ts.map"), DECLARATION_MAP).unwrap();
        let root = uris::path_to_uri(&tmp.path().join("repo")).unwrap();
        (tmp, uris::as_dir_url(root))
    }

    #[tokio::test]
    async fn incoming_resolves_through_declaration_map() {
        let (tmp, file_root) = fixture();
        let retrievers = Retrievers::new(reqwest::Client::new());
        let location = PackageLocation {
            package: "lodash".into(),
            rel_path: "src/index.ts".into(),
        };
        let hit = resolve_incoming(
            &retrievers,
            &file_root,
            tmp.path(),
            &location,
            Position::new(1, 0),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
        .expect("declaration map should match");
        assert!(hit.0.as_str().ends_with("node_modules/lodash/index.d.ts"));
        assert_eq!(hit.1, Position::new(1, 0));
    }

    #[tokio::test]
    async fn incoming_prefers_verbatim_files() {
        let (tmp, file_root) = fixture();
        let verbatim = tmp.path().join("repo/node_modules/lodash/src");
        std::fs::create_dir_all(&verbatim).unwrap();
        std::fs::write(verbatim.join("index.ts"), "export {}\n").unwrap();

        let retrievers = Retrievers::new(reqwest::Client::new());
        let location = PackageLocation {
            package: "lodash".into(),
            rel_path: "src/index.ts".into(),
        };
        let hit = resolve_incoming(
            &retrievers,
            &file_root,
            tmp.path(),
            &location,
            Position::new(3, 7),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(hit.0.as_str().ends_with("lodash/src/index.ts"));
        assert_eq!(hit.1, Position::new(3, 7), "verbatim hits keep the position");
    }

    #[tokio::test]
    async fn outgoing_maps_declarations_to_sources() {
        let (tmp, _) = fixture();
        let declaration = tmp.path().join("repo/node_modules/lodash/index.d.ts");
        let (path, position) = map_outgoing(&declaration, Position::new(1, 0), tmp.path())
            .await
            .expect("sibling map should resolve");
        assert_eq!(path, tmp.path().join("repo/src/index.ts"));
        assert_eq!(position, Position::new(1, 0));
    }

    #[tokio::test]
    async fn outgoing_discards_targets_leaving_the_temp_root() {
        let (tmp, _) = fixture();
        let declaration = tmp.path().join("repo/node_modules/lodash/index.d.ts");
        // Constrain the temp root to somewhere the mapped source is not.
        let elsewhere = tmp.path().join("repo/node_modules");
        assert!(
            map_outgoing(&declaration, Position::new(1, 0), &elsewhere)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn outgoing_without_map_keeps_declaration() {
        let tmp = tempfile::tempdir().unwrap();
        let declaration = tmp.path().join("lonely.d.ts");
        std::fs::write(&declaration, "declare const y: string;\n").unwrap();
        assert!(map_outgoing(&declaration, Position::new(0, 0), tmp.path())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn definitely_typed_paths_shortcut_to_types_packages() {
        let external = ExternalRepo {
            repo: "github.com/DefinitelyTyped/DefinitelyTyped".into(),
            revision: Some("cafe0123".into()),
            path: "types/node/v18/fs.d.ts".into(),
        };
        let retrievers = Retrievers::new(reqwest::Client::new());
        let instance = Url::parse("https://sourcegraph.example.com").unwrap();
        let location = find_package_root_and_name(
            &external,
            &retrievers,
            &instance,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(location.package, "@types/node");
        assert_eq!(location.rel_path, "fs.d.ts");
    }
}

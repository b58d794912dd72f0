//! Translation of downstream result locations into client URIs.
//!
//! Three cases, checked in order: the compiler's bundled lib files are
//! pinned to the embedded TypeScript version; locations inside
//! `node_modules` go through the outgoing source-map pass and the
//! external-repo resolver; everything else is the plain workspace
//! rewrite.

use std::path::{Component, Path, PathBuf};

use tower_lsp::lsp_types::{Location, LocationLink, Range, Url};

use crate::error::{GatewayError, Result};
use crate::manifests::PackageManifest;
use crate::session::Session;
use crate::sourcemaps;
use crate::uris::{self, ExternalRepo};

/// TypeScript version embedded in the downstream service.
const TYPESCRIPT_VERSION: &str = "5.5.4";
const TYPESCRIPT_REPO: &str = "github.com/microsoft/TypeScript";

pub async fn location_to_client(session: &Session, location: Location) -> Result<Location> {
    let (uri, range) = map_result_location(session, &location.uri, location.range).await?;
    Ok(Location { uri, range })
}

pub async fn locations_to_client(
    session: &Session,
    locations: Vec<Location>,
) -> Result<Vec<Location>> {
    let mut out = Vec::with_capacity(locations.len());
    for location in locations {
        out.push(location_to_client(session, location).await?);
    }
    Ok(out)
}

pub async fn location_link_to_client(
    session: &Session,
    link: LocationLink,
) -> Result<LocationLink> {
    let (target_uri, target_range) =
        map_result_location(session, &link.target_uri, link.target_range).await?;
    let (_, target_selection_range) =
        map_result_location(session, &link.target_uri, link.target_selection_range).await?;
    Ok(LocationLink {
        origin_selection_range: link.origin_selection_range,
        target_uri,
        target_range,
        target_selection_range,
    })
}

async fn map_result_location(session: &Session, uri: &Url, range: Range) -> Result<(Url, Range)> {
    let path = uris::uri_to_path(uri)
        .ok_or_else(|| GatewayError::mapping(format!("{uri} is not a file URI")))?;

    if let Some(lib_rel) = typescript_lib_rel(&path) {
        let pinned = ExternalRepo {
            repo: TYPESCRIPT_REPO.to_string(),
            revision: Some(format!("v{TYPESCRIPT_VERSION}")),
            path: format!("lib/{lib_rel}"),
        };
        return Ok((pinned.to_uri(&session.instance, session.access_token())?, range));
    }

    if has_node_modules_component(&path) {
        // Declaration locations map back to package sources when a
        // sibling map resolves inside the temp root.
        let (mapped_path, mapped_range) =
            match sourcemaps::map_outgoing(&path, range.start, &session.temp_root).await {
                Some((source_path, start)) => {
                    let end = sourcemaps::map_outgoing(&path, range.end, &session.temp_root)
                        .await
                        .map_or(start, |(_, end)| end);
                    (source_path, Range::new(start, end))
                }
                None => (path.clone(), range),
            };

        if has_node_modules_component(&mapped_path) {
            let (package_root, manifest) = enclosing_package(&mapped_path)?;
            let file_uri = uris::path_to_uri(&mapped_path).ok_or_else(|| {
                GatewayError::mapping(format!("bad mapped path {}", mapped_path.display()))
            })?;
            let external = uris::resolve_external(
                &file_uri,
                &package_root,
                &manifest,
                &session.instance,
                session.access_token(),
            )?;
            return Ok((external, mapped_range));
        }

        let mapped_uri = uris::path_to_uri(&mapped_path).ok_or_else(|| {
            GatewayError::mapping(format!("bad mapped path {}", mapped_path.display()))
        })?;
        return Ok((session.roots.file_to_http(&mapped_uri)?, mapped_range));
    }

    Ok((session.roots.file_to_http(uri)?, range))
}

/// Nearest named package manifest above `path`, without leaving the
/// `node_modules` tree.
fn enclosing_package(path: &Path) -> Result<(PathBuf, PackageManifest)> {
    let mut dir = path.parent();
    while let Some(current) = dir {
        if current
            .file_name()
            .is_some_and(|name| name == "node_modules")
        {
            break;
        }
        let manifest_path = current.join("package.json");
        if manifest_path.exists() {
            let bytes = std::fs::read(&manifest_path)
                .map_err(|err| GatewayError::mapping(format!("{}: {err}", manifest_path.display())))?;
            let manifest = PackageManifest::parse(&bytes)?;
            if manifest.name.is_some() {
                return Ok((current.to_path_buf(), manifest));
            }
        }
        dir = current.parent();
    }
    Err(GatewayError::mapping(format!(
        "no package manifest above {}",
        path.display()
    )))
}

fn typescript_lib_rel(path: &Path) -> Option<String> {
    let components: Vec<&str> = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    let at = components
        .windows(2)
        .position(|pair| pair == ["typescript", "lib"])?;
    let rest = &components[at + 2..];
    if rest.is_empty() {
        None
    } else {
        Some(rest.join("/"))
    }
}

fn has_node_modules_component(path: &Path) -> bool {
    path.components()
        .any(|component| component.as_os_str() == "node_modules")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;
    use tower_lsp::lsp_types::Position;

    #[test]
    fn typescript_lib_paths_are_detected() {
        assert_eq!(
            typescript_lib_rel(Path::new(
                "/srv/node_modules/typescript/lib/lib.es2020.d.ts"
            ))
            .as_deref(),
            Some("lib.es2020.d.ts")
        );
        assert_eq!(
            typescript_lib_rel(Path::new("/srv/repo/src/typescript.ts")),
            None
        );
    }

    #[tokio::test]
    async fn workspace_locations_rewrite_to_http() {
        let fx = fixture(|_repo| {}, &[]);
        let location = Location {
            uri: Url::parse(&format!(
                "{}src/z.ts",
                fx.session.roots.file_root().as_str()
            ))
            .unwrap(),
            range: Range::new(Position::new(1, 2), Position::new(1, 9)),
        };
        let mapped = location_to_client(&fx.session, location).await.unwrap();
        assert_eq!(mapped.uri.as_str(), "https://h/repo@abc/-/raw/src/z.ts");
        assert_eq!(mapped.range.start, Position::new(1, 2));
    }

    #[tokio::test]
    async fn typescript_lib_locations_pin_the_compiler_version() {
        let fx = fixture(|_repo| {}, &[]);
        let location = Location {
            uri: Url::parse("file:///usr/lib/node_modules/typescript/lib/lib.dom.d.ts").unwrap(),
            range: Range::default(),
        };
        let mapped = location_to_client(&fx.session, location).await.unwrap();
        assert_eq!(
            mapped.uri.as_str(),
            format!(
                "https://sourcegraph.example.com/github.com/microsoft/TypeScript@v{TYPESCRIPT_VERSION}/-/raw/lib/lib.dom.d.ts"
            )
        );
    }

    #[tokio::test]
    async fn node_modules_locations_resolve_to_external_repos() {
        let fx = fixture(
            |repo| {
                let pkg = repo.join("node_modules/lodash");
                std::fs::create_dir_all(&pkg).unwrap();
                std::fs::write(
                    pkg.join("package.json"),
                    r#"{
                        "name": "lodash",
                        "repository": "git+https://github.com/lodash/lodash.git",
                        "gitHead": "deadbeef"
                    }"#,
                )
                .unwrap();
                std::fs::write(pkg.join("index.d.ts"), "declare const _: any;\n").unwrap();
            },
            &[],
        );
        let location = Location {
            uri: Url::parse(&format!(
                "{}node_modules/lodash/index.d.ts",
                fx.session.roots.file_root().as_str()
            ))
            .unwrap(),
            range: Range::default(),
        };
        let mapped = location_to_client(&fx.session, location).await.unwrap();
        assert_eq!(
            mapped.uri.as_str(),
            "https://sourcegraph.example.com/github.com/lodash/lodash@deadbeef/-/raw/index.d.ts"
        );
    }

    #[tokio::test]
    async fn declaration_maps_rewrite_before_external_resolution() {
        let fx = fixture(
            |repo| {
                let pkg = repo.join("node_modules/lodash");
                std::fs::create_dir_all(pkg.join("src")).unwrap();
                std::fs::write(
                    pkg.join("package.json"),
                    r#"{
                        "name": "lodash",
                        "repository": "git+https://github.com/lodash/lodash.git",
                        "gitHead": "deadbeef"
                    }"#,
                )
                .unwrap();
                std::fs::write(pkg.join("index.d.ts"), "declare const _: any;\n").unwrap();
                std::fs::write(
                    pkg.join("index.d.ts.map"),
                    r#"{
                        "version": 3,
                        "file": "index.d.ts",
                        "sources": ["src/index.ts"],
                        "names": [],
                        "mappings": "AAAA"
                    }"#,
                )
                .unwrap();
            },
            &[],
        );
        let location = Location {
            uri: Url::parse(&format!(
                "{}node_modules/lodash/index.d.ts",
                fx.session.roots.file_root().as_str()
            ))
            .unwrap(),
            range: Range::default(),
        };
        let mapped = location_to_client(&fx.session, location).await.unwrap();
        assert_eq!(
            mapped.uri.as_str(),
            "https://sourcegraph.example.com/github.com/lodash/lodash@deadbeef/-/raw/src/index.ts"
        );
    }
}

//! `tsconfig.json` sanitization.
//!
//! `compilerOptions.plugins` would make the downstream service load
//! plugin code out of untrusted `node_modules`; every tsconfig in the
//! workspace is rewritten without it before the downstream sees it.

use std::path::Path;

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, warn};

/// Sanitizes every `tsconfig.json` under `root`. Individual failures are
/// logged and skipped. Returns how many files were rewritten.
pub fn sanitize_tree(root: &Path) -> usize {
    let pattern = format!("{}/**/tsconfig.json", root.display());
    let paths = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(err) => {
            warn!("bad tsconfig glob {pattern}: {err}");
            return 0;
        }
    };
    let mut rewritten = 0;
    for path in paths.flatten() {
        match sanitize_file(&path) {
            Ok(true) => {
                debug!("removed compilerOptions.plugins from {}", path.display());
                rewritten += 1;
            }
            Ok(false) => {}
            Err(err) => warn!("sanitizing {}: {err:#}", path.display()),
        }
    }
    rewritten
}

/// Returns whether the file was rewritten.
pub fn sanitize_file(path: &Path) -> anyhow::Result<bool> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let stripped = strip_jsonc(&raw);
    let mut parsed: Value = match serde_json::from_str(&stripped) {
        Ok(parsed) => parsed,
        Err(err) => {
            // tsconfig files are routinely hand-edited; tolerate garbage.
            warn!("unparseable tsconfig {}: {err}", path.display());
            return Ok(false);
        }
    };

    let Some(compiler_options) = parsed
        .get_mut("compilerOptions")
        .and_then(Value::as_object_mut)
    else {
        return Ok(false);
    };
    if compiler_options.remove("plugins").is_none() {
        return Ok(false);
    }

    let rendered = serde_json::to_string_pretty(&parsed)?;
    std::fs::write(path, rendered).with_context(|| format!("writing {}", path.display()))?;
    Ok(true)
}

/// Removes `//` and `/* */` comments plus trailing commas, the two JSONC
/// liberties tsconfig files actually take.
fn strip_jsonc(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            ',' => {
                // Drop the comma when the next significant char closes a
                // container.
                let mut lookahead = chars.clone();
                let mut next_significant = None;
                for next in lookahead.by_ref() {
                    if !next.is_whitespace() {
                        next_significant = Some(next);
                        break;
                    }
                }
                match next_significant {
                    Some('}') | Some(']') => {}
                    _ => out.push(c),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comments_and_trailing_commas() {
        let raw = r#"{
            // line comment
            "compilerOptions": {
                /* block
                   comment */
                "strict": true,
                "paths": { "a": ["./a"], },
            },
        }"#;
        let value: Value = serde_json::from_str(&strip_jsonc(raw)).unwrap();
        assert_eq!(value["compilerOptions"]["strict"], Value::Bool(true));
    }

    #[test]
    fn keeps_comment_like_content_inside_strings() {
        let raw = r#"{ "a": "// not a comment", "b": "c:\\path" }"#;
        let value: Value = serde_json::from_str(&strip_jsonc(raw)).unwrap();
        assert_eq!(value["a"], "// not a comment");
    }

    #[test]
    fn removes_plugins_and_rewrites() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tsconfig.json");
        std::fs::write(
            &path,
            r#"{
                // strictness
                "compilerOptions": {
                    "strict": true,
                    "plugins": [{ "name": "evil-plugin" }],
                },
            }"#,
        )
        .unwrap();

        assert!(sanitize_file(&path).unwrap());
        let rewritten: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(rewritten["compilerOptions"].get("plugins").is_none());
        assert_eq!(rewritten["compilerOptions"]["strict"], Value::Bool(true));

        // Already clean: second pass is a no-op.
        assert!(!sanitize_file(&path).unwrap());
    }

    #[test]
    fn sanitize_tree_walks_nested_configs() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("node_modules/pkg");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            nested.join("tsconfig.json"),
            r#"{ "compilerOptions": { "plugins": [] } }"#,
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("tsconfig.json"),
            r#"{ "compilerOptions": { "strict": true } }"#,
        )
        .unwrap();

        assert_eq!(sanitize_tree(tmp.path()), 1);
    }
}

//! Session configuration lifted from `initializationOptions.configuration`.

use serde_json::Value;
use tower_lsp::lsp_types::Url;
use tracing::warn;

/// Per-session settings. Everything is optional on the wire; missing or
/// malformed values fall back to the documented defaults with a warning,
/// the rest of the session continues.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// `typescript.diagnostics.enable`: forward downstream diagnostics
    /// to the client.
    pub diagnostics_enable: bool,
    /// `typescript.progress`: emit progress notifications. `None`
    /// follows the client capability.
    pub progress: Option<bool>,
    /// `typescript.restartAfterDependencyInstallation`.
    pub restart_after_install: bool,
    /// `typescript.npmrc`: registry config handed to the installer.
    pub npmrc: Option<serde_json::Map<String, Value>>,
    /// `typescript.sourcegraphUrl`: instance used for external-repo
    /// URI rewriting.
    pub sourcegraph_url: Option<Url>,
    /// `typescript.accessToken`: bearer carried in the userinfo of
    /// produced external-repo URIs.
    pub access_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            diagnostics_enable: false,
            progress: None,
            restart_after_install: true,
            npmrc: None,
            sourcegraph_url: None,
            access_token: None,
        }
    }
}

impl GatewayConfig {
    /// Lifts the `configuration` object out of `initializationOptions`.
    pub fn from_initialization_options(options: Option<&Value>) -> Self {
        let Some(config) = options.and_then(|opts| opts.get("configuration")) else {
            return Self::default();
        };
        Self::from_configuration(config)
    }

    pub fn from_configuration(config: &Value) -> Self {
        let mut result = Self::default();
        if !config.is_object() {
            warn!("initializationOptions.configuration is not an object; using defaults");
            return result;
        }

        if let Some(enable) = lookup(config, "typescript.diagnostics.enable") {
            result.diagnostics_enable = as_bool(enable, "typescript.diagnostics.enable")
                .unwrap_or(result.diagnostics_enable);
        }
        if let Some(progress) = lookup(config, "typescript.progress") {
            result.progress = as_bool(progress, "typescript.progress");
        }
        if let Some(restart) = lookup(config, "typescript.restartAfterDependencyInstallation") {
            result.restart_after_install =
                as_bool(restart, "typescript.restartAfterDependencyInstallation")
                    .unwrap_or(result.restart_after_install);
        }
        if let Some(npmrc) = lookup(config, "typescript.npmrc") {
            match npmrc {
                Value::Object(map) => result.npmrc = Some(map.clone()),
                other => warn!("typescript.npmrc is not an object: {other}"),
            }
        }
        if let Some(url) = lookup(config, "typescript.sourcegraphUrl") {
            result.sourcegraph_url = url
                .as_str()
                .and_then(|raw| match Url::parse(raw) {
                    Ok(url) => Some(url),
                    Err(err) => {
                        warn!("typescript.sourcegraphUrl is not a valid URL: {err}");
                        None
                    }
                });
        }
        if let Some(token) = lookup(config, "typescript.accessToken") {
            result.access_token = token.as_str().map(str::to_owned);
        }

        result
    }

    /// Serializes the npmrc object into `key=value` lines for the file
    /// handed to the installer.
    pub fn npmrc_contents(&self) -> Option<String> {
        let map = self.npmrc.as_ref()?;
        let mut out = String::new();
        for (key, value) in map {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(key);
            out.push('=');
            out.push_str(&rendered);
            out.push('\n');
        }
        Some(out)
    }
}

/// Settings objects arrive either with literal dotted keys or as nested
/// objects; accept both.
fn lookup<'a>(config: &'a Value, dotted: &str) -> Option<&'a Value> {
    if let Some(value) = config.get(dotted) {
        return Some(value);
    }
    let mut current = config;
    for part in dotted.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn as_bool(value: &Value, key: &str) -> Option<bool> {
    match value.as_bool() {
        Some(flag) => Some(flag),
        None => {
            warn!("{key} is not a boolean: {value}");
            None
        }
    }
}

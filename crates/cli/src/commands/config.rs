use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use fieldpo_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use serde::Serialize;
use toml::Value;

use crate::commands::{CommandResult, EXIT_CONFIG};

#[derive(Debug, Serialize)]
struct ConfigField {
    key: &'static str,
    value: String,
    source: String,
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                EXIT_CONFIG,
            );
        }
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let fields: Vec<ConfigField> = effective_values(&config)
        .into_iter()
        .map(|(key, env_key, value)| ConfigField {
            key,
            value,
            source: field_source(
                key,
                env_key,
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            ),
        })
        .collect();

    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(fields.iter().map(render_line));

    CommandResult::success_with("config", lines.join("\n"), serde_json::to_value(&fields).ok())
}

fn effective_values(config: &AppConfig) -> Vec<EffectiveValue> {
    let access_token = match &config.backend.access_token {
        Some(token) => redact_token(token.expose_secret()),
        None => "<unset>".to_string(),
    };

    vec![
        field("database.url", &["FIELDPO_DATABASE_URL"], config.database.url.clone()),
        field(
            "database.max_connections",
            &["FIELDPO_DATABASE_MAX_CONNECTIONS"],
            config.database.max_connections.to_string(),
        ),
        field(
            "database.timeout_secs",
            &["FIELDPO_DATABASE_TIMEOUT_SECS"],
            config.database.timeout_secs.to_string(),
        ),
        field(
            "backend.url",
            &["FIELDPO_BACKEND_URL"],
            config.backend.url.clone().unwrap_or_else(|| "<unset>".to_string()),
        ),
        field(
            "backend.anon_key",
            &["FIELDPO_BACKEND_ANON_KEY"],
            redact_token(config.backend.anon_key.expose_secret()),
        ),
        field("backend.access_token", &["FIELDPO_ACCESS_TOKEN"], access_token),
        field(
            "backend.timeout_secs",
            &["FIELDPO_BACKEND_TIMEOUT_SECS"],
            config.backend.timeout_secs.to_string(),
        ),
        field(
            "organization.po_seed",
            &["FIELDPO_ORGANIZATION_PO_SEED"],
            config.organization.po_seed.to_string(),
        ),
        field(
            "logging.level",
            &["FIELDPO_LOGGING_LEVEL", "FIELDPO_LOG_LEVEL"],
            config.logging.level.clone(),
        ),
        field(
            "logging.format",
            &["FIELDPO_LOGGING_FORMAT", "FIELDPO_LOG_FORMAT"],
            format!("{:?}", config.logging.format).to_lowercase(),
        ),
    ]
}

type EffectiveValue = (&'static str, &'static [&'static str], String);

fn field(key: &'static str, env_keys: &'static [&'static str], value: String) -> EffectiveValue {
    (key, env_keys, value)
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("fieldpo.toml"), PathBuf::from("config/fieldpo.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) =
        env_keys.iter().find(|key| env::var(key).is_ok_and(|value| !value.trim().is_empty()))
    {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(field: &ConfigField) -> String {
    format!("- {} = {} (source: {})", field.key, field.value, field.source)
}

/// Keeps at most a short prefix of a secret, e.g. `eyJh***` for a JWT.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    match trimmed.char_indices().nth(4) {
        Some((cut, _)) if trimmed.len() > 12 => format!("{}***", &trimmed[..cut]),
        _ => "<redacted>".to_string(),
    }
}

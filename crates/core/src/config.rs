use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub backend: BackendConfig,
    pub organization: OrganizationConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Hosted backend. When `url` is unset every operation runs against the local database.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub url: Option<String>,
    pub anon_key: SecretString,
    pub access_token: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct OrganizationConfig {
    /// First PO number handed out in an organization without a sequence yet.
    pub po_seed: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub backend_url: Option<String>,
    pub backend_anon_key: Option<String>,
    pub backend_access_token: Option<String>,
    pub po_seed: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub const DEFAULT_PO_SEED: u64 = 1001;

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://fieldpo.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            backend: BackendConfig {
                url: None,
                anon_key: String::new().into(),
                access_token: None,
                timeout_secs: 15,
            },
            organization: OrganizationConfig { po_seed: DEFAULT_PO_SEED },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl BackendConfig {
    pub fn is_remote(&self) -> bool {
        self.url.is_some()
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("fieldpo.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(backend) = patch.backend {
            if let Some(url) = backend.url {
                self.backend.url = non_blank(url);
            }
            if let Some(anon_key) = backend.anon_key {
                self.backend.anon_key = anon_key.into();
            }
            if let Some(access_token) = backend.access_token {
                self.backend.access_token = non_blank(access_token).map(SecretString::from);
            }
            if let Some(timeout_secs) = backend.timeout_secs {
                self.backend.timeout_secs = timeout_secs;
            }
        }

        if let Some(organization) = patch.organization {
            if let Some(po_seed) = organization.po_seed {
                self.organization.po_seed = po_seed;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("FIELDPO_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("FIELDPO_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("FIELDPO_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("FIELDPO_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("FIELDPO_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FIELDPO_BACKEND_URL") {
            self.backend.url = Some(value);
        }
        if let Some(value) = read_env("FIELDPO_BACKEND_ANON_KEY") {
            self.backend.anon_key = value.into();
        }
        if let Some(value) = read_env("FIELDPO_ACCESS_TOKEN") {
            self.backend.access_token = Some(value.into());
        }
        if let Some(value) = read_env("FIELDPO_BACKEND_TIMEOUT_SECS") {
            self.backend.timeout_secs = parse_u64("FIELDPO_BACKEND_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FIELDPO_ORGANIZATION_PO_SEED") {
            self.organization.po_seed = parse_u64("FIELDPO_ORGANIZATION_PO_SEED", &value)?;
        }

        let log_level =
            read_env("FIELDPO_LOGGING_LEVEL").or_else(|| read_env("FIELDPO_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("FIELDPO_LOGGING_FORMAT").or_else(|| read_env("FIELDPO_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(backend_url) = overrides.backend_url {
            self.backend.url = non_blank(backend_url);
        }
        if let Some(anon_key) = overrides.backend_anon_key {
            self.backend.anon_key = anon_key.into();
        }
        if let Some(access_token) = overrides.backend_access_token {
            self.backend.access_token = non_blank(access_token).map(SecretString::from);
        }
        if let Some(po_seed) = overrides.po_seed {
            self.organization.po_seed = po_seed;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_backend(&self.backend)?;
        validate_organization(&self.organization)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("fieldpo.toml"), PathBuf::from("config/fieldpo.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_backend(backend: &BackendConfig) -> Result<(), ConfigError> {
    if backend.timeout_secs == 0 || backend.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "backend.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    let Some(url) = &backend.url else {
        return Ok(());
    };

    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "backend.url must start with http:// or https://".to_string(),
        ));
    }

    if backend.anon_key.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "backend.anon_key is required when backend.url is set. Find it under the project's API settings"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_organization(organization: &OrganizationConfig) -> Result<(), ConfigError> {
    if organization.po_seed == 0 {
        return Err(ConfigError::Validation(
            "organization.po_seed must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.trim_end_matches('/').to_string())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    backend: Option<BackendPatch>,
    organization: Option<OrganizationPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendPatch {
    url: Option<String>,
    anon_key: Option<String>,
    access_token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OrganizationPatch {
    po_seed: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, DEFAULT_PO_SEED};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_run_locally_with_standard_po_seed() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(!config.backend.is_remote(), "no backend url means local mode")?;
        ensure(config.organization.po_seed == DEFAULT_PO_SEED, "po seed should default to 1001")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_FIELDPO_ANON_KEY", "anon-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("fieldpo.toml");
            fs::write(
                &path,
                r#"
[backend]
url = "https://even.example.co/"
anon_key = "${TEST_FIELDPO_ANON_KEY}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.backend.anon_key.expose_secret() == "anon-from-env",
                "anon key should be loaded from environment",
            )?;
            ensure(
                config.backend.url.as_deref() == Some("https://even.example.co"),
                "trailing slash should be trimmed from backend url",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_FIELDPO_ANON_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("FIELDPO_LOG_LEVEL", "warn");
        env::set_var("FIELDPO_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["FIELDPO_LOG_LEVEL", "FIELDPO_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("FIELDPO_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("FIELDPO_ORGANIZATION_PO_SEED", "5001");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("fieldpo.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[organization]
po_seed = 2001

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.organization.po_seed == 5001, "env po seed should win over file")?;
            Ok(())
        })();

        clear_vars(&["FIELDPO_DATABASE_URL", "FIELDPO_ORGANIZATION_PO_SEED"]);
        result
    }

    #[test]
    fn remote_backend_requires_anon_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("FIELDPO_BACKEND_URL", "https://even.example.co");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("backend.anon_key")
            );
            ensure(has_message, "validation failure should mention backend.anon_key")
        })();

        clear_vars(&["FIELDPO_BACKEND_URL"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("FIELDPO_ORGANIZATION_PO_SEED", "one thousand");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected override failure".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(error, ConfigError::InvalidEnvOverride { ref key, .. } if key == "FIELDPO_ORGANIZATION_PO_SEED"),
                "override error should name the variable",
            )
        })();

        clear_vars(&["FIELDPO_ORGANIZATION_PO_SEED"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("FIELDPO_BACKEND_URL", "https://even.example.co");
        env::set_var("FIELDPO_BACKEND_ANON_KEY", "anon-secret-value");
        env::set_var("FIELDPO_ACCESS_TOKEN", "bearer-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("anon-secret-value"), "debug output should not contain anon key")?;
            ensure(
                !debug.contains("bearer-secret-value"),
                "debug output should not contain access token",
            )?;
            ensure(config.backend.is_remote(), "backend url should enable remote mode")?;
            Ok(())
        })();

        clear_vars(&["FIELDPO_BACKEND_URL", "FIELDPO_BACKEND_ANON_KEY", "FIELDPO_ACCESS_TOKEN"]);
        result
    }
}

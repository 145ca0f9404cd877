pub mod access;
pub mod config;
pub mod context;
pub mod migrate;
pub mod requests;
pub mod seed;

use std::future::Future;

use fieldpo_core::backend::BackendError;
use fieldpo_core::config::{AppConfig, LoadOptions};
use fieldpo_core::errors::{ApplicationError, DomainError};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with(command, message, None)
    }

    pub fn success_with(command: &str, message: impl Into<String>, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// What a command reports on success.
#[derive(Debug)]
pub struct CommandOutput {
    pub message: String,
    pub data: Option<Value>,
}

impl CommandOutput {
    pub fn message(message: impl Into<String>) -> Self {
        Self { message: message.into(), data: None }
    }

    pub fn with_data(message: impl Into<String>, data: impl Serialize) -> Result<Self, CommandFailure> {
        let data = serde_json::to_value(data).map_err(|error| {
            CommandFailure::new("serialization", error.to_string(), EXIT_PERSISTENCE)
        })?;
        Ok(Self { message: message.into(), data: Some(data) })
    }
}

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_RUNTIME: u8 = 3;
pub const EXIT_CONNECTIVITY: u8 = 4;
pub const EXIT_PERSISTENCE: u8 = 5;
pub const EXIT_VERIFICATION: u8 = 6;
pub const EXIT_DENIED: u8 = 7;
pub const EXIT_REJECTED: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub error_class: &'static str,
    pub message: String,
    pub exit_code: u8,
}

impl CommandFailure {
    pub fn new(error_class: &'static str, message: impl Into<String>, exit_code: u8) -> Self {
        Self { error_class, message: message.into(), exit_code }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new("invalid_argument", message, EXIT_CONFIG)
    }
}

impl From<ApplicationError> for CommandFailure {
    fn from(error: ApplicationError) -> Self {
        let message = error.to_string();
        let (error_class, exit_code) = match &error {
            ApplicationError::NotAuthenticated => ("not_authenticated", EXIT_DENIED),
            ApplicationError::NoOrganization => ("no_organization", EXIT_DENIED),
            ApplicationError::Configuration(_) => ("config_validation", EXIT_CONFIG),
            ApplicationError::Domain(domain) => domain_class(domain),
            ApplicationError::Backend(backend) => match backend {
                BackendError::NotAuthenticated => ("not_authenticated", EXIT_DENIED),
                BackendError::Network(_) => ("backend_unavailable", EXIT_CONNECTIVITY),
                BackendError::Service { status, .. } if *status >= 500 => {
                    ("backend_unavailable", EXIT_CONNECTIVITY)
                }
                BackendError::Service { status: 403, .. } => ("unauthorized", EXIT_DENIED),
                BackendError::Service { .. } => ("rejected", EXIT_REJECTED),
                BackendError::NotFound { .. } => ("not_found", EXIT_REJECTED),
                BackendError::Conflict(_) => ("conflict", EXIT_REJECTED),
                BackendError::Decode(_) => ("decode", EXIT_PERSISTENCE),
                BackendError::Persistence(_) => ("persistence", EXIT_PERSISTENCE),
                BackendError::Domain(domain) => domain_class(domain),
            },
        };
        Self::new(error_class, message, exit_code)
    }
}

fn domain_class(error: &DomainError) -> (&'static str, u8) {
    match error {
        DomainError::Unauthorized { .. } => ("unauthorized", EXIT_DENIED),
        DomainError::ProjectAccessDenied(_) => ("project_access_denied", EXIT_DENIED),
        DomainError::InvalidTransition { .. } => ("invalid_transition", EXIT_REJECTED),
        DomainError::Validation(_) => ("validation", EXIT_REJECTED),
        DomainError::UnknownValue { .. } => ("invalid_argument", EXIT_CONFIG),
        DomainError::MalformedRow { .. } => ("decode", EXIT_PERSISTENCE),
        DomainError::InvariantViolation(_) => ("invariant_violation", EXIT_PERSISTENCE),
    }
}

/// Loads config, runs `work` on a fresh current-thread runtime and renders the outcome.
pub fn execute<F, Fut>(command: &str, work: F) -> CommandResult
where
    F: FnOnce(AppConfig) -> Fut,
    Fut: Future<Output = Result<CommandOutput, CommandFailure>>,
{
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                command,
                "config_validation",
                format!("configuration issue: {error}"),
                EXIT_CONFIG,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                EXIT_RUNTIME,
            );
        }
    };

    match runtime.block_on(work(config)) {
        Ok(output) => CommandResult::success_with(command, output.message, output.data),
        Err(failure) => {
            tracing::debug!(
                event_name = "cli.command.failed",
                command,
                error_class = failure.error_class,
                exit_code = failure.exit_code,
                "command failed"
            );
            CommandResult::failure(command, failure.error_class, failure.message, failure.exit_code)
        }
    }
}

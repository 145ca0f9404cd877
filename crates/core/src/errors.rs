use thiserror::Error;

use crate::backend::BackendError;
use crate::domain::project::ProjectId;
use crate::domain::request::RequestStatus;
use crate::lifecycle::draft::ValidationError;
use crate::lifecycle::states::LifecycleAction;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("cannot {action} a request in status `{from}`")]
    InvalidTransition { from: RequestStatus, action: LifecycleAction },
    #[error("missing capability `{permission}`{}", scope_suffix(.project_id))]
    Unauthorized { permission: String, project_id: Option<ProjectId> },
    #[error("no access to project `{0}`")]
    ProjectAccessDenied(ProjectId),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("unknown {field} value `{value}`")]
    UnknownValue { field: &'static str, value: String },
    #[error("malformed {entity} row: {reason}")]
    MalformedRow { entity: &'static str, reason: String },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

fn scope_suffix(project_id: &Option<ProjectId>) -> String {
    match project_id {
        Some(project_id) => format!(" on project `{project_id}`"),
        None => String::new(),
    }
}

impl DomainError {
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::ProjectAccessDenied(_))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Backend(BackendError),
    #[error("not signed in")]
    NotAuthenticated,
    #[error("no organization membership")]
    NoOrganization,
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<BackendError> for ApplicationError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Domain(domain) => Self::Domain(domain),
            BackendError::NotAuthenticated => Self::NotAuthenticated,
            other => Self::Backend(other),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You do not have permission to perform this action.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            ApplicationError::Domain(domain) if domain.is_authorization() => {
                Self::Forbidden { message: domain.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::NotAuthenticated | ApplicationError::NoOrganization => {
                Self::Forbidden { message: value.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Domain(domain) => {
                Self::BadRequest { message: domain.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Backend(BackendError::NotFound { .. })
            | ApplicationError::Backend(BackendError::Conflict(_)) => {
                Self::BadRequest { message: value.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Backend(backend) => Self::ServiceUnavailable {
                message: backend.to_string(),
                correlation_id: unassigned(),
            },
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::BackendError;
    use crate::domain::project::ProjectId;
    use crate::errors::{ApplicationError, DomainError, InterfaceError};
    use crate::lifecycle::draft::ValidationError;

    #[test]
    fn validation_error_maps_to_bad_request_interface_error() {
        let interface = ApplicationError::from(DomainError::from(ValidationError::VendorRequired))
            .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn missing_capability_maps_to_forbidden() {
        let interface = ApplicationError::from(DomainError::Unauthorized {
            permission: "po.approve".to_owned(),
            project_id: Some(ProjectId("p2".to_owned())),
        })
        .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::Forbidden { .. }));
        assert!(interface.to_string().contains("po.approve"));
        assert!(interface.to_string().contains("p2"));
    }

    #[test]
    fn network_error_maps_to_service_unavailable() {
        let interface = ApplicationError::from(BackendError::Network("connection reset".to_owned()))
            .into_interface("req-3");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(interface.correlation_id(), "req-3");
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn backend_domain_errors_unwrap_into_domain_variant() {
        let error = ApplicationError::from(BackendError::Domain(DomainError::InvariantViolation(
            "bad row".to_owned(),
        )));
        assert!(matches!(error, ApplicationError::Domain(DomainError::InvariantViolation(_))));
    }

    #[test]
    fn configuration_error_maps_to_internal() {
        let interface =
            ApplicationError::Configuration("invalid anon key".to_owned()).into_interface("req-4");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }
}

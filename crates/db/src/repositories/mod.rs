use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;

use fieldpo_core::backend::BackendError;
use fieldpo_core::errors::DomainError;

pub mod access;
pub mod memory;
pub mod request;

pub use access::{MemberAccess, SqlAccessRepository};
pub use memory::InMemoryBackend;
pub use request::SqlRequestRepository;

/// Pseudo-capability reported when a caller acts on an organization they do not belong to.
pub const ORGANIZATION_MEMBER: &str = "organization.member";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unknown or disabled user `{0}`")]
    NotAuthenticated(String),
    #[error("{entity} `{id}` was not found")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl RepositoryError {
    pub(crate) fn not_member() -> Self {
        Self::Domain(DomainError::Unauthorized {
            permission: ORGANIZATION_MEMBER.to_owned(),
            project_id: None,
        })
    }
}

impl From<RepositoryError> for BackendError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(sqlx::Error::RowNotFound) => {
                BackendError::NotFound { entity: "row", id: String::new() }
            }
            RepositoryError::Database(sqlx::Error::Database(error))
                if error.is_unique_violation() =>
            {
                BackendError::Conflict(error.message().to_owned())
            }
            RepositoryError::Database(error) => BackendError::Persistence(error.to_string()),
            RepositoryError::Decode(message) => BackendError::Decode(message),
            RepositoryError::Encode(error) => BackendError::Persistence(error.to_string()),
            RepositoryError::NotAuthenticated(_) => BackendError::NotAuthenticated,
            RepositoryError::NotFound { entity, id } => BackendError::NotFound { entity, id },
            RepositoryError::Conflict(message) => BackendError::Conflict(message),
            RepositoryError::Domain(error @ DomainError::MalformedRow { .. }) => {
                BackendError::Decode(error.to_string())
            }
            RepositoryError::Domain(error) => BackendError::Domain(error),
        }
    }
}

pub(crate) fn parse_decimal(column: &str, raw: String) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(raw.trim())
        .map_err(|error| RepositoryError::Decode(format!("{column} `{raw}` is not a decimal: {error}")))
}

pub(crate) fn parse_optional_decimal(
    column: &str,
    raw: Option<String>,
) -> Result<Option<Decimal>, RepositoryError> {
    raw.filter(|value| !value.trim().is_empty()).map(|value| parse_decimal(column, value)).transpose()
}

pub(crate) fn parse_string_list(column: &str, raw: String) -> Result<Vec<String>, RepositoryError> {
    serde_json::from_str(&raw)
        .map_err(|error| RepositoryError::Decode(format!("{column} is not a JSON string list: {error}")))
}

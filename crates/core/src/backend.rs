//! Typed boundary to the hosted backend: authentication, permission resolution, org-scoped
//! row reads and server-validated mutations.

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::AuditEntry;
use crate::domain::profile::{Organization, OrganizationId, UserId, UserProfile};
use crate::domain::project::{CostCode, Project};
use crate::domain::request::{LineItemRecord, PurchaseRequest, RequestHeader, RequestId};
use crate::errors::DomainError;
use crate::lifecycle::draft::NewRequest;
use crate::lifecycle::states::LifecycleAction;
use crate::permissions::PermissionGrant;

/// An authenticated caller: stable user id plus the bearer credential for remote calls.
#[derive(Clone, Debug)]
pub struct Identity {
    pub user_id: UserId,
    access_token: SecretString,
}

impl Identity {
    pub fn new(user_id: UserId, access_token: impl Into<String>) -> Self {
        Self { user_id, access_token: SecretString::from(access_token.into()) }
    }

    pub fn bearer_token(&self) -> &str {
        self.access_token.expose_secret()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedAccess {
    pub profile: Option<UserProfile>,
    pub onboarded: bool,
    pub organization: Option<Organization>,
    pub grant: PermissionGrant,
}

/// Mutations that must be validated server-side. Serialized in the shape the
/// `manage-request` function accepts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RequestAction {
    #[serde(rename_all = "camelCase")]
    Approve { request_id: RequestId },
    #[serde(rename_all = "camelCase")]
    Reject { request_id: RequestId, reason: String },
    #[serde(rename_all = "camelCase")]
    MarkPurchased {
        request_id: RequestId,
        /// Sent as a JSON number.
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "rust_decimal::serde::float_option"
        )]
        final_total: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receipt_uri: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
    },
}

impl RequestAction {
    pub fn request_id(&self) -> &RequestId {
        match self {
            RequestAction::Approve { request_id }
            | RequestAction::Reject { request_id, .. }
            | RequestAction::MarkPurchased { request_id, .. } => request_id,
        }
    }

    pub fn lifecycle_action(&self) -> LifecycleAction {
        match self {
            RequestAction::Approve { .. } => LifecycleAction::Approve,
            RequestAction::Reject { .. } => LifecycleAction::Reject,
            RequestAction::MarkPurchased { .. } => LifecycleAction::MarkPurchased,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("network failure: {0}")]
    Network(String),
    #[error("service returned {status}: {message}")]
    Service { status: u16, message: String },
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("{entity} `{id}` was not found")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn sign_in(&self, email: &str, password: &SecretString)
        -> Result<Identity, BackendError>;

    /// Returns `None` when the account must be confirmed before a session exists.
    async fn sign_up(
        &self,
        email: &str,
        password: &SecretString,
        full_name: &str,
    ) -> Result<Option<Identity>, BackendError>;

    async fn sign_out(&self, identity: &Identity) -> Result<(), BackendError>;

    /// Asks the auth service to email a password recovery link. Succeeds whether or not the
    /// address belongs to an account.
    async fn reset_password(&self, email: &str) -> Result<(), BackendError>;
}

#[async_trait]
pub trait PermissionResolver: Send + Sync {
    async fn resolve(&self, identity: &Identity) -> Result<ResolvedAccess, BackendError>;
}

#[async_trait]
pub trait MembershipService: Send + Sync {
    async fn claim_access_code(
        &self,
        identity: &Identity,
        code: &str,
    ) -> Result<Organization, BackendError>;

    async fn leave_organization(&self, identity: &Identity) -> Result<(), BackendError>;
}

#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn list_projects(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<Project>, BackendError>;

    async fn list_cost_codes(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<CostCode>, BackendError>;

    /// Newest first.
    async fn list_requests(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<RequestHeader>, BackendError>;

    async fn list_line_items(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<LineItemRecord>, BackendError>;

    async fn list_profiles(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<UserProfile>, BackendError>;

    /// The append-only audit log across the organization, newest first.
    async fn list_audit_entries(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<AuditEntry>, BackendError>;

    /// Inserts the request and its line items as one unit and allocates the PO number.
    async fn create_request(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
        request: NewRequest,
    ) -> Result<PurchaseRequest, BackendError>;

    async fn apply_action(
        &self,
        identity: &Identity,
        action: RequestAction,
    ) -> Result<PurchaseRequest, BackendError>;
}

//! HTTP adapter for the hosted backend: password auth, the permission function, org-scoped
//! row reads, the transactional create RPC and the request/membership edge functions.
//!
//! Every call carries the project's `apikey` header; calls made on behalf of a user add the
//! session's bearer token. Rows are decoded through the schema boundary, so a malformed row
//! fails the whole read with [`BackendError::Decode`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use fieldpo_core::audit::AuditEntry;
use fieldpo_core::backend::{
    AuthService, BackendError, Identity, MembershipService, PermissionResolver, RequestAction,
    RequestRepository, ResolvedAccess,
};
use fieldpo_core::config::BackendConfig;
use fieldpo_core::domain::profile::{Organization, OrganizationId, UserId, UserProfile};
use fieldpo_core::domain::project::{CostCode, Project};
use fieldpo_core::domain::request::{
    assemble_requests, LineItemRecord, PurchaseRequest, RequestHeader,
};
use fieldpo_core::errors::{ApplicationError, DomainError};
use fieldpo_core::lifecycle::NewRequest;
use fieldpo_core::schema::{
    AuditEntryRow, CostCodeRow, LineItemRow, PermissionsPayload, ProfileRow, ProjectRow,
    RequestRow,
};

const PERMISSIONS_FUNCTION: &str = "/functions/v1/get-my-permissions";
const MANAGE_REQUEST_FUNCTION: &str = "/functions/v1/manage-request";
const CLAIM_ACCESS_CODE_FUNCTION: &str = "/functions/v1/claim-access-code";
const LEAVE_ORGANIZATION_FUNCTION: &str = "/functions/v1/leave-organization";
const CREATE_REQUEST_RPC: &str = "/rest/v1/rpc/create_purchase_request";

pub struct RemoteBackend {
    client: Client,
    base_url: String,
    anon_key: SecretString,
}

impl RemoteBackend {
    pub fn new(
        base_url: impl Into<String>,
        anon_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| BackendError::Network(error.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_owned();

        Ok(Self { client, base_url, anon_key })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, ApplicationError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| ApplicationError::Configuration("backend.url is not set".to_owned()))?;

        Self::new(url, config.anon_key.clone(), Duration::from_secs(config.timeout_secs))
            .map_err(|error| ApplicationError::Configuration(error.to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn anonymous(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("apikey", self.anon_key.expose_secret())
    }

    fn authorized(&self, builder: RequestBuilder, identity: &Identity) -> RequestBuilder {
        self.anonymous(builder).bearer_auth(identity.bearer_token())
    }

    async fn select<T: DeserializeOwned>(
        &self,
        identity: &Identity,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, BackendError> {
        let builder = self.client.get(self.url(&format!("/rest/v1/{table}"))).query(query);
        let response = send(self.authorized(builder, identity), table).await?;
        decode(response).await
    }

    async fn call_function<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        identity: &Identity,
        path: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let builder = self.client.post(self.url(path)).json(body);
        let response = send(self.authorized(builder, identity), path).await?;
        decode(response).await
    }
}

fn organization_filter(organization_id: &OrganizationId) -> String {
    format!("eq.{organization_id}")
}

async fn send(builder: RequestBuilder, endpoint: &str) -> Result<Response, BackendError> {
    let response = builder.send().await.map_err(|error| {
        tracing::warn!(
            event_name = "backend.remote.unreachable",
            endpoint,
            error = %error,
            "backend request failed before a response"
        );
        BackendError::Network(error.to_string())
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(ErrorBody::into_message)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_owned());

    tracing::warn!(
        event_name = "backend.remote.rejected",
        endpoint,
        status = status.as_u16(),
        message = %message,
        "backend rejected request"
    );

    Err(match status {
        StatusCode::UNAUTHORIZED => BackendError::NotAuthenticated,
        StatusCode::CONFLICT => BackendError::Conflict(message),
        status => BackendError::Service { status: status.as_u16(), message },
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    response.json::<T>().await.map_err(|error| BackendError::Decode(error.to_string()))
}

fn malformed(error: DomainError) -> BackendError {
    BackendError::Decode(error.to_string())
}

fn convert_rows<R, T>(rows: Vec<R>) -> Result<Vec<T>, BackendError>
where
    T: TryFrom<R, Error = DomainError>,
{
    rows.into_iter().map(T::try_from).collect::<Result<Vec<_>, _>>().map_err(malformed)
}

/// Error bodies differ per service: edge functions send `error`, the row API sends `message`,
/// auth sends `msg` or `error_description`.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl ErrorBody {
    fn into_message(self) -> Option<String> {
        [self.error_description, self.message, self.msg, self.error]
            .into_iter()
            .flatten()
            .find(|message| !message.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AuthSession {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    user: Option<AuthUser>,
}

impl AuthSession {
    fn into_identity(self) -> Option<Identity> {
        match (self.access_token, self.user) {
            (Some(token), Some(user)) if !token.is_empty() => {
                Some(Identity::new(UserId(user.id), token))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RequestPayload {
    request: RequestRow,
    #[serde(default, alias = "lineItems")]
    line_items: Vec<LineItemRow>,
}

impl RequestPayload {
    fn into_request(self) -> Result<PurchaseRequest, BackendError> {
        let header = RequestHeader::try_from(self.request).map_err(malformed)?;
        let request_id = header.id.clone();
        let items: Vec<LineItemRecord> = convert_rows(self.line_items)?;

        assemble_requests(vec![header], items).pop().ok_or_else(|| {
            BackendError::Decode(format!("request `{request_id}` missing from response"))
        })
    }
}

#[derive(Debug, Deserialize)]
struct ClaimPayload {
    #[serde(default)]
    organization: Option<Organization>,
}

#[async_trait]
impl AuthService for RemoteBackend {
    async fn sign_in(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<Identity, BackendError> {
        let builder = self
            .client
            .post(self.url("/auth/v1/token"))
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email.trim(), "password": password.expose_secret() }));
        let response = send(self.anonymous(builder), "auth.token").await?;
        let session: AuthSession = decode(response).await?;

        session
            .into_identity()
            .ok_or_else(|| BackendError::Decode("sign-in response carried no session".to_owned()))
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &SecretString,
        full_name: &str,
    ) -> Result<Option<Identity>, BackendError> {
        let builder = self.client.post(self.url("/auth/v1/signup")).json(&json!({
            "email": email.trim(),
            "password": password.expose_secret(),
            "data": { "full_name": full_name.trim() },
        }));
        let response = send(self.anonymous(builder), "auth.signup").await?;
        let session: AuthSession = decode(response).await?;

        Ok(session.into_identity())
    }

    async fn sign_out(&self, identity: &Identity) -> Result<(), BackendError> {
        let builder = self.client.post(self.url("/auth/v1/logout"));
        send(self.authorized(builder, identity), "auth.logout").await?;
        Ok(())
    }

    async fn reset_password(&self, email: &str) -> Result<(), BackendError> {
        let builder =
            self.client.post(self.url("/auth/v1/recover")).json(&json!({ "email": email.trim() }));
        send(self.anonymous(builder), "auth.recover").await?;
        Ok(())
    }
}

#[async_trait]
impl PermissionResolver for RemoteBackend {
    async fn resolve(&self, identity: &Identity) -> Result<ResolvedAccess, BackendError> {
        let builder = self.client.get(self.url(PERMISSIONS_FUNCTION));
        let response = send(self.authorized(builder, identity), PERMISSIONS_FUNCTION).await?;
        let payload: PermissionsPayload = decode(response).await?;

        ResolvedAccess::try_from(payload).map_err(malformed)
    }
}

#[async_trait]
impl MembershipService for RemoteBackend {
    async fn claim_access_code(
        &self,
        identity: &Identity,
        code: &str,
    ) -> Result<Organization, BackendError> {
        let payload: ClaimPayload = self
            .call_function(identity, CLAIM_ACCESS_CODE_FUNCTION, &json!({ "code": code.trim() }))
            .await?;

        payload.organization.ok_or_else(|| {
            BackendError::Decode("claim response did not include an organization".to_owned())
        })
    }

    async fn leave_organization(&self, identity: &Identity) -> Result<(), BackendError> {
        let builder = self.client.post(self.url(LEAVE_ORGANIZATION_FUNCTION));
        send(self.authorized(builder, identity), LEAVE_ORGANIZATION_FUNCTION).await?;
        Ok(())
    }
}

#[async_trait]
impl RequestRepository for RemoteBackend {
    async fn list_projects(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<Project>, BackendError> {
        let rows: Vec<ProjectRow> = self
            .select(
                identity,
                "projects",
                &[
                    ("select", "*".to_owned()),
                    ("organization_id", organization_filter(organization_id)),
                    ("order", "name.asc".to_owned()),
                ],
            )
            .await?;
        convert_rows(rows)
    }

    async fn list_cost_codes(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<CostCode>, BackendError> {
        let rows: Vec<CostCodeRow> = self
            .select(
                identity,
                "cost_codes",
                &[
                    ("select", "*".to_owned()),
                    ("organization_id", organization_filter(organization_id)),
                    ("order", "code.asc".to_owned()),
                ],
            )
            .await?;
        convert_rows(rows)
    }

    async fn list_requests(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<RequestHeader>, BackendError> {
        let rows: Vec<RequestRow> = self
            .select(
                identity,
                "purchase_requests",
                &[
                    ("select", "*".to_owned()),
                    ("organization_id", organization_filter(organization_id)),
                    ("order", "created_at.desc".to_owned()),
                ],
            )
            .await?;
        convert_rows(rows)
    }

    async fn list_line_items(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<LineItemRecord>, BackendError> {
        let rows: Vec<LineItemRow> = self
            .select(
                identity,
                "line_items",
                &[
                    ("select", "*,purchase_requests!inner(organization_id)".to_owned()),
                    ("purchase_requests.organization_id", organization_filter(organization_id)),
                    ("order", "sort_order.asc".to_owned()),
                ],
            )
            .await?;
        convert_rows(rows)
    }

    async fn list_profiles(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<UserProfile>, BackendError> {
        let rows: Vec<ProfileRow> = self
            .select(
                identity,
                "profiles",
                &[
                    ("select", "*".to_owned()),
                    ("organization_id", organization_filter(organization_id)),
                ],
            )
            .await?;
        convert_rows(rows)
    }

    async fn list_audit_entries(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<AuditEntry>, BackendError> {
        let rows: Vec<AuditEntryRow> = self
            .select(
                identity,
                "audit_entries",
                &[
                    ("select", "*,purchase_requests!inner(organization_id)".to_owned()),
                    ("purchase_requests.organization_id", organization_filter(organization_id)),
                    ("order", "timestamp.desc".to_owned()),
                ],
            )
            .await?;
        convert_rows(rows)
    }

    async fn create_request(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
        request: NewRequest,
    ) -> Result<PurchaseRequest, BackendError> {
        let payload: RequestPayload = self
            .call_function(
                identity,
                CREATE_REQUEST_RPC,
                &json!({ "p_organization_id": organization_id, "p_request": request }),
            )
            .await?;
        payload.into_request()
    }

    async fn apply_action(
        &self,
        identity: &Identity,
        action: RequestAction,
    ) -> Result<PurchaseRequest, BackendError> {
        let payload: RequestPayload =
            self.call_function(identity, MANAGE_REQUEST_FUNCTION, &action).await?;
        payload.into_request()
    }
}

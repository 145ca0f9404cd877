use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use fieldpo_core::audit::{sort_for_display, AuditEntry};
use fieldpo_core::backend::{
    BackendError, Identity, MembershipService, PermissionResolver, RequestAction,
    RequestRepository, ResolvedAccess,
};
use fieldpo_core::config::DEFAULT_PO_SEED;
use fieldpo_core::domain::profile::{Organization, OrganizationId, UserId, UserProfile};
use fieldpo_core::domain::project::{CostCode, Project};
use fieldpo_core::domain::request::{
    LineItemRecord, PoNumber, PurchaseRequest, RequestHeader, RequestId,
};
use fieldpo_core::errors::DomainError;
use fieldpo_core::lifecycle::{LifecycleEngine, NewRequest, Submission};
use fieldpo_core::permissions::PermissionGrant;

use super::RepositoryError;

#[derive(Default)]
struct MemoryState {
    organizations: HashMap<OrganizationId, Organization>,
    profiles: HashMap<UserId, UserProfile>,
    grants: HashMap<UserId, PermissionGrant>,
    projects: HashMap<OrganizationId, Vec<Project>>,
    cost_codes: HashMap<OrganizationId, Vec<CostCode>>,
    requests: HashMap<RequestId, PurchaseRequest>,
    audit: Vec<AuditEntry>,
    access_codes: HashMap<String, AccessCodeGrant>,
    next_po: HashMap<OrganizationId, u64>,
}

#[derive(Clone)]
struct AccessCodeGrant {
    organization_id: OrganizationId,
    role_name: String,
    permissions: BTreeSet<String>,
}

impl MemoryState {
    fn member(&self, identity: &Identity) -> Result<(&UserProfile, PermissionGrant), BackendError> {
        let profile = self
            .profiles
            .get(&identity.user_id)
            .filter(|profile| !profile.disabled)
            .ok_or(BackendError::NotAuthenticated)?;
        let grant = self.grants.get(&identity.user_id).cloned().unwrap_or_default();
        Ok((profile, grant))
    }

    fn member_of(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<PermissionGrant, BackendError> {
        let (profile, grant) = self.member(identity)?;
        if profile.organization_id.as_ref() != Some(organization_id) {
            return Err(RepositoryError::not_member().into());
        }
        Ok(grant)
    }
}

/// Process-local backend holding every table in memory. Enforces the same membership,
/// capability and lifecycle rules as the SQLite repositories.
pub struct InMemoryBackend {
    state: RwLock<MemoryState>,
    engine: LifecycleEngine,
    po_seed: u64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            engine: LifecycleEngine::new(),
            po_seed: DEFAULT_PO_SEED,
        }
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_po_seed(mut self, po_seed: u64) -> Self {
        self.po_seed = po_seed.max(1);
        self
    }

    pub fn with_organization(mut self, organization: Organization) -> Self {
        self.state.get_mut().organizations.insert(organization.id.clone(), organization);
        self
    }

    pub fn with_member(mut self, profile: UserProfile, grant: PermissionGrant) -> Self {
        let state = self.state.get_mut();
        state.grants.insert(profile.id.clone(), grant);
        state.profiles.insert(profile.id.clone(), profile);
        self
    }

    pub fn with_project(mut self, organization_id: &OrganizationId, project: Project) -> Self {
        self.state.get_mut().projects.entry(organization_id.clone()).or_default().push(project);
        self
    }

    pub fn with_cost_code(mut self, organization_id: &OrganizationId, cost_code: CostCode) -> Self {
        self.state.get_mut().cost_codes.entry(organization_id.clone()).or_default().push(cost_code);
        self
    }

    pub fn with_request(mut self, request: PurchaseRequest) -> Self {
        let state = self.state.get_mut();
        let next = state.next_po.entry(request.header.organization_id.clone()).or_insert(self.po_seed);
        *next = (*next).max(request.header.po_number.0 + 1);
        state.requests.insert(request.id().clone(), request);
        self
    }

    /// Registers a code granting `role_name` with the given org-wide permission keys.
    pub fn with_access_code(
        mut self,
        code: &str,
        organization_id: &OrganizationId,
        role_name: &str,
        permissions: &[&str],
    ) -> Self {
        self.state.get_mut().access_codes.insert(
            code.trim().to_ascii_uppercase(),
            AccessCodeGrant {
                organization_id: organization_id.clone(),
                role_name: role_name.to_owned(),
                permissions: permissions.iter().map(|key| key.to_string()).collect(),
            },
        );
        self
    }

    pub async fn set_grant(&self, user_id: &UserId, grant: PermissionGrant) {
        self.state.write().await.grants.insert(user_id.clone(), grant);
    }

    pub async fn request(&self, request_id: &RequestId) -> Option<PurchaseRequest> {
        self.state.read().await.requests.get(request_id).cloned()
    }

    /// Every audit entry written so far, in write order.
    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.read().await.audit.clone()
    }
}

#[async_trait::async_trait]
impl RequestRepository for InMemoryBackend {
    async fn list_projects(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<Project>, BackendError> {
        let state = self.state.read().await;
        state.member_of(identity, organization_id)?;
        let mut projects = state.projects.get(organization_id).cloned().unwrap_or_default();
        projects.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(projects)
    }

    async fn list_cost_codes(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<CostCode>, BackendError> {
        let state = self.state.read().await;
        state.member_of(identity, organization_id)?;
        let mut cost_codes = state.cost_codes.get(organization_id).cloned().unwrap_or_default();
        cost_codes.sort_by(|left, right| left.code.cmp(&right.code));
        Ok(cost_codes)
    }

    async fn list_requests(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<RequestHeader>, BackendError> {
        let state = self.state.read().await;
        state.member_of(identity, organization_id)?;
        let mut headers: Vec<RequestHeader> = state
            .requests
            .values()
            .filter(|request| &request.header.organization_id == organization_id)
            .map(|request| request.header.clone())
            .collect();
        headers.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then(right.po_number.cmp(&left.po_number))
        });
        Ok(headers)
    }

    async fn list_line_items(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<LineItemRecord>, BackendError> {
        let state = self.state.read().await;
        state.member_of(identity, organization_id)?;
        Ok(state
            .requests
            .values()
            .filter(|request| &request.header.organization_id == organization_id)
            .flat_map(|request| {
                request.line_items.iter().enumerate().map(|(index, item)| LineItemRecord {
                    request_id: request.id().clone(),
                    sort_order: index as i64,
                    item: item.clone(),
                })
            })
            .collect())
    }

    async fn list_profiles(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<UserProfile>, BackendError> {
        let state = self.state.read().await;
        state.member_of(identity, organization_id)?;
        let mut profiles: Vec<UserProfile> = state
            .profiles
            .values()
            .filter(|profile| profile.organization_id.as_ref() == Some(organization_id))
            .cloned()
            .collect();
        profiles.sort_by(|left, right| left.full_name.cmp(&right.full_name));
        Ok(profiles)
    }

    async fn list_audit_entries(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Vec<AuditEntry>, BackendError> {
        let state = self.state.read().await;
        state.member_of(identity, organization_id)?;
        let mut entries: Vec<AuditEntry> = state
            .audit
            .iter()
            .rev()
            .filter(|entry| {
                state
                    .requests
                    .get(&entry.request_id)
                    .is_some_and(|request| &request.header.organization_id == organization_id)
            })
            .cloned()
            .collect();
        sort_for_display(&mut entries);
        Ok(entries)
    }

    async fn create_request(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
        request: NewRequest,
    ) -> Result<PurchaseRequest, BackendError> {
        let mut state = self.state.write().await;
        let grant = state.member_of(identity, organization_id)?;
        request.verify().map_err(DomainError::from)?;
        grant.require_project_access(&request.project_id)?;

        let known_project = state
            .projects
            .get(organization_id)
            .is_some_and(|projects| projects.iter().any(|project| project.id == request.project_id));
        if !known_project {
            return Err(BackendError::NotFound {
                entity: "project",
                id: request.project_id.0.clone(),
            });
        }

        let next = state.next_po.entry(organization_id.clone()).or_insert(self.po_seed);
        let po_number = PoNumber(*next);
        let submission = Submission {
            id: RequestId(Uuid::new_v4().to_string()),
            po_number,
            organization_id: organization_id.clone(),
            requester_id: identity.user_id.clone(),
            submitted_at: Utc::now(),
        };
        let (created, outcome) = self.engine.submit(request, submission, &grant)?;
        *next += 1;

        state.audit.push(outcome.audit_entry);
        state.requests.insert(created.id().clone(), created.clone());
        Ok(created)
    }

    async fn apply_action(
        &self,
        identity: &Identity,
        action: RequestAction,
    ) -> Result<PurchaseRequest, BackendError> {
        let mut state = self.state.write().await;
        let (profile, grant) = state.member(identity)?;
        let organization_id = profile.organization_id.clone();

        let mut request = state
            .requests
            .get(action.request_id())
            .filter(|request| Some(&request.header.organization_id) == organization_id.as_ref())
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                entity: "purchase_request",
                id: action.request_id().0.clone(),
            })?;

        let outcome =
            self.engine.apply(&mut request, &identity.user_id, &grant, &action, Utc::now())?;

        state.audit.push(outcome.audit_entry);
        state.requests.insert(request.id().clone(), request.clone());
        Ok(request)
    }
}

#[async_trait::async_trait]
impl PermissionResolver for InMemoryBackend {
    async fn resolve(&self, identity: &Identity) -> Result<ResolvedAccess, BackendError> {
        let state = self.state.read().await;
        let (profile, grant) = state.member(identity)?;
        let organization = profile
            .organization_id
            .as_ref()
            .and_then(|organization_id| state.organizations.get(organization_id))
            .cloned();

        Ok(ResolvedAccess {
            profile: Some(profile.clone()),
            onboarded: profile.onboarded,
            organization,
            grant,
        })
    }
}

#[async_trait::async_trait]
impl MembershipService for InMemoryBackend {
    async fn claim_access_code(
        &self,
        identity: &Identity,
        code: &str,
    ) -> Result<Organization, BackendError> {
        let mut state = self.state.write().await;
        let code = code.trim().to_ascii_uppercase();
        let access_code = state.access_codes.get(&code).cloned().ok_or_else(|| {
            BackendError::NotFound { entity: "access_code", id: code.clone() }
        })?;
        let organization =
            state.organizations.get(&access_code.organization_id).cloned().ok_or_else(|| {
                BackendError::NotFound {
                    entity: "organization",
                    id: access_code.organization_id.0.clone(),
                }
            })?;

        let current = state.member(identity)?.0.organization_id.clone();
        if current.as_ref().is_some_and(|current| current != &organization.id) {
            return Err(BackendError::Conflict(
                "already a member of another organization".to_owned(),
            ));
        }

        if let Some(profile) = state.profiles.get_mut(&identity.user_id) {
            profile.organization_id = Some(organization.id.clone());
            profile.onboarded = true;
        }
        let grant = state.grants.entry(identity.user_id.clone()).or_default();
        grant.organization_roles.insert(access_code.role_name);
        grant.organization_permissions.extend(access_code.permissions);

        Ok(organization)
    }

    async fn leave_organization(&self, identity: &Identity) -> Result<(), BackendError> {
        let mut state = self.state.write().await;
        if state.member(identity)?.0.organization_id.is_none() {
            return Err(BackendError::Conflict("not a member of any organization".to_owned()));
        }

        if let Some(profile) = state.profiles.get_mut(&identity.user_id) {
            profile.organization_id = None;
            profile.onboarded = false;
        }
        state.grants.insert(identity.user_id.clone(), PermissionGrant::default());
        Ok(())
    }
}

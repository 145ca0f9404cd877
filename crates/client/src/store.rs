use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::RwLock;

use fieldpo_core::audit::{derive_trail, sort_for_display, AuditEntry};
use fieldpo_core::backend::{BackendError, Identity, RequestAction, RequestRepository};
use fieldpo_core::domain::money::is_within_max_amount;
use fieldpo_core::domain::profile::{OrganizationId, UserId, UserProfile};
use fieldpo_core::domain::project::{CostCode, CostCodeId, Project, ProjectId};
use fieldpo_core::domain::request::{
    assemble_requests, PurchaseRequest, RequestId, RequestStatus,
};
use fieldpo_core::errors::{ApplicationError, DomainError};
use fieldpo_core::lifecycle::{
    LifecycleAction, LifecycleEngine, PurchaseInput, RequestDraft, ValidationError, Variance,
};
use fieldpo_core::permissions::PO_APPROVE;

use crate::session::SessionContext;

/// Everything one refresh reads for the caller's organization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub projects: Vec<Project>,
    pub cost_codes: Vec<CostCode>,
    /// Newest first, line items in sort order.
    pub requests: Vec<PurchaseRequest>,
    pub profiles: Vec<UserProfile>,
    /// The stored audit log, newest first.
    pub audit_entries: Vec<AuditEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied { generation: u64 },
    /// A refresh issued later had already been applied.
    Discarded { generation: u64, applied: u64 },
}

#[derive(Default)]
struct StoreState {
    applied_generation: u64,
    initialized: bool,
    snapshot: Snapshot,
    last_error: Option<String>,
}

/// Read-through cache of the organization's rows, rebuilt wholesale on every refresh.
///
/// Refreshes are numbered when issued. A result is applied only when no later-issued refresh
/// has been applied yet, so a slow response can never overwrite newer data. Mutations validate
/// locally, check the caller's capability, call the backend and then refresh unconditionally.
pub struct DataStore {
    repository: Arc<dyn RequestRepository>,
    session: Arc<SessionContext>,
    engine: LifecycleEngine,
    issued: AtomicU64,
    state: RwLock<StoreState>,
}

impl DataStore {
    pub fn new(repository: Arc<dyn RequestRepository>, session: Arc<SessionContext>) -> Self {
        Self {
            repository,
            session,
            engine: LifecycleEngine::new(),
            issued: AtomicU64::new(0),
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// Loads the cache once; later calls are no-ops.
    pub async fn initialize(&self) -> Result<(), ApplicationError> {
        if self.state.read().await.initialized {
            return Ok(());
        }
        self.refresh().await.map(|_| ())
    }

    pub async fn refresh(&self) -> Result<RefreshOutcome, ApplicationError> {
        let generation = self.issued.fetch_add(1, Ordering::SeqCst) + 1;

        let Some(identity) = self.session.identity().await else {
            return Ok(self.apply(generation, Snapshot::default()).await);
        };
        let Some(organization_id) = self.session.organization_id().await else {
            tracing::debug!(
                event_name = "store.refresh.no_organization",
                generation,
                user_id = %identity.user_id,
                "no organization, clearing cache"
            );
            return Ok(self.apply(generation, Snapshot::default()).await);
        };

        match self.load(&identity, &organization_id).await {
            Ok(snapshot) => Ok(self.apply(generation, snapshot).await),
            Err(error) => {
                let mut state = self.state.write().await;
                if generation > state.applied_generation {
                    state.last_error = Some(error.to_string());
                }
                tracing::warn!(
                    event_name = "store.refresh.failed",
                    generation,
                    organization_id = %organization_id,
                    error = %error,
                    "refresh failed"
                );
                Err(error.into())
            }
        }
    }

    async fn load(
        &self,
        identity: &Identity,
        organization_id: &OrganizationId,
    ) -> Result<Snapshot, BackendError> {
        let repository = &self.repository;
        let (projects, cost_codes, headers, line_items, profiles, audit_entries) = tokio::try_join!(
            repository.list_projects(identity, organization_id),
            repository.list_cost_codes(identity, organization_id),
            repository.list_requests(identity, organization_id),
            repository.list_line_items(identity, organization_id),
            repository.list_profiles(identity, organization_id),
            repository.list_audit_entries(identity, organization_id),
        )?;

        Ok(Snapshot {
            projects,
            cost_codes,
            requests: assemble_requests(headers, line_items),
            profiles,
            audit_entries,
        })
    }

    async fn apply(&self, generation: u64, snapshot: Snapshot) -> RefreshOutcome {
        let mut state = self.state.write().await;
        if generation <= state.applied_generation {
            tracing::debug!(
                event_name = "store.refresh.discarded",
                generation,
                applied = state.applied_generation,
                "stale refresh discarded"
            );
            return RefreshOutcome::Discarded { generation, applied: state.applied_generation };
        }

        tracing::debug!(
            event_name = "store.refresh.applied",
            generation,
            requests = snapshot.requests.len(),
            "refresh applied"
        );
        state.applied_generation = generation;
        state.initialized = true;
        state.snapshot = snapshot;
        state.last_error = None;
        RefreshOutcome::Applied { generation }
    }

    /// Drops cached rows, e.g. after the session ended. In-flight refreshes are discarded.
    pub async fn clear(&self) {
        let generation = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.write().await;
        *state = StoreState { applied_generation: generation, ..StoreState::default() };
    }

    pub async fn submit(&self, draft: &RequestDraft) -> Result<PurchaseRequest, ApplicationError> {
        let request = draft.validate().map_err(DomainError::from)?;
        let (identity, organization_id) = self.member().await?;

        if !self.engine.can_submit(&self.session.grant().await, &request.project_id) {
            return Err(DomainError::ProjectAccessDenied(request.project_id.clone()).into());
        }

        let created = self.repository.create_request(&identity, &organization_id, request).await?;
        tracing::info!(
            event_name = "store.request.submitted",
            request_id = %created.id(),
            po_number = %created.header.po_number,
            user_id = %identity.user_id,
            "purchase request submitted"
        );

        self.refresh_after_write().await;
        Ok(self.request(created.id()).await.unwrap_or(created))
    }

    pub async fn approve(&self, request_id: &RequestId) -> Result<PurchaseRequest, ApplicationError> {
        self.transition(RequestAction::Approve { request_id: request_id.clone() }).await
    }

    pub async fn reject(
        &self,
        request_id: &RequestId,
        reason: &str,
    ) -> Result<PurchaseRequest, ApplicationError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(DomainError::from(ValidationError::RejectionReasonRequired).into());
        }

        self.transition(RequestAction::Reject {
            request_id: request_id.clone(),
            reason: reason.to_owned(),
        })
        .await
    }

    pub async fn mark_purchased(
        &self,
        request_id: &RequestId,
        input: PurchaseInput,
    ) -> Result<PurchaseRequest, ApplicationError> {
        if let Some(total) = input.final_total {
            if total < Decimal::ZERO {
                return Err(DomainError::from(ValidationError::NegativeFinalTotal).into());
            }
            if !is_within_max_amount(total) {
                return Err(DomainError::from(ValidationError::AmountOutOfRange).into());
            }
        }

        self.transition(RequestAction::MarkPurchased {
            request_id: request_id.clone(),
            final_total: input.final_total,
            receipt_uri: input.receipt_uri,
            notes: input.notes,
        })
        .await
    }

    async fn transition(&self, action: RequestAction) -> Result<PurchaseRequest, ApplicationError> {
        let (identity, _) = self.member().await?;
        let request = self.request(action.request_id()).await.ok_or_else(|| {
            ApplicationError::Backend(BackendError::NotFound {
                entity: "purchase_request",
                id: action.request_id().to_string(),
            })
        })?;

        let lifecycle_action = action.lifecycle_action();
        self.engine.check(&request, lifecycle_action, &self.session.grant().await)?;

        let updated = self.repository.apply_action(&identity, action).await?;
        tracing::info!(
            event_name = "store.request.transitioned",
            request_id = %updated.id(),
            action = %lifecycle_action,
            status = %updated.status(),
            user_id = %identity.user_id,
            "purchase request transitioned"
        );

        self.refresh_after_write().await;
        Ok(self.request(updated.id()).await.unwrap_or(updated))
    }

    /// The write already succeeded; a failed refresh only leaves `last_error` behind.
    async fn refresh_after_write(&self) {
        if let Err(error) = self.refresh().await {
            tracing::warn!(
                event_name = "store.refresh.after_write_failed",
                error = %error,
                "cache refresh after write failed"
            );
        }
    }

    async fn member(&self) -> Result<(Identity, OrganizationId), ApplicationError> {
        let identity = self.session.identity().await.ok_or(ApplicationError::NotAuthenticated)?;
        let organization_id =
            self.session.organization_id().await.ok_or(ApplicationError::NoOrganization)?;
        Ok((identity, organization_id))
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.state.read().await.snapshot.clone()
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.initialized
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.read().await.last_error.clone()
    }

    pub async fn applied_generation(&self) -> u64 {
        self.state.read().await.applied_generation
    }

    pub async fn requests(&self) -> Vec<PurchaseRequest> {
        self.state.read().await.snapshot.requests.clone()
    }

    pub async fn request(&self, request_id: &RequestId) -> Option<PurchaseRequest> {
        let state = self.state.read().await;
        state.snapshot.requests.iter().find(|request| request.id() == request_id).cloned()
    }

    /// The signed-in user's own requests, newest first.
    pub async fn my_requests(&self) -> Vec<PurchaseRequest> {
        let Some(identity) = self.session.identity().await else {
            return Vec::new();
        };
        self.requests_where(|request| request.header.requester_id == identity.user_id).await
    }

    pub async fn requests_with_status(&self, status: RequestStatus) -> Vec<PurchaseRequest> {
        self.requests_where(|request| request.status() == status).await
    }

    /// Pending requests the caller may approve or reject.
    pub async fn awaiting_approval(&self) -> Vec<PurchaseRequest> {
        let grant = self.session.grant().await;
        self.requests_where(|request| {
            request.status() == RequestStatus::Pending
                && grant.can(PO_APPROVE, Some(request.project_id()))
        })
        .await
    }

    async fn requests_where(
        &self,
        predicate: impl Fn(&PurchaseRequest) -> bool,
    ) -> Vec<PurchaseRequest> {
        let state = self.state.read().await;
        let mut requests: Vec<_> =
            state.snapshot.requests.iter().filter(|request| predicate(request)).cloned().collect();
        requests.sort_by(|left, right| right.header.created_at.cmp(&left.header.created_at));
        requests
    }

    pub async fn projects(&self) -> Vec<Project> {
        self.state.read().await.snapshot.projects.clone()
    }

    pub async fn project(&self, project_id: &ProjectId) -> Option<Project> {
        let state = self.state.read().await;
        state.snapshot.projects.iter().find(|project| &project.id == project_id).cloned()
    }

    pub async fn cost_codes(&self) -> Vec<CostCode> {
        self.state.read().await.snapshot.cost_codes.clone()
    }

    pub async fn cost_code(&self, cost_code_id: &CostCodeId) -> Option<CostCode> {
        let state = self.state.read().await;
        state.snapshot.cost_codes.iter().find(|code| &code.id == cost_code_id).cloned()
    }

    pub async fn search_cost_codes(&self, query: &str) -> Vec<CostCode> {
        let state = self.state.read().await;
        state.snapshot.cost_codes.iter().filter(|code| code.matches(query)).cloned().collect()
    }

    pub async fn profiles(&self) -> Vec<UserProfile> {
        self.state.read().await.snapshot.profiles.clone()
    }

    pub async fn profile(&self, user_id: &UserId) -> Option<UserProfile> {
        let state = self.state.read().await;
        state.snapshot.profiles.iter().find(|profile| &profile.id == user_id).cloned()
    }

    /// Stored entries for the request, newest first. A request with nothing in the log gets
    /// the trail its stamps imply.
    pub async fn audit_trail(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<AuditEntry>, ApplicationError> {
        let state = self.state.read().await;
        let snapshot = &state.snapshot;
        let request = snapshot
            .requests
            .iter()
            .find(|request| request.id() == request_id)
            .ok_or_else(|| not_cached(request_id))?;

        let stored: Vec<AuditEntry> = snapshot
            .audit_entries
            .iter()
            .filter(|entry| &entry.request_id == request_id)
            .cloned()
            .collect();
        if stored.is_empty() {
            return Ok(derive_trail(request));
        }
        Ok(stored)
    }

    /// The stored log plus derived trails for requests that have no stored entries, newest
    /// first.
    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        let state = self.state.read().await;
        let snapshot = &state.snapshot;
        let logged: HashSet<&RequestId> =
            snapshot.audit_entries.iter().map(|entry| &entry.request_id).collect();

        let mut entries = snapshot.audit_entries.clone();
        entries.extend(
            snapshot
                .requests
                .iter()
                .filter(|request| !logged.contains(request.id()))
                .flat_map(derive_trail),
        );
        sort_for_display(&mut entries);
        entries
    }

    /// Transitions the caller could apply right now, given the request's status and their
    /// permissions on its project.
    pub async fn allowed_actions(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<LifecycleAction>, ApplicationError> {
        let request = self.request(request_id).await.ok_or_else(|| not_cached(request_id))?;
        Ok(self.engine.allowed_actions(&request, &self.session.grant().await))
    }

    pub async fn variance(&self, request_id: &RequestId) -> Option<Variance> {
        self.request(request_id).await.as_ref().and_then(Variance::of)
    }
}

fn not_cached(request_id: &RequestId) -> ApplicationError {
    ApplicationError::Backend(BackendError::NotFound {
        entity: "purchase_request",
        id: request_id.to_string(),
    })
}

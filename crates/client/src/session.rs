use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::RwLock;

use fieldpo_core::backend::{
    AuthService, Identity, MembershipService, PermissionResolver, ResolvedAccess,
};
use fieldpo_core::domain::profile::{Organization, OrganizationId, UserProfile};
use fieldpo_core::domain::project::ProjectId;
use fieldpo_core::errors::ApplicationError;
use fieldpo_core::permissions::PermissionGrant;

#[derive(Default)]
struct SessionState {
    identity: Option<Identity>,
    access: ResolvedAccess,
    permissions_stale: bool,
}

/// The signed-in identity and its resolved permissions. Started once per session and ended on
/// sign-out; permissions are refetched on start and after every membership change.
pub struct SessionContext {
    resolver: Arc<dyn PermissionResolver>,
    membership: Arc<dyn MembershipService>,
    auth: Option<Arc<dyn AuthService>>,
    state: RwLock<SessionState>,
}

impl SessionContext {
    pub fn new(
        resolver: Arc<dyn PermissionResolver>,
        membership: Arc<dyn MembershipService>,
    ) -> Self {
        Self { resolver, membership, auth: None, state: RwLock::new(SessionState::default()) }
    }

    /// Uses one backend for permissions and membership.
    pub fn for_backend<B>(backend: Arc<B>) -> Self
    where
        B: PermissionResolver + MembershipService + 'static,
    {
        Self::new(backend.clone(), backend)
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthService>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub async fn start(&self, identity: Identity) -> Result<ResolvedAccess, ApplicationError> {
        let user_id = identity.user_id.clone();
        {
            let mut state = self.state.write().await;
            *state = SessionState { identity: Some(identity), ..SessionState::default() };
        }

        tracing::info!(event_name = "session.started", user_id = %user_id, "session started");
        self.refresh_permissions().await
    }

    pub async fn end(&self) {
        let mut state = self.state.write().await;
        if let Some(identity) = state.identity.take() {
            tracing::info!(
                event_name = "session.ended",
                user_id = %identity.user_id,
                "session ended"
            );
        }
        *state = SessionState::default();
    }

    pub async fn sign_in(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<ResolvedAccess, ApplicationError> {
        let identity = self.auth()?.sign_in(email, password).await?;
        self.start(identity).await
    }

    /// Returns `None` when the account still has to be confirmed before it can sign in.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &SecretString,
        full_name: &str,
    ) -> Result<Option<ResolvedAccess>, ApplicationError> {
        match self.auth()?.sign_up(email, password, full_name).await? {
            Some(identity) => self.start(identity).await.map(Some),
            None => Ok(None),
        }
    }

    /// Sends a recovery link to `email`. Works without a signed-in session.
    pub async fn reset_password(&self, email: &str) -> Result<(), ApplicationError> {
        self.auth()?.reset_password(email).await?;
        tracing::info!(
            event_name = "session.auth.recovery_requested",
            "password recovery requested"
        );
        Ok(())
    }

    /// Local state is cleared even when the auth service fails to revoke the token.
    pub async fn sign_out(&self) -> Result<(), ApplicationError> {
        let identity = self.identity().await;
        let revoked = match (&self.auth, identity) {
            (Some(auth), Some(identity)) => auth.sign_out(&identity).await,
            _ => Ok(()),
        };

        self.end().await;
        revoked.map_err(ApplicationError::from)
    }

    /// A failed refresh keeps the last known permissions and flags them as stale.
    pub async fn refresh_permissions(&self) -> Result<ResolvedAccess, ApplicationError> {
        let identity = self.identity().await.ok_or(ApplicationError::NotAuthenticated)?;

        match self.resolver.resolve(&identity).await {
            Ok(access) => {
                let mut state = self.state.write().await;
                let still_current = state
                    .identity
                    .as_ref()
                    .is_some_and(|current| current.user_id == identity.user_id);
                if still_current {
                    state.access = access.clone();
                    state.permissions_stale = false;
                }

                tracing::debug!(
                    event_name = "session.permissions.refreshed",
                    user_id = %identity.user_id,
                    organization_id = ?access.organization.as_ref().map(|org| org.id.0.as_str()),
                    org_roles = access.grant.organization_roles.len(),
                    project_bindings = access.grant.project_bindings.len(),
                    applied = still_current,
                    "permissions refreshed"
                );
                Ok(access)
            }
            Err(error) => {
                self.state.write().await.permissions_stale = true;
                tracing::warn!(
                    event_name = "session.permissions.refresh_failed",
                    user_id = %identity.user_id,
                    error = %error,
                    "permission refresh failed, keeping last known permissions"
                );
                Err(error.into())
            }
        }
    }

    /// Joins the organization behind `code`. The claim itself succeeded when this returns a
    /// refresh error; `permissions_stale` is set in that case.
    pub async fn claim_access_code(&self, code: &str) -> Result<Organization, ApplicationError> {
        let identity = self.identity().await.ok_or(ApplicationError::NotAuthenticated)?;
        let organization = self.membership.claim_access_code(&identity, code).await?;

        tracing::info!(
            event_name = "session.membership.claimed",
            user_id = %identity.user_id,
            organization_id = %organization.id,
            "access code claimed"
        );

        self.refresh_permissions().await?;
        Ok(organization)
    }

    pub async fn leave_organization(&self) -> Result<(), ApplicationError> {
        let identity = self.identity().await.ok_or(ApplicationError::NotAuthenticated)?;
        self.membership.leave_organization(&identity).await?;

        {
            let mut state = self.state.write().await;
            let access = &mut state.access;
            if let Some(profile) = access.profile.as_mut() {
                profile.organization_id = None;
                profile.onboarded = false;
            }
            access.onboarded = false;
            access.organization = None;
            access.grant = PermissionGrant::default();
        }

        tracing::info!(
            event_name = "session.membership.left",
            user_id = %identity.user_id,
            "left organization"
        );

        self.refresh_permissions().await.map(|_| ())
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.state.read().await.identity.clone()
    }

    pub async fn is_signed_in(&self) -> bool {
        self.state.read().await.identity.is_some()
    }

    pub async fn access(&self) -> ResolvedAccess {
        self.state.read().await.access.clone()
    }

    pub async fn grant(&self) -> PermissionGrant {
        self.state.read().await.access.grant.clone()
    }

    pub async fn profile(&self) -> Option<UserProfile> {
        self.state.read().await.access.profile.clone()
    }

    pub async fn organization(&self) -> Option<Organization> {
        self.state.read().await.access.organization.clone()
    }

    pub async fn organization_id(&self) -> Option<OrganizationId> {
        self.state.read().await.access.organization.as_ref().map(|org| org.id.clone())
    }

    pub async fn is_onboarded(&self) -> bool {
        self.state.read().await.access.onboarded
    }

    pub async fn can(&self, permission_key: &str, project_id: Option<&ProjectId>) -> bool {
        self.state.read().await.access.grant.can(permission_key, project_id)
    }

    pub async fn has_org_role(&self, role_name: &str) -> bool {
        self.state.read().await.access.grant.has_org_role(role_name)
    }

    pub async fn permissions_stale(&self) -> bool {
        self.state.read().await.permissions_stale
    }

    fn auth(&self) -> Result<&Arc<dyn AuthService>, ApplicationError> {
        self.auth.as_ref().ok_or_else(|| {
            ApplicationError::Configuration("no auth service is configured".to_owned())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use secrecy::SecretString;

    use fieldpo_core::backend::{
        AuthService, BackendError, Identity, MembershipService, PermissionResolver,
        ResolvedAccess,
    };
    use fieldpo_core::domain::profile::{Organization, OrganizationId, UserId, UserProfile};
    use fieldpo_core::domain::project::ProjectId;
    use fieldpo_core::errors::ApplicationError;
    use fieldpo_core::permissions::{PermissionGrant, ProjectBinding, PO_APPROVE};
    use fieldpo_db::InMemoryBackend;

    use super::SessionContext;

    fn org() -> Organization {
        Organization {
            id: OrganizationId("org-even".to_owned()),
            name: "Even Construction".to_owned(),
            slug: "even-construction".to_owned(),
        }
    }

    fn profile(id: &str, organization: Option<&Organization>) -> UserProfile {
        UserProfile {
            id: UserId(id.to_owned()),
            organization_id: organization.map(|org| org.id.clone()),
            email: format!("{id}@evenconstruction.com"),
            full_name: String::new(),
            avatar_url: None,
            onboarded: organization.is_some(),
            disabled: false,
        }
    }

    fn foreman_on_p2() -> PermissionGrant {
        PermissionGrant {
            organization_roles: BTreeSet::new(),
            organization_permissions: BTreeSet::new(),
            project_bindings: vec![ProjectBinding {
                project_id: ProjectId("p2".to_owned()),
                role_names: ["foreman".to_owned()].into_iter().collect(),
                permissions: [PO_APPROVE.to_owned()].into_iter().collect(),
            }],
        }
    }

    fn backend() -> Arc<InMemoryBackend> {
        let org = org();
        Arc::new(
            InMemoryBackend::new()
                .with_organization(org.clone())
                .with_member(profile("u2", Some(&org)), foreman_on_p2())
                .with_member(profile("u6", None), PermissionGrant::default())
                .with_access_code(
                    "EVEN-CREW-2026",
                    &org.id,
                    "field_worker",
                    &["po.create"],
                ),
        )
    }

    fn identity(user_id: &str) -> Identity {
        Identity::new(UserId(user_id.to_owned()), format!("token-{user_id}"))
    }

    /// Resolves once, then fails every call while `failing` is set.
    struct FlakyResolver {
        inner: Arc<InMemoryBackend>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl PermissionResolver for FlakyResolver {
        async fn resolve(&self, identity: &Identity) -> Result<ResolvedAccess, BackendError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(BackendError::Network("connection reset".to_owned()));
            }
            self.inner.resolve(identity).await
        }
    }

    struct RecordingAuth {
        signed_out: AtomicBool,
    }

    #[async_trait]
    impl AuthService for RecordingAuth {
        async fn sign_in(
            &self,
            email: &str,
            _password: &SecretString,
        ) -> Result<Identity, BackendError> {
            match email {
                "jake@evenconstruction.com" => Ok(identity("u2")),
                _ => Err(BackendError::Service {
                    status: 400,
                    message: "Invalid login credentials".to_owned(),
                }),
            }
        }

        async fn sign_up(
            &self,
            _email: &str,
            _password: &SecretString,
            _full_name: &str,
        ) -> Result<Option<Identity>, BackendError> {
            Ok(None)
        }

        async fn sign_out(&self, _identity: &Identity) -> Result<(), BackendError> {
            self.signed_out.store(true, Ordering::SeqCst);
            Err(BackendError::Network("offline".to_owned()))
        }

        async fn reset_password(&self, email: &str) -> Result<(), BackendError> {
            if email.contains('@') {
                Ok(())
            } else {
                Err(BackendError::Service {
                    status: 422,
                    message: "Unable to validate email address".to_owned(),
                })
            }
        }
    }

    #[tokio::test]
    async fn start_resolves_permissions_for_can_checks() {
        let session = SessionContext::for_backend(backend());
        session.start(identity("u2")).await.expect("start");

        assert!(session.can(PO_APPROVE, Some(&ProjectId("p2".to_owned()))).await);
        assert!(!session.can(PO_APPROVE, Some(&ProjectId("p1".to_owned()))).await);
        assert!(session.can(PO_APPROVE, None).await);
        assert!(!session.has_org_role("manager").await);
        assert_eq!(session.organization_id().await, Some(org().id));
    }

    #[tokio::test]
    async fn end_clears_every_piece_of_state() {
        let session = SessionContext::for_backend(backend());
        session.start(identity("u2")).await.expect("start");

        session.end().await;

        assert!(!session.is_signed_in().await);
        assert_eq!(session.access().await, ResolvedAccess::default());
        assert!(!session.can(PO_APPROVE, None).await);
        assert!(matches!(
            session.refresh_permissions().await,
            Err(ApplicationError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn claim_joins_the_organization_and_refreshes() {
        let session = SessionContext::for_backend(backend());
        session.start(identity("u6")).await.expect("start");
        assert!(session.organization().await.is_none());

        let organization =
            session.claim_access_code(" even-crew-2026 ").await.expect("claim access code");

        assert_eq!(organization.id, org().id);
        assert_eq!(session.organization_id().await, Some(org().id));
        assert!(session.is_onboarded().await);
        assert!(session.has_org_role("field_worker").await);
    }

    #[tokio::test]
    async fn leave_resets_membership_locally() {
        let session = SessionContext::for_backend(backend());
        session.start(identity("u2")).await.expect("start");

        session.leave_organization().await.expect("leave");

        assert!(session.organization().await.is_none());
        assert!(!session.is_onboarded().await);
        assert!(!session.can(PO_APPROVE, None).await);
        let profile = session.profile().await.expect("profile survives leaving");
        assert_eq!(profile.organization_id, None);
    }

    #[tokio::test]
    async fn failed_refresh_after_claim_surfaces_error_and_marks_stale() {
        let inner = backend();
        let resolver =
            Arc::new(FlakyResolver { inner: inner.clone(), failing: AtomicBool::new(false) });
        let session = SessionContext::new(resolver.clone(), inner.clone());
        session.start(identity("u6")).await.expect("start");

        resolver.failing.store(true, Ordering::SeqCst);
        let error = session
            .claim_access_code("EVEN-CREW-2026")
            .await
            .expect_err("refresh failure must surface");

        assert!(matches!(error, ApplicationError::Backend(BackendError::Network(_))));
        assert!(session.permissions_stale().await);
        assert!(session.organization().await.is_none(), "last known permissions are kept");

        resolver.failing.store(false, Ordering::SeqCst);
        session.refresh_permissions().await.expect("refresh recovers");
        assert!(!session.permissions_stale().await);
        assert_eq!(session.organization_id().await, Some(org().id));
    }

    #[tokio::test]
    async fn sign_in_starts_and_sign_out_always_clears() {
        let auth = Arc::new(RecordingAuth { signed_out: AtomicBool::new(false) });
        let session = SessionContext::for_backend(backend()).with_auth(auth.clone());
        let password = SecretString::from("hunter22".to_owned());

        let rejected = session.sign_in("nobody@example.com", &password).await;
        assert!(matches!(rejected, Err(ApplicationError::Backend(BackendError::Service { .. }))));
        assert!(!session.is_signed_in().await);

        session.sign_in("jake@evenconstruction.com", &password).await.expect("sign in");
        assert!(session.can(PO_APPROVE, None).await);

        let unconfirmed =
            session.sign_up("new@example.com", &password, "New Hire").await.expect("sign up");
        assert!(unconfirmed.is_none());

        let signed_out = session.sign_out().await;
        assert!(signed_out.is_err());
        assert!(auth.signed_out.load(Ordering::SeqCst));
        assert!(!session.is_signed_in().await);
        assert!(!session.can(PO_APPROVE, None).await);
    }

    #[tokio::test]
    async fn password_recovery_needs_no_session() {
        let auth = Arc::new(RecordingAuth { signed_out: AtomicBool::new(false) });
        let session = SessionContext::for_backend(backend()).with_auth(auth);

        session.reset_password("jake@evenconstruction.com").await.expect("recovery sent");
        assert!(!session.is_signed_in().await);

        let invalid = session.reset_password("jake").await;
        assert!(matches!(invalid, Err(ApplicationError::Backend(BackendError::Service { .. }))));

        let unconfigured = SessionContext::for_backend(backend());
        let result = unconfigured.reset_password("jake@evenconstruction.com").await;
        assert!(matches!(result, Err(ApplicationError::Configuration(_))));
    }

    #[tokio::test]
    async fn sign_in_without_auth_service_is_a_configuration_error() {
        let session = SessionContext::for_backend(backend());
        let result =
            session.sign_in("jake@evenconstruction.com", &SecretString::from("x".to_owned())).await;
        assert!(matches!(result, Err(ApplicationError::Configuration(_))));
    }
}

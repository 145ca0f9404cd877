use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use fieldpo_core::backend::{
    BackendError, Identity, MembershipService, PermissionResolver, ResolvedAccess,
};
use fieldpo_core::domain::profile::{Organization, OrganizationId, UserId, UserProfile};
use fieldpo_core::domain::project::ProjectId;
use fieldpo_core::permissions::{PermissionGrant, ProjectBinding};
use fieldpo_core::schema::{parse_timestamp, ProfileRow};

use super::RepositoryError;
use crate::DbPool;

/// A user's profile together with the organization it belongs to and the capabilities it holds
/// there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberAccess {
    pub profile: UserProfile,
    pub organization: Option<Organization>,
    pub grant: PermissionGrant,
}

impl MemberAccess {
    pub fn organization_id(&self) -> Option<&OrganizationId> {
        self.profile.organization_id.as_ref()
    }

    pub fn require_member_of(&self, organization_id: &OrganizationId) -> Result<(), RepositoryError> {
        if self.organization_id() == Some(organization_id) {
            Ok(())
        } else {
            Err(RepositoryError::not_member())
        }
    }
}

impl From<MemberAccess> for ResolvedAccess {
    fn from(access: MemberAccess) -> Self {
        ResolvedAccess {
            onboarded: access.profile.onboarded,
            profile: Some(access.profile),
            organization: access.organization,
            grant: access.grant,
        }
    }
}

pub struct SqlAccessRepository {
    pool: DbPool,
}

impl SqlAccessRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn member_access(&self, user_id: &UserId) -> Result<MemberAccess, RepositoryError> {
        load_member(&self.pool, user_id).await
    }

    /// Joins the code's organization with the code's role. A user already in another
    /// organization must leave it first.
    pub async fn claim(
        &self,
        user_id: &UserId,
        code: &str,
    ) -> Result<Organization, RepositoryError> {
        let code = code.trim().to_ascii_uppercase();
        if code.is_empty() {
            return Err(RepositoryError::NotFound { entity: "access_code", id: code });
        }

        let mut tx = self.pool.begin().await?;

        let access_code = sqlx::query(
            "SELECT organization_id, role_name, max_uses, use_count, expires_at
             FROM access_codes WHERE code = ?",
        )
        .bind(&code)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound { entity: "access_code", id: code.clone() })?;

        let organization_id = OrganizationId(access_code.try_get("organization_id")?);
        let role_name: String = access_code.try_get("role_name")?;
        let max_uses: Option<i64> = access_code.try_get("max_uses")?;
        let use_count: i64 = access_code.try_get("use_count")?;
        let expires_at: Option<String> = access_code.try_get("expires_at")?;

        if let Some(expires_at) = expires_at.as_deref() {
            if parse_timestamp("access_code", "expires_at", expires_at)? <= Utc::now() {
                return Err(RepositoryError::Conflict(format!("access code `{code}` has expired")));
            }
        }
        if max_uses.is_some_and(|max_uses| use_count >= max_uses) {
            return Err(RepositoryError::Conflict(format!(
                "access code `{code}` has no uses left"
            )));
        }

        let current: Option<Option<String>> =
            sqlx::query_scalar("SELECT organization_id FROM profiles WHERE id = ? AND disabled = 0")
                .bind(&user_id.0)
                .fetch_optional(&mut *tx)
                .await?;
        match current {
            None => return Err(RepositoryError::NotAuthenticated(user_id.0.clone())),
            Some(Some(existing)) if existing != organization_id.0 => {
                return Err(RepositoryError::Conflict(
                    "already a member of another organization".to_owned(),
                ));
            }
            Some(_) => {}
        }

        sqlx::query("UPDATE profiles SET organization_id = ?, onboarded = 1 WHERE id = ?")
            .bind(&organization_id.0)
            .bind(&user_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO organization_roles (organization_id, user_id, role_name) VALUES (?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(&organization_id.0)
        .bind(&user_id.0)
        .bind(&role_name)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE access_codes SET use_count = use_count + 1 WHERE code = ?")
            .bind(&code)
            .execute(&mut *tx)
            .await?;

        let organization = sqlx::query("SELECT id, name, slug FROM organizations WHERE id = ?")
            .bind(&organization_id.0)
            .fetch_one(&mut *tx)
            .await
            .map_err(RepositoryError::from)
            .and_then(|row| row_to_organization(&row))?;

        tx.commit().await?;

        tracing::info!(
            event_name = "membership.access_code.claimed",
            user_id = %user_id,
            organization_id = %organization.id,
            role_name = %role_name,
            "access code claimed"
        );
        Ok(organization)
    }

    /// Drops every role and binding the user holds in their organization and detaches the
    /// profile from it.
    pub async fn leave(&self, user_id: &UserId) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let organization_id: Option<String> =
            sqlx::query_scalar("SELECT organization_id FROM profiles WHERE id = ? AND disabled = 0")
                .bind(&user_id.0)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| RepositoryError::NotAuthenticated(user_id.0.clone()))?;
        let organization_id = organization_id.ok_or_else(|| {
            RepositoryError::Conflict("not a member of any organization".to_owned())
        })?;

        sqlx::query("DELETE FROM organization_roles WHERE organization_id = ? AND user_id = ?")
            .bind(&organization_id)
            .bind(&user_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM project_role_bindings
             WHERE user_id = ?
               AND project_id IN (SELECT id FROM projects WHERE organization_id = ?)",
        )
        .bind(&user_id.0)
        .bind(&organization_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE profiles SET organization_id = NULL, onboarded = 0 WHERE id = ?")
            .bind(&user_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            event_name = "membership.organization.left",
            user_id = %user_id,
            organization_id = %organization_id,
            "left organization"
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl PermissionResolver for SqlAccessRepository {
    async fn resolve(&self, identity: &Identity) -> Result<ResolvedAccess, BackendError> {
        Ok(self.member_access(&identity.user_id).await?.into())
    }
}

#[async_trait::async_trait]
impl MembershipService for SqlAccessRepository {
    async fn claim_access_code(
        &self,
        identity: &Identity,
        code: &str,
    ) -> Result<Organization, BackendError> {
        Ok(self.claim(&identity.user_id, code).await?)
    }

    async fn leave_organization(&self, identity: &Identity) -> Result<(), BackendError> {
        Ok(self.leave(&identity.user_id).await?)
    }
}

/// Loads the profile, organization and grant of an enabled user. Unknown and disabled users
/// are treated as unauthenticated.
pub(crate) async fn load_member(
    pool: &DbPool,
    user_id: &UserId,
) -> Result<MemberAccess, RepositoryError> {
    let profile = sqlx::query(
        "SELECT id, organization_id, email, full_name, avatar_url, onboarded, disabled
         FROM profiles WHERE id = ?",
    )
    .bind(&user_id.0)
    .fetch_optional(pool)
    .await?
    .map(|row| row_to_profile(&row))
    .transpose()?
    .filter(|profile| !profile.disabled)
    .ok_or_else(|| RepositoryError::NotAuthenticated(user_id.0.clone()))?;

    let Some(organization_id) = profile.organization_id.clone() else {
        return Ok(MemberAccess { profile, organization: None, grant: PermissionGrant::default() });
    };

    let organization = sqlx::query("SELECT id, name, slug FROM organizations WHERE id = ?")
        .bind(&organization_id.0)
        .fetch_optional(pool)
        .await?
        .map(|row| row_to_organization(&row))
        .transpose()?;

    let grant = load_grant(pool, user_id, &organization_id).await?;
    Ok(MemberAccess { profile, organization, grant })
}

async fn load_grant(
    pool: &DbPool,
    user_id: &UserId,
    organization_id: &OrganizationId,
) -> Result<PermissionGrant, RepositoryError> {
    let organization_roles: BTreeSet<String> = sqlx::query_scalar(
        "SELECT role_name FROM organization_roles WHERE organization_id = ? AND user_id = ?",
    )
    .bind(&organization_id.0)
    .bind(&user_id.0)
    .fetch_all(pool)
    .await?
    .into_iter()
    .collect();

    let organization_permissions: BTreeSet<String> = sqlx::query_scalar(
        "SELECT DISTINCT rp.permission_key
         FROM organization_roles o
         JOIN role_permissions rp ON rp.role_name = o.role_name
         WHERE o.organization_id = ? AND o.user_id = ?",
    )
    .bind(&organization_id.0)
    .bind(&user_id.0)
    .fetch_all(pool)
    .await?
    .into_iter()
    .collect();

    let rows = sqlx::query(
        "SELECT b.project_id, b.role_name, rp.permission_key
         FROM project_role_bindings b
         JOIN projects p ON p.id = b.project_id
         LEFT JOIN role_permissions rp ON rp.role_name = b.role_name
         WHERE b.user_id = ? AND p.organization_id = ?
         ORDER BY b.project_id",
    )
    .bind(&user_id.0)
    .bind(&organization_id.0)
    .fetch_all(pool)
    .await?;

    let mut bindings: BTreeMap<String, ProjectBinding> = BTreeMap::new();
    for row in rows {
        let project_id: String = row.try_get("project_id")?;
        let role_name: String = row.try_get("role_name")?;
        let permission_key: Option<String> = row.try_get("permission_key")?;

        let binding = bindings.entry(project_id.clone()).or_insert_with(|| ProjectBinding {
            project_id: ProjectId(project_id),
            role_names: BTreeSet::new(),
            permissions: BTreeSet::new(),
        });
        binding.role_names.insert(role_name);
        if let Some(permission_key) = permission_key {
            binding.permissions.insert(permission_key);
        }
    }

    Ok(PermissionGrant {
        organization_roles,
        organization_permissions,
        project_bindings: bindings.into_values().collect(),
    })
}

pub(crate) fn row_to_profile(row: &SqliteRow) -> Result<UserProfile, RepositoryError> {
    let profile = ProfileRow {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        full_name: row.try_get("full_name")?,
        avatar_url: row.try_get("avatar_url")?,
        organization_id: row.try_get("organization_id")?,
        onboarded: row.try_get("onboarded")?,
        disabled: row.try_get("disabled")?,
    };
    Ok(UserProfile::try_from(profile)?)
}

fn row_to_organization(row: &SqliteRow) -> Result<Organization, RepositoryError> {
    Ok(Organization {
        id: OrganizationId(row.try_get("id")?),
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
    })
}

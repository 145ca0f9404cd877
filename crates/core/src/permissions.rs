use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::project::ProjectId;
use crate::errors::DomainError;

pub const PO_APPROVE: &str = "po.approve";
pub const PO_MARK_ORDERED: &str = "po.mark_ordered";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectBinding {
    pub project_id: ProjectId,
    pub role_names: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
}

/// Resolved capabilities of one identity: org-wide roles and permission keys plus
/// per-project bindings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub organization_roles: BTreeSet<String>,
    pub organization_permissions: BTreeSet<String>,
    pub project_bindings: Vec<ProjectBinding>,
}

impl PermissionGrant {
    pub fn binding(&self, project_id: &ProjectId) -> Option<&ProjectBinding> {
        self.project_bindings.iter().find(|binding| &binding.project_id == project_id)
    }

    /// Without a project this answers "can I do this anywhere", which is what global
    /// affordances such as a new-request button need.
    pub fn can(&self, permission_key: &str, project_id: Option<&ProjectId>) -> bool {
        if self.organization_permissions.contains(permission_key) {
            return true;
        }

        match project_id {
            Some(project_id) => self
                .binding(project_id)
                .is_some_and(|binding| binding.permissions.contains(permission_key)),
            None => self
                .project_bindings
                .iter()
                .any(|binding| binding.permissions.contains(permission_key)),
        }
    }

    pub fn has_org_role(&self, role_name: &str) -> bool {
        self.organization_roles.contains(role_name)
    }

    /// Org-wide members reach every project; everyone else needs a binding.
    pub fn has_project_access(&self, project_id: &ProjectId) -> bool {
        !self.organization_roles.is_empty()
            || !self.organization_permissions.is_empty()
            || self.binding(project_id).is_some()
    }

    pub fn require(&self, permission_key: &str, project_id: &ProjectId) -> Result<(), DomainError> {
        if self.can(permission_key, Some(project_id)) {
            return Ok(());
        }

        Err(DomainError::Unauthorized {
            permission: permission_key.to_owned(),
            project_id: Some(project_id.clone()),
        })
    }

    pub fn require_project_access(&self, project_id: &ProjectId) -> Result<(), DomainError> {
        if self.has_project_access(project_id) {
            return Ok(());
        }

        Err(DomainError::ProjectAccessDenied(project_id.clone()))
    }
}

use std::collections::BTreeSet;

use clap::Args;
use serde::Serialize;

use fieldpo_core::domain::profile::Organization;
use fieldpo_core::domain::project::ProjectId;
use fieldpo_core::permissions::PermissionGrant;

use crate::commands::context::{ActingAs, MemberSession};
use crate::commands::{execute, CommandFailure, CommandOutput, CommandResult};

#[derive(Debug, Clone, Args)]
pub struct CanArgs {
    #[command(flatten)]
    pub acting_as: ActingAs,
    /// Permission key, e.g. `po.approve`
    pub permission: String,
    /// Ask about one project instead of "anywhere in the organization"
    #[arg(long)]
    pub project: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ClaimArgs {
    #[command(flatten)]
    pub acting_as: ActingAs,
    pub code: String,
}

#[derive(Debug, Serialize)]
struct CapabilityAnswer {
    permission: String,
    project_id: Option<ProjectId>,
    allowed: bool,
}

#[derive(Debug, Serialize)]
struct WhoAmI {
    user_id: String,
    display_name: Option<String>,
    onboarded: bool,
    organization: Option<Organization>,
    organization_roles: BTreeSet<String>,
    organization_permissions: BTreeSet<String>,
    projects: Vec<ProjectAccess>,
}

#[derive(Debug, Serialize)]
struct ProjectAccess {
    project_id: ProjectId,
    roles: BTreeSet<String>,
    permissions: BTreeSet<String>,
}

fn project_access(grant: &PermissionGrant) -> Vec<ProjectAccess> {
    grant
        .project_bindings
        .iter()
        .map(|binding| ProjectAccess {
            project_id: binding.project_id.clone(),
            roles: binding.role_names.clone(),
            permissions: binding.permissions.clone(),
        })
        .collect()
}

pub fn whoami(acting_as: ActingAs) -> CommandResult {
    execute("whoami", |config| async move {
        let member = MemberSession::open(&config, &acting_as).await?;
        let access = member.session.access().await;
        member.close().await;

        let display_name = access.profile.as_ref().map(|profile| profile.display_name().to_owned());
        let message = match (&display_name, &access.organization) {
            (Some(name), Some(organization)) => format!("{name} in {}", organization.name),
            (Some(name), None) => format!("{name} without an organization"),
            (None, _) => format!("{} has no profile", acting_as.user_id),
        };

        CommandOutput::with_data(
            message,
            WhoAmI {
                user_id: acting_as.user_id.clone(),
                display_name,
                onboarded: access.onboarded,
                projects: project_access(&access.grant),
                organization: access.organization,
                organization_roles: access.grant.organization_roles,
                organization_permissions: access.grant.organization_permissions,
            },
        )
    })
}

pub fn can(args: CanArgs) -> CommandResult {
    execute("can", |config| async move {
        let member = MemberSession::open(&config, &args.acting_as).await?;
        let project_id = args.project.as_deref().map(|project| ProjectId(project.trim().to_owned()));
        let allowed = member.session.can(&args.permission, project_id.as_ref()).await;
        member.close().await;

        let scope = match &project_id {
            Some(project_id) => format!("on {project_id}"),
            None => "anywhere".to_owned(),
        };
        let verdict = if allowed { "may" } else { "may not" };
        CommandOutput::with_data(
            format!("{} {verdict} use {} {scope}", args.acting_as.user_id, args.permission),
            CapabilityAnswer { permission: args.permission.clone(), project_id, allowed },
        )
    })
}

pub fn claim_code(args: ClaimArgs) -> CommandResult {
    execute("claim-code", |config| async move {
        let member = MemberSession::open(&config, &args.acting_as).await?;

        let outcome = async {
            let organization = member.session.claim_access_code(&args.code).await?;
            member.store.refresh().await?;
            Ok::<_, CommandFailure>(organization)
        }
        .await;
        member.close().await;

        let organization = outcome?;
        CommandOutput::with_data(format!("joined {}", organization.name), organization)
    })
}

pub fn leave_org(acting_as: ActingAs) -> CommandResult {
    execute("leave-org", |config| async move {
        let member = MemberSession::open(&config, &acting_as).await?;
        let left = member.session.leave_organization().await;
        if left.is_ok() {
            member.store.clear().await;
        }
        member.close().await;

        left?;
        Ok(CommandOutput::message(format!("{} left their organization", acting_as.user_id)))
    })
}

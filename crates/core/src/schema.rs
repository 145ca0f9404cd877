//! Untyped storage rows and their conversion into domain entities.
//!
//! Rows mirror the column layout of the hosted tables and the local SQLite schema. Every
//! conversion is fallible: unknown enum values, unparseable timestamps and stamp combinations
//! the lifecycle cannot produce are rejected as [`DomainError::MalformedRow`] instead of being
//! coerced into defaults.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEntry};
use crate::backend::ResolvedAccess;
use crate::domain::profile::{Organization, OrganizationId, UserId, UserProfile};
use crate::domain::project::{CostCode, CostCodeId, Project, ProjectId};
use crate::domain::request::{
    Approval, LineItem, LineItemId, LineItemRecord, Purchase, Rejection, RequestHeader, RequestId,
    RequestState,
};
use crate::errors::DomainError;
use crate::permissions::{PermissionGrant, ProjectBinding};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRow {
    pub id: String,
    pub po_number: String,
    pub organization_id: String,
    pub project_id: String,
    pub requester_id: String,
    pub vendor: String,
    pub category: String,
    pub cost_code_id: String,
    pub estimated_total: Decimal,
    #[serde(default)]
    pub final_total: Option<Decimal>,
    pub need_by: String,
    pub urgency: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<String>>,
    #[serde(default)]
    pub receipt_attachments: Option<Vec<String>>,
    pub delivery_method: String,
    #[serde(default)]
    pub delivery_address: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub approved_at: Option<String>,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub rejected_at: Option<String>,
    #[serde(default)]
    pub rejected_by: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub purchased_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemRow {
    pub id: String,
    pub purchase_request_id: String,
    pub name: String,
    pub quantity: Decimal,
    pub unit: String,
    pub estimated_unit_cost: Decimal,
    #[serde(default)]
    pub sort_order: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntryRow {
    pub id: String,
    pub purchase_request_id: String,
    pub action: String,
    pub user_id: String,
    pub timestamp: String,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    pub job_number: String,
    #[serde(default)]
    pub address: Option<String>,
    pub monthly_budget: Decimal,
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostCodeRow {
    pub id: String,
    pub code: String,
    pub label: String,
    pub category: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRow {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub onboarded: bool,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingPayload {
    pub project_id: String,
    #[serde(default)]
    pub role_names: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Body of the permission endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsPayload {
    #[serde(default)]
    pub profile: Option<ProfileRow>,
    #[serde(default)]
    pub onboarded: bool,
    #[serde(default)]
    pub organization: Option<Organization>,
    #[serde(default)]
    pub org_roles: Vec<String>,
    #[serde(default)]
    pub org_permissions: Vec<String>,
    #[serde(default)]
    pub project_bindings: Vec<BindingPayload>,
}

pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Strict RFC 3339 parse; any offset is normalised to UTC.
pub fn parse_timestamp(
    entity: &'static str,
    column: &str,
    value: &str,
) -> Result<DateTime<Utc>, DomainError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| malformed(entity, format!("{column} `{value}` is not RFC 3339: {error}")))
}

fn parse_optional_timestamp(
    entity: &'static str,
    column: &str,
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>, DomainError> {
    match non_empty(value) {
        Some(value) => parse_timestamp(entity, column, value).map(Some),
        None => Ok(None),
    }
}

fn parse_enum<T>(entity: &'static str, column: &str, value: &str) -> Result<T, DomainError>
where
    T: FromStr<Err = DomainError>,
{
    value.parse().map_err(|error: DomainError| malformed(entity, format!("{column}: {error}")))
}

fn require_text(entity: &'static str, column: &str, value: &str) -> Result<String, DomainError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(malformed(entity, format!("{column} is empty")));
    }
    Ok(trimmed.to_owned())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn malformed(entity: &'static str, reason: impl Into<String>) -> DomainError {
    DomainError::MalformedRow { entity, reason: reason.into() }
}

impl TryFrom<RequestRow> for RequestHeader {
    type Error = DomainError;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        const ENTITY: &str = "purchase_request";

        let id = require_text(ENTITY, "id", &row.id)?;
        let status = parse_enum(ENTITY, "status", &row.status)?;

        let approval = match (
            parse_optional_timestamp(ENTITY, "approved_at", row.approved_at.as_deref())?,
            non_empty(row.approved_by.as_deref()),
        ) {
            (Some(approved_at), Some(approved_by)) => {
                Some(Approval { approved_at, approved_by: UserId(approved_by.to_owned()) })
            }
            (None, None) => None,
            _ => return Err(malformed(ENTITY, "approval stamp is incomplete")),
        };

        let rejection = match (
            parse_optional_timestamp(ENTITY, "rejected_at", row.rejected_at.as_deref())?,
            non_empty(row.rejected_by.as_deref()),
        ) {
            (Some(rejected_at), Some(rejected_by)) => Some(Rejection {
                rejected_at,
                rejected_by: UserId(rejected_by.to_owned()),
                reason: row.rejection_reason.clone().unwrap_or_default(),
            }),
            (None, None) => None,
            _ => return Err(malformed(ENTITY, "rejection stamp is incomplete")),
        };

        let purchase = match (
            parse_optional_timestamp(ENTITY, "purchased_at", row.purchased_at.as_deref())?,
            row.final_total,
        ) {
            (Some(purchased_at), Some(final_total)) => Some(Purchase { purchased_at, final_total }),
            (None, None) => None,
            _ => return Err(malformed(ENTITY, "purchase stamp is incomplete")),
        };

        let state = RequestState::from_parts(status, approval, rejection, purchase)
            .map_err(|error| malformed(ENTITY, format!("request `{id}`: {error}")))?;

        Ok(RequestHeader {
            po_number: parse_enum(ENTITY, "po_number", &row.po_number)?,
            organization_id: OrganizationId(require_text(
                ENTITY,
                "organization_id",
                &row.organization_id,
            )?),
            project_id: ProjectId(require_text(ENTITY, "project_id", &row.project_id)?),
            requester_id: UserId(require_text(ENTITY, "requester_id", &row.requester_id)?),
            vendor: row.vendor,
            category: parse_enum(ENTITY, "category", &row.category)?,
            cost_code_id: CostCodeId(require_text(ENTITY, "cost_code_id", &row.cost_code_id)?),
            estimated_total: row.estimated_total,
            need_by: parse_enum(ENTITY, "need_by", &row.need_by)?,
            urgency: parse_enum(ENTITY, "urgency", &row.urgency)?,
            notes: row.notes.unwrap_or_default(),
            attachments: row.attachments.unwrap_or_default(),
            receipt_attachments: row.receipt_attachments.unwrap_or_default(),
            delivery_method: parse_enum(ENTITY, "delivery_method", &row.delivery_method)?,
            delivery_address: non_empty(row.delivery_address.as_deref()).map(str::to_owned),
            state,
            created_at: parse_timestamp(ENTITY, "created_at", &row.created_at)?,
            updated_at: parse_timestamp(ENTITY, "updated_at", &row.updated_at)?,
            id: RequestId(id),
        })
    }
}

impl From<&RequestHeader> for RequestRow {
    fn from(header: &RequestHeader) -> Self {
        let approval = header.state.approval();
        let rejection = header.state.rejection();
        let purchase = header.state.purchase();

        Self {
            id: header.id.0.clone(),
            po_number: header.po_number.to_string(),
            organization_id: header.organization_id.0.clone(),
            project_id: header.project_id.0.clone(),
            requester_id: header.requester_id.0.clone(),
            vendor: header.vendor.clone(),
            category: header.category.as_str().to_owned(),
            cost_code_id: header.cost_code_id.0.clone(),
            estimated_total: header.estimated_total,
            final_total: purchase.map(|purchase| purchase.final_total),
            need_by: header.need_by.as_str().to_owned(),
            urgency: header.urgency.as_str().to_owned(),
            notes: Some(header.notes.clone()),
            attachments: Some(header.attachments.clone()),
            receipt_attachments: Some(header.receipt_attachments.clone()),
            delivery_method: header.delivery_method.as_str().to_owned(),
            delivery_address: header.delivery_address.clone(),
            status: header.state.status().as_str().to_owned(),
            created_at: format_timestamp(&header.created_at),
            updated_at: format_timestamp(&header.updated_at),
            approved_at: approval.map(|approval| format_timestamp(&approval.approved_at)),
            approved_by: approval.map(|approval| approval.approved_by.0.clone()),
            rejected_at: rejection.map(|rejection| format_timestamp(&rejection.rejected_at)),
            rejected_by: rejection.map(|rejection| rejection.rejected_by.0.clone()),
            rejection_reason: rejection.map(|rejection| rejection.reason.clone()),
            purchased_at: purchase.map(|purchase| format_timestamp(&purchase.purchased_at)),
        }
    }
}

impl TryFrom<LineItemRow> for LineItemRecord {
    type Error = DomainError;

    fn try_from(row: LineItemRow) -> Result<Self, Self::Error> {
        const ENTITY: &str = "line_item";

        if row.quantity <= Decimal::ZERO {
            return Err(malformed(ENTITY, format!("line item `{}` has quantity {}", row.id, row.quantity)));
        }
        if row.estimated_unit_cost < Decimal::ZERO {
            return Err(malformed(ENTITY, format!("line item `{}` has a negative unit cost", row.id)));
        }

        Ok(LineItemRecord {
            request_id: RequestId(require_text(
                ENTITY,
                "purchase_request_id",
                &row.purchase_request_id,
            )?),
            sort_order: row.sort_order,
            item: LineItem {
                id: LineItemId(require_text(ENTITY, "id", &row.id)?),
                name: row.name,
                quantity: row.quantity,
                unit: row.unit,
                estimated_unit_cost: row.estimated_unit_cost,
            },
        })
    }
}

impl TryFrom<AuditEntryRow> for AuditEntry {
    type Error = DomainError;

    fn try_from(row: AuditEntryRow) -> Result<Self, Self::Error> {
        const ENTITY: &str = "audit_entry";

        let action = AuditAction::from_str(&row.action)
            .map_err(|_| malformed(ENTITY, format!("unknown action `{}`", row.action)))?;

        Ok(AuditEntry {
            id: require_text(ENTITY, "id", &row.id)?,
            request_id: RequestId(require_text(
                ENTITY,
                "purchase_request_id",
                &row.purchase_request_id,
            )?),
            action,
            user_id: UserId(require_text(ENTITY, "user_id", &row.user_id)?),
            timestamp: parse_timestamp(ENTITY, "timestamp", &row.timestamp)?,
            details: row.details,
        })
    }
}

impl TryFrom<ProjectRow> for Project {
    type Error = DomainError;

    fn try_from(row: ProjectRow) -> Result<Self, Self::Error> {
        const ENTITY: &str = "project";

        Ok(Project {
            id: ProjectId(require_text(ENTITY, "id", &row.id)?),
            name: row.name,
            job_number: row.job_number,
            address: row.address.unwrap_or_default(),
            monthly_budget: row.monthly_budget,
            status: parse_enum(ENTITY, "status", &row.status)?,
        })
    }
}

impl TryFrom<CostCodeRow> for CostCode {
    type Error = DomainError;

    fn try_from(row: CostCodeRow) -> Result<Self, Self::Error> {
        Ok(CostCode {
            id: CostCodeId(require_text("cost_code", "id", &row.id)?),
            code: require_text("cost_code", "code", &row.code)?,
            label: row.label,
            category: row.category,
        })
    }
}

impl TryFrom<ProfileRow> for UserProfile {
    type Error = DomainError;

    fn try_from(row: ProfileRow) -> Result<Self, Self::Error> {
        Ok(UserProfile {
            id: UserId(require_text("profile", "id", &row.id)?),
            organization_id: non_empty(row.organization_id.as_deref())
                .map(|id| OrganizationId(id.to_owned())),
            email: row.email,
            full_name: row.full_name.unwrap_or_default(),
            avatar_url: non_empty(row.avatar_url.as_deref()).map(str::to_owned),
            onboarded: row.onboarded,
            disabled: row.disabled,
        })
    }
}

impl TryFrom<PermissionsPayload> for ResolvedAccess {
    type Error = DomainError;

    fn try_from(payload: PermissionsPayload) -> Result<Self, Self::Error> {
        let profile = payload.profile.map(UserProfile::try_from).transpose()?;

        let project_bindings = payload
            .project_bindings
            .into_iter()
            .map(|binding| {
                Ok(ProjectBinding {
                    project_id: ProjectId(require_text(
                        "project_binding",
                        "projectId",
                        &binding.project_id,
                    )?),
                    role_names: binding.role_names.into_iter().collect(),
                    permissions: binding.permissions.into_iter().collect(),
                })
            })
            .collect::<Result<Vec<_>, DomainError>>()?;

        Ok(ResolvedAccess {
            profile,
            onboarded: payload.onboarded,
            organization: payload.organization,
            grant: PermissionGrant {
                organization_roles: payload.org_roles.into_iter().collect::<BTreeSet<_>>(),
                organization_permissions: payload.org_permissions.into_iter().collect(),
                project_bindings,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{AuditEntryRow, LineItemRow, PermissionsPayload, RequestRow};
    use crate::audit::{AuditAction, AuditEntry};
    use crate::backend::ResolvedAccess;
    use crate::domain::profile::UserId;
    use crate::domain::project::ProjectId;
    use crate::domain::request::{
        Approval, LineItemRecord, PoNumber, Purchase, RequestHeader, RequestState, RequestStatus,
    };
    use crate::errors::DomainError;
    use crate::permissions::PO_APPROVE;
    use crate::test_support::request_header;

    fn pending_row() -> serde_json::Value {
        json!({
            "id": "r1",
            "po_number": "PO-1041",
            "organization_id": "org-even",
            "project_id": "p1",
            "requester_id": "u1",
            "vendor": "White Cap Supply",
            "category": "materials",
            "cost_code_id": "cc2",
            "estimated_total": 614,
            "final_total": null,
            "need_by": "today",
            "urgency": "urgent",
            "notes": null,
            "attachments": null,
            "delivery_method": "delivery",
            "delivery_address": "1200 River Rd, Austin, TX 78701",
            "status": "pending",
            "created_at": "2026-03-02T14:00:00+00:00",
            "updated_at": "2026-03-02T14:00:00.000Z",
            "approved_at": null,
            "approved_by": null
        })
    }

    fn decode(value: serde_json::Value) -> Result<RequestHeader, DomainError> {
        let row: RequestRow = serde_json::from_value(value).expect("row shape");
        RequestHeader::try_from(row)
    }

    #[test]
    fn hosted_row_decodes_into_pending_header() {
        let header = decode(pending_row()).expect("valid row");

        assert_eq!(header.po_number, PoNumber(1041));
        assert_eq!(header.state.status(), RequestStatus::Pending);
        assert_eq!(header.estimated_total, Decimal::from(614));
        assert_eq!(header.notes, "");
        assert!(header.attachments.is_empty());
    }

    #[test]
    fn unknown_status_is_rejected() {
        let mut row = pending_row();
        row["status"] = json!("ordered");

        let error = decode(row).expect_err("unknown status");
        assert!(matches!(error, DomainError::MalformedRow { entity: "purchase_request", .. }));
    }

    #[test]
    fn pending_row_with_approval_stamp_is_rejected() {
        let mut row = pending_row();
        row["approved_at"] = json!("2026-03-02T15:00:00Z");
        row["approved_by"] = json!("u3");

        assert!(decode(row).is_err());
    }

    #[test]
    fn half_stamp_is_rejected() {
        let mut row = pending_row();
        row["status"] = json!("approved");
        row["approved_at"] = json!("2026-03-02T15:00:00Z");

        let error = decode(row).expect_err("approved_by missing");
        assert!(error.to_string().contains("approval stamp is incomplete"));
    }

    #[test]
    fn non_rfc3339_timestamp_is_rejected() {
        let mut row = pending_row();
        row["created_at"] = json!("03/02/2026 2:00 PM");

        assert!(decode(row).is_err());
    }

    #[test]
    fn purchased_header_survives_row_encoding() {
        let created = request_header("r1", RequestState::Pending).created_at;
        let header = request_header(
            "r1",
            RequestState::Purchased {
                approval: Approval { approved_at: created, approved_by: UserId("u3".to_owned()) },
                purchase: Purchase { purchased_at: created, final_total: Decimal::new(65_000, 2) },
            },
        );

        let row = RequestRow::from(&header);
        assert_eq!(row.status, "purchased");
        assert_eq!(RequestHeader::try_from(row).expect("decode"), header);
    }

    #[test]
    fn line_item_with_zero_quantity_is_rejected() {
        let row = LineItemRow {
            id: "li1".to_owned(),
            purchase_request_id: "r1".to_owned(),
            name: "80lb Concrete Mix".to_owned(),
            quantity: Decimal::ZERO,
            unit: "bags".to_owned(),
            estimated_unit_cost: Decimal::new(650, 2),
            sort_order: 0,
        };

        assert!(LineItemRecord::try_from(row).is_err());
    }

    #[test]
    fn permissions_payload_builds_grant() {
        let payload: PermissionsPayload = serde_json::from_value(json!({
            "profile": {"id": "u1", "email": "mike@evenconstruction.com", "full_name": "Mike Torres",
                        "avatar_url": null, "organization_id": "org-even", "onboarded": true, "disabled": false},
            "onboarded": true,
            "organization": {"id": "org-even", "name": "Even Construction", "slug": "even"},
            "orgRoles": [],
            "orgPermissions": [],
            "projectBindings": [{"projectId": "p1", "roleNames": ["foreman"], "permissions": ["po.approve"]}]
        }))
        .expect("payload shape");

        let access = ResolvedAccess::try_from(payload).expect("valid payload");
        assert!(access.onboarded);
        assert_eq!(access.profile.expect("profile").display_name(), "Mike Torres");
        assert!(access.grant.can(PO_APPROVE, Some(&ProjectId("p1".to_owned()))));
        assert!(!access.grant.can(PO_APPROVE, Some(&ProjectId("p2".to_owned()))));
    }

    #[test]
    fn audit_rows_keep_the_acting_user_and_reject_unknown_actions() {
        let row: AuditEntryRow = serde_json::from_value(json!({
            "id": "r9:purchased",
            "purchase_request_id": "r9",
            "action": "purchased",
            "user_id": "u3",
            "timestamp": "2026-02-25T14:00:00.000Z",
            "details": "Marked purchased – $1,012.47 (receipt attached)"
        }))
        .expect("row");

        let entry = AuditEntry::try_from(row.clone()).expect("entry");
        assert_eq!(entry.action, AuditAction::Purchased);
        assert_eq!(entry.user_id, UserId("u3".to_owned()));

        let unknown = AuditEntryRow { action: "shipped".to_owned(), ..row };
        assert!(matches!(
            AuditEntry::try_from(unknown),
            Err(DomainError::MalformedRow { entity: "audit_entry", .. })
        ));
    }
}

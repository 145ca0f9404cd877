use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry};
use crate::backend::RequestAction;
use crate::domain::money::{format_usd, is_within_max_amount, round_cents};
use crate::domain::profile::{OrganizationId, UserId};
use crate::domain::project::ProjectId;
use crate::domain::request::{
    Approval, LineItem, LineItemId, PoNumber, Purchase, PurchaseRequest, Rejection, RequestHeader,
    RequestId, RequestState,
};
use crate::errors::DomainError;
use crate::lifecycle::draft::{NewRequest, ValidationError};
use crate::lifecycle::states::{LifecycleAction, TransitionOutcome};
use crate::permissions::PermissionGrant;

/// Identifiers the persistence layer allocates for a new request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub id: RequestId,
    pub po_number: PoNumber,
    pub organization_id: OrganizationId,
    pub requester_id: UserId,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseInput {
    /// Falls back to the estimated total when absent.
    pub final_total: Option<Decimal>,
    pub receipt_uri: Option<String>,
    pub notes: Option<String>,
}

/// Applies lifecycle transitions to requests. Every transition checks the source status first
/// and the caller's capability second, and yields the audit entry it produced.
#[derive(Clone, Debug, Default)]
pub struct LifecycleEngine;

impl LifecycleEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn allowed_actions(
        &self,
        request: &PurchaseRequest,
        grant: &PermissionGrant,
    ) -> Vec<LifecycleAction> {
        LifecycleAction::TRANSITIONS
            .iter()
            .copied()
            .filter(|action| self.check(request, *action, grant).is_ok())
            .collect()
    }

    pub fn check(
        &self,
        request: &PurchaseRequest,
        action: LifecycleAction,
        grant: &PermissionGrant,
    ) -> Result<(), DomainError> {
        let from = request.status();
        if action.source_status() != Some(from) {
            return Err(DomainError::InvalidTransition { from, action });
        }

        match action.required_permission() {
            Some(permission) => grant.require(permission, request.project_id()),
            None => grant.require_project_access(request.project_id()),
        }
    }

    pub fn can_submit(&self, grant: &PermissionGrant, project_id: &ProjectId) -> bool {
        grant.has_project_access(project_id)
    }

    pub fn submit(
        &self,
        request: NewRequest,
        submission: Submission,
        grant: &PermissionGrant,
    ) -> Result<(PurchaseRequest, TransitionOutcome), DomainError> {
        request.verify()?;
        grant.require_project_access(&request.project_id)?;

        let line_items = request
            .line_items
            .into_iter()
            .map(|item| LineItem {
                id: LineItemId(Uuid::new_v4().to_string()),
                name: item.name,
                quantity: item.quantity,
                unit: item.unit,
                estimated_unit_cost: item.estimated_unit_cost,
            })
            .collect();

        let header = RequestHeader {
            id: submission.id,
            po_number: submission.po_number,
            organization_id: submission.organization_id,
            project_id: request.project_id,
            requester_id: submission.requester_id,
            vendor: request.vendor,
            category: request.category,
            cost_code_id: request.cost_code_id,
            estimated_total: round_cents(request.estimated_total),
            need_by: request.need_by,
            urgency: request.urgency,
            notes: request.notes,
            attachments: request.attachments,
            receipt_attachments: Vec::new(),
            delivery_method: request.delivery_method,
            delivery_address: request.delivery_address,
            state: RequestState::Pending,
            created_at: submission.submitted_at,
            updated_at: submission.submitted_at,
        };

        let audit_entry = AuditEntry::new(
            header.id.clone(),
            AuditAction::Submitted,
            header.requester_id.clone(),
            submission.submitted_at,
        )
        .with_details(format!(
            "Purchase request {} submitted for {}",
            header.po_number, header.vendor
        ));

        let outcome = TransitionOutcome {
            action: LifecycleAction::Submit,
            from: None,
            to: header.state.status(),
            audit_entry,
        };

        Ok((PurchaseRequest { header, line_items }, outcome))
    }

    pub fn approve(
        &self,
        request: &mut PurchaseRequest,
        actor: &UserId,
        grant: &PermissionGrant,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DomainError> {
        self.check(request, LifecycleAction::Approve, grant)?;

        let details = format!("Approved {}", request.header.po_number);
        let approval = Approval { approved_at: at, approved_by: actor.clone() };
        Ok(self.transition(
            request,
            LifecycleAction::Approve,
            RequestState::Approved { approval },
            actor,
            at,
            details,
        ))
    }

    pub fn reject(
        &self,
        request: &mut PurchaseRequest,
        actor: &UserId,
        grant: &PermissionGrant,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DomainError> {
        self.check(request, LifecycleAction::Reject, grant)?;

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ValidationError::RejectionReasonRequired.into());
        }

        let rejection =
            Rejection { rejected_at: at, rejected_by: actor.clone(), reason: reason.to_owned() };
        Ok(self.transition(
            request,
            LifecycleAction::Reject,
            RequestState::Rejected { rejection },
            actor,
            at,
            format!("Rejected: {reason}"),
        ))
    }

    pub fn mark_purchased(
        &self,
        request: &mut PurchaseRequest,
        actor: &UserId,
        grant: &PermissionGrant,
        input: PurchaseInput,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DomainError> {
        self.check(request, LifecycleAction::MarkPurchased, grant)?;

        let final_total = input.final_total.unwrap_or(request.header.estimated_total);
        if final_total < Decimal::ZERO {
            return Err(ValidationError::NegativeFinalTotal.into());
        }
        if !is_within_max_amount(final_total) {
            return Err(ValidationError::AmountOutOfRange.into());
        }
        let final_total = round_cents(final_total);

        let approval = request.header.state.approval().cloned().ok_or_else(|| {
            DomainError::InvariantViolation("approved request has no approval stamp".to_owned())
        })?;

        let receipt_uri = input.receipt_uri.filter(|uri| !uri.trim().is_empty());
        let mut details = format!("Marked purchased – {}", format_usd(final_total));
        if let Some(receipt_uri) = receipt_uri {
            request.header.receipt_attachments.push(receipt_uri);
            details.push_str(" (receipt attached)");
        }

        if let Some(notes) = input.notes.as_deref().map(str::trim).filter(|notes| !notes.is_empty())
        {
            append_purchase_notes(&mut request.header.notes, notes);
        }

        let purchase = Purchase { purchased_at: at, final_total };
        Ok(self.transition(
            request,
            LifecycleAction::MarkPurchased,
            RequestState::Purchased { approval, purchase },
            actor,
            at,
            details,
        ))
    }

    /// Dispatches a wire-level action against the request it names.
    pub fn apply(
        &self,
        request: &mut PurchaseRequest,
        actor: &UserId,
        grant: &PermissionGrant,
        action: &RequestAction,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DomainError> {
        if action.request_id() != request.id() {
            return Err(DomainError::InvariantViolation(format!(
                "action targets request `{}` but `{}` was loaded",
                action.request_id(),
                request.id()
            )));
        }

        match action {
            RequestAction::Approve { .. } => self.approve(request, actor, grant, at),
            RequestAction::Reject { reason, .. } => self.reject(request, actor, grant, reason, at),
            RequestAction::MarkPurchased { final_total, receipt_uri, notes, .. } => self
                .mark_purchased(
                    request,
                    actor,
                    grant,
                    PurchaseInput {
                        final_total: *final_total,
                        receipt_uri: receipt_uri.clone(),
                        notes: notes.clone(),
                    },
                    at,
                ),
        }
    }

    fn transition(
        &self,
        request: &mut PurchaseRequest,
        action: LifecycleAction,
        next: RequestState,
        actor: &UserId,
        at: DateTime<Utc>,
        details: String,
    ) -> TransitionOutcome {
        let from = request.status();
        request.header.state = next;
        request.header.updated_at = at;

        TransitionOutcome {
            action,
            from: Some(from),
            to: request.status(),
            audit_entry: AuditEntry::new(
                request.header.id.clone(),
                action.audit_action(),
                actor.clone(),
                at,
            )
            .with_details(details),
        }
    }
}

fn append_purchase_notes(existing: &mut String, notes: &str) {
    if existing.trim().is_empty() {
        *existing = format!("Purchase notes: {notes}");
    } else {
        existing.push_str(&format!("\n\nPurchase notes: {notes}"));
    }
}

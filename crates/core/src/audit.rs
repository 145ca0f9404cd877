use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::money::format_usd;
use crate::domain::profile::UserId;
use crate::domain::request::{PurchaseRequest, RequestId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Submitted,
    Approved,
    Rejected,
    Purchased,
}

wire_enum!(AuditAction {
    Submitted => "submitted",
    Approved => "approved",
    Rejected => "rejected",
    Purchased => "purchased",
});

/// Append-only record of one lifecycle transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub request_id: RequestId,
    pub action: AuditAction,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub details: Option<String>,
}

impl AuditEntry {
    pub fn new(
        request_id: RequestId,
        action: AuditAction,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request_id,
            action,
            user_id,
            timestamp,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Rebuilds the trail a request's current state implies. Ids are derived from the request
/// and action so repeated derivations compare equal.
pub fn derive_trail(request: &PurchaseRequest) -> Vec<AuditEntry> {
    let header = &request.header;
    let entry = |action: AuditAction, user_id: &UserId, timestamp: DateTime<Utc>, details: String| {
        AuditEntry {
            id: format!("{}:{}", header.id, action),
            request_id: header.id.clone(),
            action,
            user_id: user_id.clone(),
            timestamp,
            details: Some(details),
        }
    };

    let mut entries = vec![entry(
        AuditAction::Submitted,
        &header.requester_id,
        header.created_at,
        format!("Purchase request {} submitted for {}", header.po_number, header.vendor),
    )];

    if let Some(approval) = header.state.approval() {
        entries.push(entry(
            AuditAction::Approved,
            &approval.approved_by,
            approval.approved_at,
            format!("Approved {}", header.po_number),
        ));
    }

    if let Some(rejection) = header.state.rejection() {
        entries.push(entry(
            AuditAction::Rejected,
            &rejection.rejected_by,
            rejection.rejected_at,
            format!("Rejected: {}", rejection.reason),
        ));
    }

    // The purchaser is not stamped on the request, so the derived entry credits the requester.
    if let Some(purchase) = header.state.purchase() {
        entries.push(entry(
            AuditAction::Purchased,
            &header.requester_id,
            purchase.purchased_at,
            format!("Purchased from {} – {}", header.vendor, format_usd(purchase.final_total)),
        ));
    }

    sort_for_display(&mut entries);
    entries
}

/// Trail for every request, newest first.
pub fn derive_log(requests: &[PurchaseRequest]) -> Vec<AuditEntry> {
    let mut entries: Vec<AuditEntry> = requests.iter().flat_map(derive_trail).collect();
    sort_for_display(&mut entries);
    entries
}

pub fn sort_for_display(entries: &mut [AuditEntry]) {
    entries.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
}

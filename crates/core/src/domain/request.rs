use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::money::checked_extended_total;
use crate::domain::profile::{OrganizationId, UserId};
use crate::domain::project::{CostCodeId, ProjectId};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineItemId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sequential, organization-scoped purchase order number rendered as `PO-<n>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PoNumber(pub u64);

impl fmt::Display for PoNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PO-{}", self.0)
    }
}

impl FromStr for PoNumber {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .strip_prefix("PO-")
            .and_then(|digits| digits.parse::<u64>().ok())
            .map(PoNumber)
            .ok_or_else(|| DomainError::UnknownValue {
                field: "PoNumber",
                value: value.to_owned(),
            })
    }
}

impl From<PoNumber> for String {
    fn from(value: PoNumber) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for PoNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Draft,
    Pending,
    Approved,
    Rejected,
    Purchased,
}

wire_enum!(RequestStatus {
    Draft => "draft",
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Purchased => "purchased",
});

impl RequestStatus {
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Draft, RequestStatus::Pending)
                | (RequestStatus::Pending, RequestStatus::Approved)
                | (RequestStatus::Pending, RequestStatus::Rejected)
                | (RequestStatus::Approved, RequestStatus::Purchased)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Rejected | RequestStatus::Purchased)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestCategory {
    Materials,
    Tools,
    EquipmentRental,
    Subcontract,
    Other,
}

wire_enum!(RequestCategory {
    Materials => "materials",
    Tools => "tools",
    EquipmentRental => "equipment-rental",
    Subcontract => "subcontract",
    Other => "other",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Normal,
    Urgent,
}

wire_enum!(Urgency {
    Normal => "normal",
    Urgent => "urgent",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NeedBy {
    Today,
    Tomorrow,
    ThisWeek,
    NextWeek,
}

wire_enum!(NeedBy {
    Today => "today",
    Tomorrow => "tomorrow",
    ThisWeek => "this-week",
    NextWeek => "next-week",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    Pickup,
    Delivery,
}

wire_enum!(DeliveryMethod {
    Pickup => "pickup",
    Delivery => "delivery",
});

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: LineItemId,
    pub name: String,
    pub quantity: Decimal,
    pub unit: String,
    pub estimated_unit_cost: Decimal,
}

impl LineItem {
    /// `None` when quantity × unit cost does not fit in a decimal.
    pub fn extended_cost(&self) -> Option<Decimal> {
        self.quantity.checked_mul(self.estimated_unit_cost)
    }
}

/// A stored line item together with its owning request, as returned by org-scoped reads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemRecord {
    pub request_id: RequestId,
    pub sort_order: i64,
    pub item: LineItem,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub approved_at: DateTime<Utc>,
    pub approved_by: UserId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub rejected_at: DateTime<Utc>,
    pub rejected_by: UserId,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub purchased_at: DateTime<Utc>,
    pub final_total: Decimal,
}

/// Status together with the stamps that status carries. A purchased request keeps the
/// approval it was purchased under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestState {
    Draft,
    Pending,
    Approved { approval: Approval },
    Rejected { rejection: Rejection },
    Purchased { approval: Approval, purchase: Purchase },
}

impl RequestState {
    pub fn status(&self) -> RequestStatus {
        match self {
            RequestState::Draft => RequestStatus::Draft,
            RequestState::Pending => RequestStatus::Pending,
            RequestState::Approved { .. } => RequestStatus::Approved,
            RequestState::Rejected { .. } => RequestStatus::Rejected,
            RequestState::Purchased { .. } => RequestStatus::Purchased,
        }
    }

    pub fn approval(&self) -> Option<&Approval> {
        match self {
            RequestState::Approved { approval } | RequestState::Purchased { approval, .. } => {
                Some(approval)
            }
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            RequestState::Rejected { rejection } => Some(rejection),
            _ => None,
        }
    }

    pub fn purchase(&self) -> Option<&Purchase> {
        match self {
            RequestState::Purchased { purchase, .. } => Some(purchase),
            _ => None,
        }
    }

    /// Rebuilds a state from a flat status column and its optional stamps, rejecting any
    /// combination the lifecycle cannot produce.
    pub fn from_parts(
        status: RequestStatus,
        approval: Option<Approval>,
        rejection: Option<Rejection>,
        purchase: Option<Purchase>,
    ) -> Result<Self, DomainError> {
        let state = match (status, approval, rejection, purchase) {
            (RequestStatus::Draft, None, None, None) => RequestState::Draft,
            (RequestStatus::Pending, None, None, None) => RequestState::Pending,
            (RequestStatus::Approved, Some(approval), None, None) => {
                RequestState::Approved { approval }
            }
            (RequestStatus::Rejected, None, Some(rejection), None) => {
                if rejection.reason.trim().is_empty() {
                    return Err(DomainError::InvariantViolation(
                        "rejected request is missing a rejection reason".to_owned(),
                    ));
                }
                RequestState::Rejected { rejection }
            }
            (RequestStatus::Purchased, Some(approval), None, Some(purchase)) => {
                RequestState::Purchased { approval, purchase }
            }
            (status, approval, rejection, purchase) => {
                return Err(DomainError::InvariantViolation(format!(
                    "status `{status}` is inconsistent with stamps (approval: {}, rejection: {}, purchase: {})",
                    approval.is_some(),
                    rejection.is_some(),
                    purchase.is_some()
                )));
            }
        };

        Ok(state)
    }
}

/// Every persisted request column except its line items.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub id: RequestId,
    pub po_number: PoNumber,
    pub organization_id: OrganizationId,
    pub project_id: ProjectId,
    pub requester_id: UserId,
    pub vendor: String,
    pub category: RequestCategory,
    pub cost_code_id: CostCodeId,
    pub estimated_total: Decimal,
    pub need_by: NeedBy,
    pub urgency: Urgency,
    pub notes: String,
    pub attachments: Vec<String>,
    pub receipt_attachments: Vec<String>,
    pub delivery_method: DeliveryMethod,
    pub delivery_address: Option<String>,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    #[serde(flatten)]
    pub header: RequestHeader,
    pub line_items: Vec<LineItem>,
}

impl PurchaseRequest {
    pub fn id(&self) -> &RequestId {
        &self.header.id
    }

    pub fn status(&self) -> RequestStatus {
        self.header.state.status()
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.header.project_id
    }

    /// Sum of quantity × unit cost over the line items, to the cent.
    pub fn line_item_total(&self) -> Option<Decimal> {
        line_item_total(&self.line_items)
    }

    pub fn final_total(&self) -> Option<Decimal> {
        self.header.state.purchase().map(|purchase| purchase.final_total)
    }
}

pub fn line_item_total(items: &[LineItem]) -> Option<Decimal> {
    checked_extended_total(items.iter().map(|item| (item.quantity, item.estimated_unit_cost)))
}

/// Joins org-scoped request headers with their line items by foreign key, keeping header
/// order and ordering items by `sort_order`. Items whose request is not present are dropped.
pub fn assemble_requests(
    headers: Vec<RequestHeader>,
    items: Vec<LineItemRecord>,
) -> Vec<PurchaseRequest> {
    let mut by_request: HashMap<RequestId, Vec<LineItemRecord>> = HashMap::new();
    for record in items {
        by_request.entry(record.request_id.clone()).or_default().push(record);
    }

    headers
        .into_iter()
        .map(|header| {
            let mut records = by_request.remove(&header.id).unwrap_or_default();
            records.sort_by_key(|record| record.sort_order);
            let line_items = records.into_iter().map(|record| record.item).collect();
            PurchaseRequest { header, line_items }
        })
        .collect()
}

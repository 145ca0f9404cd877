/// Implements `as_str`, `Display` and `FromStr` for enums stored as wire strings.
macro_rules! wire_enum {
    ($name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::errors::DomainError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim() {
                    $($wire => Ok($name::$variant),)+
                    other => Err(crate::errors::DomainError::UnknownValue {
                        field: stringify!($name),
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

pub mod audit;
pub mod backend;
pub mod config;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod permissions;
pub mod schema;

pub use audit::{AuditAction, AuditEntry};
pub use backend::{
    AuthService, BackendError, Identity, MembershipService, PermissionResolver, RequestAction,
    RequestRepository, ResolvedAccess,
};
pub use domain::profile::{Organization, OrganizationId, UserId, UserProfile};
pub use domain::project::{CostCode, CostCodeId, Project, ProjectId, ProjectStatus};
pub use domain::request::{
    LineItem, PoNumber, PurchaseRequest, RequestHeader, RequestId, RequestState, RequestStatus,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use lifecycle::{
    LifecycleAction, LifecycleEngine, LineItemDraft, NewRequest, PurchaseInput, RequestDraft,
    TransitionOutcome, ValidationError, Variance,
};
pub use permissions::{PermissionGrant, ProjectBinding, PO_APPROVE, PO_MARK_ORDERED};

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use crate::domain::profile::{OrganizationId, UserId};
    use crate::domain::project::{CostCodeId, ProjectId};
    use crate::domain::request::{
        DeliveryMethod, LineItem, LineItemId, NeedBy, PoNumber, PurchaseRequest,
        RequestCategory, RequestHeader, RequestId, RequestState, Urgency,
    };

    pub fn request_header(id: &str, state: RequestState) -> RequestHeader {
        let created_at = Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).single().expect("timestamp");
        RequestHeader {
            id: RequestId(id.to_owned()),
            po_number: PoNumber(1041),
            organization_id: OrganizationId("org-even".to_owned()),
            project_id: ProjectId("p1".to_owned()),
            requester_id: UserId("u1".to_owned()),
            vendor: "White Cap Supply".to_owned(),
            category: RequestCategory::Materials,
            cost_code_id: CostCodeId("cc2".to_owned()),
            estimated_total: Decimal::new(61_400, 2),
            need_by: NeedBy::Today,
            urgency: Urgency::Urgent,
            notes: String::new(),
            attachments: Vec::new(),
            receipt_attachments: Vec::new(),
            delivery_method: DeliveryMethod::Pickup,
            delivery_address: None,
            state,
            created_at,
            updated_at: created_at,
        }
    }

    /// The 614.00 concrete-and-rebar request used across lifecycle tests.
    pub fn request(state: RequestState) -> PurchaseRequest {
        PurchaseRequest {
            header: request_header("r1", state),
            line_items: vec![
                LineItem {
                    id: LineItemId("li1".to_owned()),
                    name: "80lb Concrete Mix".to_owned(),
                    quantity: Decimal::from(40),
                    unit: "bags".to_owned(),
                    estimated_unit_cost: Decimal::new(650, 2),
                },
                LineItem {
                    id: LineItemId("li2".to_owned()),
                    name: "Rebar #4 x 20ft".to_owned(),
                    quantity: Decimal::from(24),
                    unit: "pcs".to_owned(),
                    estimated_unit_cost: Decimal::new(1475, 2),
                },
            ],
        }
    }
}

use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEntry};
use crate::domain::request::RequestStatus;
use crate::permissions::{PO_APPROVE, PO_MARK_ORDERED};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Submit,
    Approve,
    Reject,
    MarkPurchased,
}

wire_enum!(LifecycleAction {
    Submit => "submit",
    Approve => "approve",
    Reject => "reject",
    MarkPurchased => "mark_purchased",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredInput {
    Project,
    Vendor,
    LineItems,
    CostCode,
    NeedBy,
    Urgency,
    DeliveryMethod,
    RejectionReason,
}

impl LifecycleAction {
    /// Actions that move an existing request; `Submit` creates one instead.
    pub const TRANSITIONS: &'static [LifecycleAction] =
        &[LifecycleAction::Approve, LifecycleAction::Reject, LifecycleAction::MarkPurchased];

    pub fn source_status(&self) -> Option<RequestStatus> {
        match self {
            LifecycleAction::Submit => None,
            LifecycleAction::Approve | LifecycleAction::Reject => Some(RequestStatus::Pending),
            LifecycleAction::MarkPurchased => Some(RequestStatus::Approved),
        }
    }

    pub fn target_status(&self) -> RequestStatus {
        match self {
            LifecycleAction::Submit => RequestStatus::Pending,
            LifecycleAction::Approve => RequestStatus::Approved,
            LifecycleAction::Reject => RequestStatus::Rejected,
            LifecycleAction::MarkPurchased => RequestStatus::Purchased,
        }
    }

    /// Capability checked against the request's project. Submitting only needs project access.
    pub fn required_permission(&self) -> Option<&'static str> {
        match self {
            LifecycleAction::Submit => None,
            LifecycleAction::Approve | LifecycleAction::Reject => Some(PO_APPROVE),
            LifecycleAction::MarkPurchased => Some(PO_MARK_ORDERED),
        }
    }

    /// Inputs the caller must supply. The purchase final total is optional and defaults to the
    /// estimated total.
    pub fn required_inputs(&self) -> &'static [RequiredInput] {
        match self {
            LifecycleAction::Submit => &[
                RequiredInput::Project,
                RequiredInput::Vendor,
                RequiredInput::LineItems,
                RequiredInput::CostCode,
                RequiredInput::NeedBy,
                RequiredInput::Urgency,
                RequiredInput::DeliveryMethod,
            ],
            LifecycleAction::Approve | LifecycleAction::MarkPurchased => &[],
            LifecycleAction::Reject => &[RequiredInput::RejectionReason],
        }
    }

    pub fn audit_action(&self) -> AuditAction {
        match self {
            LifecycleAction::Submit => AuditAction::Submitted,
            LifecycleAction::Approve => AuditAction::Approved,
            LifecycleAction::Reject => AuditAction::Rejected,
            LifecycleAction::MarkPurchased => AuditAction::Purchased,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub action: LifecycleAction,
    pub from: Option<RequestStatus>,
    pub to: RequestStatus,
    pub audit_entry: AuditEntry,
}

#[cfg(test)]
mod tests {
    use super::{LifecycleAction, RequiredInput};
    use crate::domain::request::RequestStatus;

    #[test]
    fn every_transition_follows_a_status_edge() {
        for action in LifecycleAction::TRANSITIONS {
            let source = action.source_status().expect("transitions have a source");
            assert!(source.can_transition_to(action.target_status()), "{action}");
        }
    }

    #[test]
    fn reject_is_the_only_transition_needing_input() {
        assert_eq!(LifecycleAction::Reject.required_inputs(), &[RequiredInput::RejectionReason]);
        assert!(LifecycleAction::Approve.required_inputs().is_empty());
        assert!(LifecycleAction::MarkPurchased.required_inputs().is_empty());
        assert_eq!(LifecycleAction::Submit.target_status(), RequestStatus::Pending);
    }
}

use clap::Args;
use rust_decimal::Decimal;
use serde::Serialize;

use fieldpo_core::audit::AuditEntry;
use fieldpo_core::domain::project::{CostCodeId, ProjectId};
use fieldpo_core::domain::request::{
    DeliveryMethod, NeedBy, PurchaseRequest, RequestCategory, RequestId, RequestStatus, Urgency,
};
use fieldpo_core::lifecycle::{LifecycleAction, LineItemDraft, PurchaseInput, RequestDraft, Variance};

use crate::commands::context::{ActingAs, MemberSession};
use crate::commands::{execute, CommandFailure, CommandOutput, CommandResult, EXIT_REJECTED};

#[derive(Debug, Clone, Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub acting_as: ActingAs,
    /// Only requests in this status
    #[arg(long)]
    pub status: Option<RequestStatus>,
    /// Only requests the acting user submitted
    #[arg(long, conflicts_with = "awaiting")]
    pub mine: bool,
    /// Only pending requests the acting user may approve
    #[arg(long)]
    pub awaiting: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ShowArgs {
    #[command(flatten)]
    pub acting_as: ActingAs,
    pub request_id: String,
}

#[derive(Debug, Clone, Args)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub acting_as: ActingAs,
    #[arg(long)]
    pub project: String,
    #[arg(long)]
    pub cost_code: String,
    #[arg(long)]
    pub vendor: String,
    #[arg(long, default_value = "materials")]
    pub category: RequestCategory,
    /// Line item as `name:quantity:unit:unit_cost`; repeatable
    #[arg(long = "item", value_name = "ITEM", required = true)]
    pub items: Vec<String>,
    #[arg(long, default_value = "this-week")]
    pub need_by: NeedBy,
    #[arg(long, default_value = "normal")]
    pub urgency: Urgency,
    #[arg(long, default_value = "")]
    pub notes: String,
    /// Deliver to this address instead of picking up
    #[arg(long)]
    pub deliver_to: Option<String>,
    /// Attachment URI; repeatable
    #[arg(long = "attach", value_name = "URI")]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct TransitionArgs {
    #[command(flatten)]
    pub acting_as: ActingAs,
    pub request_id: String,
}

#[derive(Debug, Clone, Args)]
pub struct RejectArgs {
    #[command(flatten)]
    pub acting_as: ActingAs,
    pub request_id: String,
    #[arg(long)]
    pub reason: String,
}

#[derive(Debug, Clone, Args)]
pub struct PurchaseArgs {
    #[command(flatten)]
    pub acting_as: ActingAs,
    pub request_id: String,
    /// Defaults to the estimated total
    #[arg(long)]
    pub final_total: Option<Decimal>,
    #[arg(long)]
    pub receipt: Option<String>,
    #[arg(long)]
    pub notes: Option<String>,
}

/// A request together with what the acting user may do with it next.
#[derive(Debug, Serialize)]
struct RequestView {
    request: PurchaseRequest,
    po_number: String,
    status: RequestStatus,
    line_item_total: Option<Decimal>,
    allowed_actions: Vec<LifecycleAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    variance: Option<VarianceView>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    audit_trail: Vec<AuditEntry>,
}

#[derive(Debug, Serialize)]
struct VarianceView {
    amount: String,
    percent: String,
    over_estimate: bool,
}

impl From<Variance> for VarianceView {
    fn from(variance: Variance) -> Self {
        Self {
            amount: variance.amount_display(),
            percent: variance.percent_display(),
            over_estimate: variance.is_over_estimate(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ListedRequest {
    id: RequestId,
    po_number: String,
    status: RequestStatus,
    project_id: ProjectId,
    vendor: String,
    estimated_total: Decimal,
    requester_id: String,
}

impl From<&PurchaseRequest> for ListedRequest {
    fn from(request: &PurchaseRequest) -> Self {
        Self {
            id: request.id().clone(),
            po_number: request.header.po_number.to_string(),
            status: request.status(),
            project_id: request.project_id().clone(),
            vendor: request.header.vendor.clone(),
            estimated_total: request.header.estimated_total,
            requester_id: request.header.requester_id.0.clone(),
        }
    }
}

pub fn list(args: ListArgs) -> CommandResult {
    execute("list", |config| async move {
        let member = MemberSession::open(&config, &args.acting_as).await?;

        let mut requests = if args.awaiting {
            member.store.awaiting_approval().await
        } else if args.mine {
            member.store.my_requests().await
        } else {
            member.store.requests().await
        };
        if let Some(status) = args.status {
            requests.retain(|request| request.status() == status);
        }
        member.close().await;

        let listed: Vec<ListedRequest> = requests.iter().map(ListedRequest::from).collect();
        CommandOutput::with_data(format!("{} purchase requests", listed.len()), listed)
    })
}

pub fn show(args: ShowArgs) -> CommandResult {
    execute("show", |config| async move {
        let member = MemberSession::open(&config, &args.acting_as).await?;
        let view = request_view(&member, &RequestId(args.request_id.clone()), true).await;
        member.close().await;

        let view = view?;
        CommandOutput::with_data(format!("{} is {}", view.po_number, view.status), view)
    })
}

pub fn submit(args: SubmitArgs) -> CommandResult {
    execute("submit", |config| async move {
        let draft = draft_from_args(&args)?;
        let member = MemberSession::open(&config, &args.acting_as).await?;

        let outcome = async {
            let created = member.store.submit(&draft).await?;
            request_view(&member, created.id(), false).await
        }
        .await;
        member.close().await;

        let view = outcome?;
        CommandOutput::with_data(format!("submitted {}", view.po_number), view)
    })
}

pub fn approve(args: TransitionArgs) -> CommandResult {
    execute("approve", |config| async move {
        let member = MemberSession::open(&config, &args.acting_as).await?;
        let request_id = RequestId(args.request_id.clone());

        let outcome = async {
            member.store.approve(&request_id).await?;
            request_view(&member, &request_id, false).await
        }
        .await;
        member.close().await;

        let view = outcome?;
        CommandOutput::with_data(format!("approved {}", view.po_number), view)
    })
}

pub fn reject(args: RejectArgs) -> CommandResult {
    execute("reject", |config| async move {
        let member = MemberSession::open(&config, &args.acting_as).await?;
        let request_id = RequestId(args.request_id.clone());

        let outcome = async {
            member.store.reject(&request_id, &args.reason).await?;
            request_view(&member, &request_id, false).await
        }
        .await;
        member.close().await;

        let view = outcome?;
        CommandOutput::with_data(format!("rejected {}", view.po_number), view)
    })
}

pub fn purchase(args: PurchaseArgs) -> CommandResult {
    execute("purchase", |config| async move {
        let member = MemberSession::open(&config, &args.acting_as).await?;
        let request_id = RequestId(args.request_id.clone());
        let input = PurchaseInput {
            final_total: args.final_total,
            receipt_uri: args.receipt.clone(),
            notes: args.notes.clone(),
        };

        let outcome = async {
            member.store.mark_purchased(&request_id, input).await?;
            request_view(&member, &request_id, false).await
        }
        .await;
        member.close().await;

        let view = outcome?;
        let message = match &view.variance {
            Some(variance) => format!("purchased {} ({})", view.po_number, variance.amount),
            None => format!("purchased {}", view.po_number),
        };
        CommandOutput::with_data(message, view)
    })
}

async fn request_view(
    member: &MemberSession,
    request_id: &RequestId,
    with_trail: bool,
) -> Result<RequestView, CommandFailure> {
    let store = &member.store;
    let request = store.request(request_id).await.ok_or_else(|| {
        CommandFailure::new(
            "not_found",
            format!("purchase_request `{request_id}` was not found"),
            EXIT_REJECTED,
        )
    })?;

    let allowed_actions = store.allowed_actions(request_id).await?;
    let audit_trail = if with_trail { store.audit_trail(request_id).await? } else { Vec::new() };

    Ok(RequestView {
        po_number: request.header.po_number.to_string(),
        status: request.status(),
        line_item_total: request.line_item_total(),
        variance: Variance::of(&request).map(VarianceView::from),
        allowed_actions,
        audit_trail,
        request,
    })
}

fn draft_from_args(args: &SubmitArgs) -> Result<RequestDraft, CommandFailure> {
    let mut draft = RequestDraft::new(
        ProjectId(args.project.trim().to_owned()),
        CostCodeId(args.cost_code.trim().to_owned()),
    );
    draft.vendor = args.vendor.clone();
    draft.category = args.category;
    draft.need_by = args.need_by;
    draft.urgency = args.urgency;
    draft.notes = args.notes.clone();
    draft.attachments = args.attachments.clone();
    if let Some(address) = &args.deliver_to {
        draft.delivery_method = DeliveryMethod::Delivery;
        draft.delivery_address = Some(address.clone());
    }

    draft.line_items =
        args.items.iter().map(|item| parse_line_item(item)).collect::<Result<_, _>>()?;
    Ok(draft)
}

/// Splits from the right so item names may contain colons.
fn parse_line_item(raw: &str) -> Result<LineItemDraft, CommandFailure> {
    let mut parts = raw.rsplitn(4, ':');
    let (Some(unit_cost), Some(unit), Some(quantity), Some(name)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CommandFailure::invalid_argument(format!(
            "line item `{raw}` must look like name:quantity:unit:unit_cost"
        )));
    };

    Ok(LineItemDraft::from_form(name, quantity, unit, unit_cost))
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use fieldpo_core::domain::request::{DeliveryMethod, RequestCategory};
    use fieldpo_core::ValidationError;

    use super::{draft_from_args, parse_line_item, SubmitArgs};
    use crate::commands::context::ActingAs;

    fn args(items: &[&str]) -> SubmitArgs {
        SubmitArgs {
            acting_as: ActingAs { user_id: "u1".to_owned() },
            project: " p1 ".to_owned(),
            cost_code: "cc2".to_owned(),
            vendor: "White Cap Supply".to_owned(),
            category: RequestCategory::Materials,
            items: items.iter().map(|item| item.to_string()).collect(),
            need_by: "today".parse().expect("need by"),
            urgency: "urgent".parse().expect("urgency"),
            notes: String::new(),
            deliver_to: Some("1200 River Rd, Austin TX 78701".to_owned()),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn line_items_split_from_the_right() {
        let item = parse_line_item("Rebar #4 x 20ft: grade 60:24:pcs:14.75").expect("item");

        assert_eq!(item.name, "Rebar #4 x 20ft: grade 60");
        assert_eq!(item.quantity, Decimal::from(24));
        assert_eq!(item.unit, "pcs");
        assert_eq!(item.unit_cost, Decimal::new(1475, 2));
    }

    #[test]
    fn malformed_line_items_are_argument_errors() {
        let failure = parse_line_item("Concrete:40").expect_err("too few fields");
        assert_eq!(failure.error_class, "invalid_argument");
    }

    #[test]
    fn drafts_drop_incomplete_rows_and_keep_delivery() {
        let draft = draft_from_args(&args(&[":5:ea:10", "Pipe:2:ea:20"])).expect("draft");

        assert_eq!(draft.project_id.0, "p1");
        assert_eq!(draft.delivery_method, DeliveryMethod::Delivery);
        let request = draft.validate().expect("valid");
        assert_eq!(request.line_items.len(), 1);
        assert_eq!(request.estimated_total, Decimal::from(40));
    }

    #[test]
    fn oversized_quantities_fail_validation() {
        let draft =
            draft_from_args(&args(&["Pipe:79228162514264337593543950335::2"])).expect("draft");

        assert_eq!(draft.validate(), Err(ValidationError::AmountOutOfRange));
    }
}

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::money::{checked_extended_total, is_within_max_amount, round_cents};
use crate::domain::project::{CostCodeId, ProjectId};
use crate::domain::request::{DeliveryMethod, NeedBy, RequestCategory, Urgency};

pub const DEFAULT_UNIT: &str = "pcs";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("vendor is required")]
    VendorRequired,
    #[error("a project is required")]
    ProjectRequired,
    #[error("a cost code is required")]
    CostCodeRequired,
    #[error("at least one line item needs a name, a quantity above zero and a unit cost above zero")]
    NoValidLineItems,
    #[error("line item {index} is incomplete")]
    InvalidLineItem { index: usize },
    #[error("estimated total {actual} does not match line items ({expected})")]
    EstimatedTotalMismatch { expected: Decimal, actual: Decimal },
    #[error("a rejection reason is required")]
    RejectionReasonRequired,
    #[error("final total cannot be negative")]
    NegativeFinalTotal,
    #[error("amount exceeds the largest supported total")]
    AmountOutOfRange,
}

/// One row of the line-item form. Rows that are not complete are dropped on submit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemDraft {
    pub name: String,
    pub quantity: Decimal,
    pub unit: String,
    pub unit_cost: Decimal,
}

impl LineItemDraft {
    pub fn new(
        name: impl Into<String>,
        quantity: Decimal,
        unit: impl Into<String>,
        unit_cost: Decimal,
    ) -> Self {
        Self { name: name.into(), quantity, unit: unit.into(), unit_cost }
    }

    /// Builds a row from raw form text. Unparseable numbers count as zero, which makes the
    /// row invalid rather than failing the whole form.
    pub fn from_form(name: &str, quantity: &str, unit: &str, unit_cost: &str) -> Self {
        Self::new(name, parse_amount(quantity), unit, parse_amount(unit_cost))
    }

    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty()
            && self.quantity > Decimal::ZERO
            && self.unit_cost > Decimal::ZERO
    }

    fn to_new_line_item(&self) -> NewLineItem {
        let unit = self.unit.trim();
        NewLineItem {
            name: self.name.trim().to_owned(),
            quantity: self.quantity,
            unit: if unit.is_empty() { DEFAULT_UNIT.to_owned() } else { unit.to_owned() },
            estimated_unit_cost: self.unit_cost,
        }
    }
}

fn parse_amount(raw: &str) -> Decimal {
    Decimal::from_str(raw.trim()).unwrap_or(Decimal::ZERO)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDraft {
    pub project_id: ProjectId,
    pub vendor: String,
    pub category: RequestCategory,
    pub cost_code_id: CostCodeId,
    pub line_items: Vec<LineItemDraft>,
    pub need_by: NeedBy,
    pub urgency: Urgency,
    pub notes: String,
    pub delivery_method: DeliveryMethod,
    pub delivery_address: Option<String>,
    pub attachments: Vec<String>,
}

impl RequestDraft {
    /// An empty form with the same defaults the request screen starts from.
    pub fn new(project_id: ProjectId, cost_code_id: CostCodeId) -> Self {
        Self {
            project_id,
            vendor: String::new(),
            category: RequestCategory::Materials,
            cost_code_id,
            line_items: Vec::new(),
            need_by: NeedBy::ThisWeek,
            urgency: Urgency::Normal,
            notes: String::new(),
            delivery_method: DeliveryMethod::Pickup,
            delivery_address: None,
            attachments: Vec::new(),
        }
    }

    pub fn valid_line_items(&self) -> impl Iterator<Item = &LineItemDraft> {
        self.line_items.iter().filter(|item| item.is_valid())
    }

    pub fn is_submittable(&self) -> bool {
        self.validate().is_ok()
    }

    /// Running total over the rows that would be submitted.
    pub fn estimated_total(&self) -> Result<Decimal, ValidationError> {
        bounded_total(self.valid_line_items().map(|item| (item.quantity, item.unit_cost)))
    }

    pub fn validate(&self) -> Result<NewRequest, ValidationError> {
        let vendor = self.vendor.trim();
        if vendor.is_empty() {
            return Err(ValidationError::VendorRequired);
        }
        if self.project_id.0.trim().is_empty() {
            return Err(ValidationError::ProjectRequired);
        }
        if self.cost_code_id.0.trim().is_empty() {
            return Err(ValidationError::CostCodeRequired);
        }

        let line_items: Vec<NewLineItem> =
            self.valid_line_items().map(LineItemDraft::to_new_line_item).collect();
        if line_items.is_empty() {
            return Err(ValidationError::NoValidLineItems);
        }

        let delivery_address = match self.delivery_method {
            DeliveryMethod::Delivery => self
                .delivery_address
                .as_deref()
                .map(str::trim)
                .filter(|address| !address.is_empty())
                .map(str::to_owned),
            DeliveryMethod::Pickup => None,
        };

        Ok(NewRequest {
            project_id: self.project_id.clone(),
            vendor: vendor.to_owned(),
            category: self.category,
            cost_code_id: self.cost_code_id.clone(),
            estimated_total: new_line_item_total(&line_items)?,
            line_items,
            need_by: self.need_by,
            urgency: self.urgency,
            notes: self.notes.trim().to_owned(),
            delivery_method: self.delivery_method,
            delivery_address,
            attachments: self.attachments.clone(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLineItem {
    pub name: String,
    pub quantity: Decimal,
    pub unit: String,
    pub estimated_unit_cost: Decimal,
}

/// A validated draft, ready to be created by the repository.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequest {
    pub project_id: ProjectId,
    pub vendor: String,
    pub category: RequestCategory,
    pub cost_code_id: CostCodeId,
    pub line_items: Vec<NewLineItem>,
    pub estimated_total: Decimal,
    pub need_by: NeedBy,
    pub urgency: Urgency,
    pub notes: String,
    pub delivery_method: DeliveryMethod,
    pub delivery_address: Option<String>,
    pub attachments: Vec<String>,
}

impl NewRequest {
    /// Re-checks a request received over the wire before it is persisted.
    pub fn verify(&self) -> Result<(), ValidationError> {
        if self.vendor.trim().is_empty() {
            return Err(ValidationError::VendorRequired);
        }
        if self.project_id.0.trim().is_empty() {
            return Err(ValidationError::ProjectRequired);
        }
        if self.cost_code_id.0.trim().is_empty() {
            return Err(ValidationError::CostCodeRequired);
        }
        if self.line_items.is_empty() {
            return Err(ValidationError::NoValidLineItems);
        }

        for (index, item) in self.line_items.iter().enumerate() {
            let complete = !item.name.trim().is_empty()
                && item.quantity > Decimal::ZERO
                && item.estimated_unit_cost > Decimal::ZERO;
            if !complete {
                return Err(ValidationError::InvalidLineItem { index });
            }
        }

        let expected = new_line_item_total(&self.line_items)?;
        if round_cents(self.estimated_total) != expected {
            return Err(ValidationError::EstimatedTotalMismatch {
                expected,
                actual: self.estimated_total,
            });
        }

        Ok(())
    }
}

fn new_line_item_total(items: &[NewLineItem]) -> Result<Decimal, ValidationError> {
    bounded_total(items.iter().map(|item| (item.quantity, item.estimated_unit_cost)))
}

fn bounded_total(
    rows: impl IntoIterator<Item = (Decimal, Decimal)>,
) -> Result<Decimal, ValidationError> {
    checked_extended_total(rows)
        .filter(|total| is_within_max_amount(*total))
        .ok_or(ValidationError::AmountOutOfRange)
}

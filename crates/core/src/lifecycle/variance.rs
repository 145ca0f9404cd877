use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::money::{format_usd, round_cents};
use crate::domain::request::PurchaseRequest;

/// Difference between the final and estimated totals of a purchase. Informational only; no
/// rule blocks a purchase on its size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variance {
    pub estimated_total: Decimal,
    pub final_total: Decimal,
    pub amount: Decimal,
    /// `None` when the estimate is zero or the ratio does not fit in a decimal.
    pub percent: Option<Decimal>,
}

impl Variance {
    pub fn between(estimated_total: Decimal, final_total: Decimal) -> Self {
        let amount = round_cents(final_total.saturating_sub(estimated_total));
        let percent = (estimated_total > Decimal::ZERO)
            .then(|| amount.checked_div(estimated_total)?.checked_mul(Decimal::ONE_HUNDRED))
            .flatten();

        Self { estimated_total, final_total, amount, percent }
    }

    /// Variance of a purchased request, `None` before purchase.
    pub fn of(request: &PurchaseRequest) -> Option<Self> {
        request
            .final_total()
            .map(|final_total| Self::between(request.header.estimated_total, final_total))
    }

    /// What the purchase sheet shows while the final total is being typed: an empty entry
    /// falls back to the estimate.
    pub fn preview(request: &PurchaseRequest, final_total: Option<Decimal>) -> Self {
        let estimated_total = request.header.estimated_total;
        Self::between(estimated_total, final_total.unwrap_or(estimated_total))
    }

    /// Percentage to one decimal place, `0.0` when there is no estimate to compare against.
    pub fn percent_display(&self) -> String {
        let mut rounded = self
            .percent
            .map(|percent| percent.round_dp_with_strategy(1, RoundingStrategy::MidpointAwayFromZero))
            .unwrap_or(Decimal::ZERO);
        rounded.rescale(1);
        rounded.to_string()
    }

    /// Signed dollar amount, e.g. `+$36.00`.
    pub fn amount_display(&self) -> String {
        if self.amount >= Decimal::ZERO {
            format!("+{}", format_usd(self.amount))
        } else {
            format_usd(self.amount)
        }
    }

    pub fn is_over_estimate(&self) -> bool {
        self.amount > Decimal::ZERO
    }
}

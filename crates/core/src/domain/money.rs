use rust_decimal::{Decimal, RoundingStrategy};

/// Largest amount, in whole dollars, a request or purchase may carry.
pub const MAX_AMOUNT_DOLLARS: i64 = 1_000_000_000_000;

pub fn is_within_max_amount(value: Decimal) -> bool {
    value.abs() <= Decimal::from(MAX_AMOUNT_DOLLARS)
}

/// Sum of quantity × unit cost to the cent, `None` when any step overflows.
pub fn checked_extended_total<I>(rows: I) -> Option<Decimal>
where
    I: IntoIterator<Item = (Decimal, Decimal)>,
{
    rows.into_iter()
        .try_fold(Decimal::ZERO, |total, (quantity, unit_cost)| {
            total.checked_add(quantity.checked_mul(unit_cost)?)
        })
        .map(round_cents)
}

/// Rounds an amount to whole cents, half away from zero.
pub fn round_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Formats an amount as US dollars with thousands separators, e.g. `$1,234.50`.
pub fn format_usd(value: Decimal) -> String {
    let mut rounded = round_cents(value);
    rounded.rescale(2);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let text = rounded.abs().to_string();
    let (whole, cents) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (index, digit) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let sign = if negative { "-" } else { "" };
    format!("{sign}${grouped}.{cents}")
}

use rust_decimal::Decimal;

use super::TradingConfig;

/// Buy discount below market, as a fraction.
///
/// The floor covers a round trip of fees plus the operator's minimum
/// discount (given in percent) plus the configured margin. Volatility can
/// widen the discount past the floor but never below it.
pub fn compute_discount(
    fee_rate: Decimal,
    min_discount_pct: Decimal,
    atr_pct: Decimal,
    config: &TradingConfig,
) -> Option<Decimal> {
    let floor = fee_rate
        .checked_mul(Decimal::TWO)?
        .checked_add(min_discount_pct.checked_div(Decimal::ONE_HUNDRED)?)?
        .checked_add(config.discount_margin)?;
    let volatility = atr_pct.checked_mul(config.atr_multiplier)?;

    Some(floor.max(volatility))
}

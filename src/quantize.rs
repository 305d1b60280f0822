//! Exact decimal quantization to exchange step and tick sizes.

use rust_decimal::{Decimal, RoundingStrategy};

/// Largest multiple of `step` that does not exceed `value`.
///
/// Returns `None` for a non-positive step or on overflow.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Option<Decimal> {
    if step <= Decimal::ZERO {
        return None;
    }
    value.checked_div(step)?.floor().checked_mul(step)
}

/// Nearest multiple of `tick`, ties rounding away from zero.
///
/// Returns `None` for a non-positive tick or on overflow.
pub fn round_to_tick(value: Decimal, tick: Decimal) -> Option<Decimal> {
    if tick <= Decimal::ZERO {
        return None;
    }
    value
        .checked_div(tick)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .checked_mul(tick)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(dec!(0.0012), dec!(0.00001)), Some(dec!(0.0012)));
        assert_eq!(floor_to_step(dec!(0.001234567), dec!(0.00001)), Some(dec!(0.00123)));
        assert_eq!(floor_to_step(dec!(0.000009), dec!(0.00001)), Some(dec!(0)));
        assert_eq!(floor_to_step(dec!(7), dec!(2.5)), Some(dec!(5)));
        assert_eq!(floor_to_step(dec!(1), Decimal::ZERO), None);
        assert_eq!(floor_to_step(dec!(1), dec!(-0.1)), None);
    }

    #[test]
    fn test_floor_to_step_is_largest_multiple_not_above_value() {
        let steps = [dec!(0.00001), dec!(0.001), dec!(0.25), dec!(1), dec!(3)];
        let values = [dec!(0.0000123), dec!(0.98765), dec!(1.5), dec!(10), dec!(123.456789)];

        for step in steps {
            for value in values {
                let q = floor_to_step(value, step).unwrap();
                assert!(q <= value, "{} > {} for step {}", q, value, step);
                assert!(value - q < step, "{} not maximal for step {}", q, step);
                assert_eq!(q % step, Decimal::ZERO);
            }
        }
    }

    #[test]
    fn test_round_to_tick_half_up() {
        assert_eq!(round_to_tick(dec!(99203.004), dec!(0.01)), Some(dec!(99203.00)));
        assert_eq!(round_to_tick(dec!(99203.005), dec!(0.01)), Some(dec!(99203.01)));
        assert_eq!(round_to_tick(dec!(99203.015), dec!(0.01)), Some(dec!(99203.02)));
        assert_eq!(round_to_tick(dec!(12.5), dec!(1)), Some(dec!(13)));
        assert_eq!(round_to_tick(dec!(13.5), dec!(1)), Some(dec!(14)));
        assert_eq!(round_to_tick(dec!(-2.5), dec!(1)), Some(dec!(-3)));
        assert_eq!(round_to_tick(dec!(1), Decimal::ZERO), None);
    }
}

use rust_decimal::Decimal;

use crate::models::Candle;

/// Minimum bars needed before the ATR is trusted.
const MIN_BARS: usize = 6;

/// Average true range over `candles` as a fraction of `price`.
///
/// `candles` must be ordered newest first; each bar's previous close is the
/// close of the bar after it in the slice, so `n` bars yield `n - 1` true
/// ranges. Returns `None` with fewer than six bars or a non-positive price.
pub fn atr_percent(candles: &[Candle], price: Decimal) -> Option<Decimal> {
    if candles.len() < MIN_BARS || price <= Decimal::ZERO {
        return None;
    }

    let mut sum = Decimal::ZERO;
    for pair in candles.windows(2) {
        sum = sum.checked_add(pair[0].true_range(pair[1].close))?;
    }

    let count = Decimal::from(candles.len() - 1);
    sum.checked_div(count)?.checked_div(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn bar(i: i64, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        let open_time = Utc::now() - Duration::minutes(15 * i);
        Candle {
            symbol: "BTCUSDT".to_string(),
            interval: "15m".to_string(),
            open_time,
            close_time: open_time + Duration::minutes(15),
            open: close,
            high,
            low,
            close,
            volume: Decimal::ZERO,
            quote_volume: Decimal::ZERO,
            trades_count: 0,
        }
    }

    #[test]
    fn test_atr_percent_of_flat_range() {
        // Every bar spans 1000 around a constant close: TR = 1000
        let candles: Vec<Candle> = (0..24)
            .map(|i| bar(i, dec!(100500), dec!(99500), dec!(100000)))
            .collect();

        assert_eq!(atr_percent(&candles, dec!(100000)), Some(dec!(0.01)));
    }

    #[test]
    fn test_atr_uses_previous_close_gaps() {
        // Newest first: the newest bar gapped up 2000 over the prior close
        let mut candles = vec![bar(0, dec!(102000), dec!(101900), dec!(101950))];
        candles.extend((1..6).map(|i| bar(i, dec!(100050), dec!(99950), dec!(100000))));

        // TRs: 2000, then four of 100 -> 2400 / 5 = 480
        assert_eq!(atr_percent(&candles, dec!(100000)), Some(dec!(0.0048)));
    }

    #[test]
    fn test_atr_needs_enough_bars() {
        let candles: Vec<Candle> = (0..5)
            .map(|i| bar(i, dec!(100500), dec!(99500), dec!(100000)))
            .collect();
        assert_eq!(atr_percent(&candles, dec!(100000)), None);
        assert_eq!(atr_percent(&[], dec!(100000)), None);

        let enough: Vec<Candle> = (0..6)
            .map(|i| bar(i, dec!(100500), dec!(99500), dec!(100000)))
            .collect();
        assert_eq!(atr_percent(&enough, Decimal::ZERO), None);
    }
}

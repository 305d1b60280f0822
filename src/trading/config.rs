//! Cycle engine constants.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Fixed parameters of the sell/buy cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Minimum time between realized sells, in hours (strictly exceeded)
    pub sell_interval_hours: i64,

    /// Fraction of the free base balance sold per cycle
    pub sell_fraction: Decimal,

    /// Free base balance below which no sell is attempted
    pub base_dust_floor: Decimal,

    /// Absolute minimum buy notional in quote currency
    pub min_buy_notional: Decimal,

    /// Open buys closer than this to the target price count as duplicates
    pub duplicate_price_tolerance: Decimal,

    /// Fee rate used when fill history is too thin
    pub fallback_fee_rate: Decimal,

    /// Filled orders required before percentile fees are trusted
    pub min_fills_for_fee_stats: i64,

    /// Orders sampled for fee percentiles
    pub fee_sample_size: i64,

    /// Net-proceeds multiplier when a sell has no recorded fee
    pub proceeds_fee_buffer: Decimal,

    /// Safety margin added on top of fees and the operator minimum discount
    pub discount_margin: Decimal,

    /// Bars in the ATR window
    pub atr_window: i64,

    /// Share of ATR percent applied as discount
    pub atr_multiplier: Decimal,

    /// ATR percent assumed when too few bars are stored
    pub atr_fallback: Decimal,

    /// Wait before re-fetching a filled sell that reported zero proceeds
    pub sell_refetch_delay_ms: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            sell_interval_hours: 24,
            sell_fraction: dec!(0.1),           // Sell 1/10 of free base
            base_dust_floor: dec!(0.0005),
            min_buy_notional: dec!(10),         // $10
            duplicate_price_tolerance: dec!(5), // $5
            fallback_fee_rate: dec!(0.0015),    // 0.15%
            min_fills_for_fee_stats: 20,
            fee_sample_size: 1000,
            proceeds_fee_buffer: dec!(0.998),   // Assume 0.2% fee
            discount_margin: dec!(0.005),       // 0.5%
            atr_window: 24,
            atr_multiplier: dec!(0.5),
            atr_fallback: dec!(0.01),           // 1%
            sell_refetch_delay_ms: 1000,
        }
    }
}

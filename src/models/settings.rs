//! Operator-controlled settings singleton.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Global settings, read fresh every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Master switch
    pub trading_enabled: bool,

    /// Compute decisions but never place orders
    pub dry_run: bool,

    /// Maximum concurrently open buy orders
    pub max_open_buys: i64,

    /// Minimum required discount after fees, in percent (0.6 = 0.6%)
    pub min_discount_net_fees: Decimal,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            trading_enabled: true,
            dry_run: true,
            max_open_buys: 2,
            min_discount_net_fees: dec!(0.6),
        }
    }
}

impl Settings {
    /// Trading disabled and not a dry run means the cycle has nothing to do.
    pub fn is_idle(&self) -> bool {
        !self.trading_enabled && !self.dry_run
    }
}

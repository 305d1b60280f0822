//! Exchange trading rules for a symbol.

use rust_decimal::Decimal;

/// Cached per-symbol filters. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolFilters {
    /// Quantity granularity
    pub step_size: Decimal,

    /// Price granularity
    pub tick_size: Decimal,

    pub min_qty: Decimal,

    /// Minimum price x quantity
    pub min_notional: Decimal,
}

impl SymbolFilters {
    /// Trading is only allowed when every granularity and floor is usable.
    pub fn is_tradable(&self) -> bool {
        self.step_size > Decimal::ZERO
            && self.tick_size > Decimal::ZERO
            && self.min_notional > Decimal::ZERO
    }
}

//! Data models for orders, cycles, candles, filters, and settings.

mod candle;
mod cycle;
mod filters;
mod order;
mod settings;

pub use candle::Candle;
pub use cycle::{Cycle, CycleStatus, CycleSummary};
pub use filters::SymbolFilters;
pub use order::{
    client_order_id, is_own_client_id, smoke_client_order_id, Environment, Order, OrderSide,
    OrderStatus, OrderType,
};
pub use settings::Settings;

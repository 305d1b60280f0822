//! The exchange seam the engine is written against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{OrderSide, OrderType, SymbolFilters};
use crate::quantize::{floor_to_step, round_to_tick};

use super::error::{ExchangeError, FilterViolation};
use super::types::{AccountInfo, ExchangeOrder, Kline, OrderAck, OrderRef, OrderRequest};

/// Spot-market operations used by the cycle engine.
///
/// Implementations own their filter cache. The engine receives one as an
/// `Arc<dyn Exchange>` so tests can substitute an in-memory fake.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Latest trade price. Returns zero on failure; callers must treat zero
    /// as unusable.
    async fn price(&self, symbol: &str) -> Decimal;

    /// Cached filters, fetching trading rules when absent. `Ok(None)` means
    /// the exchange did not report usable filters for the symbol.
    async fn filters(&self, symbol: &str) -> Result<Option<SymbolFilters>, ExchangeError>;

    /// Re-fetch trading rules and replace the cache entry.
    async fn refresh_filters(&self, symbol: &str) -> Result<Option<SymbolFilters>, ExchangeError>;

    async fn account(&self) -> Result<AccountInfo, ExchangeError>;

    async fn open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    async fn order_status(
        &self,
        symbol: &str,
        order: &OrderRef,
    ) -> Result<ExchangeOrder, ExchangeError>;

    /// Validate against cached filters, then submit.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        order: &OrderRef,
    ) -> Result<ExchangeOrder, ExchangeError>;

    /// Candles starting at `start`, oldest first.
    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        limit: u16,
    ) -> Result<Vec<Kline>, ExchangeError>;
}

/// An order request after quantization against the symbol's filters.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedOrder {
    pub quantity: Decimal,
    pub price: Option<Decimal>,
}

/// Quantize and check an order against `filters`.
///
/// Quantity is floored to the step size and must reach the minimum quantity.
/// A price is rounded to the tick size; buys must also clear the minimum
/// notional.
pub fn validate_order(
    request: &OrderRequest,
    filters: &SymbolFilters,
) -> Result<ValidatedOrder, FilterViolation> {
    let quantity = floor_to_step(request.quantity, filters.step_size).ok_or(
        FilterViolation::Unquantizable {
            value: request.quantity,
            granularity: filters.step_size,
        },
    )?;

    if quantity.is_zero() {
        return Err(FilterViolation::ZeroQuantity {
            step: filters.step_size,
        });
    }
    if quantity < filters.min_qty {
        return Err(FilterViolation::BelowMinQty {
            qty: quantity,
            min: filters.min_qty,
        });
    }

    let price = match request.price {
        Some(p) => Some(round_to_tick(p, filters.tick_size).ok_or(
            FilterViolation::Unquantizable {
                value: p,
                granularity: filters.tick_size,
            },
        )?),
        None => None,
    };

    if request.order_type == OrderType::Limit && price.is_none() {
        return Err(FilterViolation::MissingLimitPrice);
    }

    if let (OrderSide::Buy, Some(p)) = (request.side, price) {
        let notional = quantity
            .checked_mul(p)
            .ok_or(FilterViolation::Overflow("notional"))?;
        if notional < filters.min_notional {
            return Err(FilterViolation::BelowMinNotional {
                notional,
                min: filters.min_notional,
            });
        }
    }

    Ok(ValidatedOrder { quantity, price })
}

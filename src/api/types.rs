//! Response and request types for the exchange REST API.
//!
//! Every endpoint gets its own struct; fields the exchange may omit are
//! `Option` or carry `#[serde(default)]`.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::models::{OrderSide, OrderType};

/// `/api/v3/ticker/price`
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: Decimal,
}

/// `/api/v3/time`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTime {
    pub server_time: i64,
}

/// `/api/v3/exchangeInfo`
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    #[serde(default)]
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub filters: Vec<RawFilter>,
}

/// One entry of a symbol's filter list. Only the fields of the filter types
/// we read are modelled.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFilter {
    pub filter_type: String,
    pub step_size: Option<Decimal>,
    pub min_qty: Option<Decimal>,
    pub tick_size: Option<Decimal>,
    pub min_notional: Option<Decimal>,
}

/// `/api/v3/account`
#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub balances: Vec<Balance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    #[serde(default)]
    pub locked: Decimal,
}

impl AccountInfo {
    pub fn balance(&self, asset: &str) -> Option<&Balance> {
        self.balances.iter().find(|b| b.asset == asset)
    }

    pub fn free(&self, asset: &str) -> Option<Decimal> {
        self.balance(asset).map(|b| b.free)
    }
}

/// Order as reported by `/api/v3/order` and `/api/v3/openOrders`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeOrder {
    pub symbol: String,
    pub order_id: i64,
    pub client_order_id: String,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub orig_qty: Decimal,
    #[serde(default)]
    pub executed_qty: Decimal,
    #[serde(default, alias = "cumQuoteQty", alias = "cumulativeQuoteQty")]
    pub cummulative_quote_qty: Decimal,
    pub status: String,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub update_time: Option<i64>,
}

/// Response to an order placement (FULL response type).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub symbol: String,
    pub order_id: i64,
    pub client_order_id: String,
    pub transact_time: Option<i64>,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub orig_qty: Decimal,
    #[serde(default)]
    pub executed_qty: Decimal,
    #[serde(default, alias = "cumQuoteQty", alias = "cumulativeQuoteQty")]
    pub cummulative_quote_qty: Decimal,
    pub status: String,
    #[serde(default)]
    pub fills: Vec<Fill>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub price: Decimal,
    pub qty: Decimal,
    pub commission: Decimal,
    pub commission_asset: String,
}

/// Commission totals derived from an order's fills.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeSummary {
    pub amount: Decimal,
    pub asset: String,
    /// Commission in quote currency when it can be derived from the fills
    pub quote_equivalent: Option<Decimal>,
}

impl OrderAck {
    /// Sum commissions over fills charged in the first fill's asset.
    ///
    /// A quote-currency commission is taken as-is; a base-asset commission
    /// is valued at each fill's price. Other assets need an external price,
    /// so `quote_equivalent` stays `None`. So does a fill charged in a second
    /// asset, which `amount` cannot represent.
    pub fn fee_summary(&self, base_asset: &str, quote_asset: &str) -> Option<FeeSummary> {
        let asset = self.fills.first()?.commission_asset.clone();
        let mut amount = Decimal::ZERO;
        let mut quote = Some(Decimal::ZERO);

        for fill in &self.fills {
            if fill.commission_asset != asset {
                warn!(
                    client_id = %self.client_order_id,
                    asset = %fill.commission_asset,
                    commission = %fill.commission,
                    primary = %asset,
                    "Fill charged in a second commission asset, quote fee unknown"
                );
                quote = None;
                continue;
            }

            amount = amount.checked_add(fill.commission)?;
            let fill_quote = if asset == quote_asset {
                Some(fill.commission)
            } else if asset == base_asset {
                fill.commission.checked_mul(fill.price)
            } else {
                None
            };
            quote = quote.zip(fill_quote).and_then(|(q, f)| q.checked_add(f));
        }

        Some(FeeSummary {
            amount,
            asset,
            quote_equivalent: quote,
        })
    }
}

/// Error body returned by the exchange on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

/// One `/api/v3/klines` bar.
#[derive(Debug, Clone, PartialEq)]
pub struct Kline {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: DateTime<Utc>,
    pub quote_volume: Decimal,
    pub trades_count: i64,
}

impl Kline {
    /// Parse the positional array form the klines endpoint returns.
    pub fn from_row(row: &[Value]) -> Option<Self> {
        let ts = |i: usize| {
            row.get(i)
                .and_then(Value::as_i64)
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        };
        let dec = |i: usize| -> Option<Decimal> {
            match row.get(i)? {
                Value::String(s) => s.parse().ok(),
                Value::Number(n) => n.to_string().parse().ok(),
                _ => None,
            }
        };

        Some(Kline {
            open_time: ts(0)?,
            open: dec(1)?,
            high: dec(2)?,
            low: dec(3)?,
            close: dec(4)?,
            volume: dec(5)?,
            close_time: ts(6)?,
            quote_volume: dec(7)?,
            trades_count: row.get(8).and_then(Value::as_i64).unwrap_or(0),
        })
    }
}

/// Order placement request, before filter validation.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub client_order_id: String,
}

/// Reference to an existing order on the exchange.
#[derive(Debug, Clone)]
pub enum OrderRef {
    ExchangeId(i64),
    ClientId(String),
}

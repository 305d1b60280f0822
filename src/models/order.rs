//! Order model: one row per exchange order attempt.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Execution environment an order belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Live,
    Testnet,
    Paper,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Live => "live",
            Environment::Testnet => "testnet",
            Environment::Paper => "paper",
        }
    }

    pub fn is_paper(&self) -> bool {
        matches!(self, Environment::Paper)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "live" => Ok(Environment::Live),
            "testnet" => Ok(Environment::Testnet),
            "paper" => Ok(Environment::Paper),
            other => Err(anyhow!("unknown environment: {}", other)),
        }
    }
}

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// Prefix used in client order ids.
    pub fn client_id_prefix(&self) -> &'static str {
        match self {
            OrderSide::Buy => "ABUY",
            OrderSide::Sell => "ASELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(anyhow!("unknown order side: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "LIMIT" => Ok(OrderType::Limit),
            "MARKET" => Ok(OrderType::Market),
            other => Err(anyhow!("unsupported order type: {}", other)),
        }
    }
}

/// Lifecycle status of an order.
///
/// Status only moves forward: NEW -> PARTIALLY_FILLED -> FILLED, or into one
/// of the other terminal states. See [`OrderStatus::can_advance_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Failed => "FAILED",
        }
    }

    /// Map an exchange status string onto the ledger's status set.
    ///
    /// Exchange-specific terminal states collapse into CANCELED (expired,
    /// pending cancel) or FAILED (rejected).
    pub fn from_exchange(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "CANCELLED" | "PENDING_CANCEL" | "EXPIRED" | "EXPIRED_IN_MATCH" => {
                Some(OrderStatus::Canceled)
            }
            "REJECTED" | "FAILED" => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Failed
        )
    }

    pub fn is_filled_or_partial(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::PartiallyFilled)
    }

    fn rank(&self) -> u8 {
        match self {
            OrderStatus::New => 0,
            OrderStatus::PartiallyFilled => 1,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Failed => 2,
        }
    }

    /// True when moving from `self` to `next` does not regress the lifecycle.
    pub fn can_advance_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return *self == next;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_exchange(s).ok_or_else(|| anyhow!("unknown order status: {}", s))
    }
}

/// Build a fresh idempotency key: `<SIDE-PREFIX>_<ENV>_<timestamp-ms>`.
pub fn client_order_id(side: OrderSide, env: Environment, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        side.client_id_prefix(),
        env.as_str(),
        at.timestamp_millis()
    )
}

/// Client id for the `smoke` round trip. Reconciliation never imports it.
pub fn smoke_client_order_id(env: Environment, at: DateTime<Utc>) -> String {
    format!("SMOKE_{}_{}", env.as_str(), at.timestamp_millis())
}

/// Whether a client order id was issued by this engine for `env`.
pub fn is_own_client_id(client_id: &str, env: Environment) -> bool {
    [OrderSide::Buy, OrderSide::Sell].iter().any(|side| {
        client_id.starts_with(&format!("{}_{}_", side.client_id_prefix(), env.as_str()))
    })
}

/// Ledger record of an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Idempotency key, globally unique
    pub client_order_id: String,

    /// Exchange-assigned order id
    pub exchange_order_id: String,

    pub env: Environment,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,

    /// Limit price, or average fill price for market orders
    pub price: Decimal,

    /// Originally requested base quantity
    pub orig_qty: Decimal,

    /// Executed base quantity
    pub executed_qty: Decimal,

    /// Executed quote-currency amount
    pub executed_quote_qty: Decimal,

    /// Commission charged, in `fee_asset` units
    pub fee_amount: Option<Decimal>,
    pub fee_asset: Option<String>,

    /// Commission expressed in quote currency
    pub fee_quote: Option<Decimal>,

    /// Effective fee rate (fee_quote / executed_quote_qty)
    pub fee_rate: Option<Decimal>,

    /// Discount below market the order was priced at (buys only)
    pub discount_rate: Option<Decimal>,

    /// Cycle this order belongs to
    pub cycle_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_never_regresses() {
        assert!(OrderStatus::New.can_advance_to(OrderStatus::PartiallyFilled));
        assert!(OrderStatus::New.can_advance_to(OrderStatus::Filled));
        assert!(OrderStatus::PartiallyFilled.can_advance_to(OrderStatus::Canceled));
        assert!(!OrderStatus::PartiallyFilled.can_advance_to(OrderStatus::New));
        assert!(!OrderStatus::Filled.can_advance_to(OrderStatus::Canceled));
        assert!(!OrderStatus::Canceled.can_advance_to(OrderStatus::New));
        assert!(OrderStatus::Filled.can_advance_to(OrderStatus::Filled));
    }

    #[test]
    fn test_exchange_status_mapping() {
        assert_eq!(OrderStatus::from_exchange("EXPIRED"), Some(OrderStatus::Canceled));
        assert_eq!(OrderStatus::from_exchange("REJECTED"), Some(OrderStatus::Failed));
        assert_eq!(
            OrderStatus::from_exchange("partially_filled"),
            Some(OrderStatus::PartiallyFilled)
        );
        assert_eq!(OrderStatus::from_exchange("WHATEVER"), None);
    }

    #[test]
    fn test_client_order_id_format_and_ownership() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let id = client_order_id(OrderSide::Sell, Environment::Testnet, at);
        assert_eq!(id, "ASELL_testnet_1700000000123");

        assert!(is_own_client_id(&id, Environment::Testnet));
        assert!(!is_own_client_id(&id, Environment::Live));
        assert!(is_own_client_id("ABUY_live_1", Environment::Live));
        assert!(!is_own_client_id("web_abc123", Environment::Live));
    }

    #[test]
    fn test_smoke_order_is_not_an_engine_order() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let id = smoke_client_order_id(Environment::Testnet, at);
        assert_eq!(id, "SMOKE_testnet_1700000000123");

        for env in [Environment::Paper, Environment::Testnet, Environment::Live] {
            assert!(!is_own_client_id(&id, env));
        }
    }
}

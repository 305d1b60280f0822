//! Deterministic in-memory exchange for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::api::{
    validate_order, AccountInfo, Balance, Exchange, ExchangeError, ExchangeOrder, Fill, Kline,
    OrderAck, OrderRef, OrderRequest,
};
use crate::config::BotConfig;
use crate::models::{Environment, OrderType, SymbolFilters};

pub const SYMBOL: &str = "BTCUSDT";

/// Testnet BTCUSDT configuration with no credentials.
pub fn bot_config() -> BotConfig {
    BotConfig {
        env: Environment::Testnet,
        rest_base_url: "http://127.0.0.1:9".to_string(),
        api_key: String::new(),
        api_secret: String::new(),
        loop_minutes: 60,
        symbol: SYMBOL.to_string(),
        base_asset: "BTC".to_string(),
        quote_asset: "USDT".to_string(),
        candle_interval: "15m".to_string(),
        candle_backfill_days: 1,
    }
}

/// Mutable state behind the fake. Tests reach in through
/// [`FakeExchange::state`].
pub struct FakeState {
    pub price: Decimal,
    pub filters: Option<SymbolFilters>,
    pub balances: HashMap<String, Decimal>,
    pub fail_account: bool,
    pub fail_open_orders: bool,
    pub fail_place: bool,
    /// Report zero proceeds on the placement ack of market orders; the
    /// order lookup still returns the real amount.
    pub delayed_proceeds: bool,
    /// Commission charged on market fills, in quote currency per unit of
    /// proceeds
    pub commission_rate: Decimal,
    pub open_orders: Vec<ExchangeOrder>,
    /// Authoritative order state keyed by client order id
    pub orders: HashMap<String, ExchangeOrder>,
    pub placed: Vec<OrderRequest>,
    pub canceled: Vec<OrderRef>,
    pub klines: Vec<Kline>,
    next_order_id: i64,
}

pub struct FakeExchange {
    state: Mutex<FakeState>,
}

impl FakeExchange {
    /// BTCUSDT at 100000 with 0.012 BTC and 300 USDT free.
    pub fn new() -> Self {
        let balances = HashMap::from([
            ("BTC".to_string(), dec!(0.012)),
            ("USDT".to_string(), dec!(300)),
        ]);

        Self {
            state: Mutex::new(FakeState {
                price: dec!(100000),
                filters: Some(SymbolFilters {
                    step_size: dec!(0.00001),
                    tick_size: dec!(0.01),
                    min_qty: dec!(0.00001),
                    min_notional: dec!(10),
                }),
                balances,
                fail_account: false,
                fail_open_orders: false,
                fail_place: false,
                delayed_proceeds: false,
                commission_rate: dec!(0.001),
                open_orders: Vec::new(),
                orders: HashMap::new(),
                placed: Vec::new(),
                canceled: Vec::new(),
                klines: Vec::new(),
                next_order_id: 1000,
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Put a resting order on the fake book.
    pub fn add_open_order(&self, client_id: &str, side: &str, price: Decimal, qty: Decimal) {
        let mut s = self.state();
        s.next_order_id += 1;
        let order = ExchangeOrder {
            symbol: SYMBOL.to_string(),
            order_id: s.next_order_id,
            client_order_id: client_id.to_string(),
            price,
            orig_qty: qty,
            executed_qty: Decimal::ZERO,
            cummulative_quote_qty: Decimal::ZERO,
            status: "NEW".to_string(),
            side: side.to_string(),
            order_type: "LIMIT".to_string(),
            update_time: None,
        };
        s.orders.insert(client_id.to_string(), order.clone());
        s.open_orders.push(order);
    }

    /// Fill a resting order completely and take it off the book.
    pub fn fill_open_order(&self, client_id: &str) {
        let mut s = self.state();
        s.open_orders.retain(|o| o.client_order_id != client_id);
        if let Some(o) = s.orders.get_mut(client_id) {
            o.executed_qty = o.orig_qty;
            o.cummulative_quote_qty = o.orig_qty * o.price;
            o.status = "FILLED".to_string();
        }
    }
}

fn api_error(status: u16, msg: &str) -> ExchangeError {
    ExchangeError::Api {
        status,
        code: None,
        msg: msg.to_string(),
    }
}

#[async_trait]
impl Exchange for FakeExchange {
    async fn price(&self, _symbol: &str) -> Decimal {
        self.state().price
    }

    async fn filters(&self, _symbol: &str) -> Result<Option<SymbolFilters>, ExchangeError> {
        Ok(self.state().filters)
    }

    async fn refresh_filters(&self, _symbol: &str) -> Result<Option<SymbolFilters>, ExchangeError> {
        Ok(self.state().filters)
    }

    async fn account(&self) -> Result<AccountInfo, ExchangeError> {
        let s = self.state();
        if s.fail_account {
            return Err(api_error(503, "account unavailable"));
        }
        Ok(AccountInfo {
            balances: s
                .balances
                .iter()
                .map(|(asset, free)| Balance {
                    asset: asset.clone(),
                    free: *free,
                    locked: Decimal::ZERO,
                })
                .collect(),
        })
    }

    async fn open_orders(&self, _symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let s = self.state();
        if s.fail_open_orders {
            return Err(api_error(503, "open orders unavailable"));
        }
        Ok(s.open_orders.clone())
    }

    async fn order_status(
        &self,
        _symbol: &str,
        order: &OrderRef,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let s = self.state();
        let found = match order {
            OrderRef::ClientId(id) => s.orders.get(id),
            OrderRef::ExchangeId(id) => s.orders.values().find(|o| o.order_id == *id),
        };
        found
            .cloned()
            .ok_or_else(|| api_error(400, "Order does not exist."))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut s = self.state();
        let filters = s
            .filters
            .ok_or_else(|| ExchangeError::FiltersUnavailable(request.symbol.clone()))?;
        let validated = validate_order(request, &filters)?;

        if s.fail_place {
            return Err(api_error(400, "Account has insufficient balance for requested action."));
        }

        s.placed.push(request.clone());
        s.next_order_id += 1;
        let order_id = s.next_order_id;

        match request.order_type {
            OrderType::Market => {
                let proceeds = validated.quantity * s.price;
                let commission = proceeds * s.commission_rate;
                let fill_price = s.price;

                if let Some(btc) = s.balances.get_mut("BTC") {
                    *btc -= validated.quantity;
                }
                if let Some(usdt) = s.balances.get_mut("USDT") {
                    *usdt += proceeds - commission;
                }

                s.orders.insert(
                    request.client_order_id.clone(),
                    ExchangeOrder {
                        symbol: request.symbol.clone(),
                        order_id,
                        client_order_id: request.client_order_id.clone(),
                        price: Decimal::ZERO,
                        orig_qty: validated.quantity,
                        executed_qty: validated.quantity,
                        cummulative_quote_qty: proceeds,
                        status: "FILLED".to_string(),
                        side: request.side.as_str().to_string(),
                        order_type: "MARKET".to_string(),
                        update_time: None,
                    },
                );

                Ok(OrderAck {
                    symbol: request.symbol.clone(),
                    order_id,
                    client_order_id: request.client_order_id.clone(),
                    transact_time: None,
                    price: Decimal::ZERO,
                    orig_qty: validated.quantity,
                    executed_qty: validated.quantity,
                    cummulative_quote_qty: if s.delayed_proceeds {
                        Decimal::ZERO
                    } else {
                        proceeds
                    },
                    status: "FILLED".to_string(),
                    fills: vec![Fill {
                        price: fill_price,
                        qty: validated.quantity,
                        commission,
                        commission_asset: "USDT".to_string(),
                    }],
                })
            }
            OrderType::Limit => {
                let price = validated.price.unwrap_or(Decimal::ZERO);
                if let Some(usdt) = s.balances.get_mut("USDT") {
                    *usdt -= validated.quantity * price;
                }

                let order = ExchangeOrder {
                    symbol: request.symbol.clone(),
                    order_id,
                    client_order_id: request.client_order_id.clone(),
                    price,
                    orig_qty: validated.quantity,
                    executed_qty: Decimal::ZERO,
                    cummulative_quote_qty: Decimal::ZERO,
                    status: "NEW".to_string(),
                    side: request.side.as_str().to_string(),
                    order_type: "LIMIT".to_string(),
                    update_time: None,
                };
                s.orders
                    .insert(request.client_order_id.clone(), order.clone());
                s.open_orders.push(order);

                Ok(OrderAck {
                    symbol: request.symbol.clone(),
                    order_id,
                    client_order_id: request.client_order_id.clone(),
                    transact_time: None,
                    price,
                    orig_qty: validated.quantity,
                    executed_qty: Decimal::ZERO,
                    cummulative_quote_qty: Decimal::ZERO,
                    status: "NEW".to_string(),
                    fills: Vec::new(),
                })
            }
        }
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        order: &OrderRef,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let mut s = self.state();
        s.canceled.push(order.clone());

        let client_id = match order {
            OrderRef::ClientId(id) => Some(id.clone()),
            OrderRef::ExchangeId(id) => s
                .orders
                .values()
                .find(|o| o.order_id == *id)
                .map(|o| o.client_order_id.clone()),
        }
        .ok_or_else(|| api_error(400, "Unknown order sent."))?;

        s.open_orders.retain(|o| o.client_order_id != client_id);
        let o = s
            .orders
            .get_mut(&client_id)
            .ok_or_else(|| api_error(400, "Unknown order sent."))?;
        o.status = "CANCELED".to_string();
        Ok(o.clone())
    }

    async fn klines(
        &self,
        _symbol: &str,
        _interval: &str,
        start: DateTime<Utc>,
        limit: u16,
    ) -> Result<Vec<Kline>, ExchangeError> {
        Ok(self
            .state()
            .klines
            .iter()
            .filter(|k| k.open_time >= start)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

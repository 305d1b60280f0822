//! Binance spot REST client.
//!
//! Public reads (price, exchange info, klines, server time) retry with
//! exponential backoff. Account reads and order writes are signed with
//! HMAC-SHA256 over the query string, using a timestamp corrected by the
//! measured server clock offset. In paper mode, order writes never leave the
//! process: they return a synthetic filled response.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::BotConfig;
use crate::models::{Environment, OrderType, SymbolFilters};

use super::error::{ExchangeError, FilterViolation};
use super::exchange::{validate_order, Exchange};
use super::types::*;

type HmacSha256 = Hmac<Sha256>;

const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const RECV_WINDOW_MS: u64 = 5_000;

/// Binance REST client. Owns the per-symbol filter cache.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    env: Environment,
    /// Server time minus local time, in milliseconds
    time_offset_ms: AtomicI64,
    filters: RwLock<HashMap<String, SymbolFilters>>,
}

impl BinanceClient {
    pub fn new(config: &BotConfig) -> Result<Self, ExchangeError> {
        let http = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;

        Ok(Self {
            http,
            base_url: config.rest_base_url.clone(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            env: config.env,
            time_offset_ms: AtomicI64::new(0),
            filters: RwLock::new(HashMap::new()),
        })
    }

    /// Measure the exchange clock offset used for signed timestamps.
    pub async fn sync_time(&self) -> Result<i64, ExchangeError> {
        let before = Utc::now().timestamp_millis();
        let time: ServerTime = self.public_get("/api/v3/time", &[]).await?;
        let after = Utc::now().timestamp_millis();

        let offset = time.server_time - (before + after) / 2;
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        debug!(offset_ms = offset, "Synchronized exchange clock");
        Ok(offset)
    }

    fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_max_interval(Duration::from_secs(2))
            .with_max_elapsed_time(Some(Duration::from_secs(8)))
            .build();

        let http = &self.http;
        let url = &url;
        backoff::future::retry(policy, move || async move {
            let resp = http
                .get(url)
                .query(params)
                .send()
                .await
                .map_err(|e| classify(e.into()))?;
            decode(resp).await.map_err(classify)
        })
        .await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(ExchangeError::MissingCredentials);
        }

        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", self.timestamp_ms().to_string()));

        let mut query = build_query_string(&params);
        append_signature_param(&self.api_secret, &mut query)?;

        let url = format!("{}{}?{}", self.base_url, path, query);
        let resp = self
            .http
            .request(method, url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;

        decode(resp).await
    }

    /// Synthetic FILLED response for paper mode.
    async fn paper_fill(
        &self,
        request: &OrderRequest,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<OrderAck, ExchangeError> {
        let fill_price = match price {
            Some(p) => p,
            None => self.price(&request.symbol).await,
        };
        let now = self.timestamp_ms();
        let quote = quantity
            .checked_mul(fill_price)
            .ok_or(FilterViolation::Overflow("paper fill proceeds"))?;

        info!(
            client_id = %request.client_order_id,
            side = %request.side,
            qty = %quantity,
            price = %fill_price,
            "[PAPER] Simulated fill"
        );

        Ok(OrderAck {
            symbol: request.symbol.clone(),
            order_id: now,
            client_order_id: request.client_order_id.clone(),
            transact_time: Some(now),
            price: price.unwrap_or(Decimal::ZERO),
            orig_qty: quantity,
            executed_qty: quantity,
            cummulative_quote_qty: quote,
            status: "FILLED".to_string(),
            fills: Vec::new(),
        })
    }

    async fn cached_filters(&self, symbol: &str) -> Option<SymbolFilters> {
        self.filters.read().await.get(symbol).copied()
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn price(&self, symbol: &str) -> Decimal {
        let params = [("symbol", symbol.to_string())];
        match self
            .public_get::<TickerPrice>("/api/v3/ticker/price", &params)
            .await
        {
            Ok(t) => t.price,
            Err(e) => {
                warn!(symbol, error = %e, "Price fetch failed");
                Decimal::ZERO
            }
        }
    }

    async fn filters(&self, symbol: &str) -> Result<Option<SymbolFilters>, ExchangeError> {
        if let Some(f) = self.cached_filters(symbol).await {
            return Ok(Some(f));
        }
        self.refresh_filters(symbol).await
    }

    async fn refresh_filters(&self, symbol: &str) -> Result<Option<SymbolFilters>, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let info: ExchangeInfo = self.public_get("/api/v3/exchangeInfo", &params).await?;

        let mut cache = self.filters.write().await;
        for s in &info.symbols {
            match parse_filters(s) {
                Some(f) => {
                    debug!(symbol = %s.symbol, step = %f.step_size, tick = %f.tick_size, "Cached filters");
                    cache.insert(s.symbol.clone(), f);
                }
                None => warn!(symbol = %s.symbol, "Exchange info lacks LOT_SIZE or PRICE_FILTER"),
            }
        }

        Ok(cache.get(symbol).copied())
    }

    async fn account(&self) -> Result<AccountInfo, ExchangeError> {
        self.signed(Method::GET, "/api/v3/account", Vec::new()).await
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.signed(
            Method::GET,
            "/api/v3/openOrders",
            vec![("symbol", symbol.to_string())],
        )
        .await
    }

    async fn order_status(
        &self,
        symbol: &str,
        order: &OrderRef,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let params = vec![("symbol", symbol.to_string()), order_ref_param(order)];
        self.signed(Method::GET, "/api/v3/order", params).await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let filters = match self.cached_filters(&request.symbol).await {
            Some(f) => f,
            None => self
                .refresh_filters(&request.symbol)
                .await?
                .ok_or_else(|| ExchangeError::FiltersUnavailable(request.symbol.clone()))?,
        };
        let validated = validate_order(request, &filters)?;

        if self.env.is_paper() {
            return self
                .paper_fill(request, validated.quantity, validated.price)
                .await;
        }

        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", request.order_type.as_str().to_string()),
            ("quantity", validated.quantity.normalize().to_string()),
            ("newClientOrderId", request.client_order_id.clone()),
            ("newOrderRespType", "FULL".to_string()),
        ];
        if request.order_type == OrderType::Limit {
            if let Some(p) = validated.price {
                params.push(("price", p.normalize().to_string()));
            }
            params.push(("timeInForce", "GTC".to_string()));
        }

        self.signed(Method::POST, "/api/v3/order", params).await
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order: &OrderRef,
    ) -> Result<ExchangeOrder, ExchangeError> {
        if self.env.is_paper() {
            info!(symbol, order = ?order, "[PAPER] Simulated cancel");
            let (order_id, client_order_id) = match order {
                OrderRef::ExchangeId(id) => (*id, String::new()),
                OrderRef::ClientId(id) => (0, id.clone()),
            };
            return Ok(ExchangeOrder {
                symbol: symbol.to_string(),
                order_id,
                client_order_id,
                price: Decimal::ZERO,
                orig_qty: Decimal::ZERO,
                executed_qty: Decimal::ZERO,
                cummulative_quote_qty: Decimal::ZERO,
                status: "CANCELED".to_string(),
                side: String::new(),
                order_type: String::new(),
                update_time: Some(self.timestamp_ms()),
            });
        }

        let params = vec![("symbol", symbol.to_string()), order_ref_param(order)];
        self.signed(Method::DELETE, "/api/v3/order", params).await
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        limit: u16,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("startTime", start.timestamp_millis().to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<Vec<Value>> = self.public_get("/api/v3/klines", &params).await?;

        let total = rows.len();
        let klines: Vec<Kline> = rows.iter().filter_map(|r| Kline::from_row(r)).collect();
        if klines.len() < total {
            warn!(symbol, skipped = total - klines.len(), "Skipped malformed kline rows");
        }
        Ok(klines)
    }
}

fn order_ref_param(order: &OrderRef) -> (&'static str, String) {
    match order {
        OrderRef::ExchangeId(id) => ("orderId", id.to_string()),
        OrderRef::ClientId(id) => ("origClientOrderId", id.clone()),
    }
}

/// Extract step/tick/minQty/minNotional. Returns `None` unless both the lot
/// size and price filters are present.
fn parse_filters(info: &SymbolInfo) -> Option<SymbolFilters> {
    let mut step_size = None;
    let mut tick_size = None;
    let mut min_qty = Decimal::ZERO;
    let mut min_notional = Decimal::ZERO;

    for f in &info.filters {
        match f.filter_type.as_str() {
            "LOT_SIZE" => {
                step_size = f.step_size;
                min_qty = f.min_qty.unwrap_or(Decimal::ZERO);
            }
            "PRICE_FILTER" => tick_size = f.tick_size,
            "NOTIONAL" | "MIN_NOTIONAL" => {
                min_notional = f.min_notional.unwrap_or(Decimal::ZERO);
            }
            _ => {}
        }
    }

    Some(SymbolFilters {
        step_size: step_size?,
        tick_size: tick_size?,
        min_qty,
        min_notional,
    })
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ExchangeError> {
    let status = resp.status();
    let body = resp.text().await?;

    if !status.is_success() {
        return Err(match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(err) => ExchangeError::Api {
                status: status.as_u16(),
                code: Some(err.code),
                msg: err.msg,
            },
            Err(_) => ExchangeError::Api {
                status: status.as_u16(),
                code: None,
                msg: body,
            },
        });
    }

    serde_json::from_str(&body).map_err(|e| ExchangeError::Decode(format!("{}: {}", e, body)))
}

fn classify(err: ExchangeError) -> backoff::Error<ExchangeError> {
    if err.is_transient() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

fn build_query_string(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn append_signature_param(secret: &str, query: &mut String) -> Result<(), ExchangeError> {
    let signature = signature_hex(secret, query)?;
    query.push_str("&signature=");
    query.push_str(&signature);
    Ok(())
}

fn signature_hex(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Signature(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

//! The cycle engine: reconcile, gather inputs, then the sell and buy stages.
//!
//! A realized sell opens a cycle; the cycle's proceeds fund exactly one
//! limit buy below market. Re-entering any step is safe: the sell is gated
//! on the last realized sell and a cycle that already has a buy is never
//! paired again.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::api::{Exchange, OrderAck, OrderRef, OrderRequest};
use crate::config::BotConfig;
use crate::db::Database;
use crate::market::{atr_percent, MarketDataSyncer};
use crate::metrics::FeeStatsEstimator;
use crate::models::{
    client_order_id, Cycle, Environment, Order, OrderSide, OrderStatus, OrderType, Settings,
    SymbolFilters,
};
use crate::quantize::floor_to_step;

use super::discount::compute_discount;
use super::{CycleOutcome, Decision, Reconciler, TradingConfig};

/// Time left before the next sell is allowed, or `Ok` when the gate is open.
///
/// The gate opens only once strictly more than `interval` has passed since
/// the last realized sell.
pub fn sell_gate(
    last_sell_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    interval: Duration,
) -> Result<(), Duration> {
    match last_sell_at {
        None => Ok(()),
        Some(last) => {
            let elapsed = now - last;
            if elapsed > interval {
                Ok(())
            } else {
                Err(interval - elapsed)
            }
        }
    }
}

/// Balances, price, and rules captured once per cycle.
struct MarketSnapshot {
    price: Decimal,
    base_free: Decimal,
    quote_free: Decimal,
    filters: SymbolFilters,
}

/// Intermediates of the buy sizing, logged as one line.
#[derive(Default)]
struct BuySizing {
    cycle_id: String,
    sell_id: String,
    proceeds: Decimal,
    fee: Decimal,
    net: Decimal,
    fresh_free: Decimal,
    spend: Decimal,
    target_price: Decimal,
    quantity: Decimal,
    discount: Decimal,
    cap_reason: &'static str,
}

/// Runs one reconciliation-gated sell/buy iteration.
pub struct CycleEngine {
    exchange: Arc<dyn Exchange>,
    db: Database,
    config: TradingConfig,
    env: Environment,
    symbol: String,
    base_asset: String,
    quote_asset: String,
    candle_interval: String,
    reconciler: Reconciler,
    syncer: MarketDataSyncer,
    fee_stats: FeeStatsEstimator,
}

impl CycleEngine {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        db: Database,
        config: TradingConfig,
        bot: &BotConfig,
    ) -> Self {
        let reconciler = Reconciler::new(exchange.clone(), db.clone(), bot.env, &bot.symbol);
        let syncer = MarketDataSyncer::new(
            exchange.clone(),
            db.clone(),
            &bot.symbol,
            &bot.candle_interval,
            bot.candle_backfill_days,
        );
        let fee_stats = FeeStatsEstimator::new(
            exchange.clone(),
            db.clone(),
            &bot.quote_asset,
            config.fee_sample_size,
        );

        Self {
            exchange,
            db,
            config,
            env: bot.env,
            symbol: bot.symbol.clone(),
            base_asset: bot.base_asset.clone(),
            quote_asset: bot.quote_asset.clone(),
            candle_interval: bot.candle_interval.clone(),
            reconciler,
            syncer,
            fee_stats,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn syncer(&self) -> &MarketDataSyncer {
        &self.syncer
    }

    pub fn fee_stats(&self) -> &FeeStatsEstimator {
        &self.fee_stats
    }

    /// One full iteration. Errors here are ledger failures; every exchange
    /// or sizing problem is reported through the outcome instead.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        if !self.reconciler.reconcile().await {
            return Ok(abort("reconciliation failed"));
        }

        if let Err(e) = self.syncer.sync().await {
            warn!(error = %e, "[MARKET] Candle sync failed, ATR may fall back");
        }

        let Some(settings) = self.db.load_settings().await? else {
            return Ok(abort("settings missing"));
        };
        if settings.is_idle() {
            info!("[POLICY] Trading disabled and dry run off, skipping cycle");
            return Ok(abort("trading disabled"));
        }

        let fee_rate = match self.fee_stats.refresh().await {
            Ok(stats) => stats.conservative_rate(
                self.config.min_fills_for_fee_stats,
                self.config.fallback_fee_rate,
            ),
            Err(e) => {
                warn!(error = %e, "[STATS] Fee refresh failed, using fallback rate");
                self.config.fallback_fee_rate
            }
        };

        let snapshot = match self.snapshot().await {
            Ok(s) => s,
            Err(reason) => return Ok(abort(&reason)),
        };

        let now = Utc::now();
        let sell = self.sell_stage(&settings, &snapshot, now).await;
        if sell.is_fail() {
            error!(reason = %sell.reason(), "[CYCLE] Sell failed, skipping buy stage");
            return Ok(CycleOutcome::Completed { sell, buy: None });
        }

        let buy = self
            .buy_stage(&settings, &snapshot, fee_rate, Utc::now())
            .await;
        Ok(CycleOutcome::Completed {
            sell,
            buy: Some(buy),
        })
    }

    /// Account, price, and filters. Any gap aborts the cycle.
    async fn snapshot(&self) -> std::result::Result<MarketSnapshot, String> {
        let account = self
            .exchange
            .account()
            .await
            .map_err(|e| format!("account fetch failed: {}", e))?;

        let price = self.exchange.price(&self.symbol).await;
        if price <= Decimal::ZERO {
            return Err("price unavailable".to_string());
        }

        let (Some(base_free), Some(quote_free)) = (
            account.free(&self.base_asset),
            account.free(&self.quote_asset),
        ) else {
            return Err(format!(
                "balances for {}/{} missing from account",
                self.base_asset, self.quote_asset
            ));
        };

        let equity = base_free
            .checked_mul(price)
            .and_then(|b| b.checked_add(quote_free))
            .map(|e| e.round_dp(2).to_string())
            .unwrap_or_else(|| "overflow".to_string());
        info!(
            base_free = %base_free,
            quote_free = %quote_free,
            price = %price,
            equity = %equity,
            "[ACCOUNT] Snapshot"
        );

        let filters = match self.exchange.filters(&self.symbol).await {
            Ok(Some(f)) if f.is_tradable() => f,
            Ok(Some(f)) => {
                error!(
                    step = %f.step_size,
                    tick = %f.tick_size,
                    min_notional = %f.min_notional,
                    "[FILTERS] Non-positive filters, blocking trading"
                );
                return Err("filters not tradable".to_string());
            }
            Ok(None) => {
                error!(symbol = %self.symbol, "[FILTERS] No filters reported, blocking trading");
                return Err("filters unavailable".to_string());
            }
            Err(e) => {
                error!(error = %e, "[FILTERS] Fetch failed, blocking trading");
                return Err(format!("filters unavailable: {}", e));
            }
        };

        Ok(MarketSnapshot {
            price,
            base_free,
            quote_free,
            filters,
        })
    }

    // ==================== Sell ====================

    async fn sell_stage(
        &self,
        settings: &Settings,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> Decision {
        let last_sell = match self.db.last_realized_sell(self.env).await {
            Ok(s) => s,
            Err(e) => return Decision::Fail(format!("{:#}", e)),
        };
        let last_sell_at = last_sell.as_ref().map(|o| o.updated_at);

        let decision = match self.evaluate_sell(settings, snapshot, last_sell_at, now).await {
            Ok(d) => d,
            Err(e) => Decision::Fail(format!("{:#}", e)),
        };

        let hours_ago = last_sell_at
            .map(|t| format!("{:.2}", (now - t).num_seconds() as f64 / 3600.0))
            .unwrap_or_else(|| "never".to_string());
        info!(
            last_sell = %last_sell_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "none".to_string()),
            hours_ago = %hours_ago,
            decision = decision.label(),
            reason = %decision.reason(),
            "[SELL-LOGIC]"
        );
        decision
    }

    async fn evaluate_sell(
        &self,
        settings: &Settings,
        snapshot: &MarketSnapshot,
        last_sell_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let interval = Duration::hours(self.config.sell_interval_hours);
        if let Err(remaining) = sell_gate(last_sell_at, now, interval) {
            return Ok(Decision::skip(format!(
                "next sell in {}h{:02}m",
                remaining.num_hours(),
                remaining.num_minutes() % 60
            )));
        }

        if snapshot.base_free < self.config.base_dust_floor {
            return Ok(Decision::skip(format!(
                "{} free {} below dust floor {}",
                self.base_asset, snapshot.base_free, self.config.base_dust_floor
            )));
        }

        let Some(raw) = snapshot.base_free.checked_mul(self.config.sell_fraction) else {
            return Ok(overflow("sell quantity"));
        };
        let Some(quantity) = floor_to_step(raw, snapshot.filters.step_size) else {
            return Ok(overflow("quantized sell quantity"));
        };
        if quantity.is_zero() {
            return Ok(Decision::skip(format!(
                "sell quantity {} rounds to zero at step {}",
                raw, snapshot.filters.step_size
            )));
        }

        let Some(notional) = quantity.checked_mul(snapshot.price) else {
            return Ok(overflow("sell notional"));
        };
        if notional < snapshot.filters.min_notional {
            return Ok(Decision::skip(format!(
                "notional {} below min {}",
                notional, snapshot.filters.min_notional
            )));
        }

        info!(
            raw = %raw,
            qty = %quantity,
            price = %snapshot.price,
            notional = %notional,
            "[SELL-SIZING]"
        );

        if !places_orders(settings) {
            return Ok(Decision::DryRun);
        }

        self.execute_sell(quantity, now).await
    }

    async fn execute_sell(&self, quantity: Decimal, now: DateTime<Utc>) -> Result<Decision> {
        let cycle = Cycle::open(self.env, now);
        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            quantity,
            price: None,
            client_order_id: client_order_id(OrderSide::Sell, self.env, now),
        };

        let ack = self
            .exchange
            .place_order(&request)
            .await
            .context("Market sell rejected")?;

        let mut status = OrderStatus::from_exchange(&ack.status).unwrap_or(OrderStatus::New);
        let mut executed_qty = ack.executed_qty;
        let mut executed_quote = ack.cummulative_quote_qty;

        if executed_quote.is_zero() && status.is_filled_or_partial() {
            tokio::time::sleep(std::time::Duration::from_millis(
                self.config.sell_refetch_delay_ms,
            ))
            .await;
            match self
                .exchange
                .order_status(&self.symbol, &OrderRef::ExchangeId(ack.order_id))
                .await
            {
                Ok(o) => {
                    status = OrderStatus::from_exchange(&o.status).unwrap_or(status);
                    executed_qty = o.executed_qty;
                    executed_quote = o.cummulative_quote_qty;
                    info!(
                        client_id = %request.client_order_id,
                        executed_quote = %executed_quote,
                        "[SELL-EXEC] Re-fetched proceeds"
                    );
                }
                Err(e) => warn!(
                    client_id = %request.client_order_id,
                    error = %e,
                    "[SELL-EXEC] Proceeds re-fetch failed"
                ),
            }
        }

        let avg_price = if executed_qty > Decimal::ZERO {
            executed_quote.checked_div(executed_qty).unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        let mut order = self.order_from_ack(&ack, &request, status, now);
        order.price = avg_price;
        order.executed_qty = executed_qty;
        order.executed_quote_qty = executed_quote;
        order.fee_rate = order
            .fee_quote
            .filter(|_| executed_quote > Decimal::ZERO)
            .and_then(|f| f.checked_div(executed_quote));
        order.cycle_id = Some(cycle.id.clone());

        if let Err(e) = self.db.record_sell_with_cycle(&cycle, &order).await {
            error!(
                client_id = %order.client_order_id,
                error = %e,
                "[SELL-EXEC] Sell executed but not recorded"
            );
            return Err(e);
        }

        info!(
            client_id = %order.client_order_id,
            cycle_id = %cycle.id,
            qty = %executed_qty,
            proceeds = %executed_quote,
            fee = %order.fee_quote.map(|f| f.to_string()).unwrap_or_else(|| "unknown".to_string()),
            "[SELL-EXEC] Recorded sell"
        );

        Ok(Decision::Place {
            client_order_id: order.client_order_id,
        })
    }

    // ==================== Buy ====================

    async fn buy_stage(
        &self,
        settings: &Settings,
        snapshot: &MarketSnapshot,
        fee_rate: Decimal,
        now: DateTime<Utc>,
    ) -> Decision {
        let decision = match self.evaluate_buy(settings, snapshot, fee_rate, now).await {
            Ok(d) => d,
            Err(e) => Decision::Fail(format!("{:#}", e)),
        };
        info!(
            decision = decision.label(),
            reason = %decision.reason(),
            "[BUY-LOGIC]"
        );
        decision
    }

    async fn evaluate_buy(
        &self,
        settings: &Settings,
        snapshot: &MarketSnapshot,
        fee_rate: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let Some(sell) = self.db.last_realized_sell(self.env).await? else {
            return Ok(Decision::skip("no realized sell to pair with"));
        };
        let Some(cycle_id) = sell.cycle_id.clone() else {
            return Ok(Decision::skip(format!(
                "sell {} has no cycle (legacy)",
                sell.client_order_id
            )));
        };
        if let Some(paired) = self.db.buy_for_cycle(&cycle_id).await? {
            return Ok(Decision::skip(format!(
                "cycle {} already paired with {}",
                cycle_id, paired.client_order_id
            )));
        }

        let proceeds = sell.executed_quote_qty;
        if proceeds <= Decimal::ZERO {
            return Ok(Decision::skip(format!(
                "sell {} has no recorded proceeds",
                sell.client_order_id
            )));
        }

        let mut sizing = BuySizing {
            cycle_id: cycle_id.clone(),
            sell_id: sell.exchange_order_id.clone(),
            proceeds,
            ..BuySizing::default()
        };

        match sell.fee_quote.filter(|f| *f > Decimal::ZERO) {
            Some(fee) => {
                sizing.fee = fee;
                sizing.net = proceeds - fee;
            }
            None => {
                let Some(net) = proceeds.checked_mul(self.config.proceeds_fee_buffer) else {
                    return Ok(overflow("net proceeds"));
                };
                sizing.fee = proceeds - net;
                sizing.net = net;
                info!(
                    gross = %proceeds,
                    net = %net,
                    "[BUY-SIZING] No fee recorded for sell, net proceeds estimated"
                );
            }
        }

        // Proceeds may not be reflected in the cycle-start snapshot
        sizing.fresh_free = match self.exchange.account().await {
            Ok(account) => account.free(&self.quote_asset).unwrap_or(snapshot.quote_free),
            Err(e) => {
                warn!(error = %e, "[BUY-SIZING] Balance refresh failed, using snapshot");
                snapshot.quote_free
            }
        };

        if sizing.fresh_free < sizing.net {
            sizing.spend = sizing.fresh_free;
            sizing.cap_reason = "cap_by_free";
        } else {
            sizing.spend = sizing.net;
            sizing.cap_reason = "none";
        }

        let candles = match self
            .db
            .recent_candles(&self.symbol, &self.candle_interval, self.config.atr_window)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "[BUY-SIZING] Candle read failed, using ATR fallback");
                Vec::new()
            }
        };
        let atr = atr_percent(&candles, snapshot.price).unwrap_or(self.config.atr_fallback);

        let Some(discount) = compute_discount(
            fee_rate,
            settings.min_discount_net_fees,
            atr,
            &self.config,
        ) else {
            return Ok(overflow("discount"));
        };
        sizing.discount = discount;

        let Some(target_price) = snapshot.price.checked_mul(Decimal::ONE - discount) else {
            return Ok(overflow("target price"));
        };
        if target_price <= Decimal::ZERO {
            return Ok(Decision::skip(format!(
                "discount {} leaves no positive target price",
                discount
            )));
        }
        sizing.target_price = target_price;

        let Some(quantity) = sizing
            .spend
            .checked_div(target_price)
            .and_then(|raw| floor_to_step(raw, snapshot.filters.step_size))
        else {
            return Ok(overflow("buy quantity"));
        };
        sizing.quantity = quantity;

        info!(
            cycle_id = %sizing.cycle_id,
            sell_id = %sizing.sell_id,
            sell_proceeds = %sizing.proceeds.round_dp(2),
            fee_quote = %sizing.fee.round_dp(4),
            net_proceeds = %sizing.net.round_dp(2),
            quote_free_fresh = %sizing.fresh_free.round_dp(2),
            final_spend = %sizing.spend.round_dp(2),
            price = %sizing.target_price.round_dp(2),
            qty = %sizing.quantity,
            discount_pct = %(sizing.discount * Decimal::ONE_HUNDRED).round_dp(2),
            atr_pct = %(atr * Decimal::ONE_HUNDRED).round_dp(3),
            cap = sizing.cap_reason,
            "[BUY-SIZING]"
        );

        let open = self
            .exchange
            .open_orders(&self.symbol)
            .await
            .context("Open orders unavailable for duplicate check")?;
        if let Some(dup) = open.iter().find(|o| {
            o.side.eq_ignore_ascii_case("BUY")
                && (o.price - target_price).abs() < self.config.duplicate_price_tolerance
        }) {
            return Ok(Decision::skip(format!(
                "duplicate found: open buy {} at {}",
                dup.client_order_id, dup.price
            )));
        }

        let Some(notional) = quantity.checked_mul(target_price) else {
            return Ok(overflow("buy notional"));
        };
        if notional < self.config.min_buy_notional {
            return Ok(Decision::skip(format!(
                "buy notional {} below minimum {}",
                notional.round_dp(2),
                self.config.min_buy_notional
            )));
        }

        let open_buys = self.db.count_open_buys(self.env).await?;
        if open_buys >= settings.max_open_buys {
            return Ok(Decision::skip(format!(
                "max open buys reached ({}/{})",
                open_buys, settings.max_open_buys
            )));
        }

        if !places_orders(settings) {
            return Ok(Decision::DryRun);
        }

        self.execute_buy(&sizing, now).await
    }

    async fn execute_buy(&self, sizing: &BuySizing, now: DateTime<Utc>) -> Result<Decision> {
        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: sizing.quantity,
            price: Some(sizing.target_price),
            client_order_id: client_order_id(OrderSide::Buy, self.env, now),
        };

        let ack = self
            .exchange
            .place_order(&request)
            .await
            .context("Limit buy rejected")?;

        let status = OrderStatus::from_exchange(&ack.status).unwrap_or(OrderStatus::New);
        let mut order = self.order_from_ack(&ack, &request, status, now);
        order.discount_rate = Some(sizing.discount);
        order.cycle_id = Some(sizing.cycle_id.clone());
        if order.price.is_zero() {
            order.price = sizing.target_price;
        }

        self.db
            .insert_order(&order)
            .await
            .context("Buy placed but not recorded")?;

        info!(
            client_id = %order.client_order_id,
            cycle_id = %sizing.cycle_id,
            price = %order.price,
            qty = %order.orig_qty,
            "[BUY-EXEC] Placed limit buy"
        );

        Ok(Decision::Place {
            client_order_id: order.client_order_id,
        })
    }

    /// Ledger row for a fresh placement, with fees summed from the fills.
    fn order_from_ack(
        &self,
        ack: &OrderAck,
        request: &OrderRequest,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Order {
        let fee = ack.fee_summary(&self.base_asset, &self.quote_asset);
        let fee_quote = fee.as_ref().and_then(|f| f.quote_equivalent);
        let fee_rate = fee_quote
            .filter(|_| ack.cummulative_quote_qty > Decimal::ZERO)
            .and_then(|f| f.checked_div(ack.cummulative_quote_qty));

        Order {
            client_order_id: request.client_order_id.clone(),
            exchange_order_id: ack.order_id.to_string(),
            env: self.env,
            side: request.side,
            order_type: request.order_type,
            status,
            price: ack.price,
            orig_qty: ack.orig_qty,
            executed_qty: ack.executed_qty,
            executed_quote_qty: ack.cummulative_quote_qty,
            fee_amount: fee.as_ref().map(|f| f.amount),
            fee_asset: fee.map(|f| f.asset),
            fee_quote,
            fee_rate,
            discount_rate: None,
            cycle_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Orders are only sent with the master switch on and dry run off.
fn places_orders(settings: &Settings) -> bool {
    settings.trading_enabled && !settings.dry_run
}

fn abort(reason: &str) -> CycleOutcome {
    warn!(reason, "[CYCLE] Aborted");
    CycleOutcome::Aborted(reason.to_string())
}

fn overflow(what: &str) -> Decision {
    Decision::skip(format!("arithmetic overflow computing {}", what))
}

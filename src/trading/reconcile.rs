//! Ledger reconciliation against the exchange's live order set.
//!
//! Runs first in every cycle. Local orders that left the book take the
//! exchange's authoritative status (or CANCELED when it cannot be fetched),
//! and open orders carrying our client id prefix but missing from the
//! ledger are imported.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::api::{Exchange, ExchangeOrder, OrderRef};
use crate::db::{Database, ExecutionUpdate};
use crate::models::{is_own_client_id, Environment, Order, OrderSide, OrderStatus, OrderType};

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub updated: usize,
    pub force_canceled: usize,
    pub imported: usize,
}

pub struct Reconciler {
    exchange: Arc<dyn Exchange>,
    db: Database,
    env: Environment,
    symbol: String,
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        db: Database,
        env: Environment,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            db,
            env,
            symbol: symbol.into(),
        }
    }

    /// Reconcile and report success. Failures are logged; the caller skips
    /// the cycle on `false`.
    pub async fn reconcile(&self) -> bool {
        match self.run().await {
            Ok(report) => {
                info!(
                    updated = report.updated,
                    canceled = report.force_canceled,
                    imported = report.imported,
                    "[RECONCILE] Complete"
                );
                true
            }
            Err(e) => {
                error!(error = %e, "[RECONCILE] Failed");
                false
            }
        }
    }

    pub async fn run(&self) -> Result<ReconcileReport> {
        let open = self
            .exchange
            .open_orders(&self.symbol)
            .await
            .context("Failed to fetch open orders")?;
        let local = self.db.non_terminal_orders(self.env).await?;

        let open_by_id: HashMap<&str, &ExchangeOrder> = open
            .iter()
            .map(|o| (o.client_order_id.as_str(), o))
            .collect();

        let mut report = ReconcileReport::default();

        for order in &local {
            match open_by_id.get(order.client_order_id.as_str()) {
                Some(live) => {
                    if self.apply(order, live).await? {
                        report.updated += 1;
                    }
                }
                None => self.settle_missing(order, &mut report).await?,
            }
        }

        for live in &open {
            if !is_own_client_id(&live.client_order_id, self.env) {
                continue;
            }
            if local.iter().any(|o| o.client_order_id == live.client_order_id) {
                continue;
            }
            if self.import_orphan(live).await? {
                report.imported += 1;
            }
        }

        Ok(report)
    }

    /// A local non-terminal order is no longer on the book: take the
    /// exchange's word for it, or give it up as canceled.
    async fn settle_missing(&self, order: &Order, report: &mut ReconcileReport) -> Result<()> {
        let lookup = self
            .exchange
            .order_status(&self.symbol, &OrderRef::ClientId(order.client_order_id.clone()))
            .await;

        match lookup {
            Ok(remote) => {
                if self.apply(order, &remote).await? {
                    report.updated += 1;
                }
            }
            Err(e) => {
                warn!(
                    client_id = %order.client_order_id,
                    error = %e,
                    "[RECONCILE] Status lookup failed, marking CANCELED"
                );
                let update = ExecutionUpdate {
                    status: OrderStatus::Canceled,
                    executed_qty: None,
                    executed_quote_qty: None,
                    updated_at: Utc::now(),
                };
                if self
                    .db
                    .update_order_execution(&order.client_order_id, &update)
                    .await?
                {
                    report.force_canceled += 1;
                }
            }
        }
        Ok(())
    }

    /// Copy status and executed amounts from the exchange. Returns whether
    /// the ledger changed.
    async fn apply(&self, order: &Order, remote: &ExchangeOrder) -> Result<bool> {
        let Some(status) = OrderStatus::from_exchange(&remote.status) else {
            warn!(
                client_id = %order.client_order_id,
                status = %remote.status,
                "[RECONCILE] Unknown exchange status, leaving order untouched"
            );
            return Ok(false);
        };

        if status == order.status
            && remote.executed_qty == order.executed_qty
            && remote.cummulative_quote_qty == order.executed_quote_qty
        {
            return Ok(false);
        }

        let update = ExecutionUpdate {
            status,
            executed_qty: Some(remote.executed_qty),
            executed_quote_qty: Some(remote.cummulative_quote_qty),
            updated_at: Utc::now(),
        };
        let changed = self
            .db
            .update_order_execution(&order.client_order_id, &update)
            .await?;

        if changed {
            info!(
                client_id = %order.client_order_id,
                from = %order.status,
                to = %status,
                executed_qty = %remote.executed_qty,
                executed_quote = %remote.cummulative_quote_qty,
                "[RECONCILE] Updated order"
            );
        }
        Ok(changed)
    }

    async fn import_orphan(&self, live: &ExchangeOrder) -> Result<bool> {
        let (Ok(side), Ok(order_type)) = (
            live.side.parse::<OrderSide>(),
            live.order_type.parse::<OrderType>(),
        ) else {
            warn!(
                client_id = %live.client_order_id,
                side = %live.side,
                order_type = %live.order_type,
                "[RECONCILE] Cannot import order of unsupported kind"
            );
            return Ok(false);
        };

        let now = Utc::now();
        let seen_at = live
            .update_time
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(now);

        let order = Order {
            client_order_id: live.client_order_id.clone(),
            exchange_order_id: live.order_id.to_string(),
            env: self.env,
            side,
            order_type,
            status: OrderStatus::from_exchange(&live.status).unwrap_or(OrderStatus::New),
            price: live.price,
            orig_qty: live.orig_qty,
            executed_qty: live.executed_qty,
            executed_quote_qty: live.cummulative_quote_qty,
            fee_amount: None,
            fee_asset: None,
            fee_quote: None,
            fee_rate: None,
            discount_rate: None,
            cycle_id: None,
            created_at: seen_at,
            updated_at: now,
        };

        let inserted = self.db.insert_order_if_absent(&order).await?;
        if inserted {
            warn!(
                client_id = %order.client_order_id,
                side = %order.side,
                price = %order.price,
                qty = %order.orig_qty,
                "[RECONCILE] Imported orphaned order"
            );
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::order;
    use crate::testing::{FakeExchange, SYMBOL};
    use rust_decimal_macros::dec;

    async fn setup() -> (Arc<FakeExchange>, Database, Reconciler) {
        let exchange = Arc::new(FakeExchange::new());
        let db = Database::in_memory().await.unwrap();
        let reconciler = Reconciler::new(exchange.clone(), db.clone(), Environment::Testnet, SYMBOL);
        (exchange, db, reconciler)
    }

    #[tokio::test]
    async fn test_missing_order_takes_exchange_status() {
        let (exchange, db, reconciler) = setup().await;
        db.insert_order(&order("ABUY_testnet_1", OrderSide::Buy, OrderStatus::New, Utc::now()))
            .await
            .unwrap();

        exchange.add_open_order("ABUY_testnet_1", "BUY", dec!(99200), dec!(0.003));
        exchange.fill_open_order("ABUY_testnet_1");

        assert!(reconciler.reconcile().await);

        let stored = db.find_order("ABUY_testnet_1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Filled);
        assert_eq!(stored.executed_qty, dec!(0.003));
        assert_eq!(stored.executed_quote_qty, dec!(297.6));
    }

    #[tokio::test]
    async fn test_unknown_missing_order_is_forced_canceled() {
        let (_exchange, db, reconciler) = setup().await;
        db.insert_order(&order("ABUY_testnet_1", OrderSide::Buy, OrderStatus::New, Utc::now()))
            .await
            .unwrap();

        let report = reconciler.run().await.unwrap();
        assert_eq!(report.force_canceled, 1);

        let stored = db.find_order("ABUY_testnet_1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Canceled);
        assert!(db.non_terminal_orders(Environment::Testnet).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphans_with_our_prefix_are_imported_once() {
        let (exchange, db, reconciler) = setup().await;
        exchange.add_open_order("ABUY_testnet_1700000000000", "BUY", dec!(98000), dec!(0.002));
        exchange.add_open_order("ABUY_live_1700000000000", "BUY", dec!(98000), dec!(0.002));
        exchange.add_open_order("web_manual_order", "BUY", dec!(97000), dec!(0.002));

        let report = reconciler.run().await.unwrap();
        assert_eq!(report.imported, 1);

        let imported = db.find_order("ABUY_testnet_1700000000000").await.unwrap().unwrap();
        assert_eq!(imported.status, OrderStatus::New);
        assert_eq!(imported.price, dec!(98000));
        assert_eq!(imported.cycle_id, None);
        assert_eq!(imported.fee_amount, None);

        // Second pass sees the local record
        let again = reconciler.run().await.unwrap();
        assert_eq!(again.imported, 0);
        assert_eq!(db.count_orders().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_open_orders_failure_reports_false() {
        let (exchange, _db, reconciler) = setup().await;
        exchange.state().fail_open_orders = true;
        assert!(!reconciler.reconcile().await);
    }
}

//! Effective fee-rate percentiles from historical fills.

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::Exchange;
use crate::db::{Database, FeeSnapshot};
use crate::models::Order;

/// Fee-rate percentiles over the sampled fills.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeeStats {
    pub p50: Decimal,
    pub p90: Decimal,
    /// Orders that yielded a usable rate
    pub samples: usize,
    /// All filled orders in the ledger
    pub filled_orders: i64,
}

impl FeeStats {
    /// Rate to size discounts with: `p90`, unless the ledger holds fewer than
    /// `min_fills` fills or `p90` is not positive.
    pub fn conservative_rate(&self, min_fills: i64, fallback: Decimal) -> Decimal {
        if self.filled_orders < min_fills || self.p90 <= Decimal::ZERO {
            fallback
        } else {
            self.p90
        }
    }
}

/// Percentile estimator over the most recent filled orders.
pub struct FeeStatsEstimator {
    exchange: Arc<dyn Exchange>,
    db: Database,
    quote_asset: String,
    sample_size: i64,
}

impl FeeStatsEstimator {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        db: Database,
        quote_asset: impl Into<String>,
        sample_size: i64,
    ) -> Self {
        Self {
            exchange,
            db,
            quote_asset: quote_asset.into(),
            sample_size,
        }
    }

    /// Recompute p50/p90 and store today's snapshot.
    pub async fn refresh(&self) -> Result<FeeStats> {
        let orders = self.db.recent_filled_orders(self.sample_size).await?;
        let filled_orders = self.db.count_filled_orders().await?;

        let mut prices: HashMap<String, Decimal> = HashMap::new();
        let mut rates = Vec::with_capacity(orders.len());
        for order in &orders {
            if let Some(rate) = self.order_fee_rate(order, &mut prices).await {
                rates.push(rate);
            }
        }
        rates.sort();

        let stats = FeeStats {
            p50: percentile(&rates, 50),
            p90: percentile(&rates, 90),
            samples: rates.len(),
            filled_orders,
        };

        self.db
            .upsert_fee_snapshot(&FeeSnapshot {
                date: Utc::now().date_naive(),
                p50: stats.p50,
                p90: stats.p90,
                sample_size: stats.samples as i64,
            })
            .await?;

        info!(
            p50 = %stats.p50,
            p90 = %stats.p90,
            samples = stats.samples,
            filled = stats.filled_orders,
            "[STATS] Fee rates refreshed"
        );
        Ok(stats)
    }

    /// Stored rate when present and nonzero; otherwise the commission
    /// converted to quote currency over the executed quote amount. A zero
    /// commission yields no sample.
    async fn order_fee_rate(
        &self,
        order: &Order,
        prices: &mut HashMap<String, Decimal>,
    ) -> Option<Decimal> {
        // Zero-commission fills carry no fee information
        if let Some(rate) = order.fee_rate.filter(|r| !r.is_zero()) {
            return Some(rate);
        }

        let amount = order.fee_amount?;
        let asset = order.fee_asset.as_deref()?;
        if order.executed_quote_qty <= Decimal::ZERO {
            return None;
        }

        let fee_quote = match order.fee_quote {
            Some(q) => q,
            None if asset == self.quote_asset => amount,
            None => {
                let price = match prices.get(asset) {
                    Some(p) => *p,
                    None => {
                        let symbol = format!("{}{}", asset, self.quote_asset);
                        let p = self.exchange.price(&symbol).await;
                        prices.insert(asset.to_string(), p);
                        p
                    }
                };
                if price <= Decimal::ZERO {
                    debug!(asset, client_id = %order.client_order_id, "No reference price for fee asset");
                    return None;
                }
                amount.checked_mul(price)?
            }
        };

        if fee_quote.is_zero() {
            return None;
        }
        fee_quote.checked_div(order.executed_quote_qty)
    }
}

/// Percentile of an ascending slice. At a fractional index the two
/// bracketing values are averaged. Zero for an empty slice.
pub fn percentile(sorted: &[Decimal], p: usize) -> Decimal {
    let n = sorted.len();
    if n == 0 {
        return Decimal::ZERO;
    }

    let scaled = p * n;
    let lo = (scaled / 100).min(n - 1);
    let hi = scaled.div_ceil(100).min(n - 1);

    if lo == hi {
        sorted[lo]
    } else {
        (sorted[lo] + sorted[hi]) / Decimal::TWO
    }
}

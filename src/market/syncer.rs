//! Incremental candle ingestion.

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::{Exchange, Kline};
use crate::db::Database;
use crate::models::Candle;

/// Bars requested per page.
const PAGE_LIMIT: u16 = 1000;

/// Upper bound on pages per sync.
const MAX_PAGES: usize = 500;

/// Result of one sync pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub pages: usize,
    pub candles: usize,
}

/// Pages klines forward from the newest stored candle and upserts them.
pub struct MarketDataSyncer {
    exchange: Arc<dyn Exchange>,
    db: Database,
    symbol: String,
    interval: String,
    backfill: Duration,
    page_pause: std::time::Duration,
}

impl MarketDataSyncer {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        db: Database,
        symbol: impl Into<String>,
        interval: impl Into<String>,
        backfill_days: i64,
    ) -> Self {
        Self {
            exchange,
            db,
            symbol: symbol.into(),
            interval: interval.into(),
            backfill: Duration::days(backfill_days),
            page_pause: std::time::Duration::from_millis(200),
        }
    }

    /// Pause between pages. Defaults to 200ms.
    #[cfg(test)]
    pub fn with_page_pause(mut self, pause: std::time::Duration) -> Self {
        self.page_pause = pause;
        self
    }

    /// Fetch and upsert every bar from the newest stored one onward.
    /// Re-running is harmless: rows are keyed by open time.
    pub async fn sync(&self) -> Result<SyncReport> {
        let step = interval_duration(&self.interval)?;
        let now = Utc::now();

        // Re-fetch the newest stored bar: it may have been stored while open.
        let mut start = match self.db.latest_candle(&self.symbol, &self.interval).await? {
            Some(c) => c.open_time,
            None => now - self.backfill,
        };

        let mut report = SyncReport::default();
        while now - start >= step && report.pages < MAX_PAGES {
            let klines = self
                .exchange
                .klines(&self.symbol, &self.interval, start, PAGE_LIMIT)
                .await
                .with_context(|| format!("Failed to fetch klines for {}", self.symbol))?;

            let Some(last) = klines.last() else {
                break;
            };
            let last_close = last.close_time;

            let candles: Vec<Candle> = klines
                .iter()
                .map(|k| to_candle(k, &self.symbol, &self.interval))
                .collect();
            self.db.upsert_candles(&candles).await?;

            report.pages += 1;
            report.candles += candles.len();
            debug!(
                symbol = %self.symbol,
                page = report.pages,
                count = candles.len(),
                last_close = %last_close,
                "Stored kline page"
            );

            let next = last_close + Duration::milliseconds(1);
            if next <= start {
                break;
            }
            start = next;

            if now - last_close < step {
                break;
            }
            tokio::time::sleep(self.page_pause).await;
        }

        info!(
            symbol = %self.symbol,
            interval = %self.interval,
            candles = report.candles,
            "[MARKET] Candle sync complete"
        );
        Ok(report)
    }
}

fn to_candle(k: &Kline, symbol: &str, interval: &str) -> Candle {
    Candle {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        open_time: k.open_time,
        close_time: k.close_time,
        open: k.open,
        high: k.high,
        low: k.low,
        close: k.close,
        volume: k.volume,
        quote_volume: k.quote_volume,
        trades_count: k.trades_count,
    }
}

/// Length of a kline interval such as `15m`, `4h`, `1d`, or `1w`.
pub fn interval_duration(interval: &str) -> Result<Duration> {
    let (count, unit) = interval.split_at(interval.len().saturating_sub(1));
    let count: i64 = count
        .parse()
        .with_context(|| format!("Invalid candle interval: {}", interval))?;
    if count <= 0 {
        bail!("Invalid candle interval: {}", interval);
    }

    match unit {
        "m" => Ok(Duration::minutes(count)),
        "h" => Ok(Duration::hours(count)),
        "d" => Ok(Duration::days(count)),
        "w" => Ok(Duration::weeks(count)),
        _ => bail!("Unsupported candle interval: {}", interval),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExchange;
    use chrono::{DateTime, DurationRound};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn kline(open_time: DateTime<Utc>) -> Kline {
        Kline {
            open_time,
            open: dec!(100000),
            high: dec!(100050),
            low: dec!(99950),
            close: dec!(100010),
            volume: dec!(3),
            close_time: open_time + Duration::minutes(15) - Duration::milliseconds(1),
            quote_volume: dec!(300000),
            trades_count: 10,
        }
    }

    fn closed_bars(n: i64) -> Vec<Kline> {
        let last_open = Utc::now()
            .duration_trunc(Duration::minutes(15))
            .unwrap()
            - Duration::minutes(15);
        (0..n)
            .rev()
            .map(|i| kline(last_open - Duration::minutes(15 * i)))
            .collect()
    }

    #[test]
    fn test_interval_duration() {
        assert_eq!(interval_duration("15m").unwrap(), Duration::minutes(15));
        assert_eq!(interval_duration("4h").unwrap(), Duration::hours(4));
        assert_eq!(interval_duration("1d").unwrap(), Duration::days(1));
        assert!(interval_duration("1M").is_err());
        assert!(interval_duration("m").is_err());
        assert!(interval_duration("0m").is_err());
    }

    #[tokio::test]
    async fn test_sync_backfills_then_resumes_without_duplicates() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.state().klines = closed_bars(8);
        let db = Database::in_memory().await.unwrap();

        let syncer = MarketDataSyncer::new(exchange.clone(), db.clone(), "BTCUSDT", "15m", 1)
            .with_page_pause(std::time::Duration::ZERO);

        let first = syncer.sync().await.unwrap();
        assert_eq!(first.candles, 8);
        assert_eq!(db.count_candles("BTCUSDT", "15m").await.unwrap(), 8);

        // Only the newest bar is fetched again and overwritten in place
        syncer.sync().await.unwrap();
        assert_eq!(db.count_candles("BTCUSDT", "15m").await.unwrap(), 8);

        let latest = db.latest_candle("BTCUSDT", "15m").await.unwrap().unwrap();
        assert_eq!(latest.close, dec!(100010));
        assert!(latest.volume > Decimal::ZERO);
    }
}

//! SQLite ledger for orders, cycles, candles, settings, and fee snapshots.
//!
//! Everything the engine needs to resume after a restart lives here.
//! Decimals are stored as TEXT so no precision is lost; timestamps are
//! INTEGER unix milliseconds.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::models::{
    Candle, Cycle, CycleStatus, CycleSummary, Environment, Order, OrderSide, OrderStatus, Settings,
};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Stored order record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredOrder {
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub env: String,
    pub side: String,
    pub order_type: String,
    pub status: String,
    pub price: String,
    pub orig_qty: String,
    pub executed_qty: String,
    pub executed_quote_qty: String,
    pub fee_amount: Option<String>,
    pub fee_asset: Option<String>,
    pub fee_quote: Option<String>,
    pub fee_rate: Option<String>,
    pub discount_rate: Option<String>,
    pub cycle_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredCandle {
    symbol: String,
    interval: String,
    open_time: i64,
    close_time: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    quote_volume: String,
    trades_count: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredSettings {
    trading_enabled: bool,
    dry_run: bool,
    max_open_buys: i64,
    min_discount_net_fees: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredCycleSummary {
    id: String,
    env: String,
    started_at: i64,
    sell_client_id: Option<String>,
    buy_client_id: Option<String>,
    buy_status: Option<String>,
}

/// Execution fields reconciled from the exchange. `None` keeps the stored
/// value.
#[derive(Debug, Clone)]
pub struct ExecutionUpdate {
    pub status: OrderStatus,
    pub executed_qty: Option<Decimal>,
    pub executed_quote_qty: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

/// One day's fee-rate percentiles.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeSnapshot {
    pub date: NaiveDate,
    pub p50: Decimal,
    pub p90: Decimal,
    pub sample_size: i64,
}

const ORDER_COLUMNS: &str = "client_order_id, exchange_order_id, env, side, order_type, status, \
     price, orig_qty, executed_qty, executed_quote_qty, fee_amount, fee_asset, fee_quote, \
     fee_rate, discount_rate, cycle_id, created_at, updated_at";

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same memory store.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                trading_enabled INTEGER NOT NULL,
                dry_run INTEGER NOT NULL,
                max_open_buys INTEGER NOT NULL,
                min_discount_net_fees TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cycles (
                id TEXT PRIMARY KEY,
                env TEXT NOT NULL,
                started_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_order_id TEXT NOT NULL UNIQUE,
                exchange_order_id TEXT NOT NULL DEFAULT '',
                env TEXT NOT NULL,
                side TEXT NOT NULL CHECK (side IN ('BUY', 'SELL')),
                order_type TEXT NOT NULL,
                status TEXT NOT NULL,
                price TEXT NOT NULL DEFAULT '0',
                orig_qty TEXT NOT NULL DEFAULT '0',
                executed_qty TEXT NOT NULL DEFAULT '0',
                executed_quote_qty TEXT NOT NULL DEFAULT '0',
                fee_amount TEXT,
                fee_asset TEXT,
                fee_quote TEXT,
                fee_rate TEXT,
                discount_rate TEXT,
                cycle_id TEXT REFERENCES cycles(id),
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                close_time INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                quote_volume TEXT NOT NULL,
                trades_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (symbol, interval, open_time)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_snapshots (
                date TEXT PRIMARY KEY,
                p50_fee_rate TEXT NOT NULL,
                p90_fee_rate TEXT NOT NULL,
                sample_size INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity TEXT NOT NULL,
                actor TEXT NOT NULL,
                before_json TEXT,
                after_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // A cycle accepts at most one buy
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_cycle_buy ON orders(cycle_id) \
             WHERE side = 'BUY' AND cycle_id IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_env_status ON orders(env, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_updated ON orders(updated_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Settings ====================

    /// Insert the default settings row if none exists.
    pub async fn ensure_default_settings(&self) -> Result<()> {
        let defaults = Settings::default();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO settings
                (id, trading_enabled, dry_run, max_open_buys, min_discount_net_fees, updated_at)
            VALUES (1, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(defaults.trading_enabled)
        .bind(defaults.dry_run)
        .bind(defaults.max_open_buys)
        .bind(defaults.min_discount_net_fees.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to seed settings")?;

        if result.rows_affected() > 0 {
            debug!("Inserted default settings");
        }
        Ok(())
    }

    /// Read the settings singleton. Never cached.
    pub async fn load_settings(&self) -> Result<Option<Settings>> {
        let row = sqlx::query_as::<_, StoredSettings>(
            "SELECT trading_enabled, dry_run, max_open_buys, min_discount_net_fees FROM settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load settings")?;

        row.map(|r| -> Result<Settings> {
            Ok(Settings {
                trading_enabled: r.trading_enabled,
                dry_run: r.dry_run,
                max_open_buys: r.max_open_buys,
                min_discount_net_fees: parse_dec(&r.min_discount_net_fees, "min_discount_net_fees")?,
            })
        })
        .transpose()
    }

    /// Replace the settings singleton and record the change in the audit log.
    pub async fn update_settings(&self, settings: &Settings, actor: &str) -> Result<()> {
        let before = self.load_settings().await?;
        let before_json = before
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize settings")?;
        let after_json = serde_json::to_string(settings).context("Failed to serialize settings")?;
        let now = Utc::now().timestamp_millis();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO settings
                (id, trading_enabled, dry_run, max_open_buys, min_discount_net_fees, updated_at)
            VALUES (1, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                trading_enabled = excluded.trading_enabled,
                dry_run = excluded.dry_run,
                max_open_buys = excluded.max_open_buys,
                min_discount_net_fees = excluded.min_discount_net_fees,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(settings.trading_enabled)
        .bind(settings.dry_run)
        .bind(settings.max_open_buys)
        .bind(settings.min_discount_net_fees.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO audit_log (entity, actor, before_json, after_json, created_at) VALUES ('settings', ?, ?, ?, ?)",
        )
        .bind(actor)
        .bind(before_json)
        .bind(after_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.context("Failed to update settings")?;
        Ok(())
    }

    /// Number of audit entries for an entity.
    pub async fn count_audit_entries(&self, entity: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log WHERE entity = ?")
            .bind(entity)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ==================== Orders ====================

    /// Insert a new order. Fails if the client order id already exists or
    /// the order would pair a second buy with a cycle.
    pub async fn insert_order(&self, order: &Order) -> Result<()> {
        bind_order(order)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to insert order {}", order.client_order_id))?;
        Ok(())
    }

    /// Insert an order unless its client order id is already recorded.
    /// Returns whether a row was written.
    pub async fn insert_order_if_absent(&self, order: &Order) -> Result<bool> {
        let sql = format!(
            "INSERT OR IGNORE INTO orders ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ORDER_COLUMNS
        );
        let result = bind_order_fields(sqlx::query(&sql), order)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to import order {}", order.client_order_id))?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a sell together with the cycle it opens.
    pub async fn record_sell_with_cycle(&self, cycle: &Cycle, sell: &Order) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO cycles (id, env, started_at) VALUES (?, ?, ?)")
            .bind(cycle.id.as_str())
            .bind(cycle.env.as_str())
            .bind(cycle.started_at.timestamp_millis())
            .execute(&mut *tx)
            .await
            .context("Failed to insert cycle")?;

        bind_order(sell)
            .execute(&mut *tx)
            .await
            .context("Failed to insert sell order")?;

        tx.commit().await.context("Failed to commit sell and cycle")?;
        Ok(())
    }

    pub async fn find_order(&self, client_order_id: &str) -> Result<Option<Order>> {
        let sql = format!("SELECT {} FROM orders WHERE client_order_id = ?", ORDER_COLUMNS);
        sqlx::query_as::<_, StoredOrder>(&sql)
            .bind(client_order_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch order")?
            .map(Order::try_from)
            .transpose()
    }

    /// Orders in NEW or PARTIALLY_FILLED status for an environment.
    pub async fn non_terminal_orders(&self, env: Environment) -> Result<Vec<Order>> {
        let sql = format!(
            "SELECT {} FROM orders WHERE env = ? AND status IN ('NEW', 'PARTIALLY_FILLED') ORDER BY created_at",
            ORDER_COLUMNS
        );
        self.fetch_orders(sqlx::query_as(&sql).bind(env.as_str())).await
    }

    /// Apply reconciled execution state. Updates that would move the status
    /// backwards are refused; returns whether the row changed.
    pub async fn update_order_execution(
        &self,
        client_order_id: &str,
        update: &ExecutionUpdate,
    ) -> Result<bool> {
        let current = self
            .find_order(client_order_id)
            .await?
            .ok_or_else(|| anyhow!("Order {} not found", client_order_id))?;

        if !current.status.can_advance_to(update.status) {
            warn!(
                client_id = client_order_id,
                from = %current.status,
                to = %update.status,
                "Refusing status regression"
            );
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE orders SET
                status = ?,
                executed_qty = COALESCE(?, executed_qty),
                executed_quote_qty = COALESCE(?, executed_quote_qty),
                updated_at = ?
            WHERE client_order_id = ?
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.executed_qty.map(|d| d.to_string()))
        .bind(update.executed_quote_qty.map(|d| d.to_string()))
        .bind(update.updated_at.timestamp_millis())
        .bind(client_order_id)
        .execute(&self.pool)
        .await
        .context("Failed to update order")?;

        Ok(true)
    }

    /// Most recent FILLED sell with nonzero executed quantity.
    pub async fn last_realized_sell(&self, env: Environment) -> Result<Option<Order>> {
        let sql = format!(
            r#"SELECT {} FROM orders
               WHERE env = ? AND side = 'SELL' AND status = 'FILLED'
                 AND CAST(executed_qty AS REAL) > 0
               ORDER BY updated_at DESC LIMIT 1"#,
            ORDER_COLUMNS
        );
        sqlx::query_as::<_, StoredOrder>(&sql)
            .bind(env.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch last sell")?
            .map(Order::try_from)
            .transpose()
    }

    /// The buy paired with a cycle, if any.
    pub async fn buy_for_cycle(&self, cycle_id: &str) -> Result<Option<Order>> {
        let sql = format!(
            "SELECT {} FROM orders WHERE cycle_id = ? AND side = 'BUY' LIMIT 1",
            ORDER_COLUMNS
        );
        sqlx::query_as::<_, StoredOrder>(&sql)
            .bind(cycle_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch paired buy")?
            .map(Order::try_from)
            .transpose()
    }

    /// Number of BUY orders referencing a cycle.
    #[cfg(test)]
    pub async fn count_buys_for_cycle(&self, cycle_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM orders WHERE cycle_id = ? AND side = 'BUY'")
                .bind(cycle_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Buys still resting on the book according to the ledger.
    pub async fn count_open_buys(&self, env: Environment) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM orders WHERE env = ? AND side = 'BUY' AND status IN ('NEW', 'PARTIALLY_FILLED')",
        )
        .bind(env.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Most recent filled orders with nonzero executed quantity, newest first.
    pub async fn recent_filled_orders(&self, limit: i64) -> Result<Vec<Order>> {
        let sql = format!(
            r#"SELECT {} FROM orders
               WHERE status = 'FILLED' AND CAST(executed_qty AS REAL) > 0
               ORDER BY updated_at DESC LIMIT ?"#,
            ORDER_COLUMNS
        );
        self.fetch_orders(sqlx::query_as(&sql).bind(limit)).await
    }

    pub async fn count_filled_orders(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM orders WHERE status = 'FILLED' AND CAST(executed_qty AS REAL) > 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn recent_orders(&self, env: Environment, limit: i64) -> Result<Vec<Order>> {
        let sql = format!(
            "SELECT {} FROM orders WHERE env = ? ORDER BY created_at DESC LIMIT ?",
            ORDER_COLUMNS
        );
        self.fetch_orders(sqlx::query_as(&sql).bind(env.as_str()).bind(limit))
            .await
    }

    pub async fn count_orders(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn fetch_orders<'q>(
        &self,
        query: sqlx::query::QueryAs<'q, Sqlite, StoredOrder, SqliteArguments<'q>>,
    ) -> Result<Vec<Order>> {
        query
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch orders")?
            .into_iter()
            .map(Order::try_from)
            .collect()
    }

    // ==================== Cycles ====================

    /// Cycles joined with their sell and paired buy, newest first. Status is
    /// derived from the buy.
    pub async fn cycle_summaries(&self, env: Environment, limit: i64) -> Result<Vec<CycleSummary>> {
        let rows = sqlx::query_as::<_, StoredCycleSummary>(
            r#"
            SELECT c.id, c.env, c.started_at,
                   s.client_order_id AS sell_client_id,
                   b.client_order_id AS buy_client_id,
                   b.status AS buy_status
            FROM cycles c
            LEFT JOIN orders s ON s.cycle_id = c.id AND s.side = 'SELL'
            LEFT JOIN orders b ON b.cycle_id = c.id AND b.side = 'BUY'
            WHERE c.env = ?
            ORDER BY c.started_at DESC
            LIMIT ?
            "#,
        )
        .bind(env.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch cycles")?;

        rows.into_iter()
            .map(|r| -> Result<CycleSummary> {
                let buy_status = r
                    .buy_status
                    .as_deref()
                    .map(str::parse::<OrderStatus>)
                    .transpose()?;
                Ok(CycleSummary {
                    cycle: Cycle {
                        id: r.id,
                        env: r.env.parse()?,
                        started_at: from_millis(r.started_at)?,
                    },
                    sell_client_id: r.sell_client_id,
                    buy_client_id: r.buy_client_id,
                    buy_status,
                    status: CycleStatus::derive(buy_status),
                })
            })
            .collect()
    }

    pub async fn count_cycles(&self, env: Environment) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cycles WHERE env = ?")
            .bind(env.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ==================== Candles ====================

    /// Latest stored candle by open time.
    pub async fn latest_candle(&self, symbol: &str, interval: &str) -> Result<Option<Candle>> {
        sqlx::query_as::<_, StoredCandle>(
            "SELECT * FROM candles WHERE symbol = ? AND interval = ? ORDER BY open_time DESC LIMIT 1",
        )
        .bind(symbol)
        .bind(interval)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest candle")?
        .map(Candle::try_from)
        .transpose()
    }

    /// Upsert candles keyed by (symbol, interval, open_time) in one
    /// transaction.
    pub async fn upsert_candles(&self, candles: &[Candle]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for c in candles {
            let result = sqlx::query(
                r#"
                INSERT INTO candles
                    (symbol, interval, open_time, close_time, open, high, low, close, volume, quote_volume, trades_count)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(symbol, interval, open_time) DO UPDATE SET
                    close_time = excluded.close_time,
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    quote_volume = excluded.quote_volume,
                    trades_count = excluded.trades_count
                "#,
            )
            .bind(c.symbol.as_str())
            .bind(c.interval.as_str())
            .bind(c.open_time.timestamp_millis())
            .bind(c.close_time.timestamp_millis())
            .bind(c.open.to_string())
            .bind(c.high.to_string())
            .bind(c.low.to_string())
            .bind(c.close.to_string())
            .bind(c.volume.to_string())
            .bind(c.quote_volume.to_string())
            .bind(c.trades_count)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        tx.commit().await.context("Failed to upsert candles")?;
        Ok(written)
    }

    /// Most recent candles, newest first.
    pub async fn recent_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: i64,
    ) -> Result<Vec<Candle>> {
        sqlx::query_as::<_, StoredCandle>(
            "SELECT * FROM candles WHERE symbol = ? AND interval = ? ORDER BY open_time DESC LIMIT ?",
        )
        .bind(symbol)
        .bind(interval)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch candles")?
        .into_iter()
        .map(Candle::try_from)
        .collect()
    }

    pub async fn count_candles(&self, symbol: &str, interval: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM candles WHERE symbol = ? AND interval = ?")
                .bind(symbol)
                .bind(interval)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ==================== Fee Snapshots ====================

    pub async fn upsert_fee_snapshot(&self, snapshot: &FeeSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_snapshots (date, p50_fee_rate, p90_fee_rate, sample_size, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(date) DO UPDATE SET
                p50_fee_rate = excluded.p50_fee_rate,
                p90_fee_rate = excluded.p90_fee_rate,
                sample_size = excluded.sample_size,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(snapshot.date.format("%Y-%m-%d").to_string())
        .bind(snapshot.p50.to_string())
        .bind(snapshot.p90.to_string())
        .bind(snapshot.sample_size)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to write fee snapshot")?;

        Ok(())
    }

    pub async fn fee_snapshot(&self, date: NaiveDate) -> Result<Option<FeeSnapshot>> {
        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT p50_fee_rate, p90_fee_rate, sample_size FROM daily_snapshots WHERE date = ?",
        )
        .bind(date.format("%Y-%m-%d").to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(p50, p90, sample_size)| -> Result<FeeSnapshot> {
            Ok(FeeSnapshot {
                date,
                p50: parse_dec(&p50, "p50_fee_rate")?,
                p90: parse_dec(&p90, "p90_fee_rate")?,
                sample_size,
            })
        })
        .transpose()
    }
}

const INSERT_ORDER_SQL: &str = "INSERT INTO orders (client_order_id, exchange_order_id, env, side, \
     order_type, status, price, orig_qty, executed_qty, executed_quote_qty, fee_amount, fee_asset, \
     fee_quote, fee_rate, discount_rate, cycle_id, created_at, updated_at) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

fn bind_order(order: &Order) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    bind_order_fields(sqlx::query(INSERT_ORDER_SQL), order)
}

fn bind_order_fields<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    order: &'q Order,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(order.client_order_id.as_str())
        .bind(order.exchange_order_id.as_str())
        .bind(order.env.as_str())
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(order.status.as_str())
        .bind(order.price.to_string())
        .bind(order.orig_qty.to_string())
        .bind(order.executed_qty.to_string())
        .bind(order.executed_quote_qty.to_string())
        .bind(order.fee_amount.map(|d| d.to_string()))
        .bind(order.fee_asset.as_deref())
        .bind(order.fee_quote.map(|d| d.to_string()))
        .bind(order.fee_rate.map(|d| d.to_string()))
        .bind(order.discount_rate.map(|d| d.to_string()))
        .bind(order.cycle_id.as_deref())
        .bind(order.created_at.timestamp_millis())
        .bind(order.updated_at.timestamp_millis())
}

fn parse_dec(value: &str, field: &str) -> Result<Decimal> {
    value
        .parse()
        .with_context(|| format!("Invalid decimal in {}: {}", field, value))
}

fn parse_opt_dec(value: Option<&str>, field: &str) -> Result<Option<Decimal>> {
    value.map(|v| parse_dec(v, field)).transpose()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("Invalid timestamp: {}", ms))
}

impl TryFrom<StoredOrder> for Order {
    type Error = anyhow::Error;

    fn try_from(row: StoredOrder) -> Result<Self> {
        Ok(Order {
            env: row.env.parse()?,
            side: row.side.parse::<OrderSide>()?,
            order_type: row.order_type.parse()?,
            status: row.status.parse()?,
            price: parse_dec(&row.price, "price")?,
            orig_qty: parse_dec(&row.orig_qty, "orig_qty")?,
            executed_qty: parse_dec(&row.executed_qty, "executed_qty")?,
            executed_quote_qty: parse_dec(&row.executed_quote_qty, "executed_quote_qty")?,
            fee_amount: parse_opt_dec(row.fee_amount.as_deref(), "fee_amount")?,
            fee_quote: parse_opt_dec(row.fee_quote.as_deref(), "fee_quote")?,
            fee_rate: parse_opt_dec(row.fee_rate.as_deref(), "fee_rate")?,
            discount_rate: parse_opt_dec(row.discount_rate.as_deref(), "discount_rate")?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            client_order_id: row.client_order_id,
            exchange_order_id: row.exchange_order_id,
            fee_asset: row.fee_asset,
            cycle_id: row.cycle_id,
        })
    }
}

impl TryFrom<StoredCandle> for Candle {
    type Error = anyhow::Error;

    fn try_from(row: StoredCandle) -> Result<Self> {
        Ok(Candle {
            open_time: from_millis(row.open_time)?,
            close_time: from_millis(row.close_time)?,
            open: parse_dec(&row.open, "open")?,
            high: parse_dec(&row.high, "high")?,
            low: parse_dec(&row.low, "low")?,
            close: parse_dec(&row.close, "close")?,
            volume: parse_dec(&row.volume, "volume")?,
            quote_volume: parse_dec(&row.quote_volume, "quote_volume")?,
            trades_count: row.trades_count,
            symbol: row.symbol,
            interval: row.interval,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::OrderType;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    pub(crate) fn order(
        client_id: &str,
        side: OrderSide,
        status: OrderStatus,
        at: DateTime<Utc>,
    ) -> Order {
        Order {
            client_order_id: client_id.to_string(),
            exchange_order_id: "1".to_string(),
            env: Environment::Testnet,
            side,
            order_type: match side {
                OrderSide::Buy => OrderType::Limit,
                OrderSide::Sell => OrderType::Market,
            },
            status,
            price: dec!(100000),
            orig_qty: dec!(0.0012),
            executed_qty: if status == OrderStatus::Filled { dec!(0.0012) } else { Decimal::ZERO },
            executed_quote_qty: if status == OrderStatus::Filled { dec!(120) } else { Decimal::ZERO },
            fee_amount: None,
            fee_asset: None,
            fee_quote: None,
            fee_rate: None,
            discount_rate: None,
            cycle_id: None,
            created_at: at,
            updated_at: at,
        }
    }

    fn candle(open_time: DateTime<Utc>, close: Decimal) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            interval: "15m".to_string(),
            open_time,
            close_time: open_time + Duration::minutes(15) - Duration::milliseconds(1),
            open: close,
            high: close + dec!(10),
            low: close - dec!(10),
            close,
            volume: dec!(1.5),
            quote_volume: dec!(150000),
            trades_count: 42,
        }
    }

    #[tokio::test]
    async fn test_settings_seed_and_audit() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.load_settings().await.unwrap().is_none());

        db.ensure_default_settings().await.unwrap();
        db.ensure_default_settings().await.unwrap();
        assert_eq!(db.load_settings().await.unwrap(), Some(Settings::default()));

        let changed = Settings {
            dry_run: false,
            min_discount_net_fees: dec!(0.75),
            ..Settings::default()
        };
        db.update_settings(&changed, "operator").await.unwrap();

        assert_eq!(db.load_settings().await.unwrap(), Some(changed));
        assert_eq!(db.count_audit_entries("settings").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_order_roundtrip_keeps_decimals_exact() {
        let db = Database::in_memory().await.unwrap();
        let mut o = order("ABUY_testnet_1", OrderSide::Buy, OrderStatus::New, Utc::now());
        o.price = dec!(99200.01);
        o.orig_qty = dec!(0.00302);
        o.discount_rate = Some(dec!(0.008));
        db.insert_order(&o).await.unwrap();

        let stored = db.find_order("ABUY_testnet_1").await.unwrap().unwrap();
        assert_eq!(stored.price, dec!(99200.01));
        assert_eq!(stored.orig_qty, dec!(0.00302));
        assert_eq!(stored.discount_rate, Some(dec!(0.008)));
        assert_eq!(stored.created_at.timestamp_millis(), o.created_at.timestamp_millis());

        // Same idempotency key is rejected
        assert!(db.insert_order(&o).await.is_err());
        assert!(!db.insert_order_if_absent(&o).await.unwrap());
        assert_eq!(db.count_orders().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();
        db.insert_order(&order("ABUY_testnet_1", OrderSide::Buy, OrderStatus::New, now))
            .await
            .unwrap();

        let filled = ExecutionUpdate {
            status: OrderStatus::Filled,
            executed_qty: Some(dec!(0.0012)),
            executed_quote_qty: Some(dec!(119.04)),
            updated_at: now,
        };
        assert!(db.update_order_execution("ABUY_testnet_1", &filled).await.unwrap());

        let regress = ExecutionUpdate {
            status: OrderStatus::New,
            executed_qty: None,
            executed_quote_qty: None,
            updated_at: now,
        };
        assert!(!db.update_order_execution("ABUY_testnet_1", &regress).await.unwrap());

        let stored = db.find_order("ABUY_testnet_1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Filled);
        assert_eq!(stored.executed_quote_qty, dec!(119.04));
    }

    #[tokio::test]
    async fn test_cycle_accepts_one_buy() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();
        let cycle = Cycle::open(Environment::Testnet, now);

        let mut sell = order("ASELL_testnet_1", OrderSide::Sell, OrderStatus::Filled, now);
        sell.cycle_id = Some(cycle.id.clone());
        db.record_sell_with_cycle(&cycle, &sell).await.unwrap();

        let mut buy = order("ABUY_testnet_2", OrderSide::Buy, OrderStatus::New, now);
        buy.cycle_id = Some(cycle.id.clone());
        db.insert_order(&buy).await.unwrap();

        let mut second = order("ABUY_testnet_3", OrderSide::Buy, OrderStatus::New, now);
        second.cycle_id = Some(cycle.id.clone());
        assert!(db.insert_order(&second).await.is_err());

        assert_eq!(db.count_buys_for_cycle(&cycle.id).await.unwrap(), 1);
        assert_eq!(db.count_open_buys(Environment::Testnet).await.unwrap(), 1);

        let summaries = db.cycle_summaries(Environment::Testnet, 10).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, CycleStatus::Open);
        assert_eq!(summaries[0].sell_client_id.as_deref(), Some("ASELL_testnet_1"));
        assert_eq!(summaries[0].buy_client_id.as_deref(), Some("ABUY_testnet_2"));
    }

    #[tokio::test]
    async fn test_failed_sell_transaction_leaves_no_cycle() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();
        db.insert_order(&order("ASELL_testnet_1", OrderSide::Sell, OrderStatus::Filled, now))
            .await
            .unwrap();

        // Duplicate client id makes the order insert fail inside the transaction
        let cycle = Cycle::open(Environment::Testnet, now);
        let dup = order("ASELL_testnet_1", OrderSide::Sell, OrderStatus::Filled, now);
        assert!(db.record_sell_with_cycle(&cycle, &dup).await.is_err());
        assert_eq!(db.count_cycles(Environment::Testnet).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_last_realized_sell_ignores_empty_fills_and_other_envs() {
        let db = Database::in_memory().await.unwrap();
        let t0 = Utc::now() - Duration::hours(30);

        db.insert_order(&order("ASELL_testnet_1", OrderSide::Sell, OrderStatus::Filled, t0))
            .await
            .unwrap();

        let mut empty = order("ASELL_testnet_2", OrderSide::Sell, OrderStatus::Filled, t0 + Duration::hours(1));
        empty.executed_qty = Decimal::ZERO;
        db.insert_order(&empty).await.unwrap();

        let mut live = order("ASELL_live_3", OrderSide::Sell, OrderStatus::Filled, t0 + Duration::hours(2));
        live.env = Environment::Live;
        db.insert_order(&live).await.unwrap();

        let last = db.last_realized_sell(Environment::Testnet).await.unwrap().unwrap();
        assert_eq!(last.client_order_id, "ASELL_testnet_1");
        assert_eq!(db.count_filled_orders().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_candle_upsert_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let t0 = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let bars: Vec<Candle> = (0..4)
            .map(|i| candle(t0 + Duration::minutes(15 * i), dec!(100000) + Decimal::from(i)))
            .collect();

        db.upsert_candles(&bars).await.unwrap();
        db.upsert_candles(&bars).await.unwrap();
        assert_eq!(db.count_candles("BTCUSDT", "15m").await.unwrap(), 4);

        let mut revised = bars[3].clone();
        revised.close = dec!(100123.45);
        db.upsert_candles(&[revised]).await.unwrap();

        let latest = db.latest_candle("BTCUSDT", "15m").await.unwrap().unwrap();
        assert_eq!(latest.open_time, bars[3].open_time);
        assert_eq!(latest.close, dec!(100123.45));

        let recent = db.recent_candles("BTCUSDT", "15m", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].open_time > recent[1].open_time);
    }

    #[tokio::test]
    async fn test_fee_snapshot_upsert() {
        let db = Database::in_memory().await.unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let mut snap = FeeSnapshot {
            date,
            p50: dec!(0.001),
            p90: dec!(0.00105),
            sample_size: 25,
        };
        db.upsert_fee_snapshot(&snap).await.unwrap();
        snap.p90 = dec!(0.0011);
        db.upsert_fee_snapshot(&snap).await.unwrap();

        assert_eq!(db.fee_snapshot(date).await.unwrap(), Some(snap));
    }
}

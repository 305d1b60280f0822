//! BTC accumulation bot
//!
//! Sells a small slice of the base balance at most once per interval and
//! rebuys with the proceeds via a single discounted limit order per cycle.

mod api;
mod bot;
mod config;
mod db;
mod market;
mod metrics;
mod models;
mod quantize;
mod trading;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{BinanceClient, Exchange, OrderRef, OrderRequest};
use crate::bot::Bot;
use crate::config::BotConfig;
use crate::db::Database;
use crate::models::{smoke_client_order_id, Environment, OrderSide, OrderType};
use crate::quantize::{floor_to_step, round_to_tick};
use crate::trading::{CycleEngine, TradingConfig};

/// BTC accumulation bot CLI.
#[derive(Parser)]
#[command(name = "accubot")]
#[command(about = "Accumulate BTC by selling small slices and rebuying below market", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./accubot.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Execution environment
    #[arg(short, long, env = "BOT_MODE", value_enum, default_value = "live")]
    mode: Environment,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cycle loop until interrupted
    Run,

    /// Run a single cycle and exit
    Cycle,

    /// Reconcile the order ledger against the exchange
    Reconcile,

    /// Fetch and store candles
    SyncCandles {
        /// Backfill depth in days when nothing is stored yet
        #[arg(long)]
        days: Option<i64>,
    },

    /// Recompute fee-rate percentiles from filled orders
    FeeStats,

    /// Show or change operator settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Show ledger status
    Status,

    /// List recent cycles
    Cycles {
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Check connectivity: filters, candles, and a placed-then-canceled order
    Smoke,
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print current settings
    Show,

    /// Update one or more settings
    Set {
        #[arg(long)]
        trading_enabled: Option<bool>,

        #[arg(long)]
        dry_run: Option<bool>,

        #[arg(long)]
        max_open_buys: Option<i64>,

        /// Minimum discount after fees, in percent
        #[arg(long)]
        min_discount: Option<Decimal>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Initialize database
    let db = Database::new(&cli.database).await?;
    db.ensure_default_settings().await?;

    // Settings and ledger views need no exchange access
    let command = match cli.command {
        Commands::Settings { action } => return settings_command(&db, action).await,
        Commands::Status => return print_status(&db, cli.mode).await,
        Commands::Cycles { limit } => return print_cycles(&db, cli.mode, limit).await,
        other => other,
    };

    let config = BotConfig::from_env(cli.mode)?;
    info!(
        env = %config.env,
        symbol = %config.symbol,
        base_url = %config.rest_base_url,
        "Loaded configuration"
    );

    let client = Arc::new(BinanceClient::new(&config)?);
    if let Err(e) = client.sync_time().await {
        warn!(error = %e, "Server time sync failed, signing with local clock");
    }
    let exchange: Arc<dyn Exchange> = client;

    let engine = CycleEngine::new(exchange.clone(), db.clone(), TradingConfig::default(), &config);

    match command {
        Commands::Run => {
            let mut bot = Bot::new(engine, config.env, config.loop_minutes);
            bot.run().await?;
        }

        Commands::Cycle => {
            let outcome = engine.run_cycle().await?;
            println!("{}", outcome);
        }

        Commands::Reconcile => {
            let report = engine.reconciler().run().await?;
            println!(
                "Reconciled: {} updated, {} forced CANCELED, {} imported",
                report.updated, report.force_canceled, report.imported
            );
        }

        Commands::SyncCandles { days } => {
            let report = match days {
                Some(d) if d > 0 => {
                    let syncer = crate::market::MarketDataSyncer::new(
                        exchange.clone(),
                        db.clone(),
                        &config.symbol,
                        &config.candle_interval,
                        d,
                    );
                    syncer.sync().await?
                }
                Some(d) => bail!("--days must be positive, got {}", d),
                None => engine.syncer().sync().await?,
            };
            let stored = db.count_candles(&config.symbol, &config.candle_interval).await?;
            println!(
                "Fetched {} candles in {} pages ({} stored for {} {})",
                report.candles, report.pages, stored, config.symbol, config.candle_interval
            );
        }

        Commands::FeeStats => {
            let stats = engine.fee_stats().refresh().await?;
            let trading = TradingConfig::default();
            println!("\n=== Fee Rates ===");
            println!("p50:           {:.4}%", stats.p50 * Decimal::ONE_HUNDRED);
            println!("p90:           {:.4}%", stats.p90 * Decimal::ONE_HUNDRED);
            println!("Samples:       {}", stats.samples);
            println!("Filled orders: {}", stats.filled_orders);
            println!(
                "Rate in use:   {:.4}%",
                stats.conservative_rate(trading.min_fills_for_fee_stats, trading.fallback_fee_rate)
                    * Decimal::ONE_HUNDRED
            );
        }

        Commands::Smoke => smoke(exchange.as_ref(), &engine, &config).await?,

        Commands::Settings { .. } | Commands::Status | Commands::Cycles { .. } => {}
    }

    Ok(())
}

async fn settings_command(db: &Database, action: SettingsAction) -> Result<()> {
    let Some(mut settings) = db.load_settings().await? else {
        bail!("Settings row missing");
    };

    if let SettingsAction::Set {
        trading_enabled,
        dry_run,
        max_open_buys,
        min_discount,
    } = action
    {
        if let Some(v) = trading_enabled {
            settings.trading_enabled = v;
        }
        if let Some(v) = dry_run {
            settings.dry_run = v;
        }
        if let Some(v) = max_open_buys {
            if v < 0 {
                bail!("max_open_buys must not be negative");
            }
            settings.max_open_buys = v;
        }
        if let Some(v) = min_discount {
            if v < Decimal::ZERO {
                bail!("min_discount must not be negative");
            }
            settings.min_discount_net_fees = v;
        }

        db.update_settings(&settings, "cli").await?;
        info!(?settings, "Settings updated");
    }

    println!("\n=== Settings ===");
    println!("Trading enabled: {}", settings.trading_enabled);
    println!("Dry run:         {}", settings.dry_run);
    println!("Max open buys:   {}", settings.max_open_buys);
    println!("Min discount:    {}%", settings.min_discount_net_fees);
    Ok(())
}

async fn print_status(db: &Database, env: Environment) -> Result<()> {
    let settings = db.load_settings().await?.unwrap_or_default();
    let open_buys = db.count_open_buys(env).await?;
    let cycles = db.count_cycles(env).await?;
    let total_orders = db.count_orders().await?;
    let settings_changes = db.count_audit_entries("settings").await?;
    let last_sell = db.last_realized_sell(env).await?;
    let fees = db.fee_snapshot(Utc::now().date_naive()).await?;

    println!("\n=== Status ({}) ===", env);
    println!(
        "Mode:            {}",
        if settings.is_idle() {
            "idle"
        } else if settings.dry_run {
            "dry run"
        } else {
            "trading"
        }
    );
    println!("Open buys:       {}/{}", open_buys, settings.max_open_buys);
    println!("Cycles:          {}", cycles);
    println!("Orders (all):    {}", total_orders);
    println!("Settings edits:  {}", settings_changes);
    match last_sell {
        Some(s) => println!(
            "Last sell:       {} ({} for {:.2})",
            s.updated_at.format("%Y-%m-%d %H:%M UTC"),
            s.executed_qty,
            s.executed_quote_qty
        ),
        None => println!("Last sell:       none"),
    }
    if let Some(f) = fees {
        println!(
            "Fees today:      p50 {:.4}% / p90 {:.4}% ({} samples)",
            f.p50 * Decimal::ONE_HUNDRED,
            f.p90 * Decimal::ONE_HUNDRED,
            f.sample_size
        );
    }

    let orders = db.recent_orders(env, 10).await?;
    if orders.is_empty() {
        return Ok(());
    }

    println!(
        "\n{:<28} {:<5} {:<7} {:<17} {:>12} {:>12} {:>12}",
        "CLIENT ID", "SIDE", "TYPE", "STATUS", "PRICE", "QTY", "QUOTE"
    );
    println!("{}", "-".repeat(99));
    for o in orders {
        println!(
            "{:<28} {:<5} {:<7} {:<17} {:>12.2} {:>12} {:>12.2}",
            truncate(&o.client_order_id, 27),
            o.side.as_str(),
            o.order_type.as_str(),
            o.status.as_str(),
            o.price,
            o.orig_qty,
            o.executed_quote_qty
        );
    }
    Ok(())
}

async fn print_cycles(db: &Database, env: Environment, limit: i64) -> Result<()> {
    let cycles = db.cycle_summaries(env, limit).await?;
    if cycles.is_empty() {
        println!("No cycles recorded for {}.", env);
        return Ok(());
    }

    println!(
        "\n{:<38} {:<17} {:<7} {:<28} {:<28}",
        "CYCLE", "STARTED", "STATUS", "SELL", "BUY"
    );
    println!("{}", "-".repeat(122));
    for c in cycles {
        let buy = match (&c.buy_client_id, c.buy_status) {
            (Some(id), Some(status)) => format!("{} {}", truncate(id, 18), status),
            _ => "-".to_string(),
        };
        println!(
            "{:<38} {:<17} {:<7} {:<28} {:<28}",
            c.cycle.id,
            c.cycle.started_at.format("%Y-%m-%d %H:%M"),
            c.status.as_str(),
            c.sell_client_id.as_deref().unwrap_or("-"),
            buy
        );
    }
    Ok(())
}

/// Filters, candles, and when credentials exist a limit buy far below
/// market that is canceled right away.
async fn smoke(exchange: &dyn Exchange, engine: &CycleEngine, config: &BotConfig) -> Result<()> {
    let Some(filters) = exchange.refresh_filters(&config.symbol).await? else {
        bail!("No filters reported for {}", config.symbol);
    };
    println!(
        "Filters: step {} tick {} min qty {} min notional {}",
        filters.step_size, filters.tick_size, filters.min_qty, filters.min_notional
    );

    let report = engine.syncer().sync().await?;
    println!("Candles: {} fetched", report.candles);

    let price = exchange.price(&config.symbol).await;
    println!("Price: {}", price);

    if !config.has_credentials() && !config.env.is_paper() {
        println!("No API credentials, skipping order round trip");
        return Ok(());
    }
    if price <= Decimal::ZERO || !filters.is_tradable() {
        bail!("Cannot size smoke order: price {} filters {:?}", price, filters);
    }

    // Half the market price, sized to twice the minimum notional
    let Some(limit_price) = round_to_tick(price / Decimal::TWO, filters.tick_size) else {
        bail!("Price overflow sizing smoke order");
    };
    let Some(quantity) = (filters.min_notional * Decimal::TWO)
        .checked_div(limit_price)
        .and_then(|q| floor_to_step(q, filters.step_size))
    else {
        bail!("Quantity overflow sizing smoke order");
    };

    let request = OrderRequest {
        symbol: config.symbol.clone(),
        side: OrderSide::Buy,
        order_type: OrderType::Limit,
        quantity,
        price: Some(limit_price),
        client_order_id: smoke_client_order_id(config.env, Utc::now()),
    };
    let ack = exchange.place_order(&request).await?;
    println!(
        "Placed {} {} @ {} -> {} (order {})",
        request.client_order_id, quantity, limit_price, ack.status, ack.order_id
    );

    let canceled = exchange
        .cancel_order(&config.symbol, &OrderRef::ClientId(request.client_order_id.clone()))
        .await?;
    println!("Canceled {} -> {}", canceled.client_order_id, canceled.status);
    Ok(())
}

/// Truncate a string to max length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}

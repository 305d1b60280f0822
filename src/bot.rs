//! Bot runner: paced cycle loop with graceful shutdown.
//!
//! Handles:
//! - Running one reconciliation-gated sell/buy cycle per period
//! - Subtracting cycle time from the pause, with a floor
//! - Stopping between cycles on Ctrl-C

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::models::Environment;
use crate::trading::{CycleEngine, CycleOutcome, Decision};

/// Shortest pause between two cycles.
const MIN_PAUSE: Duration = Duration::from_secs(1);

/// Time to wait after a cycle that took `elapsed`.
pub fn next_pause(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed).max(MIN_PAUSE)
}

pub struct Bot {
    engine: CycleEngine,
    env: Environment,
    period: Duration,

    stats: BotStats,

    /// Shutdown flag
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Bot {
    pub fn new(engine: CycleEngine, env: Environment, loop_minutes: u64) -> Self {
        Self {
            engine,
            env,
            period: Duration::from_secs(loop_minutes * 60),
            stats: BotStats::new(env),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Get shutdown signal for external control.
    #[cfg(test)]
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Main run loop. A cycle in progress always completes; shutdown is
    /// only observed between cycles.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            env = %self.env,
            period_secs = self.period.as_secs(),
            "Starting accumulation loop"
        );

        let shutdown = self.shutdown.clone();
        let wake = self.wake.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
            wake.notify_one();
        });

        self.stats.is_running = true;
        while !self.shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.tick().await;

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let pause = next_pause(self.period, started.elapsed());
            info!(pause_secs = pause.as_secs(), "Sleeping until next cycle");
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.wake.notified() => {}
            }
        }
        self.stats.is_running = false;

        info!("{}", self.stats);
        info!("Bot shutdown complete");
        Ok(())
    }

    /// One cycle. Errors are logged and the loop carries on.
    async fn tick(&mut self) {
        match self.engine.run_cycle().await {
            Ok(outcome) => {
                info!(outcome = %outcome, "[CYCLE] Done");
                self.stats.record(&outcome);
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "[CYCLE] Error in cycle");
                self.stats.errors += 1;
                self.stats.cycles += 1;
            }
        }
    }

    #[cfg(test)]
    pub fn stats(&self) -> &BotStats {
        &self.stats
    }
}

/// Loop statistics since start.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub env: Environment,
    pub cycles: u64,
    pub aborted: u64,
    pub sells_placed: u64,
    pub buys_placed: u64,
    pub failures: u64,
    pub errors: u64,
    pub last_outcome: Option<String>,
    pub is_running: bool,
}

impl BotStats {
    fn new(env: Environment) -> Self {
        Self {
            env,
            cycles: 0,
            aborted: 0,
            sells_placed: 0,
            buys_placed: 0,
            failures: 0,
            errors: 0,
            last_outcome: None,
            is_running: false,
        }
    }

    fn record(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        self.last_outcome = Some(outcome.to_string());

        match outcome {
            CycleOutcome::Aborted(_) => self.aborted += 1,
            CycleOutcome::Completed { sell, buy } => {
                if sell.is_place() {
                    self.sells_placed += 1;
                }
                if buy.as_ref().is_some_and(Decision::is_place) {
                    self.buys_placed += 1;
                }
                if sell.is_fail() || buy.as_ref().is_some_and(Decision::is_fail) {
                    self.failures += 1;
                }
            }
        }
    }
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "Environment:     {}", self.env)?;
        writeln!(f, "Cycles:          {} (Aborted: {}, Errors: {})",
            self.cycles, self.aborted, self.errors)?;
        writeln!(f, "Orders Placed:   {} sells, {} buys", self.sells_placed, self.buys_placed)?;
        writeln!(f, "Stage Failures:  {}", self.failures)?;
        writeln!(f, "Last Outcome:    {}", self.last_outcome.as_deref().unwrap_or("none"))?;
        writeln!(f, "Status:          {}",
            if self.is_running { "Running" } else { "Stopped" })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_subtracts_elapsed_with_floor() {
        let hour = Duration::from_secs(3600);
        assert_eq!(next_pause(hour, Duration::from_secs(600)), Duration::from_secs(3000));
        assert_eq!(next_pause(hour, Duration::from_secs(3599)), MIN_PAUSE);
        assert_eq!(next_pause(hour, Duration::from_secs(7200)), MIN_PAUSE);
    }

    #[test]
    fn test_stats_count_outcomes() {
        let mut stats = BotStats::new(Environment::Paper);
        stats.record(&CycleOutcome::Aborted("reconciliation failed".to_string()));
        stats.record(&CycleOutcome::Completed {
            sell: Decision::Place {
                client_order_id: "ASELL_paper_1".to_string(),
            },
            buy: Some(Decision::Place {
                client_order_id: "ABUY_paper_2".to_string(),
            }),
        });
        stats.record(&CycleOutcome::Completed {
            sell: Decision::Fail("rejected".to_string()),
            buy: None,
        });

        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.aborted, 1);
        assert_eq!(stats.sells_placed, 1);
        assert_eq!(stats.buys_placed, 1);
        assert_eq!(stats.failures, 1);
        assert!(stats.to_string().contains("1 sells, 1 buys"));
    }

    #[tokio::test]
    async fn test_run_stops_when_shutdown_is_set() {
        use crate::db::Database;
        use crate::testing::{bot_config, FakeExchange};
        use crate::trading::TradingConfig;

        let db = Database::in_memory().await.unwrap();
        db.ensure_default_settings().await.unwrap();
        let engine = CycleEngine::new(
            Arc::new(FakeExchange::new()),
            db,
            TradingConfig::default(),
            &bot_config(),
        );

        let mut bot = Bot::new(engine, Environment::Testnet, 60);
        bot.shutdown_signal().store(true, Ordering::SeqCst);
        tokio_test::assert_ok!(bot.run().await);
        assert_eq!(bot.stats().cycles, 0);
        assert!(!bot.stats().is_running);
    }
}

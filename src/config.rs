//! Runtime configuration assembled from the environment.

use anyhow::{bail, Context, Result};
use std::env;
use std::str::FromStr;

use crate::models::Environment;

pub const LIVE_REST_URL: &str = "https://api.binance.com";
pub const TESTNET_REST_URL: &str = "https://testnet.binance.vision";

/// Connection and market settings for one bot process.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Execution environment; also tags every order written to the ledger
    pub env: Environment,

    pub rest_base_url: String,

    /// Empty when not configured; signed calls then fail with a
    /// configuration error
    pub api_key: String,
    pub api_secret: String,

    /// Loop period in minutes
    pub loop_minutes: u64,

    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,

    pub candle_interval: String,

    /// Lookback used when no candles are stored yet
    pub candle_backfill_days: i64,
}

impl BotConfig {
    /// Read configuration for `env`. API keys are chosen by mode: paper mode
    /// uses the testnet keys for its signed reads.
    pub fn from_env(env: Environment) -> Result<Self> {
        let (key_var, secret_var) = match env {
            Environment::Live => ("BINANCE_API_KEY_LIVE", "BINANCE_API_SECRET_LIVE"),
            Environment::Testnet | Environment::Paper => {
                ("BINANCE_API_KEY_TESTNET", "BINANCE_API_SECRET_TESTNET")
            }
        };

        let default_url = match env {
            Environment::Live => LIVE_REST_URL,
            Environment::Testnet | Environment::Paper => TESTNET_REST_URL,
        };

        let config = Self {
            env,
            rest_base_url: var_or("BINANCE_REST_BASE_URL", default_url)
                .trim_end_matches('/')
                .to_string(),
            api_key: env::var(key_var).unwrap_or_default(),
            api_secret: env::var(secret_var).unwrap_or_default(),
            loop_minutes: parse_var("LOOP_MINUTES", 60)?,
            symbol: var_or("TRADING_SYMBOL", "BTCUSDT"),
            base_asset: var_or("BASE_ASSET", "BTC"),
            quote_asset: var_or("QUOTE_ASSET", "USDT"),
            candle_interval: var_or("CANDLE_INTERVAL", "15m"),
            candle_backfill_days: parse_var("CANDLE_BACKFILL_DAYS", 1)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.loop_minutes == 0 {
            bail!("LOOP_MINUTES must be at least 1");
        }
        if self.candle_backfill_days <= 0 {
            bail!("CANDLE_BACKFILL_DAYS must be positive");
        }
        if !self.symbol.starts_with(&self.base_asset) || !self.symbol.ends_with(&self.quote_asset) {
            bail!(
                "TRADING_SYMBOL {} does not match {}/{}",
                self.symbol,
                self.base_asset,
                self.quote_asset
            );
        }
        Ok(())
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {}", name, v)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BotConfig {
        BotConfig {
            env: Environment::Testnet,
            rest_base_url: TESTNET_REST_URL.to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            loop_minutes: 60,
            symbol: "BTCUSDT".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            candle_interval: "15m".to_string(),
            candle_backfill_days: 1,
        }
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());
        assert!(!config().has_credentials());

        let mismatched = BotConfig {
            symbol: "ETHUSDT".to_string(),
            ..config()
        };
        assert!(mismatched.validate().is_err());

        let no_loop = BotConfig {
            loop_minutes: 0,
            ..config()
        };
        assert!(no_loop.validate().is_err());
    }
}

//! Candle ingestion and volatility estimates derived from stored candles.

mod syncer;
mod volatility;

pub use syncer::MarketDataSyncer;
pub use volatility::atr_percent;

//! Fee statistics over the order ledger.

mod fee_stats;

pub use fee_stats::FeeStatsEstimator;

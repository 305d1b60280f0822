//! Trading logic: reconciliation, discount sizing, and the sell/buy cycle.

mod config;
mod decision;
mod discount;
mod pipeline;
mod reconcile;

pub use config::TradingConfig;
pub use decision::{CycleOutcome, Decision};
pub use pipeline::CycleEngine;
pub use reconcile::Reconciler;

//! Cycle model: one realized sell and its at-most-one paired buy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::order::{Environment, OrderStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CycleStatus {
    Open,
    Closed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Open => "OPEN",
            CycleStatus::Closed => "CLOSED",
        }
    }

    /// Closure is derived: a cycle is closed once its paired buy has filled.
    pub fn derive(paired_buy_status: Option<OrderStatus>) -> Self {
        match paired_buy_status {
            Some(OrderStatus::Filled) => CycleStatus::Closed,
            _ => CycleStatus::Open,
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted cycle row. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    pub id: String,
    pub env: Environment,
    pub started_at: DateTime<Utc>,
}

impl Cycle {
    pub fn open(env: Environment, started_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            env,
            started_at,
        }
    }
}

/// Read-side view of a cycle joined with its sell and paired buy.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub cycle: Cycle,
    pub sell_client_id: Option<String>,
    pub buy_client_id: Option<String>,
    pub buy_status: Option<OrderStatus>,
    pub status: CycleStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_is_derived_from_paired_buy() {
        assert_eq!(CycleStatus::derive(None), CycleStatus::Open);
        assert_eq!(CycleStatus::derive(Some(OrderStatus::New)), CycleStatus::Open);
        assert_eq!(
            CycleStatus::derive(Some(OrderStatus::Canceled)),
            CycleStatus::Open
        );
        assert_eq!(
            CycleStatus::derive(Some(OrderStatus::Filled)),
            CycleStatus::Closed
        );
    }
}

//! Per-stage outcomes of a cycle.

use std::fmt;

/// What a stage decided. Every variant is logged verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Nothing placed, with the reason
    Skip(String),
    /// Order placed and recorded
    Place { client_order_id: String },
    /// Would have placed; settings say dry run
    DryRun,
    /// Execution failed, with the error
    Fail(String),
}

impl Decision {
    pub fn skip(reason: impl Into<String>) -> Self {
        Decision::Skip(reason.into())
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, Decision::Fail(_))
    }

    pub fn is_place(&self) -> bool {
        matches!(self, Decision::Place { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Decision::Skip(_) => "SKIP",
            Decision::Place { .. } => "PLACE",
            Decision::DryRun => "DRY_RUN",
            Decision::Fail(_) => "FAIL",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Decision::Skip(r) | Decision::Fail(r) => r,
            Decision::Place { client_order_id } => client_order_id,
            Decision::DryRun => "dry run",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.reason())
    }
}

/// Result of one pipeline iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Stopped before the sell stage
    Aborted(String),
    /// Both stages evaluated; `buy` is `None` when the sell failed
    Completed {
        sell: Decision,
        buy: Option<Decision>,
    },
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Aborted(reason) => write!(f, "aborted: {}", reason),
            CycleOutcome::Completed { sell, buy: Some(buy) } => {
                write!(f, "sell={} buy={}", sell, buy)
            }
            CycleOutcome::Completed { sell, buy: None } => {
                write!(f, "sell={} buy=not attempted", sell)
            }
        }
    }
}

//! Typed errors at the exchange boundary.

use rust_decimal::Decimal;
use thiserror::Error;

/// Pre-submission filter check failures. Raised before any network call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterViolation {
    #[error("quantity rounds to zero at step size {step}")]
    ZeroQuantity { step: Decimal },
    #[error("quantity {qty} below minQty {min}")]
    BelowMinQty { qty: Decimal, min: Decimal },
    #[error("notional {notional} below minNotional {min}")]
    BelowMinNotional { notional: Decimal, min: Decimal },
    #[error("price required for LIMIT order")]
    MissingLimitPrice,
    #[error("value {value} cannot be quantized to {granularity}")]
    Unquantizable { value: Decimal, granularity: Decimal },
    #[error("arithmetic overflow computing {0}")]
    Overflow(&'static str),
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("missing API key or secret for signed request")]
    MissingCredentials,
    #[error("order validation failed: {0}")]
    Validation(#[from] FilterViolation),
    #[error("trading filters unavailable for {0}")]
    FiltersUnavailable(String),
    #[error("http request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("exchange api error (status={status}, code={code:?}): {msg}")]
    Api {
        status: u16,
        code: Option<i64>,
        msg: String,
    },
    #[error("response decode error: {0}")]
    Decode(String),
    #[error("signature error: {0}")]
    Signature(String),
}

impl ExchangeError {
    /// Whether a retry of the same idempotent read could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ExchangeError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

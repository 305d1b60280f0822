//! Exchange access: the `Exchange` trait, the Binance REST client, and the
//! typed request/response structs they share.

mod binance_client;
mod error;
mod exchange;
mod types;

pub use binance_client::BinanceClient;
pub use exchange::Exchange;
#[cfg(test)]
pub use error::ExchangeError;
#[cfg(test)]
pub use exchange::validate_order;
pub use types::*;

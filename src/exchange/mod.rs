//! Venue and market-data interfaces, plus the simulated venue used in paper mode.

mod paper;
mod replay;
mod traits;

pub use paper::PaperExchange;
pub use replay::ReplayMarketData;
pub use traits::{rate_category, ExchangeClient, MarketDataProvider};

#[cfg(test)]
pub use traits::{MockExchangeClient, MockMarketDataProvider};

use async_trait::async_trait;

use crate::domain::{Balance, MarketSnapshot, OrderAck, OrderBook, OrderRequest, VenuePosition};
use crate::error::Result;
use crate::execution::RateCategory;

/// Derivatives venue used for order placement and account queries.
///
/// Implementations classify their failures through [`crate::error::EngineError`]:
/// transport problems as `Network`/`Timeout`/`RateLimited`, credential problems
/// as `Auth`, and hard rejections as `VenueRejected`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the venue can rest an order with a hidden quantity
    fn supports_iceberg(&self) -> bool {
        false
    }

    /// Submit an order. Resubmitting an already-known client order id must not
    /// create a second order.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    async fn fetch_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool>;

    async fn fetch_balance(&self) -> Result<Balance>;

    async fn fetch_positions(&self) -> Result<Vec<VenuePosition>>;

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook>;
}

/// Rate category each venue operation counts against
pub fn rate_category(operation: &str) -> RateCategory {
    match operation {
        "place_order" | "cancel_order" | "fetch_order" => RateCategory::Order,
        "fetch_balance" | "fetch_positions" => RateCategory::Account,
        _ => RateCategory::MarketData,
    }
}

/// Source of market snapshots (candles, book, ticker) for the scan cycle
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Symbols this provider can serve
    fn universe(&self) -> Vec<String>;

    /// Snapshots for the requested symbols. Unknown symbols are omitted.
    async fn get_snapshot(&self, symbols: &[String]) -> Result<Vec<MarketSnapshot>>;
}

//! Simulated venue for paper trading.
//!
//! Orders fill against the latest order book, consuming displayed depth level
//! by level. Resting (GTC) orders are re-matched whenever the market is
//! refreshed. Client order ids are deduplicated, so a resubmission returns the
//! original acknowledgement.

use async_trait::async_trait;
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ExchangeClient, MarketDataProvider, ReplayMarketData};
use crate::config::PaperConfig;
use crate::domain::{
    Balance, MarketSnapshot, OrderAck, OrderBook, OrderRequest, OrderSide, OrderStatus,
    OrderType, TimeInForce, VenuePosition,
};
use crate::error::{EngineError, OrderError, Result};

#[derive(Debug, Clone, Copy, Default)]
struct PaperPosition {
    /// Signed: positive long, negative short
    quantity: Decimal,
    entry_price: Decimal,
}

#[derive(Debug, Default)]
struct PaperState {
    books: HashMap<String, OrderBook>,
    marks: HashMap<String, Decimal>,
    cash: Decimal,
    positions: HashMap<String, PaperPosition>,
    orders: HashMap<String, OrderAck>,
    resting: HashMap<String, OrderRequest>,
    by_client_id: HashMap<String, String>,
    next_id: u64,
    fail_next: u32,
}

/// Walk one side of `book`, taking liquidity up to `quantity` and `limit`.
/// Returns (filled quantity, filled notional).
fn take_liquidity(
    book: &mut OrderBook,
    side: OrderSide,
    quantity: Decimal,
    limit: Option<Decimal>,
) -> (Decimal, Decimal) {
    let levels = match side {
        OrderSide::Buy => &mut book.asks,
        OrderSide::Sell => &mut book.bids,
    };
    let mut remaining = quantity;
    let mut notional = Decimal::ZERO;
    for level in levels.iter_mut() {
        if remaining <= Decimal::ZERO {
            break;
        }
        if let Some(limit) = limit {
            let crosses = match side {
                OrderSide::Buy => level.price <= limit,
                OrderSide::Sell => level.price >= limit,
            };
            if !crosses {
                break;
            }
        }
        let take = remaining.min(level.quantity);
        level.quantity -= take;
        remaining -= take;
        notional += take * level.price;
    }
    levels.retain(|l| l.quantity > Decimal::ZERO);
    (quantity - remaining, notional)
}

impl PaperState {
    fn settle(&mut self, symbol: &str, side: OrderSide, qty: Decimal, price: Decimal, fee: Decimal) {
        let delta = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let mut realized = Decimal::ZERO;
        let pos = self.positions.entry(symbol.to_string()).or_default();
        let old = pos.quantity;
        let total = old + delta;

        if old.is_zero() || (old > Decimal::ZERO) == (delta > Decimal::ZERO) {
            pos.entry_price = (pos.entry_price * old.abs() + price * delta.abs()) / total.abs();
        } else {
            let closing = delta.abs().min(old.abs());
            realized = (price - pos.entry_price) * closing * old.signum();
            if !total.is_zero() && (total > Decimal::ZERO) != (old > Decimal::ZERO) {
                pos.entry_price = price;
            }
        }
        pos.quantity = total;
        if total.is_zero() {
            self.positions.remove(symbol);
        }
        self.cash += realized - fee;
    }

    fn unrealized(&self) -> Decimal {
        self.positions
            .iter()
            .map(|(symbol, p)| {
                let mark = self.marks.get(symbol).copied().unwrap_or(p.entry_price);
                (mark - p.entry_price) * p.quantity
            })
            .sum()
    }

    fn equity(&self) -> Decimal {
        self.cash + self.unrealized()
    }

    /// Re-match resting orders after a book change
    fn match_resting(&mut self, fee_rate: Decimal) {
        let ids: Vec<String> = self.resting.keys().cloned().collect();
        for order_id in ids {
            let Some(request) = self.resting.get(&order_id).cloned() else {
                continue;
            };
            let Some(ack) = self.orders.get(&order_id).cloned() else {
                continue;
            };
            let remaining = request.quantity - ack.filled_quantity;
            let Some(book) = self.books.get_mut(&request.symbol) else {
                continue;
            };
            let (filled, notional) =
                take_liquidity(book, request.side, remaining, request.limit_price);
            if filled.is_zero() {
                continue;
            }
            let fee = notional * fee_rate;
            self.settle(&request.symbol, request.side, filled, notional / filled, fee);

            let total_filled = ack.filled_quantity + filled;
            let prior_notional = ack.avg_fill_price.unwrap_or_default() * ack.filled_quantity;
            let updated = OrderAck {
                status: if total_filled >= request.quantity {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                },
                filled_quantity: total_filled,
                avg_fill_price: Some((prior_notional + notional) / total_filled),
                fee: ack.fee + fee,
                ..ack
            };
            if updated.status == OrderStatus::Filled {
                self.resting.remove(&order_id);
            }
            debug!(%order_id, filled = %total_filled, "resting paper order matched");
            self.orders.insert(order_id, updated);
        }
    }
}

/// In-process venue with simulated fills and account state
#[derive(Debug)]
pub struct PaperExchange {
    config: PaperConfig,
    feed: Option<ReplayMarketData>,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> Self {
        let state = PaperState {
            cash: config.initial_equity,
            ..Default::default()
        };
        Self {
            config,
            feed: None,
            state: Mutex::new(state),
        }
    }

    /// Paper venue that also serves `feed` as its market data
    pub fn with_feed(config: PaperConfig, feed: ReplayMarketData) -> Self {
        Self {
            feed: Some(feed),
            ..Self::new(config)
        }
    }

    /// Replace books and marks from fresh snapshots
    pub async fn update_market(&self, snapshots: &[MarketSnapshot]) {
        let mut state = self.state.lock().await;
        for snapshot in snapshots {
            state
                .books
                .insert(snapshot.symbol.clone(), snapshot.order_book.clone());
            state
                .marks
                .insert(snapshot.symbol.clone(), snapshot.last_price());
        }
        state.match_resting(self.config.taker_fee_rate);
    }

    pub async fn set_order_book(&self, symbol: &str, book: OrderBook) {
        let mut state = self.state.lock().await;
        if let Some(mid) = book.mid_price() {
            state.marks.insert(symbol.to_string(), mid);
        }
        state.books.insert(symbol.to_string(), book);
        state.match_resting(self.config.taker_fee_rate);
    }

    pub async fn set_mark(&self, symbol: &str, price: Decimal) {
        self.state
            .lock()
            .await
            .marks
            .insert(symbol.to_string(), price);
    }

    pub async fn set_cash(&self, cash: Decimal) {
        self.state.lock().await.cash = cash;
    }

    /// Make the next `n` order placements fail with a network error
    pub async fn fail_next_orders(&self, n: u32) {
        self.state.lock().await.fail_next = n;
    }

    /// Distinct orders accepted so far
    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    pub async fn equity(&self) -> Decimal {
        self.state.lock().await.equity()
    }

    pub async fn position(&self, symbol: &str) -> Option<VenuePosition> {
        let state = self.state.lock().await;
        state.positions.get(symbol).map(|p| VenuePosition {
            symbol: symbol.to_string(),
            quantity: p.quantity,
            entry_price: p.entry_price,
        })
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    fn supports_iceberg(&self) -> bool {
        self.config.supports_iceberg
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let mut state = self.state.lock().await;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(EngineError::Network("simulated disconnect".into()));
        }
        if let Some(order_id) = state.by_client_id.get(&request.client_order_id) {
            debug!(client_order_id = %request.client_order_id, "duplicate client order id");
            return state.orders.get(order_id).cloned().ok_or_else(|| {
                EngineError::Order(OrderError::NotFound {
                    order_id: order_id.clone(),
                })
            });
        }
        if request.quantity <= Decimal::ZERO {
            return Err(OrderError::Invalid(format!(
                "non-positive quantity {}",
                request.quantity
            ))
            .into());
        }

        state.next_id += 1;
        let order_id = format!("paper-{}", state.next_id);

        let mut quantity = request.quantity;
        if request.reduce_only {
            let held = state
                .positions
                .get(&request.symbol)
                .map_or(Decimal::ZERO, |p| p.quantity);
            let reducible = match request.side {
                OrderSide::Buy => (-held).max(Decimal::ZERO),
                OrderSide::Sell => held.max(Decimal::ZERO),
            };
            quantity = quantity.min(reducible);
        }

        let limit = match request.order_type {
            OrderType::Limit => request.limit_price,
            OrderType::Market => None,
        };
        let (filled, notional) = match state.books.get_mut(&request.symbol) {
            Some(book) if quantity > Decimal::ZERO => {
                take_liquidity(book, request.side, quantity, limit)
            }
            _ => (Decimal::ZERO, Decimal::ZERO),
        };
        let fee = notional * self.config.taker_fee_rate;
        let avg_fill_price = (filled > Decimal::ZERO).then(|| notional / filled);
        if let Some(price) = avg_fill_price {
            state.settle(&request.symbol, request.side, filled, price, fee);
        }

        let status = if quantity <= Decimal::ZERO {
            OrderStatus::Rejected
        } else if filled >= quantity {
            OrderStatus::Filled
        } else if request.time_in_force == TimeInForce::GTC {
            let mut rest = request.clone();
            rest.quantity = quantity;
            state.resting.insert(order_id.clone(), rest);
            if filled > Decimal::ZERO {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Submitted
            }
        } else {
            OrderStatus::Cancelled
        };

        let ack = OrderAck {
            order_id: order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            status,
            filled_quantity: filled,
            avg_fill_price,
            fee,
        };
        info!(
            symbol = %request.symbol,
            side = %request.side,
            %order_id,
            requested = %request.quantity,
            filled = %filled,
            status = ?status,
            "paper order"
        );
        state
            .by_client_id
            .insert(request.client_order_id.clone(), order_id.clone());
        state.orders.insert(order_id, ack.clone());
        Ok(ack)
    }

    async fn fetch_order(&self, _symbol: &str, order_id: &str) -> Result<OrderAck> {
        self.state
            .lock()
            .await
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| {
                OrderError::NotFound {
                    order_id: order_id.to_string(),
                }
                .into()
            })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.resting.remove(order_id).is_none() {
            return Ok(false);
        }
        if let Some(ack) = state.orders.get_mut(order_id) {
            ack.status = OrderStatus::Cancelled;
        }
        Ok(true)
    }

    async fn fetch_balance(&self) -> Result<Balance> {
        let state = self.state.lock().await;
        let equity = state.equity();
        let margin: Decimal = state
            .positions
            .values()
            .map(|p| p.quantity.abs() * p.entry_price / self.config.leverage)
            .sum();
        Ok(Balance {
            total_equity: equity,
            available: equity - margin,
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<VenuePosition>> {
        let state = self.state.lock().await;
        let mut positions: Vec<VenuePosition> = state
            .positions
            .iter()
            .map(|(symbol, p)| VenuePosition {
                symbol: symbol.clone(),
                quantity: p.quantity,
                entry_price: p.entry_price,
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook> {
        let state = self.state.lock().await;
        let book = state
            .books
            .get(symbol)
            .ok_or_else(|| EngineError::MarketDataUnavailable(format!("no book for {symbol}")))?;
        Ok(OrderBook {
            bids: book.bids.iter().take(depth).copied().collect(),
            asks: book.asks.iter().take(depth).copied().collect(),
            timestamp: book.timestamp,
        })
    }
}

#[async_trait]
impl MarketDataProvider for PaperExchange {
    fn universe(&self) -> Vec<String> {
        self.feed
            .as_ref()
            .map(MarketDataProvider::universe)
            .unwrap_or_default()
    }

    async fn get_snapshot(&self, symbols: &[String]) -> Result<Vec<MarketSnapshot>> {
        let feed = self
            .feed
            .as_ref()
            .ok_or_else(|| EngineError::MarketDataUnavailable("no market data feed".into()))?;
        let snapshots = feed.get_snapshot(symbols).await?;
        self.update_market(&snapshots).await;
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BookLevel;
    use rust_decimal_macros::dec;

    fn book() -> OrderBook {
        OrderBook {
            bids: vec![
                BookLevel::new(dec!(99.9), dec!(10)),
                BookLevel::new(dec!(99.5), dec!(10)),
            ],
            asks: vec![
                BookLevel::new(dec!(100.1), dec!(10)),
                BookLevel::new(dec!(100.5), dec!(10)),
            ],
            timestamp: None,
        }
    }

    async fn exchange() -> PaperExchange {
        let ex = PaperExchange::new(PaperConfig {
            taker_fee_rate: Decimal::ZERO,
            ..PaperConfig::default()
        });
        ex.set_order_book("SOLUSDT", book()).await;
        ex
    }

    #[tokio::test]
    async fn test_market_order_walks_the_book() {
        let ex = exchange().await;
        let ack = ex
            .place_order(&OrderRequest::market("c1".into(), "SOLUSDT", OrderSide::Buy, dec!(15)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.filled_quantity, dec!(15));
        // 10 @ 100.1 + 5 @ 100.5
        assert_eq!(ack.avg_fill_price.unwrap() * dec!(15), dec!(1503.5));

        let remaining = ex.fetch_order_book("SOLUSDT", 10).await.unwrap();
        assert_eq!(remaining.asks.len(), 1);
        assert_eq!(remaining.asks[0].quantity, dec!(5));
    }

    #[tokio::test]
    async fn test_limit_ioc_partial_fill() {
        let ex = exchange().await;
        let req = OrderRequest::limit_ioc("c1".into(), "SOLUSDT", OrderSide::Buy, dec!(15), dec!(100.2));
        let ack = ex.place_order(&req).await.unwrap();
        assert_eq!(ack.filled_quantity, dec!(10));
        assert_eq!(ack.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_duplicate_client_id_is_not_refilled() {
        let ex = exchange().await;
        let req = OrderRequest::market("same".into(), "SOLUSDT", OrderSide::Buy, dec!(5));
        let first = ex.place_order(&req).await.unwrap();
        let second = ex.place_order(&req).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(ex.order_count().await, 1);
        assert_eq!(ex.position("SOLUSDT").await.unwrap().quantity, dec!(5));
    }

    #[tokio::test]
    async fn test_reduce_only_clamps_to_position() {
        let ex = exchange().await;
        ex.place_order(&OrderRequest::market("open".into(), "SOLUSDT", OrderSide::Buy, dec!(4)))
            .await
            .unwrap();
        let ack = ex
            .place_order(
                &OrderRequest::market("close".into(), "SOLUSDT", OrderSide::Sell, dec!(10))
                    .reduce_only(),
            )
            .await
            .unwrap();
        assert_eq!(ack.filled_quantity, dec!(4));
        assert!(ex.position("SOLUSDT").await.is_none());

        let rejected = ex
            .place_order(
                &OrderRequest::market("again".into(), "SOLUSDT", OrderSide::Sell, dec!(1))
                    .reduce_only(),
            )
            .await
            .unwrap();
        assert_eq!(rejected.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_round_trip_realizes_pnl() {
        let ex = exchange().await;
        ex.place_order(&OrderRequest::market("b".into(), "SOLUSDT", OrderSide::Buy, dec!(10)))
            .await
            .unwrap();
        ex.set_order_book(
            "SOLUSDT",
            OrderBook {
                bids: vec![BookLevel::new(dec!(102.1), dec!(50))],
                asks: vec![BookLevel::new(dec!(102.3), dec!(50))],
                timestamp: None,
            },
        )
        .await;
        ex.place_order(&OrderRequest::market("s".into(), "SOLUSDT", OrderSide::Sell, dec!(10)))
            .await
            .unwrap();
        // (102.1 - 100.1) * 10
        assert_eq!(ex.equity().await, dec!(10020));
        assert!(ex.fetch_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_short_round_trip_realizes_pnl() {
        let ex = exchange().await;
        ex.place_order(&OrderRequest::market("s".into(), "SOLUSDT", OrderSide::Sell, dec!(10)))
            .await
            .unwrap();
        assert_eq!(ex.position("SOLUSDT").await.unwrap().quantity, dec!(-10));
        ex.set_order_book(
            "SOLUSDT",
            OrderBook {
                bids: vec![BookLevel::new(dec!(97.8), dec!(50))],
                asks: vec![BookLevel::new(dec!(97.9), dec!(50))],
                timestamp: None,
            },
        )
        .await;
        ex.place_order(&OrderRequest::market("b".into(), "SOLUSDT", OrderSide::Buy, dec!(10)))
            .await
            .unwrap();
        // (99.9 - 97.9) * 10
        assert_eq!(ex.equity().await, dec!(10020));
        assert!(ex.position("SOLUSDT").await.is_none());
    }

    #[tokio::test]
    async fn test_resting_order_fills_on_refresh() {
        let ex = exchange().await;
        let req = OrderRequest::limit_ioc("ice".into(), "SOLUSDT", OrderSide::Buy, dec!(8), dec!(99.8))
            .with_display_quantity(dec!(2));
        let ack = ex.place_order(&req).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Submitted);

        ex.set_order_book(
            "SOLUSDT",
            OrderBook {
                bids: vec![BookLevel::new(dec!(99.5), dec!(50))],
                asks: vec![BookLevel::new(dec!(99.7), dec!(50))],
                timestamp: None,
            },
        )
        .await;
        let ack = ex.fetch_order("SOLUSDT", &ack.order_id).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.filled_quantity, dec!(8));
        assert!(!ex.cancel_order("SOLUSDT", &ack.order_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let ex = exchange().await;
        ex.fail_next_orders(1).await;
        let req = OrderRequest::market("c1".into(), "SOLUSDT", OrderSide::Buy, dec!(1));
        assert!(ex.place_order(&req).await.unwrap_err().is_retryable());
        assert!(ex.place_order(&req).await.is_ok());
    }

    #[tokio::test]
    async fn test_balance_reports_margin() {
        let ex = exchange().await;
        ex.place_order(&OrderRequest::market("b".into(), "SOLUSDT", OrderSide::Buy, dec!(10)))
            .await
            .unwrap();
        let balance = ex.fetch_balance().await.unwrap();
        // Marked at mid 100 after the sweep
        assert!(balance.available < balance.total_equity);
    }
}

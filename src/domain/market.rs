use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::OrderSide;

/// Direction of a position (perpetual futures can be held either way)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Get the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Order side that opens (or adds to) a position on this side
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position on this side
    pub fn exit_order_side(&self) -> OrderSide {
        self.entry_order_side().opposite()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// OHLCV candle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// High-low range
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    /// |close - open| / (high - low), 0 for a flat candle
    pub fn body_ratio(&self) -> f64 {
        let range = self.range();
        if range <= Decimal::ZERO {
            return 0.0;
        }
        ((self.close - self.open).abs() / range)
            .to_f64()
            .unwrap_or(0.0)
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// One price level of an order book
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl BookLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// L2 order book. Bids sorted descending, asks ascending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            (Some(bid), None) => Some(bid),
            (None, Some(ask)) => Some(ask),
            (None, None) => None,
        }
    }

    /// Calculate spread in basis points of mid
    pub fn spread_bps(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                ((ask - bid) / mid * Decimal::from(10_000)).to_f64()
            }
            _ => None,
        }
    }

    /// Bid-side notional (USD) within `band_pct` of mid (0.01 = 1%)
    pub fn bid_depth_usd(&self, band_pct: Decimal) -> Decimal {
        let Some(mid) = self.mid_price() else {
            return Decimal::ZERO;
        };
        let floor = mid * (Decimal::ONE - band_pct);
        self.bids
            .iter()
            .filter(|l| l.price >= floor)
            .map(BookLevel::notional)
            .sum()
    }

    /// Ask-side notional (USD) within `band_pct` of mid
    pub fn ask_depth_usd(&self, band_pct: Decimal) -> Decimal {
        let Some(mid) = self.mid_price() else {
            return Decimal::ZERO;
        };
        let ceiling = mid * (Decimal::ONE + band_pct);
        self.asks
            .iter()
            .filter(|l| l.price <= ceiling)
            .map(BookLevel::notional)
            .sum()
    }

    /// Two-sided notional within `band_pct` of mid
    pub fn depth_usd(&self, band_pct: Decimal) -> Decimal {
        self.bid_depth_usd(band_pct) + self.ask_depth_usd(band_pct)
    }

    /// Liquidity an order on `order_side` would consume (asks for buys, bids for sells)
    pub fn consumable_depth_usd(&self, order_side: OrderSide, band_pct: Decimal) -> Decimal {
        match order_side {
            OrderSide::Buy => self.ask_depth_usd(band_pct),
            OrderSide::Sell => self.bid_depth_usd(band_pct),
        }
    }

    /// Share of in-band depth supporting `side`: bids/(bids+asks) for long,
    /// asks/(bids+asks) for short. 0.5 means balanced.
    pub fn imbalance(&self, side: Side, band_pct: Decimal) -> f64 {
        let bids = self.bid_depth_usd(band_pct);
        let asks = self.ask_depth_usd(band_pct);
        let total = bids + asks;
        if total <= Decimal::ZERO {
            return 0.5;
        }
        let favorable = match side {
            Side::Long => bids,
            Side::Short => asks,
        };
        (favorable / total).to_f64().unwrap_or(0.5)
    }
}

/// 24h ticker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: Decimal,
    pub quote_volume_24h: Decimal,
    #[serde(default)]
    pub price_change_pct_24h: f64,
}

/// Raw per-instrument snapshot delivered by the market-data provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub candles: Vec<Candle>,
    pub order_book: OrderBook,
    pub ticker: Ticker,
    pub timestamp: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Last traded price, falling back to book mid
    pub fn last_price(&self) -> Decimal {
        if self.ticker.last_price > Decimal::ZERO {
            self.ticker.last_price
        } else {
            self.order_book.mid_price().unwrap_or(Decimal::ZERO)
        }
    }

    pub fn last_candle(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

/// Immutable market view for one cycle.
///
/// Refreshed wholesale: the engine builds a new `MarketData` and swaps the
/// `Arc`, so readers holding the previous one never see a partial refresh.
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    snapshots: HashMap<String, Arc<MarketSnapshot>>,
    reference_symbol: Option<String>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl MarketData {
    pub fn new(
        snapshots: Vec<MarketSnapshot>,
        reference_symbol: Option<String>,
        refreshed_at: DateTime<Utc>,
    ) -> Self {
        let snapshots = snapshots
            .into_iter()
            .map(|s| (s.symbol.clone(), Arc::new(s)))
            .collect();
        Self {
            snapshots,
            reference_symbol,
            refreshed_at: Some(refreshed_at),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&Arc<MarketSnapshot>> {
        self.snapshots.get(symbol)
    }

    /// Snapshot of the reference asset (e.g. BTCUSDT) used for correlation
    pub fn reference(&self) -> Option<&Arc<MarketSnapshot>> {
        self.reference_symbol
            .as_deref()
            .and_then(|s| self.snapshots.get(s))
    }

    pub fn reference_symbol(&self) -> Option<&str> {
        self.reference_symbol.as_deref()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &String> {
        self.snapshots.keys()
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &Arc<MarketSnapshot>> {
        self.snapshots.values()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }

    /// Copy of this view with one symbol's order book replaced
    pub fn with_order_book(&self, symbol: &str, book: OrderBook) -> Self {
        let mut next = self.clone();
        if let Some(existing) = self.snapshots.get(symbol) {
            let mut snapshot = (**existing).clone();
            snapshot.order_book = book;
            next.snapshots.insert(symbol.to_string(), Arc::new(snapshot));
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book() -> OrderBook {
        OrderBook {
            bids: vec![
                BookLevel::new(dec!(99.9), dec!(10)),
                BookLevel::new(dec!(99.0), dec!(20)),
                BookLevel::new(dec!(95.0), dec!(100)),
            ],
            asks: vec![
                BookLevel::new(dec!(100.1), dec!(5)),
                BookLevel::new(dec!(101.0), dec!(5)),
                BookLevel::new(dec!(105.0), dec!(100)),
            ],
            timestamp: None,
        }
    }

    #[test]
    fn test_spread_and_mid() {
        let book = book();
        assert_eq!(book.mid_price(), Some(dec!(100.0)));
        let spread = book.spread_bps().unwrap();
        assert!((spread - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_depth_bands_exclude_far_levels() {
        let book = book();
        // 1% band around 100: bids >= 99, asks <= 101
        assert_eq!(book.bid_depth_usd(dec!(0.01)), dec!(999) + dec!(1980));
        assert_eq!(book.ask_depth_usd(dec!(0.01)), dec!(500.5) + dec!(505));
    }

    #[test]
    fn test_imbalance_is_directional() {
        let book = book();
        let long = book.imbalance(Side::Long, dec!(0.01));
        let short = book.imbalance(Side::Short, dec!(0.01));
        assert!(long > 0.7);
        assert!((long + short - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_body_ratio() {
        let candle = Candle {
            open_time: Utc::now(),
            open: dec!(100),
            high: dec!(110),
            low: dec!(100),
            close: dec!(108),
            volume: dec!(1),
        };
        assert!((candle.body_ratio() - 0.8).abs() < 1e-9);
    }
}

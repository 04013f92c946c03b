use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::{RateCategory, RateLimiter, RetryPolicy};
use crate::config::ExecutionConfig;
use crate::domain::{
    ExecutionStyle, FilledOrder, OrderAck, OrderBook, OrderIntent, OrderRequest, OrderSide,
    Position, PositionSize, PositionUpdate, UpdateAction,
};
use crate::error::{EngineError, OrderError, Result};
use crate::exchange::ExchangeClient;

/// Deterministic client order id for child `slice` of parent `key`.
///
/// Retries of the same child reuse the same id, so the venue can deduplicate.
pub fn client_order_id(key: &str, slice: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(b":");
    hasher.update(slice.to_be_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("bo-{}", &digest[..32])
}

/// Idempotency key for realizing a position update
pub fn update_key(update: &PositionUpdate) -> String {
    format!(
        "pos-{}-{:?}-{}",
        update.position_id,
        update.action.kind(),
        update.created_at.timestamp_millis()
    )
}

/// Floor `quantity` to a multiple of `step`; a non-positive step leaves it as is
pub fn floor_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    (quantity / step).floor() * step
}

/// Round a limit price to the tick grid, away from the touch: buys up, sells down
pub fn round_to_tick(price: Decimal, tick: Decimal, side: OrderSide) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let ticks = price / tick;
    let ticks = match side {
        OrderSide::Buy => ticks.ceil(),
        OrderSide::Sell => ticks.floor(),
    };
    (ticks * tick).normalize()
}

/// Venue order not yet in a terminal state
#[derive(Debug, Clone)]
pub struct InFlightOrder {
    pub client_order_id: String,
    pub symbol: String,
    pub intent: OrderIntent,
    /// Known once the venue acknowledged
    pub order_id: Option<String>,
    pub placed_at: DateTime<Utc>,
}

/// Child fills accumulated into one parent result
#[derive(Debug, Default)]
struct Fills {
    filled: Decimal,
    notional: Decimal,
    fees: Decimal,
    order_ids: Vec<String>,
}

impl Fills {
    fn absorb(&mut self, ack: &OrderAck) {
        if let Some(price) = ack.avg_fill_price {
            self.notional += price * ack.filled_quantity;
        }
        self.filled += ack.filled_quantity;
        self.fees += ack.fee;
        self.order_ids.push(ack.order_id.clone());
    }

    fn is_empty(&self) -> bool {
        self.filled <= Decimal::ZERO
    }
}

/// Turns approved sizes and position updates into venue orders
pub struct ExecutionManager {
    exchange: Arc<dyn ExchangeClient>,
    config: ExecutionConfig,
    order_book_depth: usize,
    /// Venue quantity increment; zero disables rounding
    lot_step: Decimal,
    /// Venue price increment; zero disables rounding
    tick_size: Decimal,
    retry: RetryPolicy,
    limiter: Arc<RateLimiter>,
    /// Parent key -> completed fill
    ledger: Arc<DashMap<String, FilledOrder>>,
    /// Client order id -> order awaiting a terminal state
    in_flight: Arc<DashMap<String, InFlightOrder>>,
    entries_blocked: Arc<AtomicBool>,
}

impl ExecutionManager {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        config: ExecutionConfig,
        order_book_depth: usize,
    ) -> Self {
        Self {
            exchange,
            retry: RetryPolicy::from_config(&config),
            limiter: Arc::new(RateLimiter::new(&config.rate_limits)),
            config,
            order_book_depth,
            lot_step: Decimal::ZERO,
            tick_size: Decimal::ZERO,
            ledger: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            entries_blocked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Same venue, ledger and in-flight set under a new preset
    pub fn with_config(&self, config: ExecutionConfig) -> Self {
        Self {
            exchange: Arc::clone(&self.exchange),
            retry: RetryPolicy::from_config(&config),
            limiter: Arc::new(RateLimiter::new(&config.rate_limits)),
            config,
            order_book_depth: self.order_book_depth,
            lot_step: self.lot_step,
            tick_size: self.tick_size,
            ledger: Arc::clone(&self.ledger),
            in_flight: Arc::clone(&self.in_flight),
            entries_blocked: Arc::clone(&self.entries_blocked),
        }
    }

    /// Round child quantities to `lot_step` and limit prices to `tick_size`
    pub fn with_precision(mut self, lot_step: Decimal, tick_size: Decimal) -> Self {
        self.lot_step = lot_step;
        self.tick_size = tick_size;
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn exchange(&self) -> &Arc<dyn ExchangeClient> {
        &self.exchange
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn block_entries(&self, reason: &str) {
        if !self.entries_blocked.swap(true, Ordering::SeqCst) {
            warn!(%reason, "entry orders blocked");
        }
    }

    pub fn unblock_entries(&self) {
        if self.entries_blocked.swap(false, Ordering::SeqCst) {
            info!("entry orders unblocked");
        }
    }

    pub fn entries_blocked(&self) -> bool {
        self.entries_blocked.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> Vec<InFlightOrder> {
        self.in_flight.iter().map(|e| e.value().clone()).collect()
    }

    pub fn cached_fill(&self, key: &str) -> Option<FilledOrder> {
        self.ledger.get(key).map(|e| e.value().clone())
    }

    /// Rate limit, time out and retry one venue call
    pub async fn call<T, F, Fut>(&self, category: RateCategory, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let limit = Duration::from_millis(self.config.order_timeout_ms);
        let limiter = &self.limiter;
        self.retry
            .run(operation, || {
                let fut = f();
                async move {
                    limiter.acquire(category).await;
                    match timeout(limit, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(EngineError::Timeout(limit.as_millis() as u64)),
                    }
                }
            })
            .await
    }

    pub async fn fetch_order_book(&self, symbol: &str) -> Result<OrderBook> {
        let depth = self.order_book_depth;
        self.call(RateCategory::MarketData, "fetch_order_book", || {
            self.exchange.fetch_order_book(symbol, depth)
        })
        .await
    }

    /// Pick how to work `notional` against `depth` of consumable liquidity
    pub fn choose_style(&self, notional: Decimal, depth: Decimal) -> ExecutionStyle {
        if depth <= Decimal::ZERO {
            return ExecutionStyle::Single;
        }
        let ratio = (notional / depth).to_f64().unwrap_or(f64::MAX);
        if ratio <= self.config.single_max_depth_ratio {
            return ExecutionStyle::Single;
        }
        if self.exchange.supports_iceberg() && ratio >= self.config.iceberg_min_depth_ratio {
            return ExecutionStyle::Iceberg {
                display_quantity: Decimal::ZERO,
            };
        }
        let per_slice = self.config.single_max_depth_ratio.max(f64::EPSILON);
        let wanted = (ratio / per_slice).ceil() as u32;
        ExecutionStyle::Twap {
            slices: wanted.clamp(2, self.config.max_twap_slices.max(2)),
            interval_ms: self.config.twap_interval_ms,
        }
    }

    /// Entry limit: touch price plus the allowed slippage, on the tick grid
    fn limit_price(&self, book: &OrderBook, side: OrderSide, symbol: &str) -> Result<Decimal> {
        let slip = self.config.max_slippage_bps / Decimal::from(10_000);
        let price = match side {
            OrderSide::Buy => book.best_ask().map(|p| p * (Decimal::ONE + slip)),
            OrderSide::Sell => book.best_bid().map(|p| p * (Decimal::ONE - slip)),
        };
        price.map(|p| round_to_tick(p, self.tick_size, side)).ok_or_else(|| {
            OrderError::InsufficientLiquidity {
                symbol: symbol.to_string(),
                requested: Decimal::ZERO,
                available: Decimal::ZERO,
            }
            .into()
        })
    }

    /// Execute one parent order. `key` identifies the parent across retries:
    /// a key that already completed returns the cached fill without touching
    /// the venue.
    pub async fn execute_trade(
        &self,
        size: &PositionSize,
        intent: OrderIntent,
        key: &str,
    ) -> Result<FilledOrder> {
        if let Some(cached) = self.cached_fill(key) {
            info!(%key, symbol = %cached.symbol, "returning cached fill");
            return Ok(cached);
        }
        if !size.valid || size.quantity <= Decimal::ZERO {
            return Err(OrderError::Invalid(format!(
                "cannot execute {} of {} {}",
                intent, size.quantity, size.symbol
            ))
            .into());
        }
        if intent.opens_exposure() && self.entries_blocked() {
            return Err(OrderError::EntriesBlocked {
                reason: "kill switch or halt active".into(),
            }
            .into());
        }

        let side = match intent {
            OrderIntent::Exit => size.side.exit_order_side(),
            OrderIntent::Entry | OrderIntent::AddOn => size.side.entry_order_side(),
        };

        let (style, fills) = if intent == OrderIntent::Exit {
            let request = OrderRequest::market(
                client_order_id(key, 0),
                &size.symbol,
                side,
                size.quantity,
            )
            .reduce_only();
            let mut fills = Fills::default();
            fills.absorb(&self.place(&request, intent).await?);
            (ExecutionStyle::Single, fills)
        } else {
            let book = self.fetch_order_book(&size.symbol).await?;
            let depth = book.consumable_depth_usd(side, self.config.depth_band_pct);
            if depth <= Decimal::ZERO {
                return Err(OrderError::InsufficientLiquidity {
                    symbol: size.symbol.clone(),
                    requested: size.notional_usd,
                    available: depth,
                }
                .into());
            }
            match self.choose_style(size.notional_usd, depth) {
                ExecutionStyle::Single => {
                    let fills = self.work_single(size, side, intent, key, &book).await?;
                    (ExecutionStyle::Single, fills)
                }
                ExecutionStyle::Twap { slices, interval_ms } => {
                    let fills = self
                        .work_twap(size, side, intent, key, book, slices, interval_ms)
                        .await?;
                    (ExecutionStyle::Twap { slices, interval_ms }, fills)
                }
                ExecutionStyle::Iceberg { .. } => {
                    let display = self.display_quantity(size.quantity);
                    let fills = self
                        .work_iceberg(size, side, intent, key, &book, display)
                        .await?;
                    (
                        ExecutionStyle::Iceberg {
                            display_quantity: display,
                        },
                        fills,
                    )
                }
            }
        };

        if fills.is_empty() {
            return Err(OrderError::Unfilled {
                client_order_id: key.to_string(),
            }
            .into());
        }

        let filled = FilledOrder {
            client_order_id: key.to_string(),
            symbol: size.symbol.clone(),
            side,
            intent,
            style,
            requested_quantity: size.quantity,
            filled_quantity: fills.filled,
            avg_price: fills.notional / fills.filled,
            fees: fills.fees,
            child_order_ids: fills.order_ids,
            completed_at: Utc::now(),
        };
        info!(
            symbol = %filled.symbol,
            %intent,
            side = %filled.side,
            style = ?filled.style,
            requested = %filled.requested_quantity,
            filled = %filled.filled_quantity,
            avg_price = %filled.avg_price,
            "order executed"
        );
        self.ledger.insert(key.to_string(), filled.clone());
        Ok(filled)
    }

    /// Realize a position update on the venue. Stop moves need no order.
    pub async fn execute_update(
        &self,
        position: &Position,
        update: &PositionUpdate,
    ) -> Result<Option<FilledOrder>> {
        let (intent, quantity) = match &update.action {
            UpdateAction::UpdateStop { .. } => return Ok(None),
            UpdateAction::TakeProfit { quantity, .. } | UpdateAction::Close { quantity, .. } => {
                (OrderIntent::Exit, *quantity)
            }
            UpdateAction::AddOn { quantity } => (OrderIntent::AddOn, *quantity),
        };
        let size = PositionSize::approved(
            &position.symbol,
            position.side,
            update.reference_price,
            position.stop_price,
            quantity,
        );
        self.execute_trade(&size, intent, &update_key(update))
            .await
            .map(Some)
    }

    /// Best-effort cancel of every resting entry/add-on order
    pub async fn cancel_in_flight_entries(&self) -> usize {
        let targets: Vec<InFlightOrder> = self
            .in_flight
            .iter()
            .filter(|e| e.intent.opens_exposure())
            .map(|e| e.value().clone())
            .collect();

        let mut cancelled = 0;
        for order in targets {
            let Some(order_id) = order.order_id.as_deref() else {
                continue;
            };
            match self
                .call(RateCategory::Order, "cancel_order", || {
                    self.exchange.cancel_order(&order.symbol, order_id)
                })
                .await
            {
                Ok(true) => {
                    cancelled += 1;
                    self.in_flight.remove(&order.client_order_id);
                    info!(symbol = %order.symbol, %order_id, "cancelled in-flight entry");
                }
                Ok(false) => {
                    self.in_flight.remove(&order.client_order_id);
                }
                Err(e) => {
                    warn!(symbol = %order.symbol, %order_id, error = %e, "failed to cancel entry");
                }
            }
        }
        cancelled
    }

    async fn place(&self, request: &OrderRequest, intent: OrderIntent) -> Result<OrderAck> {
        self.in_flight.insert(
            request.client_order_id.clone(),
            InFlightOrder {
                client_order_id: request.client_order_id.clone(),
                symbol: request.symbol.clone(),
                intent,
                order_id: None,
                placed_at: Utc::now(),
            },
        );
        let result = self
            .call(RateCategory::Order, "place_order", || {
                self.exchange.place_order(request)
            })
            .await;

        match &result {
            Ok(ack) if ack.status.is_active() => {
                if let Some(mut entry) = self.in_flight.get_mut(&request.client_order_id) {
                    entry.order_id = Some(ack.order_id.clone());
                }
            }
            _ => {
                self.in_flight.remove(&request.client_order_id);
            }
        }
        if let Ok(ack) = &result {
            debug!(
                client_order_id = %request.client_order_id,
                order_id = %ack.order_id,
                status = ?ack.status,
                filled = %ack.filled_quantity,
                "child order acknowledged"
            );
        }
        result
    }

    fn display_quantity(&self, quantity: Decimal) -> Decimal {
        let raw = quantity * self.config.iceberg_display_fraction;
        let display = if self.lot_step > Decimal::ZERO {
            floor_to_step(raw, self.lot_step)
        } else {
            raw.round_dp_with_strategy(quantity.scale(), RoundingStrategy::ToZero)
        };
        if display <= Decimal::ZERO {
            quantity
        } else {
            display
        }
    }

    async fn work_single(
        &self,
        size: &PositionSize,
        side: OrderSide,
        intent: OrderIntent,
        key: &str,
        book: &OrderBook,
    ) -> Result<Fills> {
        let price = self.limit_price(book, side, &size.symbol)?;
        let request =
            OrderRequest::limit_ioc(client_order_id(key, 0), &size.symbol, side, size.quantity, price);
        let mut fills = Fills::default();
        fills.absorb(&self.place(&request, intent).await?);
        Ok(fills)
    }

    #[allow(clippy::too_many_arguments)]
    async fn work_twap(
        &self,
        size: &PositionSize,
        side: OrderSide,
        intent: OrderIntent,
        key: &str,
        first_book: OrderBook,
        slices: u32,
        interval_ms: u64,
    ) -> Result<Fills> {
        let total = size.quantity;
        let even = total / Decimal::from(slices);
        let per_slice = if self.lot_step > Decimal::ZERO {
            floor_to_step(even, self.lot_step)
        } else {
            even.round_dp_with_strategy(total.scale().max(3), RoundingStrategy::ToZero)
        };
        let mut fills = Fills::default();
        let mut book = Some(first_book);

        for slice in 0..slices {
            if slice > 0 {
                sleep(Duration::from_millis(interval_ms)).await;
            }
            if intent.opens_exposure() && self.entries_blocked() {
                warn!(symbol = %size.symbol, slice, "entries blocked, stopping twap");
                break;
            }
            let remaining = total - fills.filled;
            if remaining <= Decimal::ZERO {
                break;
            }
            // Last slice takes the remainder
            let quantity = if slice + 1 == slices {
                floor_to_step(remaining, self.lot_step)
            } else {
                floor_to_step(per_slice.min(remaining), self.lot_step)
            };
            if quantity <= Decimal::ZERO {
                continue;
            }

            let current = match book.take() {
                Some(b) => b,
                None => match self.fetch_order_book(&size.symbol).await {
                    Ok(b) => b,
                    Err(e) if !fills.is_empty() => {
                        warn!(symbol = %size.symbol, slice, error = %e, "twap stopped early");
                        break;
                    }
                    Err(e) => return Err(e),
                },
            };
            let price = self.limit_price(&current, side, &size.symbol)?;
            let request = OrderRequest::limit_ioc(
                client_order_id(key, slice),
                &size.symbol,
                side,
                quantity,
                price,
            );
            match self.place(&request, intent).await {
                Ok(ack) => fills.absorb(&ack),
                Err(e) if !fills.is_empty() => {
                    warn!(symbol = %size.symbol, slice, error = %e, "twap stopped early");
                    break;
                }
                Err(e) => return Err(e),
            }
            debug!(symbol = %size.symbol, slice, filled = %fills.filled, "twap slice done");
        }
        Ok(fills)
    }

    async fn work_iceberg(
        &self,
        size: &PositionSize,
        side: OrderSide,
        intent: OrderIntent,
        key: &str,
        book: &OrderBook,
        display: Decimal,
    ) -> Result<Fills> {
        let price = self.limit_price(book, side, &size.symbol)?;
        let request =
            OrderRequest::limit_ioc(client_order_id(key, 0), &size.symbol, side, size.quantity, price)
                .with_display_quantity(display);
        let ack = self.place(&request, intent).await?;
        let ack = if ack.status.is_active() {
            self.await_resting(&request, ack).await
        } else {
            ack
        };
        let mut fills = Fills::default();
        fills.absorb(&ack);
        Ok(fills)
    }

    /// Poll a resting order until terminal; on timeout cancel and take what filled
    async fn await_resting(&self, request: &OrderRequest, ack: OrderAck) -> OrderAck {
        let symbol = request.symbol.as_str();
        let order_id = ack.order_id.clone();
        let poll = Duration::from_millis(self.config.twap_interval_ms.max(1));
        let wait = Duration::from_millis(self.config.order_timeout_ms);

        let polled = timeout(wait, async {
            loop {
                sleep(poll).await;
                match self.exchange.fetch_order(symbol, &order_id).await {
                    Ok(latest) if latest.status.is_terminal() => return latest,
                    Ok(_) => {}
                    Err(e) => debug!(%order_id, error = %e, "order poll failed"),
                }
            }
        })
        .await;

        let final_ack = match polled {
            Ok(latest) => latest,
            Err(_) => {
                warn!(%symbol, %order_id, "resting order timed out, cancelling");
                if let Err(e) = self
                    .call(RateCategory::Order, "cancel_order", || {
                        self.exchange.cancel_order(symbol, &order_id)
                    })
                    .await
                {
                    warn!(%symbol, %order_id, error = %e, "cancel failed");
                }
                self.call(RateCategory::Order, "fetch_order", || {
                    self.exchange.fetch_order(symbol, &order_id)
                })
                .await
                .unwrap_or(ack)
            }
        };
        self.in_flight.remove(&request.client_order_id);
        final_ack
    }
}

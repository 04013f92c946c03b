use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good Till Cancelled
    GTC,
    /// Fill Or Kill
    FOK,
    /// Immediate Or Cancel
    IOC,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Order accepted by the venue, resting
    Submitted,
    /// Order partially filled
    PartiallyFilled,
    /// Order fully filled
    Filled,
    /// Order cancelled
    Cancelled,
    /// Order rejected by exchange
    Rejected,
    /// Order expired
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Submitted | OrderStatus::PartiallyFilled)
    }
}

/// Why an order is being placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderIntent {
    Entry,
    Exit,
    AddOn,
}

impl OrderIntent {
    /// Entries and add-ons grow exposure and are blocked by the kill switch
    pub fn opens_exposure(&self) -> bool {
        matches!(self, OrderIntent::Entry | OrderIntent::AddOn)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderIntent::Entry => "entry",
            OrderIntent::Exit => "exit",
            OrderIntent::AddOn => "add_on",
        }
    }
}

impl std::fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a parent order is worked on the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "style")]
pub enum ExecutionStyle {
    /// One child order
    Single,
    /// Time-sliced child orders
    Twap { slices: u32, interval_ms: u64 },
    /// One resting order showing only `display_quantity`
    Iceberg { display_quantity: Decimal },
}

/// Order request sent to the venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    /// Visible size for iceberg orders
    pub display_quantity: Option<Decimal>,
}

impl OrderRequest {
    pub fn limit_ioc(
        client_order_id: String,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            client_order_id,
            symbol: symbol.to_string(),
            side,
            quantity,
            limit_price: Some(price),
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::IOC,
            reduce_only: false,
            display_quantity: None,
        }
    }

    pub fn market(client_order_id: String, symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            client_order_id,
            symbol: symbol.to_string(),
            side,
            quantity,
            limit_price: None,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::IOC,
            reduce_only: false,
            display_quantity: None,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn with_display_quantity(mut self, display: Decimal) -> Self {
        self.display_quantity = Some(display);
        self.time_in_force = TimeInForce::GTC;
        self
    }
}

/// Venue acknowledgement of a single order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub fee: Decimal,
}

/// Aggregated result of working one parent order (possibly many children)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilledOrder {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub intent: OrderIntent,
    pub style: ExecutionStyle,
    pub requested_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_price: Decimal,
    pub fees: Decimal,
    pub child_order_ids: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

impl FilledOrder {
    pub fn is_complete(&self) -> bool {
        self.filled_quantity >= self.requested_quantity
    }

    pub fn is_empty(&self) -> bool {
        self.filled_quantity <= Decimal::ZERO
    }

    /// Calculate actual fill value
    pub fn notional(&self) -> Decimal {
        self.avg_price * self.filled_quantity
    }
}

/// Account balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    /// Wallet balance plus unrealized PnL
    pub total_equity: Decimal,
    /// Equity not locked as margin
    pub available: Decimal,
}

/// Position as reported by the venue (for reconciliation)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    /// Signed quantity: positive long, negative short
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

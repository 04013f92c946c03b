use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the trading engine
#[derive(Error, Debug)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Network / venue errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Cycle deadline exceeded after {0}ms")]
    DeadlineExceeded(u64),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Order rejected by venue: {0}")]
    VenueRejected(String),

    // Order execution errors
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    // Risk management outcomes
    #[error("Risk rejected: {0}")]
    Risk(#[from] RiskError),

    // Invariant violations
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// How an error is handled by the component that owns it and by the engine loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed config/signal/command. Never retried.
    Validation,
    /// Timeout, disconnect, rate limit. Retried with backoff inside the owner.
    TransientIo,
    /// Signal failed sizing or limits. Normal outcome, logged and dropped.
    RiskRejected,
    /// Auth/permission failure or unrecoverable venue rejection. Escalates to EMERGENCY.
    FatalExchange,
    /// A data-model invariant broke. Escalates to ERROR and needs an operator reset.
    InternalInvariant,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Validation => write!(f, "validation"),
            ErrorClass::TransientIo => write!(f, "transient_io"),
            ErrorClass::RiskRejected => write!(f, "risk_rejected"),
            ErrorClass::FatalExchange => write!(f, "fatal_exchange"),
            ErrorClass::InternalInvariant => write!(f, "internal_invariant"),
        }
    }
}

impl EngineError {
    /// Classify the error for propagation decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Config(_)
            | EngineError::Json(_)
            | EngineError::Validation(_)
            | EngineError::InvalidStateTransition { .. } => ErrorClass::Validation,

            EngineError::Io(_)
            | EngineError::MarketDataUnavailable(_)
            | EngineError::Network(_)
            | EngineError::RateLimited(_)
            | EngineError::Timeout(_)
            | EngineError::RetriesExhausted { .. }
            | EngineError::DeadlineExceeded(_)
            | EngineError::Cancelled => ErrorClass::TransientIo,

            EngineError::Auth(_) | EngineError::VenueRejected(_) => ErrorClass::FatalExchange,

            EngineError::Order(err) => err.class(),

            EngineError::Risk(_) => ErrorClass::RiskRejected,

            EngineError::Invariant(_) | EngineError::Internal(_) => {
                ErrorClass::InternalInvariant
            }
        }
    }

    /// Whether a single failed attempt may be retried by the owning component
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Network(_)
                | EngineError::RateLimited(_)
                | EngineError::Timeout(_)
                | EngineError::MarketDataUnavailable(_)
                | EngineError::Io(_)
        )
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        EngineError::Invariant(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

/// Specific error types for order execution
#[derive(Error, Debug, Clone)]
pub enum OrderError {
    #[error("Order not found: {order_id}")]
    NotFound { order_id: String },

    #[error("Insufficient liquidity for {symbol}: requested {requested}, available {available}")]
    InsufficientLiquidity {
        symbol: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Price slippage exceeded: limit {limit}, actual {actual}")]
    SlippageExceeded { limit: Decimal, actual: Decimal },

    #[error("Nothing filled for {client_order_id}")]
    Unfilled { client_order_id: String },

    #[error("New entries are blocked: {reason}")]
    EntriesBlocked { reason: String },

    #[error("Invalid order: {0}")]
    Invalid(String),
}

impl OrderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OrderError::NotFound { .. } | OrderError::Unfilled { .. } => ErrorClass::TransientIo,
            OrderError::InsufficientLiquidity { .. }
            | OrderError::SlippageExceeded { .. }
            | OrderError::EntriesBlocked { .. } => ErrorClass::RiskRejected,
            OrderError::Invalid(_) => ErrorClass::Validation,
        }
    }
}

/// Specific error types for risk management
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskError {
    #[error("Kill switch active: {reason}")]
    KillSwitch { reason: String },

    #[error("Trading halted: {reason}")]
    TradingHalted { reason: String },

    #[error("Max concurrent positions: {open} >= {limit}")]
    MaxPositions { open: usize, limit: usize },

    #[error("Daily loss limit: {pnl_pct:.2}% <= -{limit_pct:.2}%")]
    DailyLossLimit { pnl_pct: f64, limit_pct: f64 },

    #[error("Correlation exposure: {value:.2} > {limit:.2}")]
    CorrelationExposure { value: f64, limit: f64 },

    #[error("Position already open for {symbol}")]
    DuplicateSymbol { symbol: String },

    #[error("Sizing rejected: {reason}")]
    Sizing { reason: String },

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),
}

impl RiskError {
    /// Stable machine-readable code used in logs and the query surface
    pub fn code(&self) -> &'static str {
        match self {
            RiskError::KillSwitch { .. } => "kill_switch",
            RiskError::TradingHalted { .. } => "trading_halted",
            RiskError::MaxPositions { .. } => "max_positions",
            RiskError::DailyLossLimit { .. } => "daily_loss_limit",
            RiskError::CorrelationExposure { .. } => "correlation_exposure",
            RiskError::DuplicateSymbol { .. } => "duplicate_symbol",
            RiskError::Sizing { .. } => "sizing",
            RiskError::InvalidSignal(_) => "invalid_signal",
        }
    }
}

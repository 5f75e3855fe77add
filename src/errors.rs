//! Error Taxonomy
//!
//! Typed errors per subsystem. Validation failures reject synchronously with
//! no state change; resource failures surface through counters and explicit
//! rejections; internal invariant breaches are fatal to the owning run only.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Input and configuration validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("empty data set: {0}")]
    EmptyData(String),
}

/// Event-bus resource failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("event queue saturated, event dropped")]
    QueueFull,
    #[error("bus is stopped")]
    Stopped,
    #[error("shutdown drain timed out with {remaining} events in flight")]
    DrainTimeout { remaining: u64 },
}

/// Slippage estimation failures. The caller decides whether to reject the
/// order or fall back to the reference price.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlippageError {
    #[error("order book for {symbol} is empty on the {side} side")]
    EmptyBook { symbol: String, side: String },
    #[error("insufficient liquidity: requested {requested}, available {available}")]
    InsufficientLiquidity {
        requested: Decimal,
        available: Decimal,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Order / portfolio accounting failures.
#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("unknown order {0}")]
    UnknownOrder(Uuid),
    #[error("order {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },
    #[error("fill quantity {fill_qty} exceeds remaining {remaining} on order {id}")]
    OverFill {
        id: Uuid,
        fill_qty: Decimal,
        remaining: Decimal,
    },
    #[error("invariant breach: {0}")]
    InvariantBreach(String),
}

/// Strategy contract failures.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("unknown strategy '{0}'")]
    Unknown(String),
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("parameter '{name}' out of bounds: {reason}")]
    OutOfBounds { name: String, reason: String },
    #[error("parameter '{name}' has wrong type: expected {expected}")]
    WrongType { name: String, expected: String },
}

/// Execution adapter failures.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("not connected")]
    NotConnected,
    #[error("order {0} not found")]
    OrderNotFound(Uuid),
    #[error("adapter rejected order: {0}")]
    Rejected(String),
    #[error("no market data for symbol {0}")]
    NoMarketData(String),
    #[error("transient adapter error: {0}")]
    Transient(String),
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ExecutionError {
    /// Transient errors are retried with exponential backoff; everything
    /// else is surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Transient(_) | ExecutionError::Timeout(_))
    }
}

/// Backtest run failures.
#[derive(Debug, Error)]
pub enum BacktestError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error(transparent)]
    Portfolio(#[from] PortfolioError),
    #[error("run cancelled")]
    Cancelled,
    #[error("internal invariant breach: {0}")]
    InvariantBreach(String),
}

/// Agent failures.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is not running")]
    NotRunning,
    #[error("signal aggregator error: {0}")]
    Aggregator(String),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Portfolio(#[from] PortfolioError),
}

/// Validation-stack failures (Monte Carlo, optimizer, walk-forward).
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("empty parameter space")]
    EmptyParameterSpace,
    #[error("no trade returns to resample")]
    NoReturns,
    #[error("run cancelled")]
    Cancelled,
}

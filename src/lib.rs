//! Quantbot Core
//!
//! Event-driven backtesting and execution engine for a quantitative trading
//! backend: market data in, strategy signals through a risk gate, simulated
//! or forwarded execution, validated performance results out.
//!
//! # Architecture
//!
//! ```text
//!  Bars/Ticks ──▶ EventBus ──▶ Strategies ──▶ Signals
//!                                               │
//!                                               ▼
//!                 Backtester (sim) / TradingAgent (live)
//!                                               │
//!                                          Risk gate
//!                                               │
//!                       Slippage model ◀── Execution ──▶ ExecutionAdapter
//!                                               │
//!                                             Fills
//!                                               │
//!                         OrderManager (positions, cash, equity curve)
//!                                               │
//!                          Monte Carlo / Optimizer / Walk-forward
//! ```
//!
//! Transports (HTTP/WebSocket façades), exchange REST adapters, persistence
//! and UI live outside this crate; the control surfaces here are plain Rust
//! types they can wrap.

pub mod agent;
pub mod backtest;
pub mod bus;
pub mod errors;
pub mod execution;
pub mod num;
pub mod portfolio;
pub mod risk;
pub mod slippage;
pub mod strategy;
pub mod types;
pub mod validation;

pub use agent::{AgentConfig, AgentStatus, SignalAggregator, TradingAgent};
pub use backtest::{
    BacktestConfig, BacktestEngine, BacktestReport, PerformanceMetrics, RunRegistry, RunState,
};
pub use bus::{
    BusEvent, CancelToken, EventBus, EventBusConfig, EventPayload, EventType, SubscribeOptions,
};
pub use errors::{
    AgentError, BacktestError, BusError, ConfigError, ExecutionError, PortfolioError,
    SlippageError, StrategyError, ValidationError,
};
pub use execution::{ExecutionAdapter, PaperExecutionAdapter};
pub use portfolio::{EquityCurve, EquityPoint, OrderManager, PortfolioSnapshot};
pub use risk::{KillSwitch, RiskCheckOutcome, RiskConfig, RiskManager, RiskViolationKind};
pub use slippage::{SlippageEstimate, SlippageModel, SlippageSpec};
pub use strategy::{Strategy, StrategyContext, StrategyRegistry};
pub use types::{Bar, Order, OrderBookSnapshot, Position, Side, Signal, Tick, Trade};
pub use validation::{
    GeneticOptimizer, GridOptimizer, MonteCarloConfig, MonteCarloResult, RandomOptimizer,
    WalkForwardConfig, WalkForwardHarness,
};

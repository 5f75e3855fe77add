//! Execution Adapters
//!
//! The `ExecutionAdapter` trait is the seam between the core and exchange or
//! DEX connectivity. Real adapters (signed REST, RPC) live outside the core;
//! the paper adapter here fills against last-seen prices through a slippage
//! model, for agent paper trading and tests.
//!
//! The core expects `cancel_order` to be idempotent and status updates to be
//! delivered at least once.

use crate::errors::ExecutionError;
use crate::slippage::SlippageModel;
use crate::types::{Order, OrderBookSnapshot, OrderStatus, OrderType, Position, Side, Tick};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Ticker update callback for streaming subscriptions.
pub type TickerCallback = Arc<dyn Fn(Tick) + Send + Sync>;

/// Exchange/DEX adapter surface consumed by the agent.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn connect(&self) -> Result<(), ExecutionError>;

    async fn disconnect(&self) -> Result<(), ExecutionError>;

    /// Place an order; returns the order with venue-assigned state.
    async fn place_order(&self, order: Order) -> Result<Order, ExecutionError>;

    /// Cancel an order. Idempotent: cancelling an unknown or already-terminal
    /// order succeeds.
    async fn cancel_order(&self, id: Uuid) -> Result<(), ExecutionError>;

    async fn get_order(&self, id: Uuid) -> Result<Order, ExecutionError>;

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExecutionError>;

    async fn get_positions(&self) -> Result<Vec<Position>, ExecutionError>;

    async fn get_ticker(&self, symbol: &str) -> Result<Tick, ExecutionError>;

    async fn get_order_book(
        &self,
        symbol: &str,
        depth: usize,
    ) -> Result<OrderBookSnapshot, ExecutionError>;

    async fn subscribe_to_ticker(
        &self,
        symbols: Vec<String>,
        callback: TickerCallback,
    ) -> Result<(), ExecutionError>;
}

/// Exponential-backoff retry policy for transient adapter errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Run `op` with exponential backoff on transient errors. Non-transient
/// errors surface immediately.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, ExecutionError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExecutionError>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                warn!(%err, attempt, "transient adapter error, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// In-process paper adapter: market orders fill immediately at the last
/// ticker price adjusted by the slippage model; resting orders fill when a
/// pushed price crosses them.
pub struct PaperExecutionAdapter {
    connected: AtomicBool,
    prices: RwLock<HashMap<String, Decimal>>,
    orders: RwLock<HashMap<Uuid, Order>>,
    balances: RwLock<HashMap<String, Decimal>>,
    positions: RwLock<HashMap<String, Position>>,
    subscribers: RwLock<Vec<(Vec<String>, TickerCallback)>>,
    /// Stop-limit orders whose trigger has been hit but whose limit
    /// condition has not.
    armed_stop_limits: RwLock<HashSet<Uuid>>,
    slippage: Arc<dyn SlippageModel>,
}

impl PaperExecutionAdapter {
    pub fn new(slippage: Arc<dyn SlippageModel>) -> Self {
        Self {
            connected: AtomicBool::new(false),
            prices: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            armed_stop_limits: RwLock::new(HashSet::new()),
            slippage,
        }
    }

    pub fn set_balance(&self, asset: impl Into<String>, amount: Decimal) {
        self.balances.write().insert(asset.into(), amount);
    }

    /// Push a new mark price: fill any resting orders the price crosses,
    /// then fan the tick out to subscribers.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().insert(symbol.to_string(), price);
        self.fill_crossings(symbol, price);
        let tick = Tick {
            symbol: symbol.to_string(),
            price,
            size: Decimal::ZERO,
            side: Side::Buy,
            timestamp: Utc::now(),
            bid: None,
            ask: None,
            bid_size: None,
            ask_size: None,
        };
        for (symbols, callback) in self.subscribers.read().iter() {
            if symbols.iter().any(|s| s == symbol) {
                callback(tick.clone());
            }
        }
    }

    /// Scan resting orders for the symbol and fill those the new price
    /// crosses. Limit-style orders fill at their limit; triggered stops fill
    /// at the market price through the slippage model.
    fn fill_crossings(&self, symbol: &str, price: Decimal) {
        let now = Utc::now();
        let mut orders = self.orders.write();
        let mut armed = self.armed_stop_limits.write();
        for order in orders.values_mut() {
            if order.symbol != symbol || order.is_terminal() {
                continue;
            }
            let Some(fill_price) = Self::crossing_fill_price(order, price, &mut armed) else {
                continue;
            };
            let fill_price = if order.order_type == OrderType::StopMarket {
                self.slippage
                    .estimate(order.side, order.remaining_qty(), fill_price, None, None)
                    .map(|e| e.expected_fill_price)
                    .unwrap_or(fill_price)
            } else {
                fill_price
            };
            let quantity = order.remaining_qty();
            if order
                .record_fill(quantity, fill_price, Decimal::ZERO, now)
                .is_ok()
            {
                armed.remove(&order.id);
                debug!(order_id = %order.id, %fill_price, "resting order filled");
            }
        }
    }

    /// Fill price for a resting order against the new price, or None while
    /// it keeps resting. Mutates the armed set for stop-limit triggers.
    fn crossing_fill_price(
        order: &Order,
        price: Decimal,
        armed: &mut HashSet<Uuid>,
    ) -> Option<Decimal> {
        match order.order_type {
            // Market orders fill at placement, never here.
            OrderType::Market => None,
            OrderType::Limit | OrderType::TakeProfit => {
                let limit = order.price?;
                match order.side {
                    Side::Buy if price <= limit => Some(limit),
                    Side::Sell if price >= limit => Some(limit),
                    _ => None,
                }
            }
            OrderType::StopMarket => {
                let stop = order.stop_price?;
                let triggered = match order.side {
                    Side::Buy => price >= stop,
                    Side::Sell => price <= stop,
                };
                triggered.then_some(price)
            }
            OrderType::StopLimit => {
                let stop = order.stop_price?;
                let limit = order.price?;
                if !armed.contains(&order.id) {
                    let triggered = match order.side {
                        Side::Buy => price >= stop,
                        Side::Sell => price <= stop,
                    };
                    if triggered {
                        armed.insert(order.id);
                    }
                    return None;
                }
                match order.side {
                    Side::Buy if price <= limit => Some(limit),
                    Side::Sell if price >= limit => Some(limit),
                    _ => None,
                }
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), ExecutionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ExecutionError::NotConnected);
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionAdapter for PaperExecutionAdapter {
    async fn connect(&self) -> Result<(), ExecutionError> {
        self.connected.store(true, Ordering::SeqCst);
        debug!("paper adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ExecutionError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn place_order(&self, mut order: Order) -> Result<Order, ExecutionError> {
        self.ensure_connected()?;
        let now = Utc::now();
        let price = self
            .prices
            .read()
            .get(&order.symbol)
            .copied()
            .ok_or_else(|| ExecutionError::NoMarketData(order.symbol.clone()))?;

        order
            .transition(OrderStatus::Open, now)
            .map_err(|e| ExecutionError::Rejected(e.to_string()))?;

        match order.order_type {
            OrderType::Market => {
                let estimate = self
                    .slippage
                    .estimate(order.side, order.quantity, price, None, None)
                    .map_err(|e| ExecutionError::Rejected(e.to_string()))?;
                order
                    .record_fill(order.quantity, estimate.expected_fill_price, Decimal::ZERO, now)
                    .map_err(|e| ExecutionError::Rejected(e.to_string()))?;
            }
            _ => {
                // Resting order: the next set_price that crosses it fills it
                // via fill_crossings; callers poll get_order for the result.
            }
        }
        self.orders.write().insert(order.id, order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, id: Uuid) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        let mut orders = self.orders.write();
        if let Some(order) = orders.get_mut(&id) {
            if !order.is_terminal() {
                let _ = order.transition(OrderStatus::Cancelled, Utc::now());
            }
        }
        self.armed_stop_limits.write().remove(&id);
        // Unknown ids are a no-op: cancel is idempotent.
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Order, ExecutionError> {
        self.ensure_connected()?;
        self.orders
            .read()
            .get(&id)
            .cloned()
            .ok_or(ExecutionError::OrderNotFound(id))
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExecutionError> {
        self.ensure_connected()?;
        Ok(self
            .balances
            .read()
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExecutionError> {
        self.ensure_connected()?;
        let mut positions: Vec<Position> = self.positions.read().values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Tick, ExecutionError> {
        self.ensure_connected()?;
        let price = self
            .prices
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| ExecutionError::NoMarketData(symbol.to_string()))?;
        Ok(Tick {
            symbol: symbol.to_string(),
            price,
            size: Decimal::ZERO,
            side: Side::Buy,
            timestamp: Utc::now(),
            bid: None,
            ask: None,
            bid_size: None,
            ask_size: None,
        })
    }

    async fn get_order_book(
        &self,
        symbol: &str,
        _depth: usize,
    ) -> Result<OrderBookSnapshot, ExecutionError> {
        self.ensure_connected()?;
        // The paper venue has no resting liquidity of its own.
        let _ = self
            .prices
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| ExecutionError::NoMarketData(symbol.to_string()))?;
        Ok(OrderBookSnapshot {
            symbol: symbol.to_string(),
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp: Utc::now(),
        })
    }

    async fn subscribe_to_ticker(
        &self,
        symbols: Vec<String>,
        callback: TickerCallback,
    ) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        self.subscribers.write().push((symbols, callback));
        Ok(())
    }
}

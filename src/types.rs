//! Core Domain Model
//!
//! Canonical market-data, order, position and trade types shared by every
//! subsystem. All monetary values are `Decimal`; all timestamps are UTC and
//! monotonic within a run (bar timestamps are the bar's close time).

use crate::errors::PortfolioError;
use crate::num;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    #[inline]
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The order side that opens or extends this position.
    #[inline]
    pub fn entry_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// The order side that reduces or closes this position.
    #[inline]
    pub fn exit_side(&self) -> Side {
        self.entry_side().opposite()
    }

    #[inline]
    pub fn sign(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

/// Order type for submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    StopLimit,
    TakeProfit,
}

/// Order lifecycle status. Transitions are monotone along
/// pending -> open -> (partially_filled)* -> terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal statuses admit no further transitions.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    /// Monotone rank used to enforce forward-only transitions.
    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Open => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
            | OrderStatus::Expired => 3,
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        // PartiallyFilled may repeat while fills accumulate.
        if *self == OrderStatus::PartiallyFilled && next == OrderStatus::PartiallyFilled {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// OHLCV bar. The timestamp is the bar's close time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Bar {
    /// Validate the OHLCV invariant: low <= {open, close} <= high, volume >= 0.
    pub fn validate(&self) -> Result<(), PortfolioError> {
        if self.low > self.open
            || self.low > self.close
            || self.high < self.open
            || self.high < self.close
            || self.low > self.high
        {
            return Err(PortfolioError::InvariantBreach(format!(
                "bar {} @ {}: OHLC out of range (o={} h={} l={} c={})",
                self.symbol, self.timestamp, self.open, self.high, self.low, self.close
            )));
        }
        if self.volume < Decimal::ZERO {
            return Err(PortfolioError::InvariantBreach(format!(
                "bar {} @ {}: negative volume {}",
                self.symbol, self.timestamp, self.volume
            )));
        }
        Ok(())
    }

    /// High-low range of the bar.
    #[inline]
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    /// Whether the bar's [low, high] range crosses `price`.
    #[inline]
    pub fn crosses(&self, price: Decimal) -> bool {
        self.low <= price && price <= self.high
    }
}

/// Single trade print or quote update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: Decimal,
    pub size: Decimal,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub bid_size: Option<Decimal>,
    pub ask_size: Option<Decimal>,
}

/// A single price level in an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl Level {
    #[inline]
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Order book snapshot: bids sorted descending, asks ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.first()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Validate bid/ask ordering and the crossed-book invariant.
    pub fn validate(&self) -> Result<(), PortfolioError> {
        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if bid.price >= ask.price {
                return Err(PortfolioError::InvariantBreach(format!(
                    "crossed book for {}: best_bid {} >= best_ask {}",
                    self.symbol, bid.price, ask.price
                )));
            }
        }
        if self.bids.windows(2).any(|w| w[0].price < w[1].price) {
            return Err(PortfolioError::InvariantBreach(format!(
                "bids for {} not sorted descending",
                self.symbol
            )));
        }
        if self.asks.windows(2).any(|w| w[0].price > w[1].price) {
            return Err(PortfolioError::InvariantBreach(format!(
                "asks for {} not sorted ascending",
                self.symbol
            )));
        }
        Ok(())
    }
}

/// A strategy's directional recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    /// Conviction in [0, 1].
    pub strength: f64,
    /// How the entry order should be placed. Market orders fill at the next
    /// bar's open; resting types fill when a later bar touches their price.
    pub entry_type: OrderType,
    /// Trigger price for stop-market / stop-limit entries.
    pub entry_trigger: Option<Decimal>,
    pub suggested_entry: Option<Decimal>,
    pub suggested_stop: Option<Decimal>,
    pub suggested_target: Option<Decimal>,
    pub reason: String,
    pub metadata: BTreeMap<String, String>,
    pub generated_at: DateTime<Utc>,
    /// Aggregator confidence, when the signal came through an aggregator.
    pub confidence: Option<f64>,
    /// Aggregator consensus, when the signal came through an aggregator.
    pub consensus: Option<f64>,
}

impl Signal {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        strength: f64,
        reason: impl Into<String>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            strength: strength.clamp(0.0, 1.0),
            entry_type: OrderType::Market,
            entry_trigger: None,
            suggested_entry: None,
            suggested_stop: None,
            suggested_target: None,
            reason: reason.into(),
            metadata: BTreeMap::new(),
            generated_at,
            confidence: None,
            consensus: None,
        }
    }

    pub fn with_entry(mut self, entry: Decimal) -> Self {
        self.suggested_entry = Some(entry);
        self
    }

    /// Request a non-market entry. Limit entries price at `suggested_entry`;
    /// stop entries also need `with_entry_trigger`.
    pub fn with_entry_type(mut self, entry_type: OrderType) -> Self {
        self.entry_type = entry_type;
        self
    }

    pub fn with_entry_trigger(mut self, trigger: Decimal) -> Self {
        self.entry_trigger = Some(trigger);
        self
    }

    pub fn with_stop(mut self, stop: Decimal) -> Self {
        self.suggested_stop = Some(stop);
        self
    }

    pub fn with_target(mut self, target: Decimal) -> Self {
        self.suggested_target = Some(target);
        self
    }
}

/// An order as tracked by the order manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub client_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub commission_accrued: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn market(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(symbol, side, OrderType::Market, quantity, None, None, now)
    }

    pub fn limit(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(symbol, side, OrderType::Limit, quantity, Some(price), None, now)
    }

    pub fn stop_market(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        stop_price: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            symbol,
            side,
            OrderType::StopMarket,
            quantity,
            None,
            Some(stop_price),
            now,
        )
    }

    pub fn stop_limit(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        stop_price: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            symbol,
            side,
            OrderType::StopLimit,
            quantity,
            Some(price),
            Some(stop_price),
            now,
        )
    }

    pub fn take_profit(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            symbol,
            side,
            OrderType::TakeProfit,
            quantity,
            Some(price),
            None,
            now,
        )
    }

    fn new(
        symbol: impl Into<String>,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
        stop_price: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id: None,
            symbol: symbol.into(),
            side,
            order_type,
            quantity,
            price,
            stop_price,
            status: OrderStatus::Pending,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            commission_accrued: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            filled_at: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    #[inline]
    pub fn remaining_qty(&self) -> Decimal {
        self.quantity - self.filled_qty
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to `next`, enforcing monotonicity.
    pub fn transition(&mut self, next: OrderStatus, now: DateTime<Utc>) -> Result<(), PortfolioError> {
        if !self.status.can_transition_to(next) {
            return Err(PortfolioError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        if next == OrderStatus::Filled {
            self.filled_at = Some(now);
        }
        Ok(())
    }

    /// Record a fill against this order: accumulates filled quantity, recomputes
    /// the size-weighted average fill price and advances the status.
    pub fn record_fill(
        &mut self,
        qty: Decimal,
        price: Decimal,
        commission: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), PortfolioError> {
        if qty <= Decimal::ZERO {
            return Err(PortfolioError::InvariantBreach(format!(
                "non-positive fill quantity {qty} on order {}",
                self.id
            )));
        }
        let remaining = self.remaining_qty();
        if qty > remaining {
            return Err(PortfolioError::OverFill {
                id: self.id,
                fill_qty: qty,
                remaining,
            });
        }
        let prior_notional = self.avg_fill_price * self.filled_qty;
        self.filled_qty += qty;
        self.avg_fill_price = num::div_scaled(prior_notional + price * qty, self.filled_qty)
            .unwrap_or(price);
        self.commission_accrued += commission;
        let next = if self.remaining_qty().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.transition(next, now)
    }
}

/// Position in a single symbol. At most one position per symbol; flipping
/// side realizes the closing leg before the new side opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    /// Size-weighted average entry price.
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn open(
        symbol: impl Into<String>,
        side: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            entry_price,
            current_price: entry_price,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            stop_loss: None,
            take_profit: None,
            opened_at,
        }
    }

    /// Signed quantity: positive for long, negative for short.
    #[inline]
    pub fn signed_quantity(&self) -> Decimal {
        self.side.sign() * self.quantity
    }

    /// Notional value at the current mark.
    #[inline]
    pub fn notional(&self) -> Decimal {
        self.quantity * self.current_price
    }

    /// Mark the position to `price`, recomputing unrealized P&L.
    pub fn mark(&mut self, price: Decimal) {
        self.current_price = price;
        self.unrealized_pnl = match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        };
    }

    /// Realized P&L for closing `qty` at `price`.
    pub fn closing_pnl(&self, qty: Decimal, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * qty,
            PositionSide::Short => (self.entry_price - price) * qty,
        }
    }
}

/// An immutable fill record. Written once by the order manager and never
/// mutated afterward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub order_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    pub slippage: Decimal,
    pub realized_pnl: Decimal,
    pub executed_at: DateTime<Utc>,
}

//! Order Manager and Portfolio Accounting
//!
//! Single writer for order, position and trade state. Everything else reads
//! snapshots: the risk manager, the agent and the UI never mutate through
//! this module and this module never calls back into them.
//!
//! Fill ingestion is atomic: order bookkeeping, position lifecycle, cash and
//! the closed-trade record all move together or the fill is rejected with no
//! state change.

use crate::errors::PortfolioError;
use crate::num;
use crate::types::{Order, OrderStatus, Position, PositionSide, Side, Trade};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// A single point on the equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub cash: Decimal,
    /// Fractional decline from the running peak, in [0, 1].
    pub drawdown: Decimal,
}

/// Time-indexed equity curve with strictly increasing timestamps and a
/// rolling fingerprint for cheap determinism comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityCurve {
    points: Vec<EquityPoint>,
    peak_equity: Decimal,
    rolling_hash: u64,
}

impl EquityCurve {
    const HASH_SEED: u64 = 0xEC11_EC11_EC11_EC11;

    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            peak_equity: Decimal::ZERO,
            rolling_hash: Self::HASH_SEED,
        }
    }

    /// Record an equity observation. Returns false (and records nothing) when
    /// `timestamp` is not strictly greater than the last recorded point.
    pub fn try_record(&mut self, timestamp: DateTime<Utc>, equity: Decimal, cash: Decimal) -> bool {
        if let Some(last) = self.points.last() {
            if timestamp <= last.timestamp {
                return false;
            }
        }
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        let drawdown = if self.peak_equity > Decimal::ZERO {
            num::div_scaled(self.peak_equity - equity, self.peak_equity)
                .unwrap_or(Decimal::ZERO)
                .clamp(Decimal::ZERO, Decimal::ONE)
        } else {
            Decimal::ZERO
        };
        let point = EquityPoint {
            timestamp,
            equity,
            cash,
            drawdown,
        };
        let mut hasher = DefaultHasher::new();
        self.rolling_hash.hash(&mut hasher);
        point.timestamp.hash(&mut hasher);
        point.equity.hash(&mut hasher);
        point.cash.hash(&mut hasher);
        self.rolling_hash = hasher.finish();
        self.points.push(point);
        true
    }

    pub fn points(&self) -> &[EquityPoint] {
        &self.points
    }

    pub fn last(&self) -> Option<&EquityPoint> {
        self.points.last()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn peak_equity(&self) -> Decimal {
        self.peak_equity
    }

    /// Maximum drawdown over the curve, with the timestamp where it occurred.
    pub fn max_drawdown(&self) -> Option<(Decimal, DateTime<Utc>)> {
        self.points
            .iter()
            .max_by_key(|p| p.drawdown)
            .map(|p| (p.drawdown, p.timestamp))
    }

    /// Rolling fingerprint over (timestamp, equity, cash).
    pub fn fingerprint(&self) -> u64 {
        self.rolling_hash
    }
}

impl Default for EquityCurve {
    fn default() -> Self {
        Self::new()
    }
}

/// A fill to apply against an open order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: Uuid,
    pub quantity: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    /// Per-unit adverse price delta versus the decision price.
    pub slippage: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Read-only view handed to the risk manager and the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub cash: Decimal,
    pub equity: Decimal,
    pub positions: BTreeMap<String, Position>,
    pub open_order_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl PortfolioSnapshot {
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Gross exposure: sum of absolute position notionals.
    pub fn gross_exposure(&self) -> Decimal {
        self.positions.values().map(|p| p.notional()).sum()
    }
}

/// The order manager: open-order registry, position lifecycle, fill
/// accounting and the equity curve.
#[derive(Debug, Clone)]
pub struct OrderManager {
    initial_capital: Decimal,
    cash: Decimal,
    open_orders: HashMap<Uuid, Order>,
    positions: HashMap<String, Position>,
    closed_trades: Vec<Trade>,
    marks: HashMap<String, Decimal>,
    equity_curve: EquityCurve,
    trade_seq: u64,
}

impl OrderManager {
    pub fn new(initial_capital: Decimal) -> Self {
        Self {
            initial_capital,
            cash: initial_capital,
            open_orders: HashMap::new(),
            positions: HashMap::new(),
            closed_trades: Vec::new(),
            marks: HashMap::new(),
            equity_curve: EquityCurve::new(),
            trade_seq: 0,
        }
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    /// Accept an order into the open-order registry.
    pub fn submit(&mut self, mut order: Order, now: DateTime<Utc>) -> Result<Uuid, PortfolioError> {
        if order.quantity <= Decimal::ZERO {
            return Err(PortfolioError::InvariantBreach(format!(
                "order {} has non-positive quantity {}",
                order.id, order.quantity
            )));
        }
        if order.status == OrderStatus::Pending {
            order.transition(OrderStatus::Open, now)?;
        }
        let id = order.id;
        self.open_orders.insert(id, order);
        Ok(id)
    }

    /// Cancel an open order. Unknown ids error; terminal orders are already
    /// out of the registry.
    pub fn cancel(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<Order, PortfolioError> {
        let mut order = self
            .open_orders
            .remove(&id)
            .ok_or(PortfolioError::UnknownOrder(id))?;
        order.transition(OrderStatus::Cancelled, now)?;
        Ok(order)
    }

    /// Mark an order rejected and drop it from the registry.
    pub fn reject(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<Order, PortfolioError> {
        let mut order = self
            .open_orders
            .remove(&id)
            .ok_or(PortfolioError::UnknownOrder(id))?;
        order.transition(OrderStatus::Rejected, now)?;
        Ok(order)
    }

    pub fn open_order(&self, id: Uuid) -> Option<&Order> {
        self.open_orders.get(&id)
    }

    /// Snapshot of open orders, sorted by creation time for deterministic
    /// iteration.
    pub fn open_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.open_orders.values().cloned().collect();
        orders.sort_by_key(|o| (o.created_at, o.id));
        orders
    }

    // ------------------------------------------------------------------
    // Fills
    // ------------------------------------------------------------------

    /// Apply a fill atomically: order bookkeeping, position lifecycle, cash
    /// and the immutable trade record.
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<Trade, PortfolioError> {
        let order = self
            .open_orders
            .get_mut(&fill.order_id)
            .ok_or(PortfolioError::UnknownOrder(fill.order_id))?;
        if fill.price <= Decimal::ZERO {
            return Err(PortfolioError::InvariantBreach(format!(
                "fill for order {} at non-positive price {}",
                fill.order_id, fill.price
            )));
        }

        order.record_fill(fill.quantity, fill.price, fill.commission, fill.timestamp)?;
        let side = order.side;
        let symbol = order.symbol.clone();
        let terminal = order.is_terminal();

        let realized_pnl = self.apply_to_position(&symbol, side, fill.quantity, fill.price, fill.timestamp);

        // Cash moves by the signed notional, commission always debits.
        let notional = fill.quantity * fill.price;
        match side {
            Side::Buy => self.cash -= notional + fill.commission,
            Side::Sell => self.cash += notional - fill.commission,
        }
        self.marks.insert(symbol.clone(), fill.price);

        // Sequence-derived ids keep runs bitwise reproducible.
        self.trade_seq += 1;
        let trade = Trade {
            id: Uuid::from_u128(self.trade_seq as u128),
            order_id: fill.order_id,
            symbol,
            side,
            quantity: fill.quantity,
            price: fill.price,
            commission: fill.commission,
            slippage: fill.slippage,
            realized_pnl,
            executed_at: fill.timestamp,
        };
        self.closed_trades.push(trade.clone());

        if terminal {
            self.open_orders.remove(&fill.order_id);
        }
        Ok(trade)
    }

    /// Open, extend, reduce or flip the symbol's position. Returns the
    /// realized P&L of any closing leg.
    fn apply_to_position(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Decimal {
        let Some(position) = self.positions.get_mut(symbol) else {
            let position_side = match side {
                Side::Buy => PositionSide::Long,
                Side::Sell => PositionSide::Short,
            };
            self.positions.insert(
                symbol.to_string(),
                Position::open(symbol, position_side, quantity, price, timestamp),
            );
            return Decimal::ZERO;
        };

        if side == position.side.entry_side() {
            // Extend: size-weighted entry price.
            let total_qty = position.quantity + quantity;
            position.entry_price = num::div_scaled(
                position.entry_price * position.quantity + price * quantity,
                total_qty,
            )
            .unwrap_or(price);
            position.quantity = total_qty;
            position.mark(price);
            return Decimal::ZERO;
        }

        // Reduce, close or flip: realize the closing leg first.
        let closing_qty = quantity.min(position.quantity);
        let realized = position.closing_pnl(closing_qty, price);
        position.quantity -= closing_qty;
        position.realized_pnl += realized;
        position.mark(price);

        let flat = position.quantity.is_zero();
        let remainder = quantity - closing_qty;
        if flat {
            self.positions.remove(symbol);
        }
        if remainder > Decimal::ZERO {
            let flipped_side = match side {
                Side::Buy => PositionSide::Long,
                Side::Sell => PositionSide::Short,
            };
            self.positions.insert(
                symbol.to_string(),
                Position::open(symbol, flipped_side, remainder, price, timestamp),
            );
        }
        realized
    }

    /// Attach bracket levels to an open position.
    pub fn set_bracket(
        &mut self,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) {
        if let Some(position) = self.positions.get_mut(symbol) {
            if stop_loss.is_some() {
                position.stop_loss = stop_loss;
            }
            if take_profit.is_some() {
                position.take_profit = take_profit;
            }
        }
    }

    // ------------------------------------------------------------------
    // Marks and equity
    // ------------------------------------------------------------------

    /// Mark a symbol to `price`, updating any open position's unrealized P&L.
    pub fn mark(&mut self, symbol: &str, price: Decimal) {
        self.marks.insert(symbol.to_string(), price);
        if let Some(position) = self.positions.get_mut(symbol) {
            position.mark(price);
        }
    }

    /// Equity = cash + sum of signed position quantity times mark price.
    pub fn equity(&self) -> Decimal {
        let position_value: Decimal = self
            .positions
            .values()
            .map(|p| p.signed_quantity() * p.current_price)
            .sum();
        self.cash + position_value
    }

    /// Append an equity point. Call once per unique timestamp, after marking
    /// every symbol trading at that timestamp.
    pub fn record_equity(&mut self, timestamp: DateTime<Utc>) -> bool {
        let equity = self.equity();
        let cash = self.cash;
        self.equity_curve.try_record(timestamp, equity, cash)
    }

    // ------------------------------------------------------------------
    // Read access
    // ------------------------------------------------------------------

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn initial_capital(&self) -> Decimal {
        self.initial_capital
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.closed_trades
    }

    pub fn equity_curve(&self) -> &EquityCurve {
        &self.equity_curve
    }

    pub fn total_realized_pnl(&self) -> Decimal {
        self.closed_trades.iter().map(|t| t.realized_pnl).sum()
    }

    pub fn total_commission(&self) -> Decimal {
        self.closed_trades.iter().map(|t| t.commission).sum()
    }

    pub fn mark_price(&self, symbol: &str) -> Option<Decimal> {
        self.marks.get(symbol).copied()
    }

    pub fn snapshot(&self, timestamp: DateTime<Utc>) -> PortfolioSnapshot {
        PortfolioSnapshot {
            cash: self.cash,
            equity: self.equity(),
            positions: self
                .positions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            open_order_count: self.open_orders.len(),
            timestamp,
        }
    }
}

//! Backtest Event Loop
//!
//! Drives strategies over a chronological bar stream, simulating execution
//! with the configured slippage model and gating every entry through the
//! risk manager.
//!
//! # Fill Rules
//!
//! - Market orders scheduled at bar `t` fill at bar `t+1`'s open. Filling at
//!   bar `t`'s close would be look-ahead bias.
//! - Limit/stop orders fill when the bar's [low, high] range crosses the
//!   trigger; the fill price is the trigger adjusted by the slippage model
//!   using that bar's volume. Stop-limit orders arm on the trigger bar and
//!   fill on a later bar that satisfies the limit condition.
//! - Bracket exits (stop-loss before take-profit when both are touched) fill
//!   intra-bar at the bracket level.

use crate::agent::sizing::{self, TradeStats};
use crate::backtest::metrics::{self, PerformanceMetrics};
use crate::backtest::{BacktestConfig, ValidationConfig};
use crate::bus::{BusEvent, CancelToken, EventBus, EventPayload, ExecutionReport};
use crate::errors::{BacktestError, ConfigError};
use crate::num;
use crate::portfolio::{EquityPoint, Fill, OrderManager};
use crate::risk::{RiskManager, RiskStatus};
use crate::slippage::{FixedSlippage, SlippageModel, SlippageSpec, VolumeWeightedSlippage};
use crate::strategy::indicators::RollingStd;
use crate::strategy::{Strategy, StrategyContext, StrategyRegistry};
use crate::types::{Bar, Order, OrderType, Position, PositionSide, Side, Signal, Trade};
use crate::validation::monte_carlo::{self, MonteCarloResult};
use crate::validation::walk_forward::WalkForwardReport;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Window for the per-symbol realized-volatility estimate used by sizing.
const VOL_WINDOW: usize = 20;
/// How often the cancellation token is polled.
const CANCEL_POLL_STRIDE: usize = 256;

/// Periodic progress snapshot, decoupled from any transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub events_processed: u64,
    pub total_events: u64,
    pub current_date: DateTime<Utc>,
    pub trades_executed: u64,
    pub current_equity: Decimal,
}

pub type ProgressCallback = Box<dyn Fn(&ProgressUpdate) + Send>;

/// Append-only record of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub id: Uuid,
    pub config: BacktestConfig,
    pub metrics: PerformanceMetrics,
    pub risk_status: RiskStatus,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
    pub monte_carlo: Option<MonteCarloResult>,
    /// Attached by a walk-forward harness run over the same config; the
    /// engine itself never fills this in.
    pub walk_forward: Option<WalkForwardReport>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub events_processed: u64,
    /// Rolling hash of the equity curve for cheap determinism comparisons.
    pub equity_fingerprint: u64,
}

/// A market order waiting for the next bar's open.
struct PendingMarket {
    order_id: Uuid,
    stop: Option<Decimal>,
    target: Option<Decimal>,
}

struct SymbolState {
    strategy: Box<dyn Strategy>,
    pending: Vec<PendingMarket>,
    returns_vol: RollingStd,
    prev_close: Option<f64>,
}

pub struct BacktestEngine {
    config: BacktestConfig,
    registry: StrategyRegistry,
    bus: Option<Arc<EventBus>>,
    progress: Option<ProgressCallback>,
    progress_interval: Duration,
    cancel: CancelToken,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        Self {
            config,
            registry: StrategyRegistry::with_defaults(),
            bus: None,
            progress: None,
            progress_interval: Duration::from_millis(500),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Attach a bus for observers (UI, logging). The engine never depends on
    /// subscribers being present.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Progress emission throttle; visible for tests.
    pub fn set_progress_interval(&mut self, interval: Duration) {
        self.progress_interval = interval;
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn publish(&self, payload: EventPayload, timestamp: DateTime<Utc>) {
        if let Some(bus) = &self.bus {
            let _ = bus.publish(BusEvent::new(payload, timestamp));
        }
    }

    /// Price a simulated fill. The volume-weighted model measures impact
    /// against the current bar's volume; models that cannot produce an
    /// estimate fall back to the reference price.
    fn estimate_fill_price(
        &self,
        side: Side,
        quantity: Decimal,
        reference_price: Decimal,
        bar: &Bar,
    ) -> Decimal {
        let estimate = match &self.config.slippage {
            SlippageSpec::Fixed { bps } => {
                FixedSlippage::new(*bps).estimate(side, quantity, reference_price, None, None)
            }
            SlippageSpec::VolumeWeighted {
                base_bps,
                impact_factor,
                reference_volume,
            } => {
                let volume = if bar.volume > Decimal::ZERO {
                    bar.volume
                } else {
                    *reference_volume
                };
                VolumeWeightedSlippage::new(*base_bps, *impact_factor, volume).estimate(
                    side,
                    quantity,
                    reference_price,
                    None,
                    None,
                )
            }
            // No order book exists in a bar-level simulation.
            SlippageSpec::BookTraversal => {
                debug!("book traversal slippage has no book in a bar backtest, using reference");
                return reference_price;
            }
        };
        match estimate {
            Ok(estimate) => estimate.expected_fill_price,
            Err(err) => {
                debug!(%err, "slippage estimate failed, falling back to reference price");
                reference_price
            }
        }
    }

    /// Run the backtest over `bars`. Bars outside `[start, end]` or for
    /// unconfigured symbols are ignored.
    pub fn run(&mut self, bars: &[Bar]) -> Result<BacktestReport, BacktestError> {
        self.config.validate()?;
        let started_at = Utc::now();
        let started = Instant::now();

        let symbols: HashSet<&str> = self.config.symbols.iter().map(String::as_str).collect();
        let mut feed: Vec<&Bar> = bars
            .iter()
            .filter(|bar| {
                bar.timestamp >= self.config.start
                    && bar.timestamp <= self.config.end
                    && symbols.contains(bar.symbol.as_str())
            })
            .collect();
        feed.sort_by(|a, b| (a.timestamp, &a.symbol).cmp(&(b.timestamp, &b.symbol)));
        if feed.is_empty() {
            return Err(ConfigError::EmptyData(format!(
                "no bars for {:?} in [{}, {}]",
                self.config.symbols, self.config.start, self.config.end
            ))
            .into());
        }

        // One strategy instance per symbol, sorted for determinism.
        let mut states: BTreeMap<String, SymbolState> = BTreeMap::new();
        for symbol in &self.config.symbols {
            let mut strategy = self
                .registry
                .create_configured(&self.config.strategy, &self.config.strategy_params)?;
            strategy.initialize(&StrategyContext {
                symbol: symbol.clone(),
                timeframe: self.config.timeframe.clone(),
                initial_capital: self.config.initial_capital,
            });
            states.insert(
                symbol.clone(),
                SymbolState {
                    strategy,
                    pending: Vec::new(),
                    returns_vol: RollingStd::new(VOL_WINDOW),
                    prev_close: None,
                },
            );
        }

        let mut orders = OrderManager::new(self.config.initial_capital);
        let risk = RiskManager::new(self.config.risk.clone());
        let mut stats = TradeStats::default();
        let mut armed_stop_limits: HashSet<Uuid> = HashSet::new();
        // Bracket levels for resting entry orders, attached once they fill.
        let mut resting_brackets: HashMap<Uuid, (Option<Decimal>, Option<Decimal>)> =
            HashMap::new();
        let mut order_seq: u64 = 0;
        let mut trades_executed: u64 = 0;
        let mut last_progress = Instant::now();
        let total_events = feed.len() as u64;

        info!(
            strategy = %self.config.strategy,
            symbols = ?self.config.symbols,
            bars = feed.len(),
            "backtest starting"
        );

        for (index, bar) in feed.iter().enumerate() {
            if index % CANCEL_POLL_STRIDE == 0 && self.cancel.is_cancelled() {
                return Err(BacktestError::Cancelled);
            }
            bar.validate()
                .map_err(|e| BacktestError::InvariantBreach(e.to_string()))?;
            let ts = bar.timestamp;

            // --- 1. Market orders from the previous bar fill at this open
            let pending: Vec<PendingMarket> = {
                let state = states
                    .get_mut(&bar.symbol)
                    .ok_or_else(|| BacktestError::InvariantBreach("unknown symbol".into()))?;
                state.pending.drain(..).collect()
            };
            for entry in pending {
                let Some(order) = orders.open_order(entry.order_id).cloned() else {
                    continue;
                };
                let fill_price =
                    self.estimate_fill_price(order.side, order.remaining_qty(), bar.open, bar);
                self.apply_simulated_fill(
                    &mut orders,
                    &risk,
                    &mut stats,
                    &order,
                    fill_price,
                    bar.open,
                    ts,
                )?;
                trades_executed += 1;
                orders.set_bracket(&order.symbol, entry.stop, entry.target);
            }

            // --- 2. Resting limit/stop orders against this bar's range
            for order in orders
                .open_orders()
                .into_iter()
                .filter(|o| o.symbol == bar.symbol)
            {
                let trigger = match self.resting_trigger(&order, bar, &mut armed_stop_limits) {
                    Some(trigger) => trigger,
                    None => continue,
                };
                let fill_price =
                    self.estimate_fill_price(order.side, order.remaining_qty(), trigger, bar);
                self.apply_simulated_fill(
                    &mut orders, &risk, &mut stats, &order, fill_price, trigger, ts,
                )?;
                trades_executed += 1;
                armed_stop_limits.remove(&order.id);
                if let Some((stop, target)) = resting_brackets.remove(&order.id) {
                    orders.set_bracket(&order.symbol, stop, target);
                }
            }

            // --- 3. Bracket exits on the open position
            if let Some(exit) = self.bracket_exit(orders.position(&bar.symbol), bar) {
                let (side, quantity, trigger) = exit;
                let mut order = Order::market(&bar.symbol, side, quantity, ts);
                order_seq += 1;
                order.id = Uuid::from_u128(order_seq as u128);
                orders.submit(order.clone(), ts)?;
                let order = orders
                    .open_order(order.id)
                    .cloned()
                    .ok_or_else(|| BacktestError::InvariantBreach("exit order lost".into()))?;
                let fill_price =
                    self.estimate_fill_price(side, quantity, trigger, bar);
                self.apply_simulated_fill(
                    &mut orders, &risk, &mut stats, &order, fill_price, trigger, ts,
                )?;
                trades_executed += 1;
            }

            // --- 4. Mark to the close, update the volatility estimate
            orders.mark(&bar.symbol, bar.close);
            let state = states
                .get_mut(&bar.symbol)
                .ok_or_else(|| BacktestError::InvariantBreach("unknown symbol".into()))?;
            let close = num::to_f64(bar.close);
            if let Some(prev) = state.prev_close.replace(close) {
                if prev > 0.0 {
                    state.returns_vol.update(close / prev - 1.0);
                }
            }

            // --- 5. Strategy callback and signal handling
            self.publish(EventPayload::Bar((*bar).clone()), ts);
            let signal = state.strategy.on_bar(bar);
            if let Some(signal) = signal {
                self.publish(EventPayload::Signal(signal.clone()), ts);
                let realized_vol = state.returns_vol.value();
                self.handle_signal(
                    &signal,
                    bar,
                    &mut orders,
                    &risk,
                    &stats,
                    realized_vol,
                    &mut order_seq,
                    &mut states,
                    &mut resting_brackets,
                )?;
            }

            // --- 6. One equity point per unique timestamp
            let is_boundary = feed
                .get(index + 1)
                .map(|next| next.timestamp != ts)
                .unwrap_or(true);
            if is_boundary {
                orders.record_equity(ts);
                risk.mark_equity(orders.equity(), ts);
            }

            // --- 7. Progress, throttled by wall time
            if last_progress.elapsed() >= self.progress_interval {
                last_progress = Instant::now();
                let update = ProgressUpdate {
                    events_processed: index as u64 + 1,
                    total_events,
                    current_date: ts,
                    trades_executed,
                    current_equity: orders.equity(),
                };
                if let Some(callback) = &self.progress {
                    callback(&update);
                }
            }
        }

        // Expire whatever never filled.
        let final_ts = feed.last().map(|b| b.timestamp).unwrap_or(self.config.end);
        for order in orders.open_orders() {
            let _ = orders.cancel(order.id, final_ts);
        }

        let performance = metrics::compute(
            orders.trades(),
            orders.equity_curve(),
            self.config.initial_capital,
            metrics::periods_per_year(&self.config.timeframe),
        );

        let monte_carlo = match &self.config.validation {
            Some(ValidationConfig {
                monte_carlo: Some(mc_config),
            }) => {
                let returns =
                    metrics::trade_returns(orders.trades(), self.config.initial_capital);
                if returns.is_empty() {
                    None
                } else {
                    let mut mc_config = mc_config.clone();
                    // The run seed governs every stochastic component.
                    mc_config.seed = mc_config.seed.or(Some(self.config.seed));
                    monte_carlo::run(
                        &returns,
                        num::to_f64(self.config.initial_capital),
                        &mc_config,
                        Some(&self.cancel),
                    )
                    .ok()
                }
            }
            _ => None,
        };

        let completed_at = Utc::now();
        info!(
            trades = trades_executed,
            final_equity = %orders.equity(),
            "backtest complete"
        );

        Ok(BacktestReport {
            id: Uuid::new_v4(),
            config: self.config.clone(),
            metrics: performance,
            risk_status: risk.status(),
            equity_curve: orders.equity_curve().points().to_vec(),
            trades: orders.trades().to_vec(),
            monte_carlo,
            walk_forward: None,
            started_at,
            completed_at,
            duration_ms: started.elapsed().as_millis() as u64,
            events_processed: total_events,
            equity_fingerprint: orders.equity_curve().fingerprint(),
        })
    }

    /// Trigger price for a resting order against this bar, or None when the
    /// order stays resting. Stop-limit orders arm on the trigger bar and are
    /// eligible from the next bar on.
    fn resting_trigger(
        &self,
        order: &Order,
        bar: &Bar,
        armed_stop_limits: &mut HashSet<Uuid>,
    ) -> Option<Decimal> {
        match order.order_type {
            OrderType::Market => None,
            OrderType::Limit | OrderType::TakeProfit => {
                let limit = order.price?;
                match order.side {
                    Side::Buy if bar.low <= limit => Some(limit),
                    Side::Sell if bar.high >= limit => Some(limit),
                    _ => None,
                }
            }
            OrderType::StopMarket => {
                let stop = order.stop_price?;
                match order.side {
                    Side::Buy if bar.high >= stop => Some(stop),
                    Side::Sell if bar.low <= stop => Some(stop),
                    _ => None,
                }
            }
            OrderType::StopLimit => {
                let stop = order.stop_price?;
                let limit = order.price?;
                if armed_stop_limits.contains(&order.id) {
                    match order.side {
                        Side::Buy if bar.low <= limit => Some(limit),
                        Side::Sell if bar.high >= limit => Some(limit),
                        _ => None,
                    }
                } else {
                    let hit = match order.side {
                        Side::Buy => bar.high >= stop,
                        Side::Sell => bar.low <= stop,
                    };
                    if hit {
                        armed_stop_limits.insert(order.id);
                    }
                    None
                }
            }
        }
    }

    /// Stop-loss/take-profit exit for the open position against this bar.
    /// The stop is checked first: when both are touched in one bar the
    /// conservative assumption wins.
    fn bracket_exit(
        &self,
        position: Option<&Position>,
        bar: &Bar,
    ) -> Option<(Side, Decimal, Decimal)> {
        let position = position?;
        let exit_side = position.side.exit_side();
        match position.side {
            PositionSide::Long => {
                if let Some(stop) = position.stop_loss {
                    if bar.low <= stop {
                        return Some((exit_side, position.quantity, stop));
                    }
                }
                if let Some(target) = position.take_profit {
                    if bar.high >= target {
                        return Some((exit_side, position.quantity, target));
                    }
                }
                None
            }
            PositionSide::Short => {
                if let Some(stop) = position.stop_loss {
                    if bar.high >= stop {
                        return Some((exit_side, position.quantity, stop));
                    }
                }
                if let Some(target) = position.take_profit {
                    if bar.low <= target {
                        return Some((exit_side, position.quantity, target));
                    }
                }
                None
            }
        }
    }

    /// Apply one simulated fill end to end: portfolio accounting, risk
    /// counters, Kelly statistics and observer events.
    #[allow(clippy::too_many_arguments)]
    fn apply_simulated_fill(
        &self,
        orders: &mut OrderManager,
        risk: &RiskManager,
        stats: &mut TradeStats,
        order: &Order,
        fill_price: Decimal,
        reference_price: Decimal,
        ts: DateTime<Utc>,
    ) -> Result<Trade, BacktestError> {
        let quantity = order.remaining_qty();
        let commission = num::apply_bps(quantity * fill_price, self.config.commission_bps);
        let fill = Fill {
            order_id: order.id,
            quantity,
            price: fill_price,
            commission,
            slippage: (fill_price - reference_price).abs(),
            timestamp: ts,
        };
        let trade = orders.apply_fill(&fill)?;
        risk.record_fill(&trade, ts);
        stats.record(trade.realized_pnl - trade.commission);
        self.publish(EventPayload::Fill(trade.clone()), ts);
        self.publish(
            EventPayload::Execution(ExecutionReport {
                order_id: order.id,
                symbol: order.symbol.clone(),
                status: "filled".into(),
                detail: None,
                timestamp: ts,
            }),
            ts,
        );
        Ok(trade)
    }

    /// Convert an approved signal into an entry order: market entries fill
    /// at the next bar's open, limit/stop entries rest with the order
    /// manager until a bar's range touches them.
    #[allow(clippy::too_many_arguments)]
    fn handle_signal(
        &self,
        signal: &Signal,
        bar: &Bar,
        orders: &mut OrderManager,
        risk: &RiskManager,
        stats: &TradeStats,
        realized_vol: Option<f64>,
        order_seq: &mut u64,
        states: &mut BTreeMap<String, SymbolState>,
        resting_brackets: &mut HashMap<Uuid, (Option<Decimal>, Option<Decimal>)>,
    ) -> Result<(), BacktestError> {
        let ts = bar.timestamp;
        let existing = orders.position(&signal.symbol);
        if let Some(position) = existing {
            // Same-direction signals while holding are ignored; opposite
            // signals flip through a single oversized order.
            if position.side.entry_side() == signal.side {
                return Ok(());
            }
        }
        let flip_quantity = existing.map(|p| p.quantity).unwrap_or(Decimal::ZERO);

        if matches!(
            signal.entry_type,
            OrderType::StopMarket | OrderType::StopLimit
        ) && signal.entry_trigger.is_none()
        {
            debug!(
                symbol = %signal.symbol,
                entry_type = ?signal.entry_type,
                "stop entry signal without a trigger price, skipped"
            );
            return Ok(());
        }

        let entry = signal.suggested_entry.unwrap_or(bar.close);
        let mut quantity = sizing::compute_size(
            &self.config.sizing,
            orders.equity(),
            entry,
            signal.suggested_stop,
            stats,
            realized_vol,
        );
        quantity += flip_quantity;
        if quantity <= Decimal::ZERO {
            return Ok(());
        }

        *order_seq += 1;
        let mut order = match signal.entry_type {
            OrderType::Market => Order::market(&signal.symbol, signal.side, quantity, ts),
            OrderType::Limit => Order::limit(&signal.symbol, signal.side, quantity, entry, ts),
            OrderType::TakeProfit => {
                Order::take_profit(&signal.symbol, signal.side, quantity, entry, ts)
            }
            OrderType::StopMarket => Order::stop_market(
                &signal.symbol,
                signal.side,
                quantity,
                signal.entry_trigger.unwrap_or(entry),
                ts,
            ),
            OrderType::StopLimit => Order::stop_limit(
                &signal.symbol,
                signal.side,
                quantity,
                entry,
                signal.entry_trigger.unwrap_or(entry),
                ts,
            ),
        };
        order.id = Uuid::from_u128(*order_seq as u128);

        let snapshot = orders.snapshot(ts);
        let outcome = risk.check_order(&order, bar.close, &snapshot, ts);
        for alert in &outcome.alerts {
            self.publish(EventPayload::RiskAlert(alert.clone()), ts);
        }
        if !outcome.approved {
            debug!(
                symbol = %signal.symbol,
                violations = ?outcome.violations,
                "order rejected by risk gate"
            );
            return Ok(());
        }

        orders.submit(order.clone(), ts)?;
        self.publish(EventPayload::Order(order.clone()), ts);
        if order.order_type == OrderType::Market {
            if let Some(state) = states.get_mut(&signal.symbol) {
                state.pending.push(PendingMarket {
                    order_id: order.id,
                    stop: signal.suggested_stop,
                    target: signal.suggested_target,
                });
            }
        } else {
            // Resting entries pick their brackets up when a bar fills them.
            resting_brackets.insert(
                order.id,
                (signal.suggested_stop, signal.suggested_target),
            );
        }
        Ok(())
    }
}

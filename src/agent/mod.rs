//! Autonomous Trading Agent
//!
//! Live/paper counterpart of the backtester's signal-to-order stage: polls an
//! external signal aggregator, sizes positions, gates orders through the
//! risk manager and forwards approved orders to an execution adapter.
//!
//! Everything observable is published on the event bus; the agent owns no
//! callbacks. The order manager remains the single writer of position state.

pub mod sizing;

pub use sizing::{SizingConfig, TradeStats};

use crate::bus::{
    BusEvent, CancelToken, EventBus, EventPayload, KillSwitchEvent,
};
use crate::errors::AgentError;
use crate::execution::{with_retries, ExecutionAdapter, RetryPolicy};
use crate::portfolio::{Fill, OrderManager};
use crate::risk::RiskManager;
use crate::types::{Order, OrderType, Side, Signal};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Aggregated multi-source signal for one symbol. The aggregator's internals
/// are outside the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedSignal {
    pub direction: Side,
    /// Aggregate conviction in [0, 1].
    pub confidence: f64,
    /// Fraction of sources agreeing on the direction, in [0, 1].
    pub consensus: f64,
    /// Requested entry order type. Market orders fill immediately at the
    /// venue; resting types are forwarded and wait for a price crossing.
    pub entry_type: OrderType,
    /// Trigger price for stop-market / stop-limit entries.
    pub entry_trigger: Option<Decimal>,
    pub suggested_entry: Option<Decimal>,
    pub suggested_stop: Option<Decimal>,
    pub suggested_target: Option<Decimal>,
}

/// External signal source consumed by the agent.
#[async_trait]
pub trait SignalAggregator: Send + Sync {
    async fn aggregated_signal(&self, symbol: &str) -> Result<AggregatedSignal, AgentError>;
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub symbols: Vec<String>,
    pub signal_poll_interval: Duration,
    pub min_confidence: f64,
    pub min_consensus: f64,
    pub sizing: SizingConfig,
    /// Kill-switch duration applied by an emergency stop, in hours.
    pub emergency_kill_hours: i64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            signal_poll_interval: Duration::from_secs(30),
            min_confidence: 0.6,
            min_consensus: 0.6,
            sizing: SizingConfig::default(),
            emergency_kill_hours: 24,
        }
    }
}

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Stopped,
    Running,
    Paused,
}

/// Point-in-time agent status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub state: AgentState,
    pub symbols: Vec<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub signals_received: u64,
    pub orders_submitted: u64,
    pub orders_rejected: u64,
    pub kill_switch_active: bool,
    pub equity: Decimal,
    pub open_positions: usize,
}

struct AgentShared {
    running: AtomicBool,
    paused: AtomicBool,
    signals_received: AtomicU64,
    orders_submitted: AtomicU64,
    orders_rejected: AtomicU64,
    last_poll: Mutex<Option<DateTime<Utc>>>,
    stats: Mutex<TradeStats>,
    cancel: Mutex<Option<CancelToken>>,
}

/// The autonomous agent.
pub struct TradingAgent {
    config: AgentConfig,
    risk: Arc<RiskManager>,
    orders: Arc<Mutex<OrderManager>>,
    executor: Arc<dyn ExecutionAdapter>,
    aggregator: Arc<dyn SignalAggregator>,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
    shared: Arc<AgentShared>,
}

impl TradingAgent {
    pub fn new(
        config: AgentConfig,
        risk: Arc<RiskManager>,
        orders: Arc<Mutex<OrderManager>>,
        executor: Arc<dyn ExecutionAdapter>,
        aggregator: Arc<dyn SignalAggregator>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            risk,
            orders,
            executor,
            aggregator,
            bus,
            retry: RetryPolicy::default(),
            shared: Arc::new(AgentShared {
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                signals_received: AtomicU64::new(0),
                orders_submitted: AtomicU64::new(0),
                orders_rejected: AtomicU64::new(0),
                last_poll: Mutex::new(None),
                stats: Mutex::new(TradeStats::default()),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// Start the polling loop. Returns None when already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let cancel = CancelToken::new();
        *self.shared.cancel.lock() = Some(cancel.clone());
        info!(symbols = ?self.config.symbols, "agent started");

        let agent = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(agent.config.signal_poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let now = Utc::now();
                if !agent.should_trade(now) {
                    continue;
                }
                if let Err(err) = agent.poll_once(now).await {
                    warn!(%err, "agent poll failed");
                }
            }
            agent.shared.running.store(false, Ordering::SeqCst);
            info!("agent stopped");
        }))
    }

    /// Stop the loop. Idempotent.
    pub fn stop(&self) {
        if let Some(cancel) = self.shared.cancel.lock().take() {
            cancel.cancel();
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        info!("agent paused");
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        info!("agent resumed");
    }

    /// All gates that must pass before the agent asks for signals.
    pub fn should_trade(&self, now: DateTime<Utc>) -> bool {
        if !self.shared.running.load(Ordering::SeqCst)
            || self.shared.paused.load(Ordering::SeqCst)
            || self.risk.is_halted(now)
        {
            return false;
        }
        match &self.risk.config().trading_hours {
            Some(hours) => hours.contains(now),
            None => true,
        }
    }

    pub fn status(&self) -> AgentStatus {
        let state = if !self.shared.running.load(Ordering::SeqCst) {
            AgentState::Stopped
        } else if self.shared.paused.load(Ordering::SeqCst) {
            AgentState::Paused
        } else {
            AgentState::Running
        };
        let orders = self.orders.lock();
        AgentStatus {
            state,
            symbols: self.config.symbols.clone(),
            last_poll_at: *self.shared.last_poll.lock(),
            signals_received: self.shared.signals_received.load(Ordering::Relaxed),
            orders_submitted: self.shared.orders_submitted.load(Ordering::Relaxed),
            orders_rejected: self.shared.orders_rejected.load(Ordering::Relaxed),
            kill_switch_active: self.risk.kill_switch().is_some(),
            equity: orders.equity(),
            open_positions: orders.open_position_count(),
        }
    }

    /// One polling pass over every configured symbol.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<(), AgentError> {
        *self.shared.last_poll.lock() = Some(now);
        for symbol in &self.config.symbols {
            match self.aggregator.aggregated_signal(symbol).await {
                Ok(aggregated) => {
                    self.shared.signals_received.fetch_add(1, Ordering::Relaxed);
                    if aggregated.confidence < self.config.min_confidence
                        || aggregated.consensus < self.config.min_consensus
                    {
                        continue;
                    }
                    if let Err(err) = self.act_on_signal(symbol, &aggregated, now).await {
                        warn!(%symbol, %err, "failed to act on signal");
                    }
                }
                Err(err) => warn!(%symbol, %err, "aggregator error"),
            }
        }
        Ok(())
    }

    async fn act_on_signal(
        &self,
        symbol: &str,
        aggregated: &AggregatedSignal,
        now: DateTime<Utc>,
    ) -> Result<(), AgentError> {
        let entry = match aggregated.suggested_entry {
            Some(entry) => entry,
            None => self.executor.get_ticker(symbol).await?.price,
        };

        // Publish the accepted signal for observers
        let mut signal = Signal::new(
            symbol,
            aggregated.direction,
            aggregated.confidence,
            "aggregated signal",
            now,
        )
        .with_entry(entry)
        .with_entry_type(aggregated.entry_type);
        if let Some(trigger) = aggregated.entry_trigger {
            signal = signal.with_entry_trigger(trigger);
        }
        if let Some(stop) = aggregated.suggested_stop {
            signal = signal.with_stop(stop);
        }
        if let Some(target) = aggregated.suggested_target {
            signal = signal.with_target(target);
        }
        signal.confidence = Some(aggregated.confidence);
        signal.consensus = Some(aggregated.consensus);
        let _ = self
            .bus
            .publish(BusEvent::new(EventPayload::Signal(signal.clone()), now));

        // Size and gate
        let (quantity, snapshot) = {
            let orders = self.orders.lock();
            let quantity = sizing::compute_size(
                &self.config.sizing,
                orders.equity(),
                entry,
                aggregated.suggested_stop,
                &self.shared.stats.lock(),
                None,
            );
            (quantity, orders.snapshot(now))
        };
        if quantity <= Decimal::ZERO {
            return Ok(());
        }

        let order = match aggregated.entry_type {
            OrderType::Market => Order::market(symbol, aggregated.direction, quantity, now),
            OrderType::Limit => Order::limit(symbol, aggregated.direction, quantity, entry, now),
            OrderType::TakeProfit => {
                Order::take_profit(symbol, aggregated.direction, quantity, entry, now)
            }
            OrderType::StopMarket | OrderType::StopLimit => {
                let Some(trigger) = aggregated.entry_trigger else {
                    warn!(%symbol, "stop entry signal without a trigger price, skipped");
                    return Ok(());
                };
                if aggregated.entry_type == OrderType::StopMarket {
                    Order::stop_market(symbol, aggregated.direction, quantity, trigger, now)
                } else {
                    Order::stop_limit(symbol, aggregated.direction, quantity, entry, trigger, now)
                }
            }
        };
        let outcome = self.risk.check_order(&order, entry, &snapshot, now);
        for alert in &outcome.alerts {
            let _ = self
                .bus
                .publish(BusEvent::new(EventPayload::RiskAlert(alert.clone()), now));
        }
        if !outcome.approved {
            self.shared.orders_rejected.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Execute with retry on transient errors
        let placed = with_retries(self.retry, || self.executor.place_order(order.clone())).await?;
        self.shared.orders_submitted.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .bus
            .publish(BusEvent::new(EventPayload::Order(placed.clone()), now));

        // Mirror any immediate fill into the portfolio
        if placed.filled_qty > Decimal::ZERO {
            let fill = Fill {
                order_id: placed.id,
                quantity: placed.filled_qty,
                price: placed.avg_fill_price,
                commission: placed.commission_accrued,
                slippage: (placed.avg_fill_price - entry).abs(),
                timestamp: now,
            };
            let trade = {
                let mut orders = self.orders.lock();
                orders.submit(order, now)?;
                let trade = orders.apply_fill(&fill)?;
                orders.set_bracket(
                    symbol,
                    aggregated.suggested_stop,
                    aggregated.suggested_target,
                );
                trade
            };
            self.risk.record_fill(&trade, now);
            self.shared.stats.lock().record(trade.realized_pnl - trade.commission);
            let _ = self
                .bus
                .publish(BusEvent::new(EventPayload::Fill(trade), now));
        } else {
            let mut orders = self.orders.lock();
            orders.submit(order, now)?;
        }
        Ok(())
    }

    /// Emergency stop: pause, trip the kill switch for the configured
    /// duration, cancel every open order and close every position at market.
    /// Idempotent; safe to invoke repeatedly.
    pub async fn emergency_stop(&self) -> Result<(), AgentError> {
        let now = Utc::now();
        warn!("emergency stop invoked");
        self.pause();

        let alert = self.risk.activate_kill_switch(
            "emergency stop",
            Some(ChronoDuration::hours(self.config.emergency_kill_hours)),
            now,
        );
        let _ = self
            .bus
            .publish(BusEvent::new(EventPayload::RiskAlert(alert), now));
        let _ = self.bus.publish(BusEvent::new(
            EventPayload::KillSwitch(KillSwitchEvent {
                active: true,
                reason: "emergency stop".into(),
                auto: false,
                expires_at: Some(now + ChronoDuration::hours(self.config.emergency_kill_hours)),
                timestamp: now,
            }),
            now,
        ));

        // Cancel open orders; adapter cancels are idempotent.
        let open_orders = { self.orders.lock().open_orders() };
        for order in open_orders {
            if let Err(err) = self.executor.cancel_order(order.id).await {
                warn!(order_id = %order.id, %err, "cancel failed during emergency stop");
            }
            let _ = self.orders.lock().cancel(order.id, now);
        }

        // Close positions at market, best effort.
        let positions: Vec<(String, Side, Decimal)> = {
            let orders = self.orders.lock();
            let mut positions: Vec<_> = orders
                .positions()
                .values()
                .map(|p| (p.symbol.clone(), p.side.exit_side(), p.quantity))
                .collect();
            positions.sort_by(|a, b| a.0.cmp(&b.0));
            positions
        };
        for (symbol, exit_side, quantity) in positions {
            let order = Order::market(&symbol, exit_side, quantity, now);
            match self.executor.place_order(order.clone()).await {
                Ok(placed) if placed.filled_qty > Decimal::ZERO => {
                    let fill = Fill {
                        order_id: placed.id,
                        quantity: placed.filled_qty,
                        price: placed.avg_fill_price,
                        commission: placed.commission_accrued,
                        slippage: Decimal::ZERO,
                        timestamp: now,
                    };
                    let mut orders = self.orders.lock();
                    if orders.submit(order, now).is_ok() {
                        if let Ok(trade) = orders.apply_fill(&fill) {
                            drop(orders);
                            self.risk.record_fill(&trade, now);
                            let _ = self
                                .bus
                                .publish(BusEvent::new(EventPayload::Fill(trade), now));
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%symbol, %err, "position close failed during emergency stop")
                }
            }
        }
        Ok(())
    }
}

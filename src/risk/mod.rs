//! Risk Management
//!
//! Pre-trade gate for every order plus the global kill switch. Checks run in
//! a fixed order and short-circuit on the first rejection; warnings never
//! block but are surfaced so callers can publish RiskAlert events.
//!
//! The risk manager only reads portfolio snapshots. It never mutates order
//! or position state and never calls back into its callers.

use crate::bus::events::{AlertSeverity, RiskAlert};
use crate::portfolio::PortfolioSnapshot;
use crate::types::{Order, Trade};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// The reasons an order can be rejected, in check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskViolationKind {
    KillSwitchActive,
    OutsideTradingHours,
    MaxOpenPositions,
    MaxPositionSize,
    MaxDailyLoss,
    MaxDrawdown,
    CorrelationLimit,
    MaxTradesPerDay,
}

impl std::fmt::Display for RiskViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskViolationKind::KillSwitchActive => "kill_switch_active",
            RiskViolationKind::OutsideTradingHours => "outside_trading_hours",
            RiskViolationKind::MaxOpenPositions => "max_open_positions",
            RiskViolationKind::MaxPositionSize => "max_position_size",
            RiskViolationKind::MaxDailyLoss => "max_daily_loss",
            RiskViolationKind::MaxDrawdown => "max_drawdown",
            RiskViolationKind::CorrelationLimit => "correlation_limit",
            RiskViolationKind::MaxTradesPerDay => "max_trades_per_day",
        };
        write!(f, "{s}")
    }
}

/// A failed or near-failed check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskViolation {
    pub kind: RiskViolationKind,
    pub detail: String,
}

/// Gate decision for one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCheckOutcome {
    pub approved: bool,
    pub violations: Vec<RiskViolation>,
    pub warnings: Vec<RiskViolation>,
    /// Alerts produced during the check (rejections, kill-switch trips and
    /// expirations). The caller publishes these on the bus.
    pub alerts: Vec<RiskAlert>,
}

impl RiskCheckOutcome {
    fn approved(warnings: Vec<RiskViolation>, alerts: Vec<RiskAlert>) -> Self {
        Self {
            approved: true,
            violations: Vec::new(),
            warnings,
            alerts,
        }
    }
}

/// Position-size ceiling, either relative to equity or absolute notional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionLimit {
    PortfolioFraction(Decimal),
    AbsoluteNotional(Decimal),
}

impl PositionLimit {
    fn ceiling(&self, equity: Decimal) -> Decimal {
        match self {
            PositionLimit::PortfolioFraction(fraction) => equity * fraction,
            PositionLimit::AbsoluteNotional(notional) => *notional,
        }
    }
}

/// Weekly trading schedule with an explicit UTC offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingHours {
    pub weekdays: HashSet<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Offset of the schedule's timezone from UTC, in minutes.
    pub utc_offset_minutes: i32,
}

impl TradingHours {
    /// 24/5 crypto-desk default: Monday through Friday, all day, UTC.
    pub fn weekdays_utc() -> Self {
        Self {
            weekdays: [
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ]
            .into_iter()
            .collect(),
            start: NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default(),
            end: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default(),
            utc_offset_minutes: 0,
        }
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now + Duration::minutes(self.utc_offset_minutes as i64);
        if !self.weekdays.contains(&local.weekday()) {
            return false;
        }
        let time = local.time();
        if self.start <= self.end {
            time >= self.start && time <= self.end
        } else {
            // Overnight session wraps midnight
            time >= self.start || time <= self.end
        }
    }
}

/// Risk limits applied by the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum loss per UTC day, in quote currency.
    pub max_daily_loss: Decimal,
    /// Maximum drawdown from the equity peak, as a fraction in (0, 1].
    pub max_drawdown: Decimal,
    pub max_position_size: PositionLimit,
    pub max_open_positions: usize,
    pub max_trades_per_day: u32,
    /// Maximum exposure per correlation group, as a fraction of equity.
    pub max_correlation_exposure: Decimal,
    /// Symbol to correlation-group assignments. Unassigned symbols form
    /// their own group.
    pub correlation_groups: HashMap<String, String>,
    pub trading_hours: Option<TradingHours>,
    /// Fraction of a limit at which a warning is raised.
    pub warn_fraction: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: dec!(500),
            max_drawdown: dec!(0.2),
            max_position_size: PositionLimit::PortfolioFraction(dec!(0.25)),
            max_open_positions: 5,
            max_trades_per_day: 100,
            max_correlation_exposure: dec!(0.5),
            correlation_groups: HashMap::new(),
            trading_hours: None,
            warn_fraction: dec!(0.8),
        }
    }
}

/// Active kill-switch record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitch {
    pub reason: String,
    /// True when tripped automatically by a risk check.
    pub auto: bool,
    pub activated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Rolling per-day risk state.
#[derive(Debug)]
struct RiskState {
    current_day: Option<NaiveDate>,
    day_start_equity: Decimal,
    daily_realized_pnl: Decimal,
    trades_today: u32,
    consecutive_losses: u32,
    peak_equity: Decimal,
    last_equity: Decimal,
    kill_switch: Option<KillSwitch>,
}

impl RiskState {
    fn new() -> Self {
        Self {
            current_day: None,
            day_start_equity: Decimal::ZERO,
            daily_realized_pnl: Decimal::ZERO,
            trades_today: 0,
            consecutive_losses: 0,
            peak_equity: Decimal::ZERO,
            last_equity: Decimal::ZERO,
            kill_switch: None,
        }
    }

    /// Worst of realized and mark-to-market daily loss (positive = loss).
    fn daily_loss(&self, equity: Decimal) -> Decimal {
        let realized_loss = -self.daily_realized_pnl;
        let mtm_loss = self.day_start_equity - equity;
        realized_loss.max(mtm_loss).max(Decimal::ZERO)
    }

    fn drawdown(&self, equity: Decimal) -> Decimal {
        if self.peak_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((self.peak_equity - equity) / self.peak_equity).clamp(Decimal::ZERO, Decimal::ONE)
    }
}

/// Point-in-time risk status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskStatus {
    pub kill_switch: Option<KillSwitch>,
    pub daily_realized_pnl: Decimal,
    pub daily_loss: Decimal,
    pub max_daily_loss: Decimal,
    pub trades_today: u32,
    pub max_trades_per_day: u32,
    pub drawdown: Decimal,
    pub max_drawdown: Decimal,
    pub consecutive_losses: u32,
    pub peak_equity: Decimal,
}

/// The risk gate.
pub struct RiskManager {
    config: RiskConfig,
    state: Mutex<RiskState>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RiskState::new()),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Gate an order. `reference_price` prices market orders that carry no
    /// limit price.
    pub fn check_order(
        &self,
        order: &Order,
        reference_price: Decimal,
        snapshot: &PortfolioSnapshot,
        now: DateTime<Utc>,
    ) -> RiskCheckOutcome {
        let mut state = self.state.lock();
        let mut alerts = Vec::new();
        self.roll_day(&mut state, now, snapshot.equity, &mut alerts);
        self.observe_equity(&mut state, snapshot.equity);

        let reject = |kind: RiskViolationKind, detail: String, mut alerts: Vec<RiskAlert>| {
            let alert = RiskAlert {
                severity: AlertSeverity::Critical,
                message: detail.clone(),
                violation: Some(kind),
                symbol: Some(order.symbol.clone()),
                timestamp: now,
            };
            alerts.push(alert);
            RiskCheckOutcome {
                approved: false,
                violations: vec![RiskViolation { kind, detail }],
                warnings: Vec::new(),
                alerts,
            }
        };

        // 1. Kill switch
        if let Some(expired) = Self::expire_kill_switch(&mut state, now) {
            alerts.push(expired);
        }
        if let Some(kill_switch) = &state.kill_switch {
            return reject(
                RiskViolationKind::KillSwitchActive,
                format!("kill switch active: {}", kill_switch.reason),
                alerts,
            );
        }

        // 2. Trading hours
        if let Some(hours) = &self.config.trading_hours {
            if !hours.contains(now) {
                return reject(
                    RiskViolationKind::OutsideTradingHours,
                    format!("{now} is outside the configured trading schedule"),
                    alerts,
                );
            }
        }

        // 3. Max open positions (only orders that would open a new symbol)
        let existing = snapshot.position(&order.symbol);
        if existing.is_none() && snapshot.positions.len() >= self.config.max_open_positions {
            return reject(
                RiskViolationKind::MaxOpenPositions,
                format!(
                    "{} open positions at limit {}",
                    snapshot.positions.len(),
                    self.config.max_open_positions
                ),
                alerts,
            );
        }

        // 4. Position size
        let order_notional = order.quantity * order.price.unwrap_or(reference_price);
        let increases_exposure = match existing {
            Some(position) => order.side == position.side.entry_side(),
            None => true,
        };
        if increases_exposure {
            let projected =
                existing.map(|p| p.notional()).unwrap_or(Decimal::ZERO) + order_notional;
            let ceiling = self.config.max_position_size.ceiling(snapshot.equity);
            if projected > ceiling {
                return reject(
                    RiskViolationKind::MaxPositionSize,
                    format!("projected notional {projected} exceeds limit {ceiling}"),
                    alerts,
                );
            }
        }

        // 5. Daily loss (after mark-to-market); breach trips the kill switch
        let daily_loss = state.daily_loss(snapshot.equity);
        if daily_loss >= self.config.max_daily_loss {
            let detail = format!(
                "daily loss {daily_loss} at limit {}",
                self.config.max_daily_loss
            );
            alerts.push(Self::trip(&mut state, &detail, now));
            return reject(RiskViolationKind::MaxDailyLoss, detail, alerts);
        }

        // 6. Drawdown; breach trips the kill switch
        let drawdown = state.drawdown(snapshot.equity);
        if drawdown >= self.config.max_drawdown {
            let detail = format!(
                "drawdown {drawdown} at limit {}",
                self.config.max_drawdown
            );
            alerts.push(Self::trip(&mut state, &detail, now));
            return reject(RiskViolationKind::MaxDrawdown, detail, alerts);
        }

        // 7. Correlation-group exposure
        if increases_exposure {
            let group = self.group_of(&order.symbol);
            let group_exposure: Decimal = snapshot
                .positions
                .values()
                .filter(|p| self.group_of(&p.symbol) == group)
                .map(|p| p.notional())
                .sum::<Decimal>()
                + order_notional;
            let ceiling = snapshot.equity * self.config.max_correlation_exposure;
            if group_exposure > ceiling {
                return reject(
                    RiskViolationKind::CorrelationLimit,
                    format!(
                        "group '{group}' exposure {group_exposure} exceeds limit {ceiling}"
                    ),
                    alerts,
                );
            }
        }

        // 8. Trades per day
        if state.trades_today >= self.config.max_trades_per_day {
            return reject(
                RiskViolationKind::MaxTradesPerDay,
                format!(
                    "{} trades today at limit {}",
                    state.trades_today, self.config.max_trades_per_day
                ),
                alerts,
            );
        }

        // Warnings: approaching the daily-loss or drawdown limits
        let mut warnings = Vec::new();
        if daily_loss >= self.config.max_daily_loss * self.config.warn_fraction {
            warnings.push(RiskViolation {
                kind: RiskViolationKind::MaxDailyLoss,
                detail: format!(
                    "daily loss {daily_loss} approaching limit {}",
                    self.config.max_daily_loss
                ),
            });
        }
        if drawdown >= self.config.max_drawdown * self.config.warn_fraction {
            warnings.push(RiskViolation {
                kind: RiskViolationKind::MaxDrawdown,
                detail: format!(
                    "drawdown {drawdown} approaching limit {}",
                    self.config.max_drawdown
                ),
            });
        }
        for warning in &warnings {
            alerts.push(RiskAlert {
                severity: AlertSeverity::Warning,
                message: warning.detail.clone(),
                violation: Some(warning.kind),
                symbol: Some(order.symbol.clone()),
                timestamp: now,
            });
        }
        RiskCheckOutcome::approved(warnings, alerts)
    }

    /// Feed a fill into the rolling counters.
    pub fn record_fill(&self, trade: &Trade, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        let mut alerts = Vec::new();
        let equity = state.last_equity;
        self.roll_day(&mut state, now, equity, &mut alerts);
        state.daily_realized_pnl += trade.realized_pnl;
        state.trades_today += 1;
        if trade.realized_pnl < Decimal::ZERO {
            state.consecutive_losses += 1;
        } else if trade.realized_pnl > Decimal::ZERO {
            state.consecutive_losses = 0;
        }
    }

    /// Track equity for drawdown and mark-to-market daily loss.
    pub fn mark_equity(&self, equity: Decimal, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        let mut alerts = Vec::new();
        self.roll_day(&mut state, now, equity, &mut alerts);
        self.observe_equity(&mut state, equity);
    }

    /// Manually activate the kill switch.
    pub fn activate_kill_switch(
        &self,
        reason: impl Into<String>,
        duration: Option<Duration>,
        now: DateTime<Utc>,
    ) -> RiskAlert {
        let reason = reason.into();
        let mut state = self.state.lock();
        state.kill_switch = Some(KillSwitch {
            reason: reason.clone(),
            auto: false,
            activated_at: now,
            expires_at: duration.map(|d| now + d),
        });
        warn!(%reason, "kill switch manually activated");
        RiskAlert {
            severity: AlertSeverity::Critical,
            message: format!("kill switch activated: {reason}"),
            violation: Some(RiskViolationKind::KillSwitchActive),
            symbol: None,
            timestamp: now,
        }
    }

    /// Explicitly deactivate the kill switch.
    pub fn deactivate_kill_switch(&self, now: DateTime<Utc>) -> RiskAlert {
        let mut state = self.state.lock();
        state.kill_switch = None;
        info!("kill switch deactivated");
        RiskAlert::info("kill switch deactivated", now)
    }

    pub fn kill_switch(&self) -> Option<KillSwitch> {
        self.state.lock().kill_switch.clone()
    }

    pub fn is_halted(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        Self::expire_kill_switch(&mut state, now);
        state.kill_switch.is_some()
    }

    pub fn status(&self) -> RiskStatus {
        let state = self.state.lock();
        RiskStatus {
            kill_switch: state.kill_switch.clone(),
            daily_realized_pnl: state.daily_realized_pnl,
            daily_loss: state.daily_loss(state.last_equity),
            max_daily_loss: self.config.max_daily_loss,
            trades_today: state.trades_today,
            max_trades_per_day: self.config.max_trades_per_day,
            drawdown: state.drawdown(state.last_equity),
            max_drawdown: self.config.max_drawdown,
            consecutive_losses: state.consecutive_losses,
            peak_equity: state.peak_equity,
        }
    }

    fn group_of<'a>(&'a self, symbol: &'a str) -> &'a str {
        self.config
            .correlation_groups
            .get(symbol)
            .map(String::as_str)
            .unwrap_or(symbol)
    }

    fn observe_equity(&self, state: &mut RiskState, equity: Decimal) {
        state.last_equity = equity;
        if equity > state.peak_equity {
            state.peak_equity = equity;
        }
    }

    /// Reset per-day counters on a fresh UTC day. Automatic kill switches
    /// clear with the day; manual ones follow their own expiry.
    fn roll_day(
        &self,
        state: &mut RiskState,
        now: DateTime<Utc>,
        equity: Decimal,
        alerts: &mut Vec<RiskAlert>,
    ) {
        let today = now.date_naive();
        if state.current_day == Some(today) {
            return;
        }
        state.current_day = Some(today);
        state.daily_realized_pnl = Decimal::ZERO;
        state.trades_today = 0;
        state.day_start_equity = equity;
        if state
            .kill_switch
            .as_ref()
            .map(|ks| ks.auto)
            .unwrap_or(false)
        {
            state.kill_switch = None;
            alerts.push(RiskAlert::info(
                "automatic kill switch cleared on new trading day",
                now,
            ));
        }
    }

    fn expire_kill_switch(state: &mut RiskState, now: DateTime<Utc>) -> Option<RiskAlert> {
        let expired = state
            .kill_switch
            .as_ref()
            .and_then(|ks| ks.expires_at)
            .map(|at| now >= at)
            .unwrap_or(false);
        if expired {
            state.kill_switch = None;
            // If the underlying breach persists, the next gated order
            // re-trips automatically.
            return Some(RiskAlert::info("kill switch expired", now));
        }
        None
    }

    fn trip(state: &mut RiskState, reason: &str, now: DateTime<Utc>) -> RiskAlert {
        warn!(%reason, "kill switch tripped automatically");
        state.kill_switch = Some(KillSwitch {
            reason: reason.to_string(),
            auto: true,
            activated_at: now,
            expires_at: None,
        });
        RiskAlert {
            severity: AlertSeverity::Critical,
            message: format!("kill switch tripped: {reason}"),
            violation: Some(RiskViolationKind::KillSwitchActive),
            symbol: None,
            timestamp: now,
        }
    }

    /// Periodic monitor: expires kill switches and publishes risk heartbeats.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        bus: Arc<crate::bus::EventBus>,
        interval: std::time::Duration,
        cancel: crate::bus::CancelToken,
    ) -> tokio::task::JoinHandle<()> {
        let risk = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let now = Utc::now();
                let expired = {
                    let mut state = risk.state.lock();
                    Self::expire_kill_switch(&mut state, now)
                };
                if let Some(alert) = expired {
                    let _ = bus.publish(crate::bus::BusEvent::new(
                        crate::bus::EventPayload::RiskAlert(alert),
                        now,
                    ));
                }
                let status = risk.status();
                let mut details = std::collections::BTreeMap::new();
                details.insert("daily_loss".into(), status.daily_loss.to_string());
                details.insert("drawdown".into(), status.drawdown.to_string());
                details.insert("trades_today".into(), status.trades_today.to_string());
                details.insert(
                    "kill_switch".into(),
                    status.kill_switch.is_some().to_string(),
                );
                let _ = bus.publish(crate::bus::BusEvent::new(
                    crate::bus::EventPayload::Heartbeat(crate::bus::HeartbeatEvent {
                        component: "risk_manager".into(),
                        timestamp: now,
                        details,
                    }),
                    now,
                ));
            }
        })
    }
}

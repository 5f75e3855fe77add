//! Event Model
//!
//! Tagged event variants carried by the bus. Every event has a unique id, a
//! type tag for subscription matching, a timestamp and a priority used as a
//! tie-break when consumers order events (lower = earlier).
//!
//! Events are ephemeral: created by a publisher, delivered at most once to
//! each matching subscription, garbage after fanout. Handlers must not retain
//! them beyond the call.

use crate::risk::RiskViolationKind;
use crate::types::{Bar, Order, Position, Signal, Tick, Trade};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Type tag used for subscription matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Bar,
    Tick,
    Signal,
    Order,
    Execution,
    Fill,
    RiskAlert,
    KillSwitch,
    Heartbeat,
    Position,
    Balance,
    Pnl,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Bar => "bar",
            EventType::Tick => "tick",
            EventType::Signal => "signal",
            EventType::Order => "order",
            EventType::Execution => "execution",
            EventType::Fill => "fill",
            EventType::RiskAlert => "risk_alert",
            EventType::KillSwitch => "kill_switch",
            EventType::Heartbeat => "heartbeat",
            EventType::Position => "position",
            EventType::Balance => "balance",
            EventType::Pnl => "pnl",
        };
        write!(f, "{s}")
    }
}

/// Alert severity. Warnings do not block orders; critical alerts accompany
/// rejections and kill-switch trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Risk alert payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAlert {
    pub severity: AlertSeverity,
    pub message: String,
    pub violation: Option<RiskViolationKind>,
    pub symbol: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RiskAlert {
    pub fn info(message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            severity: AlertSeverity::Info,
            message: message.into(),
            violation: None,
            symbol: None,
            timestamp,
        }
    }

    pub fn warning(message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            severity: AlertSeverity::Warning,
            message: message.into(),
            violation: None,
            symbol: None,
            timestamp,
        }
    }

    pub fn critical(
        violation: RiskViolationKind,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            severity: AlertSeverity::Critical,
            message: message.into(),
            violation: Some(violation),
            symbol: None,
            timestamp,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }
}

/// Execution status report from an adapter or the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order_id: Uuid,
    pub symbol: String,
    pub status: String,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Kill-switch state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchEvent {
    pub active: bool,
    pub reason: String,
    /// True when tripped automatically by a risk check.
    pub auto: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

/// Liveness heartbeat, optionally carrying component stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub component: String,
    pub timestamp: DateTime<Utc>,
    pub details: BTreeMap<String, String>,
}

/// Balance update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub asset: String,
    pub total: Decimal,
    pub available: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Portfolio P&L update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlUpdate {
    pub symbol: Option<String>,
    pub realized: Decimal,
    pub unrealized: Decimal,
    pub equity: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Tagged event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "data")]
pub enum EventPayload {
    Bar(Bar),
    Tick(Tick),
    Signal(Signal),
    Order(Order),
    Execution(ExecutionReport),
    Fill(Trade),
    RiskAlert(RiskAlert),
    KillSwitch(KillSwitchEvent),
    Heartbeat(HeartbeatEvent),
    Position(Position),
    Balance(BalanceUpdate),
    Pnl(PnlUpdate),
}

impl EventPayload {
    /// Type tag for subscription matching.
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::Bar(_) => EventType::Bar,
            EventPayload::Tick(_) => EventType::Tick,
            EventPayload::Signal(_) => EventType::Signal,
            EventPayload::Order(_) => EventType::Order,
            EventPayload::Execution(_) => EventType::Execution,
            EventPayload::Fill(_) => EventType::Fill,
            EventPayload::RiskAlert(_) => EventType::RiskAlert,
            EventPayload::KillSwitch(_) => EventType::KillSwitch,
            EventPayload::Heartbeat(_) => EventType::Heartbeat,
            EventPayload::Position(_) => EventType::Position,
            EventPayload::Balance(_) => EventType::Balance,
            EventPayload::Pnl(_) => EventType::Pnl,
        }
    }

    /// Symbol this event refers to, when it is symbol-specific.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            EventPayload::Bar(bar) => Some(&bar.symbol),
            EventPayload::Tick(tick) => Some(&tick.symbol),
            EventPayload::Signal(signal) => Some(&signal.symbol),
            EventPayload::Order(order) => Some(&order.symbol),
            EventPayload::Execution(report) => Some(&report.symbol),
            EventPayload::Fill(trade) => Some(&trade.symbol),
            EventPayload::RiskAlert(alert) => alert.symbol.as_deref(),
            EventPayload::Position(position) => Some(&position.symbol),
            EventPayload::Pnl(pnl) => pnl.symbol.as_deref(),
            EventPayload::KillSwitch(_)
            | EventPayload::Heartbeat(_)
            | EventPayload::Balance(_) => None,
        }
    }

    /// Default priority class (lower = earlier tie-break).
    fn default_priority(&self) -> u8 {
        match self {
            EventPayload::KillSwitch(_) => 0,
            EventPayload::RiskAlert(_) => 1,
            EventPayload::Bar(_) | EventPayload::Tick(_) => 2,
            EventPayload::Order(_) | EventPayload::Execution(_) | EventPayload::Fill(_) => 3,
            EventPayload::Signal(_) => 4,
            EventPayload::Position(_) | EventPayload::Balance(_) | EventPayload::Pnl(_) => 5,
            EventPayload::Heartbeat(_) => 9,
        }
    }
}

/// An event as published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Tie-break priority when consumers order events at the same timestamp.
    pub priority: u8,
    pub payload: EventPayload,
}

impl BusEvent {
    pub fn new(payload: EventPayload, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            priority: payload.default_priority(),
            payload,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    #[inline]
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

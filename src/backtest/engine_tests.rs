//! Engine scenario tests: determinism, the next-bar fill rule, bracket
//! exits, risk integration and accounting invariants over a full run.

use crate::backtest::engine::BacktestEngine;
use crate::backtest::{BacktestConfig, ValidationConfig};
use crate::bus::CancelToken;
use crate::errors::{BacktestError, StrategyError};
use crate::num;
use crate::risk::{PositionLimit, RiskConfig};
use crate::slippage::SlippageSpec;
use crate::agent::sizing::SizingConfig;
use crate::strategy::{
    ParameterSpec, ParameterValue, Strategy, StrategyContext, StrategyRegistry,
};
use crate::types::{Bar, OrderType, Side, Signal};
use crate::validation::monte_carlo::MonteCarloConfig;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
}

/// Deterministic synthetic hourly series: a slow drift plus two overlaid
/// cycles, volume pulsing with the faster cycle.
fn synthetic_bars(symbol: &str, count: usize) -> Vec<Bar> {
    let mut bars = Vec::with_capacity(count);
    let mut price = 100.0f64;
    for i in 0..count {
        let cycle = (i as f64 / 24.0).sin() * 2.5 + (i as f64 / 7.0).sin() * 1.0;
        let drift = i as f64 * 0.01;
        let close = 100.0 + drift + cycle;
        let open = price;
        let high = open.max(close) * 1.004;
        let low = open.min(close) * 0.996;
        let volume = 1000.0 + ((i as f64 / 7.0).sin().abs() * 900.0);
        bars.push(Bar {
            symbol: symbol.to_string(),
            open: num::from_f64(open).unwrap(),
            high: num::from_f64(high).unwrap(),
            low: num::from_f64(low).unwrap(),
            close: num::from_f64(close).unwrap(),
            volume: num::from_f64(volume).unwrap(),
            timestamp: t0() + Duration::hours(i as i64 + 1),
        });
        price = close;
    }
    bars
}

fn momentum_config(bars: usize) -> BacktestConfig {
    let mut config = BacktestConfig::new(
        t0(),
        t0() + Duration::hours(bars as i64 + 1),
        vec!["SOL/USDT".to_string()],
        "momentum",
    );
    config.timeframe = "1h".to_string();
    config
        .strategy_params
        .insert("period".to_string(), ParameterValue::Int(14));
    config
        .strategy_params
        .insert("threshold".to_string(), ParameterValue::Float(0.02));
    config
        .strategy_params
        .insert("bracket_pct".to_string(), ParameterValue::Float(0.03));
    config.sizing = SizingConfig::PercentRisk {
        percent: dec!(0.01),
    };
    config.risk = RiskConfig {
        max_position_size: PositionLimit::PortfolioFraction(dec!(0.5)),
        ..Default::default()
    };
    config
}

/// Test strategy that fires exactly one signal at a chosen bar index.
struct Pulse {
    fire_at: usize,
    side: Side,
    entry_type: OrderType,
    entry_price: Option<Decimal>,
    trigger: Option<Decimal>,
    stop: Option<Decimal>,
    target: Option<Decimal>,
    seen: usize,
}

impl Pulse {
    /// Market-entry pulse.
    fn registry(
        fire_at: usize,
        side: Side,
        stop: Option<Decimal>,
        target: Option<Decimal>,
    ) -> StrategyRegistry {
        Self::build_registry(fire_at, side, OrderType::Market, None, None, stop, target)
    }

    /// Resting-entry pulse (limit/stop/stop-limit).
    fn resting_registry(
        fire_at: usize,
        side: Side,
        entry_type: OrderType,
        entry_price: Option<Decimal>,
        trigger: Option<Decimal>,
        stop: Option<Decimal>,
    ) -> StrategyRegistry {
        Self::build_registry(fire_at, side, entry_type, entry_price, trigger, stop, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_registry(
        fire_at: usize,
        side: Side,
        entry_type: OrderType,
        entry_price: Option<Decimal>,
        trigger: Option<Decimal>,
        stop: Option<Decimal>,
        target: Option<Decimal>,
    ) -> StrategyRegistry {
        let mut registry = StrategyRegistry::empty();
        registry.register("pulse", move || {
            Box::new(Pulse {
                fire_at,
                side,
                entry_type,
                entry_price,
                trigger,
                stop,
                target,
                seen: 0,
            })
        });
        registry
    }
}

impl Strategy for Pulse {
    fn name(&self) -> &str {
        "pulse"
    }

    fn description(&self) -> &str {
        "fires one signal at a fixed bar index"
    }

    fn parameters(&self) -> BTreeMap<String, ParameterSpec> {
        BTreeMap::new()
    }

    fn set_parameter(&mut self, name: &str, _value: ParameterValue) -> Result<(), StrategyError> {
        Err(StrategyError::UnknownParameter(name.to_string()))
    }

    fn initialize(&mut self, _ctx: &StrategyContext) {
        self.seen = 0;
    }

    fn on_bar(&mut self, bar: &Bar) -> Option<Signal> {
        self.seen += 1;
        if self.seen != self.fire_at {
            return None;
        }
        let mut signal = Signal::new(&bar.symbol, self.side, 1.0, "pulse", bar.timestamp)
            .with_entry(self.entry_price.unwrap_or(bar.close))
            .with_entry_type(self.entry_type);
        if let Some(trigger) = self.trigger {
            signal = signal.with_entry_trigger(trigger);
        }
        if let Some(stop) = self.stop {
            signal = signal.with_stop(stop);
        }
        if let Some(target) = self.target {
            signal = signal.with_target(target);
        }
        Some(signal)
    }

    fn reset(&mut self) {
        self.seen = 0;
    }
}

fn pulse_config(bars: usize) -> BacktestConfig {
    let mut config = BacktestConfig::new(
        t0(),
        t0() + Duration::hours(bars as i64 + 1),
        vec!["SOL/USDT".to_string()],
        "pulse",
    );
    config.timeframe = "1h".to_string();
    config.slippage = SlippageSpec::Fixed { bps: dec!(10) };
    config.commission_bps = dec!(10);
    config.sizing = SizingConfig::Fixed { size: dec!(5) };
    config
}

// ---------------------------------------------------------------------------
// Determinism
// ---------------------------------------------------------------------------

#[test]
fn test_identical_inputs_are_bitwise_reproducible() {
    let bars = synthetic_bars("SOL/USDT", 744);
    let config = momentum_config(744);

    let a = BacktestEngine::new(config.clone()).run(&bars).unwrap();
    let b = BacktestEngine::new(config).run(&bars).unwrap();

    assert!(!a.trades.is_empty(), "synthetic series should trade");
    assert_eq!(a.trades, b.trades);
    assert_eq!(a.equity_curve, b.equity_curve);
    assert_eq!(a.equity_fingerprint, b.equity_fingerprint);
    // Metrics serialize identically, including float fields
    assert_eq!(
        serde_json::to_string(&a.metrics).unwrap(),
        serde_json::to_string(&b.metrics).unwrap()
    );
}

#[test]
fn test_monte_carlo_attachment_is_deterministic() {
    let bars = synthetic_bars("SOL/USDT", 744);
    let mut config = momentum_config(744);
    config.validation = Some(ValidationConfig {
        monte_carlo: Some(MonteCarloConfig {
            num_simulations: 200,
            ..Default::default()
        }),
    });

    let a = BacktestEngine::new(config.clone()).run(&bars).unwrap();
    let b = BacktestEngine::new(config).run(&bars).unwrap();
    let mc_a = a.monte_carlo.expect("monte carlo configured");
    let mc_b = b.monte_carlo.expect("monte carlo configured");
    assert_eq!(mc_a.final_equity.mean, mc_b.final_equity.mean);
    assert_eq!(mc_a.prob_ruin, mc_b.prob_ruin);
}

// ---------------------------------------------------------------------------
// Next-bar fill rule
// ---------------------------------------------------------------------------

#[test]
fn test_market_order_fills_at_next_bar_open() {
    let bars = synthetic_bars("SOL/USDT", 10);
    let config = pulse_config(10);
    let registry = Pulse::registry(3, Side::Buy, None, None);

    let report = BacktestEngine::new(config)
        .with_registry(registry)
        .run(&bars)
        .unwrap();

    assert_eq!(report.trades.len(), 1);
    let trade = &report.trades[0];
    // Signal at bar 3 (index 2): the fill happens on bar 4 (index 3), at its
    // open adjusted by 10 bps of slippage. Filling at bar 3's close would be
    // look-ahead bias.
    let next_open = bars[3].open;
    let expected = next_open + num::apply_bps(next_open, dec!(10));
    assert_eq!(trade.executed_at, bars[3].timestamp);
    assert_eq!(trade.price, expected);
    assert_ne!(trade.price, bars[2].close);
}

#[test]
fn test_sell_slippage_is_adverse() {
    let bars = synthetic_bars("SOL/USDT", 10);
    let config = pulse_config(10);
    let registry = Pulse::registry(3, Side::Sell, None, None);
    let report = BacktestEngine::new(config)
        .with_registry(registry)
        .run(&bars)
        .unwrap();

    let trade = &report.trades[0];
    let next_open = bars[3].open;
    assert_eq!(trade.price, next_open - num::apply_bps(next_open, dec!(10)));
}

// ---------------------------------------------------------------------------
// Resting limit/stop entries
// ---------------------------------------------------------------------------

/// Flat synthetic series: every bar opens and closes at 100 with a [99, 101]
/// range, so tests can carve the exact touches they need.
fn flat_bars(count: usize) -> Vec<Bar> {
    let mut bars = synthetic_bars("SOL/USDT", count);
    for bar in bars.iter_mut() {
        bar.open = dec!(100);
        bar.high = dec!(101);
        bar.low = dec!(99);
        bar.close = dec!(100);
    }
    bars
}

#[test]
fn test_limit_entry_rests_until_range_touches() {
    let mut bars = flat_bars(10);
    // Only bar 6 dips to the limit price
    bars[6].low = dec!(96);
    bars[6].close = dec!(98);

    let config = pulse_config(10);
    let registry =
        Pulse::resting_registry(3, Side::Buy, OrderType::Limit, Some(dec!(97)), None, None);
    let report = BacktestEngine::new(config)
        .with_registry(registry)
        .run(&bars)
        .unwrap();

    assert_eq!(report.trades.len(), 1);
    let trade = &report.trades[0];
    // The order rests from bar 3's close through bars 4-5 (low 99 > 97) and
    // fills when bar 6's range crosses the limit, at the limit adjusted by
    // slippage.
    assert_eq!(trade.executed_at, bars[6].timestamp);
    assert_eq!(trade.price, dec!(97) + num::apply_bps(dec!(97), dec!(10)));
}

#[test]
fn test_stop_market_entry_triggers_on_breakout() {
    let mut bars = flat_bars(10);
    bars[6].high = dec!(106);
    bars[6].close = dec!(104);

    let config = pulse_config(10);
    let registry = Pulse::resting_registry(
        3,
        Side::Buy,
        OrderType::StopMarket,
        None,
        Some(dec!(105)),
        None,
    );
    let report = BacktestEngine::new(config)
        .with_registry(registry)
        .run(&bars)
        .unwrap();

    assert_eq!(report.trades.len(), 1);
    let trade = &report.trades[0];
    assert_eq!(trade.executed_at, bars[6].timestamp);
    assert_eq!(trade.price, dec!(105) + num::apply_bps(dec!(105), dec!(10)));
}

#[test]
fn test_stop_limit_entry_arms_then_fills_on_later_bar() {
    let mut bars = flat_bars(10);
    // Bar 6 hits the stop trigger; the limit condition is only eligible from
    // the next bar on.
    bars[6].high = dec!(106);
    bars[6].close = dec!(105);
    bars[7].open = dec!(104);
    bars[7].high = dec!(105);
    bars[7].low = dec!(102);
    bars[7].close = dec!(103);

    let config = pulse_config(10);
    let registry = Pulse::resting_registry(
        3,
        Side::Buy,
        OrderType::StopLimit,
        Some(dec!(104)),
        Some(dec!(105)),
        None,
    );
    let report = BacktestEngine::new(config)
        .with_registry(registry)
        .run(&bars)
        .unwrap();

    assert_eq!(report.trades.len(), 1);
    let trade = &report.trades[0];
    // Not the arming bar: the fill lands on bar 7, at the limit price.
    assert_eq!(trade.executed_at, bars[7].timestamp);
    assert_eq!(trade.price, dec!(104) + num::apply_bps(dec!(104), dec!(10)));
}

#[test]
fn test_resting_entry_carries_brackets() {
    let mut bars = flat_bars(12);
    bars[6].low = dec!(96);
    bars[6].close = dec!(98);
    // After the limit fill at 97, bar 9 breaks the attached stop at 92
    bars[9].low = dec!(91);
    bars[9].close = dec!(93);

    let config = pulse_config(12);
    let registry = Pulse::resting_registry(
        3,
        Side::Buy,
        OrderType::Limit,
        Some(dec!(97)),
        None,
        Some(dec!(92)),
    );
    let report = BacktestEngine::new(config)
        .with_registry(registry)
        .run(&bars)
        .unwrap();

    assert_eq!(report.trades.len(), 2, "limit entry plus stop exit");
    let exit = &report.trades[1];
    assert_eq!(exit.side, Side::Sell);
    assert_eq!(exit.executed_at, bars[9].timestamp);
    assert_eq!(exit.price, dec!(92) - num::apply_bps(dec!(92), dec!(10)));
    assert!(exit.realized_pnl < Decimal::ZERO);
}

// ---------------------------------------------------------------------------
// Bracket exits
// ---------------------------------------------------------------------------

#[test]
fn test_stop_loss_exit_fires_on_touch() {
    // Flat opens, then a deep dip below the stop at bar 6
    let mut bars = flat_bars(10);
    bars[6].low = dec!(90);
    bars[6].close = dec!(91);

    let config = pulse_config(10);
    let registry = Pulse::registry(3, Side::Buy, Some(dec!(95)), None);
    let report = BacktestEngine::new(config)
        .with_registry(registry)
        .run(&bars)
        .unwrap();

    assert_eq!(report.trades.len(), 2, "entry plus stop exit");
    let exit = &report.trades[1];
    assert_eq!(exit.side, Side::Sell);
    assert_eq!(exit.executed_at, bars[6].timestamp);
    // Exit at the stop level minus slippage
    assert_eq!(exit.price, dec!(95) - num::apply_bps(dec!(95), dec!(10)));
    assert!(exit.realized_pnl < Decimal::ZERO);
}

#[test]
fn test_take_profit_exit() {
    let mut bars = flat_bars(10);
    bars[7].high = dec!(112);
    bars[7].close = dec!(111);

    let config = pulse_config(10);
    let registry = Pulse::registry(3, Side::Buy, Some(dec!(80)), Some(dec!(110)));
    let report = BacktestEngine::new(config)
        .with_registry(registry)
        .run(&bars)
        .unwrap();

    assert_eq!(report.trades.len(), 2);
    let exit = &report.trades[1];
    assert_eq!(exit.executed_at, bars[7].timestamp);
    assert!(exit.realized_pnl > Decimal::ZERO);
}

// ---------------------------------------------------------------------------
// Accounting invariants
// ---------------------------------------------------------------------------

#[test]
fn test_equity_curve_invariants_hold_over_full_run() {
    let bars = synthetic_bars("SOL/USDT", 744);
    let report = BacktestEngine::new(momentum_config(744)).run(&bars).unwrap();

    assert!(!report.equity_curve.is_empty());
    let mut prev_ts = None;
    for point in &report.equity_curve {
        // Strictly increasing timestamps
        if let Some(prev) = prev_ts {
            assert!(point.timestamp > prev);
        }
        prev_ts = Some(point.timestamp);
        // Drawdown in [0, 1]
        assert!(point.drawdown >= Decimal::ZERO && point.drawdown <= Decimal::ONE);
    }
    // Fill quantities never exceed order quantity: every trade came from a
    // fill the order manager accepted, so just sanity-check totals.
    for trade in &report.trades {
        assert!(trade.quantity > Decimal::ZERO);
        assert!(trade.price > Decimal::ZERO);
    }
}

#[test]
fn test_commission_matches_configured_bps() {
    let bars = synthetic_bars("SOL/USDT", 10);
    let config = pulse_config(10);
    let registry = Pulse::registry(3, Side::Buy, None, None);
    let report = BacktestEngine::new(config)
        .with_registry(registry)
        .run(&bars)
        .unwrap();

    let trade = &report.trades[0];
    let expected = num::apply_bps(trade.quantity * trade.price, dec!(10));
    assert_eq!(trade.commission, expected);
}

// ---------------------------------------------------------------------------
// Risk integration
// ---------------------------------------------------------------------------

#[test]
fn test_risk_gate_blocks_oversized_entries() {
    let bars = synthetic_bars("SOL/USDT", 744);
    let mut config = momentum_config(744);
    config.risk = RiskConfig {
        // A ceiling no order can satisfy
        max_position_size: PositionLimit::AbsoluteNotional(dec!(0.01)),
        ..Default::default()
    };
    let report = BacktestEngine::new(config).run(&bars).unwrap();
    assert!(report.trades.is_empty());
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

#[test]
fn test_pre_cancelled_run_aborts() {
    let bars = synthetic_bars("SOL/USDT", 100);
    let cancel = CancelToken::new();
    cancel.cancel();
    let result = BacktestEngine::new(momentum_config(100))
        .with_cancel_token(cancel)
        .run(&bars);
    assert!(matches!(result, Err(BacktestError::Cancelled)));
}

#[test]
fn test_empty_window_is_config_error() {
    let bars = synthetic_bars("SOL/USDT", 10);
    let mut config = momentum_config(10);
    config.symbols = vec!["ETH/USDT".to_string()];
    assert!(BacktestEngine::new(config).run(&bars).is_err());
}

#[test]
fn test_progress_reports_flow() {
    use parking_lot::Mutex;
    use std::sync::Arc;

    let bars = synthetic_bars("SOL/USDT", 744);
    let updates = Arc::new(Mutex::new(Vec::new()));
    let mut engine = BacktestEngine::new(momentum_config(744));
    {
        let updates = Arc::clone(&updates);
        engine = engine.with_progress(Box::new(move |update| {
            updates.lock().push(update.clone());
        }));
    }
    // Throttled by wall time: a fast run may emit zero updates, which is
    // valid; force at least one by shrinking the interval.
    engine.set_progress_interval(std::time::Duration::ZERO);
    let report = engine.run(&bars).unwrap();

    let updates = updates.lock();
    assert!(!updates.is_empty());
    let last = updates.last().unwrap();
    assert_eq!(last.total_events, report.events_processed);
    assert!(last.events_processed <= last.total_events);
}

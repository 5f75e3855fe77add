//! End-to-end integration: the run registry driving real backtests, event
//! fanout to bus observers, and walk-forward validation over live engine
//! evaluations.

use chrono::{DateTime, Duration, TimeZone, Utc};
use quantbot_core::agent::sizing::SizingConfig;
use quantbot_core::backtest::{BacktestConfig, RunRegistry, RunState};
use quantbot_core::bus::{EventBus, EventBusConfig, EventType, SubscribeOptions};
use quantbot_core::num;
use quantbot_core::risk::{PositionLimit, RiskConfig};
use quantbot_core::strategy::ParameterValue;
use quantbot_core::types::Bar;
use quantbot_core::validation::walk_forward::BacktestWindowEvaluator;
use quantbot_core::validation::{
    GridOptimizer, ParameterRange, ParameterSpace, WalkForwardConfig, WalkForwardHarness,
    WalkForwardMode,
};
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
}

fn synthetic_bars(symbol: &str, count: usize) -> Vec<Bar> {
    let mut bars = Vec::with_capacity(count);
    let mut price = 100.0f64;
    for i in 0..count {
        let close = 100.0 + i as f64 * 0.01 + (i as f64 / 24.0).sin() * 2.5
            + (i as f64 / 7.0).sin();
        let open = price;
        bars.push(Bar {
            symbol: symbol.to_string(),
            open: num::from_f64(open).unwrap(),
            high: num::from_f64(open.max(close) * 1.004).unwrap(),
            low: num::from_f64(open.min(close) * 0.996).unwrap(),
            close: num::from_f64(close).unwrap(),
            volume: dec!(1000),
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

async fn wait_for_terminal(registry: &RunRegistry, id: uuid::Uuid) -> RunState {
    for _ in 0..600 {
        if let Some(status) = registry.status(id) {
            match status.state {
                RunState::Pending | RunState::Running => {}
                terminal => return terminal,
            }
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    panic!("run {id} never reached a terminal state");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_registry_lifecycle() {
    let registry = RunRegistry::new();
    let bars = synthetic_bars("SOL/USDT", 744);
    let id = registry.start(momentum_config(744), bars);

    let state = wait_for_terminal(&registry, id).await;
    assert_eq!(state, RunState::Completed);

    let status = registry.status(id).unwrap();
    assert_eq!(status.progress_pct, 100.0);
    assert_eq!(status.events_processed, 744);
    assert!(status.error.is_none());

    let report = registry.result(id).expect("completed run has a report");
    assert_eq!(report.events_processed, 744);
    assert_eq!(
        registry.trades(id).unwrap().len(),
        report.trades.len()
    );
    // Unknown runs are absent, not errors
    assert!(registry.status(uuid::Uuid::new_v4()).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_cancellation() {
    let registry = RunRegistry::new();
    // A large feed so cancellation lands while the run is still going
    let bars = synthetic_bars("SOL/USDT", 200_000);
    let id = registry.start(momentum_config(200_000), bars);
    assert!(registry.cancel(id));

    let state = wait_for_terminal(&registry, id).await;
    assert!(
        state == RunState::Cancelled || state == RunState::Completed,
        "cancel must terminate the run, got {state:?}"
    );
    if state == RunState::Cancelled {
        assert!(registry.result(id).is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bus_observers_see_run_events() {
    let bus = Arc::new(EventBus::new(EventBusConfig {
        num_workers: 4,
        ..Default::default()
    }));
    bus.start();

    let bar_events = Arc::new(AtomicUsize::new(0));
    {
        let bar_events = Arc::clone(&bar_events);
        bus.subscribe(
            EventType::Bar,
            Arc::new(move |_| {
                bar_events.fetch_add(1, Ordering::SeqCst);
            }),
            SubscribeOptions::default(),
        );
    }

    let registry = RunRegistry::new().with_bus(Arc::clone(&bus));
    let bars = synthetic_bars("SOL/USDT", 300);
    let id = registry.start(momentum_config(300), bars);
    let state = wait_for_terminal(&registry, id).await;
    assert_eq!(state, RunState::Completed);

    // Let the workers drain, then verify fanout accounting
    for _ in 0..200 {
        if bus.stats().in_flight == 0 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    let stats = bus.stats();
    assert_eq!(
        stats.events_published,
        stats.events_processed + stats.events_dropped + stats.in_flight
    );
    assert_eq!(stats.processing_errors, 0);
    assert_eq!(bar_events.load(Ordering::SeqCst) as u64, 300);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_walk_forward_over_real_backtests() {
    let bars = Arc::new(synthetic_bars("SOL/USDT", 744));
    let evaluator = BacktestWindowEvaluator {
        base_config: momentum_config(744),
        bars: Arc::clone(&bars),
    };
    let space = ParameterSpace::new()
        .with(
            "period",
            ParameterRange::Int {
                min: 10,
                max: 20,
                step: 5,
            },
        )
        .with("threshold", ParameterRange::Float { min: 0.01, max: 0.03 });

    let harness = WalkForwardHarness::new(WalkForwardConfig {
        folds: 3,
        in_sample_pct: 0.7,
        mode: WalkForwardMode::Rolling,
    });
    let optimizer = GridOptimizer {
        float_samples: 3,
        ..Default::default()
    };
    let report = tokio::task::spawn_blocking(move || {
        harness.run(
            t0(),
            t0() + Duration::hours(745),
            &space,
            &optimizer,
            &evaluator,
        )
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(report.folds.len(), 3);
    for fold in &report.folds {
        // No temporal leak between fit and evaluation windows
        assert!(fold.window.in_sample_end <= fold.window.out_sample_start);
        assert!(fold.best_params.contains_key("period"));
        assert!(fold.best_params.contains_key("threshold"));
    }
}

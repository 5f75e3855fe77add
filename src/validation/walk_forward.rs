//! Walk-Forward Harness
//!
//! Splits a date span into K folds, optimizes parameters on each in-sample
//! window and evaluates them on the strictly-later out-of-sample window.
//! The evaluator is handed hard window bounds per fold, so the optimizer can
//! never see out-of-sample data.

use crate::backtest::engine::BacktestEngine;
use crate::backtest::BacktestConfig;
use crate::errors::{ConfigError, ValidationError};
use crate::types::Bar;
use crate::validation::optimizer::{Objective, OptimizationResult, Optimizer, ParamSet, ParameterSpace};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Window layout across folds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkForwardMode {
    /// Both windows slide forward one fold at a time.
    Rolling,
    /// In-sample anchors at the span start and expands each fold.
    Anchored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    pub folds: usize,
    /// Fraction of each fold used for the in-sample window, in (0, 1).
    pub in_sample_pct: f64,
    pub mode: WalkForwardMode,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            folds: 5,
            in_sample_pct: 0.75,
            mode: WalkForwardMode::Rolling,
        }
    }
}

/// One fold's windows. Invariant: `in_sample_end <= out_sample_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldWindow {
    pub in_sample_start: DateTime<Utc>,
    pub in_sample_end: DateTime<Utc>,
    pub out_sample_start: DateTime<Utc>,
    pub out_sample_end: DateTime<Utc>,
}

/// Split `[start, end]` into fold windows.
pub fn compute_folds(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    config: &WalkForwardConfig,
) -> Result<Vec<FoldWindow>, ValidationError> {
    if start >= end {
        return Err(ConfigError::Invalid(format!("start {start} must precede end {end}")).into());
    }
    if config.folds == 0 {
        return Err(ConfigError::Invalid("folds must be positive".into()).into());
    }
    if !(0.0..1.0).contains(&config.in_sample_pct) || config.in_sample_pct <= 0.0 {
        return Err(ConfigError::Invalid(format!(
            "in_sample_pct {} must lie in (0, 1)",
            config.in_sample_pct
        ))
        .into());
    }

    let span_secs = (end - start).num_seconds();
    let fold_secs = span_secs / config.folds as i64;
    if fold_secs < 2 {
        return Err(ConfigError::Invalid("span too short for fold count".into()).into());
    }
    let in_sample_secs = (fold_secs as f64 * config.in_sample_pct) as i64;

    let mut folds = Vec::with_capacity(config.folds);
    for index in 0..config.folds as i64 {
        let fold_start = start + Duration::seconds(index * fold_secs);
        let split = fold_start + Duration::seconds(in_sample_secs);
        let fold_end = if index as usize == config.folds - 1 {
            end
        } else {
            fold_start + Duration::seconds(fold_secs)
        };
        let in_sample_start = match config.mode {
            WalkForwardMode::Rolling => fold_start,
            WalkForwardMode::Anchored => start,
        };
        folds.push(FoldWindow {
            in_sample_start,
            in_sample_end: split,
            out_sample_start: split,
            out_sample_end: fold_end,
        });
    }
    Ok(folds)
}

/// Scores a parameter set over a bounded window. Implemented for closures.
pub trait WindowEvaluator: Sync {
    fn evaluate(&self, params: &ParamSet, start: DateTime<Utc>, end: DateTime<Utc>) -> f64;
}

impl<F> WindowEvaluator for F
where
    F: Fn(&ParamSet, DateTime<Utc>, DateTime<Utc>) -> f64 + Sync,
{
    fn evaluate(&self, params: &ParamSet, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
        self(params, start, end)
    }
}

/// Per-fold outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldResult {
    pub window: FoldWindow,
    pub best_params: ParamSet,
    pub in_sample_score: f64,
    pub out_sample_score: f64,
    /// `(is - oos) / |is|`; positive values mean out-of-sample decay.
    pub degradation: f64,
}

/// Aggregate walk-forward report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardReport {
    pub folds: Vec<FoldResult>,
    pub avg_in_sample: f64,
    pub avg_out_sample: f64,
    pub overall_degradation: f64,
}

/// The harness itself: fold computation plus the optimize-then-evaluate loop.
pub struct WalkForwardHarness {
    pub config: WalkForwardConfig,
}

impl WalkForwardHarness {
    pub fn new(config: WalkForwardConfig) -> Self {
        Self { config }
    }

    pub fn run(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        space: &ParameterSpace,
        optimizer: &dyn Optimizer,
        evaluator: &dyn WindowEvaluator,
    ) -> Result<WalkForwardReport, ValidationError> {
        let windows = compute_folds(start, end, &self.config)?;
        let mut folds = Vec::with_capacity(windows.len());

        for window in windows {
            // The objective only ever sees in-sample bounds.
            let bounded = |params: &ParamSet| {
                evaluator.evaluate(params, window.in_sample_start, window.in_sample_end)
            };
            let optimized: OptimizationResult = optimizer.optimize(space, &bounded as &dyn Objective)?;

            let out_sample_score = evaluator.evaluate(
                &optimized.best_params,
                window.out_sample_start,
                window.out_sample_end,
            );
            let degradation = if optimized.best_score.abs() > f64::EPSILON {
                (optimized.best_score - out_sample_score) / optimized.best_score.abs()
            } else {
                0.0
            };
            info!(
                is_score = optimized.best_score,
                oos_score = out_sample_score,
                degradation,
                "walk-forward fold complete"
            );
            folds.push(FoldResult {
                window,
                best_params: optimized.best_params,
                in_sample_score: optimized.best_score,
                out_sample_score,
                degradation,
            });
        }

        let count = folds.len() as f64;
        let avg_in_sample = folds.iter().map(|f| f.in_sample_score).sum::<f64>() / count;
        let avg_out_sample = folds.iter().map(|f| f.out_sample_score).sum::<f64>() / count;
        let overall_degradation = if avg_in_sample.abs() > f64::EPSILON {
            (avg_in_sample - avg_out_sample) / avg_in_sample.abs()
        } else {
            0.0
        };
        Ok(WalkForwardReport {
            folds,
            avg_in_sample,
            avg_out_sample,
            overall_degradation,
        })
    }
}

/// Window evaluator backed by real backtests: each call clones the base
/// config, narrows it to the window, applies the candidate parameters and
/// scores the resulting report by total return.
pub struct BacktestWindowEvaluator {
    pub base_config: BacktestConfig,
    pub bars: Arc<Vec<Bar>>,
}

impl WindowEvaluator for BacktestWindowEvaluator {
    fn evaluate(&self, params: &ParamSet, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
        let mut config = self.base_config.clone();
        config.start = start;
        config.end = end;
        config.strategy_params = params.clone();
        config.validation = None;
        match BacktestEngine::new(config).run(&self.bars) {
            Ok(report) => report.metrics.total_return,
            // Windows with no signal or no data score as flat, not fatal.
            Err(_) => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::optimizer::{GridOptimizer, ParameterRange};
    use chrono::TimeZone;
    use parking_lot::Mutex;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_rolling_folds_never_leak() {
        let config = WalkForwardConfig {
            folds: 4,
            in_sample_pct: 0.75,
            mode: WalkForwardMode::Rolling,
        };
        let folds = compute_folds(t(1), t(21), &config).unwrap();
        assert_eq!(folds.len(), 4);
        for fold in &folds {
            assert!(fold.in_sample_start < fold.in_sample_end);
            // No temporal leak: out-of-sample strictly after in-sample
            assert!(fold.in_sample_end <= fold.out_sample_start);
            assert!(fold.out_sample_start < fold.out_sample_end);
        }
        // Windows slide by one fold
        assert_eq!(folds[1].in_sample_start - folds[0].in_sample_start, Duration::days(5));
        assert_eq!(folds.last().unwrap().out_sample_end, t(21));
    }

    #[test]
    fn test_anchored_folds_expand() {
        let config = WalkForwardConfig {
            folds: 4,
            in_sample_pct: 0.75,
            mode: WalkForwardMode::Anchored,
        };
        let folds = compute_folds(t(1), t(21), &config).unwrap();
        for fold in &folds {
            assert_eq!(fold.in_sample_start, t(1));
            assert!(fold.in_sample_end <= fold.out_sample_start);
        }
        // Each in-sample window strictly contains the previous one
        assert!(folds
            .windows(2)
            .all(|w| w[1].in_sample_end > w[0].in_sample_end));
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let bad_pct = WalkForwardConfig {
            in_sample_pct: 1.2,
            ..Default::default()
        };
        assert!(compute_folds(t(1), t(21), &bad_pct).is_err());
        let zero_folds = WalkForwardConfig {
            folds: 0,
            ..Default::default()
        };
        assert!(compute_folds(t(1), t(21), &zero_folds).is_err());
        assert!(compute_folds(t(21), t(1), &WalkForwardConfig::default()).is_err());
    }

    #[test]
    fn test_harness_optimizes_only_on_in_sample_data() {
        // Record every window the objective is evaluated with and assert the
        // optimizer never saw out-of-sample timestamps.
        let seen: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>> = Mutex::new(Vec::new());
        let evaluator = |params: &ParamSet, start: DateTime<Utc>, end: DateTime<Utc>| {
            seen.lock().push((start, end));
            params["x"].as_f64().unwrap() - (end - start).num_days() as f64 * 0.001
        };
        let space = ParameterSpace::new().with("x", ParameterRange::Int { min: 0, max: 4, step: 1 });
        let harness = WalkForwardHarness::new(WalkForwardConfig {
            folds: 3,
            in_sample_pct: 0.5,
            mode: WalkForwardMode::Rolling,
        });
        let report = harness
            .run(t(1), t(13), &space, &GridOptimizer::default(), &evaluator)
            .unwrap();

        assert_eq!(report.folds.len(), 3);
        let windows = compute_folds(
            t(1),
            t(13),
            &WalkForwardConfig {
                folds: 3,
                in_sample_pct: 0.5,
                mode: WalkForwardMode::Rolling,
            },
        )
        .unwrap();
        // Per fold: 5 grid evaluations in-sample plus exactly one
        // out-of-sample evaluation of the winner.
        let seen = seen.lock();
        for (fold_index, window) in windows.iter().enumerate() {
            let fold_calls: Vec<_> = seen
                .iter()
                .filter(|(s, _)| *s == window.in_sample_start)
                .collect();
            assert_eq!(fold_calls.len(), 5, "fold {fold_index}");
            for (_, call_end) in fold_calls {
                assert!(*call_end <= window.out_sample_start);
            }
        }
        // The best x is always the max; degradation reflects the window-size
        // penalty difference only.
        for fold in &report.folds {
            assert_eq!(fold.best_params["x"].as_i64(), Some(4));
        }
    }

    #[test]
    fn test_degradation_sign() {
        let evaluator = |_: &ParamSet, start: DateTime<Utc>, _end: DateTime<Utc>| {
            // In-sample windows start earlier and score higher: positive decay
            if start == t(1) {
                2.0
            } else {
                1.0
            }
        };
        let space = ParameterSpace::new().with("x", ParameterRange::Int { min: 1, max: 1, step: 1 });
        let harness = WalkForwardHarness::new(WalkForwardConfig {
            folds: 1,
            in_sample_pct: 0.5,
            mode: WalkForwardMode::Rolling,
        });
        let report = harness
            .run(t(1), t(11), &space, &GridOptimizer::default(), &evaluator)
            .unwrap();
        assert!((report.overall_degradation - 0.5).abs() < 1e-12);
    }
}

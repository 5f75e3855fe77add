//! Monte Carlo Simulator
//!
//! Resamples the realized trade-return sequence to estimate the distribution
//! of outcomes: bootstrap with replacement, permutation without replacement,
//! or block bootstrap preserving autocorrelation.
//!
//! Determinism: simulations are partitioned across workers and worker `w`
//! seeds its own `ChaCha8Rng` with `seed + w`, so results are independent of
//! thread scheduling.

use crate::backtest::metrics::percentile;
use crate::bus::CancelToken;
use crate::errors::ValidationError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::time::Instant;

/// Annualization base for per-simulation ratio metrics. Each resampled
/// return is treated as one trading day.
const TRADING_DAYS: f64 = 252.0;

/// Monte Carlo configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloConfig {
    pub num_simulations: usize,
    /// Base RNG seed; the run seed is used when absent.
    pub seed: Option<u64>,
    /// Percentile levels reported for every metric distribution.
    pub confidence_levels: Vec<f64>,
    /// Block length for block-bootstrap; 1 disables blocking.
    pub bootstrap_blocks: usize,
    /// Sample i.i.d. with replacement (true) or permute (false).
    pub with_replacement: bool,
    pub parallel_workers: usize,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            num_simulations: 1_000,
            seed: None,
            confidence_levels: vec![0.05, 0.25, 0.50, 0.75, 0.95],
            bootstrap_blocks: 1,
            with_replacement: true,
            parallel_workers: 4,
        }
    }
}

/// Summary statistics of one metric across simulations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDistribution {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub skewness: f64,
    /// Excess kurtosis (normal = 0).
    pub kurtosis: f64,
    /// (level, value) pairs at the configured confidence levels.
    pub percentiles: Vec<(f64, f64)>,
}

impl MetricDistribution {
    fn from_samples(samples: &[f64], levels: &[f64]) -> Self {
        if samples.is_empty() {
            return Self {
                mean: 0.0,
                median: 0.0,
                std_dev: 0.0,
                min: 0.0,
                max: 0.0,
                skewness: 0.0,
                kurtosis: 0.0,
                percentiles: Vec::new(),
            };
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len() as f64;
        let mean = (&sorted).mean();
        let std_dev = if sorted.len() > 1 { (&sorted).std_dev() } else { 0.0 };

        let (skewness, kurtosis) = if std_dev > 0.0 && sorted.len() > 2 {
            let m3 = sorted.iter().map(|v| (v - mean).powi(3)).sum::<f64>() / n;
            let m4 = sorted.iter().map(|v| (v - mean).powi(4)).sum::<f64>() / n;
            let sigma = (sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            (m3 / sigma.powi(3), m4 / sigma.powi(4) - 3.0)
        } else {
            (0.0, 0.0)
        };

        Self {
            mean,
            median: percentile(&sorted, 0.5),
            std_dev,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            skewness,
            kurtosis,
            percentiles: levels
                .iter()
                .map(|&level| (level, percentile(&sorted, level)))
                .collect(),
        }
    }
}

/// Two-sided confidence interval on final equity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub level: f64,
    pub lower: f64,
    pub upper: f64,
}

/// An extreme simulation path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunExtreme {
    pub final_equity: f64,
    pub max_drawdown: f64,
}

/// Aggregate Monte Carlo output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub num_simulations: usize,
    /// Simulations actually completed (smaller when cancelled).
    pub completed_simulations: usize,
    pub final_equity: MetricDistribution,
    pub max_drawdown: MetricDistribution,
    pub win_rate: MetricDistribution,
    pub profit_factor: MetricDistribution,
    pub sharpe: MetricDistribution,
    pub sortino: MetricDistribution,
    pub calmar: MetricDistribution,
    pub cagr: MetricDistribution,
    /// Two-sided CIs on final equity at 99/95/90/80%.
    pub confidence_intervals: Vec<ConfidenceInterval>,
    /// P(final equity < 0.5 x initial).
    pub prob_ruin: f64,
    /// P(final equity >= 2 x initial).
    pub prob_target: f64,
    pub worst_case: RunExtreme,
    pub best_case: RunExtreme,
    /// Composite robustness score in [0, 1].
    pub robustness_score: f64,
    /// 1 - coefficient of variation of final equity, clamped to [0, 1].
    pub stability: f64,
    pub duration_ms: u64,
}

/// One simulated path's metrics.
#[derive(Debug, Clone, Copy)]
struct SimOutcome {
    final_equity: f64,
    max_drawdown: f64,
    win_rate: f64,
    profit_factor: f64,
    sharpe: f64,
    sortino: f64,
    calmar: f64,
    cagr: f64,
}

/// Resample one return sequence according to the config.
fn resample(returns: &[f64], config: &MonteCarloConfig, rng: &mut ChaCha8Rng) -> Vec<f64> {
    let n = returns.len();
    if config.bootstrap_blocks > 1 {
        // Contiguous blocks with wraparound, sampled with replacement.
        let block = config.bootstrap_blocks.min(n);
        let mut sampled = Vec::with_capacity(n);
        while sampled.len() < n {
            let start = rng.gen_range(0..n);
            for offset in 0..block {
                if sampled.len() == n {
                    break;
                }
                sampled.push(returns[(start + offset) % n]);
            }
        }
        sampled
    } else if config.with_replacement {
        (0..n).map(|_| returns[rng.gen_range(0..n)]).collect()
    } else {
        // Fisher-Yates permutation
        let mut sampled = returns.to_vec();
        for i in (1..n).rev() {
            let j = rng.gen_range(0..=i);
            sampled.swap(i, j);
        }
        sampled
    }
}

/// Compound one resampled sequence and extract its metrics.
fn simulate(returns: &[f64], initial_capital: f64) -> SimOutcome {
    let mut equity = initial_capital;
    let mut peak = initial_capital;
    let mut max_drawdown = 0.0f64;
    let mut wins = 0usize;
    let mut gross_win = 0.0;
    let mut gross_loss = 0.0;
    for &r in returns {
        equity *= 1.0 + r;
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - equity) / peak);
        }
        if r > 0.0 {
            wins += 1;
            gross_win += r;
        } else if r < 0.0 {
            gross_loss += -r;
        }
    }

    let n = returns.len() as f64;
    let mean = returns.mean();
    let std_dev = if returns.len() > 1 { returns.std_dev() } else { 0.0 };
    let sharpe = if std_dev > 0.0 {
        mean / std_dev * TRADING_DAYS.sqrt()
    } else {
        0.0
    };
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    let sortino = if downside.len() > 1 {
        let downside_std = (&downside).std_dev();
        if downside_std > 0.0 {
            mean / downside_std * TRADING_DAYS.sqrt()
        } else {
            0.0
        }
    } else {
        0.0
    };

    let growth = if initial_capital > 0.0 && equity > 0.0 {
        equity / initial_capital
    } else {
        0.0
    };
    let cagr = if growth > 0.0 && n > 0.0 {
        growth.powf(TRADING_DAYS / n) - 1.0
    } else {
        -1.0
    };
    let calmar = if max_drawdown > 0.0 { cagr / max_drawdown } else { 0.0 };
    let profit_factor = if gross_loss > 0.0 {
        gross_win / gross_loss
    } else if gross_win > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    SimOutcome {
        final_equity: equity,
        max_drawdown,
        win_rate: if n > 0.0 { wins as f64 / n } else { 0.0 },
        profit_factor,
        sharpe,
        sortino,
        calmar,
        cagr,
    }
}

/// Run the Monte Carlo batch. Cancellation yields partial results from the
/// simulations completed so far.
pub fn run(
    returns: &[f64],
    initial_capital: f64,
    config: &MonteCarloConfig,
    cancel: Option<&CancelToken>,
) -> Result<MonteCarloResult, ValidationError> {
    if returns.is_empty() {
        return Err(ValidationError::NoReturns);
    }
    if config.num_simulations == 0 {
        return Err(ValidationError::Config(crate::errors::ConfigError::Invalid(
            "num_simulations must be positive".into(),
        )));
    }
    let started = Instant::now();
    let seed = config.seed.unwrap_or(42);
    let workers = config.parallel_workers.max(1);
    let per_worker = config.num_simulations.div_ceil(workers);

    let outcomes: Vec<SimOutcome> = (0..workers as u64)
        .into_par_iter()
        .map(|worker_id| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(worker_id));
            let quota = per_worker
                .min(config.num_simulations.saturating_sub(worker_id as usize * per_worker));
            let mut outcomes = Vec::with_capacity(quota);
            for _ in 0..quota {
                if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
                    break;
                }
                let sampled = resample(returns, config, &mut rng);
                outcomes.push(simulate(&sampled, initial_capital));
            }
            outcomes
        })
        .flatten()
        .collect();

    if outcomes.is_empty() {
        return Err(ValidationError::Cancelled);
    }

    let levels = &config.confidence_levels;
    let finals: Vec<f64> = outcomes.iter().map(|o| o.final_equity).collect();
    let drawdowns: Vec<f64> = outcomes.iter().map(|o| o.max_drawdown).collect();
    // Infinite profit factors (no losing trades in a path) are excluded from
    // the distribution summary.
    let profit_factors: Vec<f64> = outcomes
        .iter()
        .map(|o| o.profit_factor)
        .filter(|pf| pf.is_finite())
        .collect();

    let mut sorted_finals = finals.clone();
    sorted_finals.sort_by(|a, b| a.total_cmp(b));
    let confidence_intervals = [0.99, 0.95, 0.90, 0.80]
        .iter()
        .map(|&level| {
            let tail = (1.0 - level) / 2.0;
            ConfidenceInterval {
                level,
                lower: percentile(&sorted_finals, tail),
                upper: percentile(&sorted_finals, 1.0 - tail),
            }
        })
        .collect();

    let count = finals.len() as f64;
    let prob_ruin = finals.iter().filter(|&&f| f < 0.5 * initial_capital).count() as f64 / count;
    let prob_target = finals.iter().filter(|&&f| f >= 2.0 * initial_capital).count() as f64 / count;
    let prob_profit =
        finals.iter().filter(|&&f| f > initial_capital).count() as f64 / count;

    let mean_final = (&finals).mean();
    let std_final = if finals.len() > 1 { (&finals).std_dev() } else { 0.0 };
    let stability = if mean_final.abs() > f64::EPSILON {
        (1.0 - std_final / mean_final.abs()).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let mean_drawdown = (&drawdowns).mean();
    let robustness_score =
        (0.4 * prob_profit + 0.3 * stability + 0.3 * (1.0 - mean_drawdown)).clamp(0.0, 1.0);

    let worst = outcomes
        .iter()
        .min_by(|a, b| a.final_equity.total_cmp(&b.final_equity))
        .copied()
        .unwrap_or(outcomes[0]);
    let best = outcomes
        .iter()
        .max_by(|a, b| a.final_equity.total_cmp(&b.final_equity))
        .copied()
        .unwrap_or(outcomes[0]);

    Ok(MonteCarloResult {
        num_simulations: config.num_simulations,
        completed_simulations: outcomes.len(),
        final_equity: MetricDistribution::from_samples(&finals, levels),
        max_drawdown: MetricDistribution::from_samples(&drawdowns, levels),
        win_rate: MetricDistribution::from_samples(
            &outcomes.iter().map(|o| o.win_rate).collect::<Vec<_>>(),
            levels,
        ),
        profit_factor: MetricDistribution::from_samples(&profit_factors, levels),
        sharpe: MetricDistribution::from_samples(
            &outcomes.iter().map(|o| o.sharpe).collect::<Vec<_>>(),
            levels,
        ),
        sortino: MetricDistribution::from_samples(
            &outcomes.iter().map(|o| o.sortino).collect::<Vec<_>>(),
            levels,
        ),
        calmar: MetricDistribution::from_samples(
            &outcomes.iter().map(|o| o.calmar).collect::<Vec<_>>(),
            levels,
        ),
        cagr: MetricDistribution::from_samples(
            &outcomes.iter().map(|o| o.cagr).collect::<Vec<_>>(),
            levels,
        ),
        confidence_intervals,
        prob_ruin,
        prob_target,
        worst_case: RunExtreme {
            final_equity: worst.final_equity,
            max_drawdown: worst.max_drawdown,
        },
        best_case: RunExtreme {
            final_equity: best.final_equity,
            max_drawdown: best.max_drawdown,
        },
        robustness_score,
        stability,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

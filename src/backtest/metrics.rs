//! Performance Metrics
//!
//! End-of-run statistics computed from the trade list and the equity curve.
//! Everything here is f64: these are analytics, not accounting.

use crate::num;
use crate::portfolio::EquityCurve;
use crate::types::Trade;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::HashMap;

/// Annualization base: trading periods per year for a given bar timeframe.
/// The convention follows the 252-trading-day year.
pub fn periods_per_year(timeframe: &str) -> f64 {
    match timeframe {
        "1m" => 252.0 * 24.0 * 60.0,
        "5m" => 252.0 * 24.0 * 12.0,
        "15m" => 252.0 * 24.0 * 4.0,
        "30m" => 252.0 * 24.0 * 2.0,
        "1h" => 252.0 * 24.0,
        "4h" => 252.0 * 6.0,
        "1d" => 252.0,
        "1w" => 52.0,
        _ => 252.0,
    }
}

/// Aggregate backtest performance report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub max_drawdown: f64,
    pub max_drawdown_at: Option<DateTime<Utc>>,
    pub win_rate: f64,
    pub profit_factor: f64,
    /// Mean net P&L per closing trade.
    pub expectancy: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub avg_holding_secs: f64,
    pub var_95: f64,
    pub var_99: f64,
    pub cvar_95: f64,
    pub num_trades: usize,
    pub num_closing_trades: usize,
    pub total_commission: f64,
    pub final_equity: f64,
}

/// Per-closing-trade return sequence: net realized P&L over the equity base
/// at the time of the trade. This is the sequence Monte Carlo resamples.
pub fn trade_returns(trades: &[Trade], initial_capital: Decimal) -> Vec<f64> {
    let mut equity_base = num::to_f64(initial_capital);
    let mut returns = Vec::new();
    for trade in trades {
        if trade.realized_pnl.is_zero() {
            continue;
        }
        let net = num::to_f64(trade.realized_pnl - trade.commission);
        if equity_base > 0.0 {
            returns.push(net / equity_base);
        }
        equity_base += net;
    }
    returns
}

/// Empirical percentile with linear interpolation over a sorted sample.
pub fn percentile(sorted: &[f64], level: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = level.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

pub fn compute(
    trades: &[Trade],
    curve: &EquityCurve,
    initial_capital: Decimal,
    periods_per_year: f64,
) -> PerformanceMetrics {
    let initial = num::to_f64(initial_capital);
    let final_equity = curve
        .last()
        .map(|p| num::to_f64(p.equity))
        .unwrap_or(initial);

    // Period returns off the equity curve
    let equities: Vec<f64> = curve.points().iter().map(|p| num::to_f64(p.equity)).collect();
    let mut period_returns = Vec::with_capacity(equities.len().saturating_sub(1));
    for window in equities.windows(2) {
        if window[0] > 0.0 {
            period_returns.push(window[1] / window[0] - 1.0);
        }
    }

    let total_return = if initial > 0.0 {
        final_equity / initial - 1.0
    } else {
        0.0
    };
    let n_periods = period_returns.len() as f64;
    let annualized_return = if n_periods > 0.0 && total_return > -1.0 {
        (1.0 + total_return).powf(periods_per_year / n_periods) - 1.0
    } else {
        0.0
    };

    let (sharpe, sortino) = if period_returns.len() > 1 {
        let mean = (&period_returns).mean();
        let std_dev = (&period_returns).std_dev();
        let sharpe = if std_dev > 0.0 {
            mean / std_dev * periods_per_year.sqrt()
        } else {
            0.0
        };
        let downside: Vec<f64> = period_returns.iter().copied().filter(|r| *r < 0.0).collect();
        let sortino = if downside.len() > 1 {
            let downside_std = (&downside).std_dev();
            if downside_std > 0.0 {
                mean / downside_std * periods_per_year.sqrt()
            } else {
                0.0
            }
        } else {
            0.0
        };
        (sharpe, sortino)
    } else {
        (0.0, 0.0)
    };

    let (max_drawdown, max_drawdown_at) = curve
        .max_drawdown()
        .map(|(dd, at)| (num::to_f64(dd), Some(at)))
        .unwrap_or((0.0, None));
    let calmar = if max_drawdown > 0.0 {
        annualized_return / max_drawdown
    } else {
        0.0
    };

    // Trade-level statistics over closing trades
    let closing: Vec<&Trade> = trades.iter().filter(|t| !t.realized_pnl.is_zero()).collect();
    let mut wins = 0usize;
    let mut gross_win = 0.0;
    let mut gross_loss = 0.0;
    let mut largest_win = 0.0f64;
    let mut largest_loss = 0.0f64;
    for trade in &closing {
        let net = num::to_f64(trade.realized_pnl - trade.commission);
        if net > 0.0 {
            wins += 1;
            gross_win += net;
            largest_win = largest_win.max(net);
        } else {
            gross_loss += -net;
            largest_loss = largest_loss.min(net);
        }
    }
    let win_rate = if closing.is_empty() {
        0.0
    } else {
        wins as f64 / closing.len() as f64
    };
    let profit_factor = if gross_loss > 0.0 {
        gross_win / gross_loss
    } else if gross_win > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    let expectancy = if closing.is_empty() {
        0.0
    } else {
        (gross_win - gross_loss) / closing.len() as f64
    };

    // Average holding time from flat-to-flat round trips
    let mut entry_times: HashMap<&str, DateTime<Utc>> = HashMap::new();
    let mut open_qty: HashMap<&str, Decimal> = HashMap::new();
    let mut holdings = Vec::new();
    for trade in trades {
        let signed = trade.side.sign() * trade.quantity;
        let qty = open_qty.entry(trade.symbol.as_str()).or_insert(Decimal::ZERO);
        let was_flat = qty.is_zero();
        *qty += signed;
        if was_flat && !qty.is_zero() {
            entry_times.insert(trade.symbol.as_str(), trade.executed_at);
        } else if !was_flat && qty.is_zero() {
            if let Some(entered) = entry_times.remove(trade.symbol.as_str()) {
                holdings.push((trade.executed_at - entered).num_seconds().max(0) as f64);
            }
        }
    }
    let avg_holding_secs = if holdings.is_empty() {
        0.0
    } else {
        holdings.iter().sum::<f64>() / holdings.len() as f64
    };

    // Tail risk from the trade-return distribution. VaR is reported as a
    // positive loss fraction.
    let mut sorted_returns = trade_returns(trades, initial_capital);
    sorted_returns.sort_by(|a, b| a.total_cmp(b));
    let (var_95, var_99, cvar_95) = if sorted_returns.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        let var_95 = (-percentile(&sorted_returns, 0.05)).max(0.0);
        let var_99 = (-percentile(&sorted_returns, 0.01)).max(0.0);
        let cutoff = percentile(&sorted_returns, 0.05);
        let tail: Vec<f64> = sorted_returns
            .iter()
            .copied()
            .filter(|r| *r <= cutoff)
            .collect();
        let cvar_95 = if tail.is_empty() {
            var_95
        } else {
            (-(tail.iter().sum::<f64>() / tail.len() as f64)).max(0.0)
        };
        (var_95, var_99, cvar_95)
    };

    PerformanceMetrics {
        total_return,
        annualized_return,
        sharpe,
        sortino,
        calmar,
        max_drawdown,
        max_drawdown_at,
        win_rate,
        profit_factor,
        expectancy,
        largest_win,
        largest_loss,
        avg_holding_secs,
        var_95,
        var_99,
        cvar_95,
        num_trades: trades.len(),
        num_closing_trades: closing.len(),
        total_commission: trades.iter().map(|t| num::to_f64(t.commission)).sum(),
        final_equity,
    }
}

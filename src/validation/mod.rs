//! Validation Stack
//!
//! Post-backtest robustness tooling: Monte Carlo resampling of the realized
//! trade returns, parameter optimization (grid / random / genetic) and the
//! walk-forward harness. Every stochastic component takes an explicit seed
//! and a cooperative cancellation token.

pub mod monte_carlo;
pub mod optimizer;
pub mod walk_forward;

pub use monte_carlo::{MonteCarloConfig, MonteCarloResult};
pub use optimizer::{
    Direction, Evaluation, GeneticOptimizer, GridOptimizer, Objective, OptimizationResult,
    Optimizer, ParamSet, ParameterRange, ParameterSpace, RandomOptimizer,
};
pub use walk_forward::{
    FoldResult, FoldWindow, WalkForwardConfig, WalkForwardHarness, WalkForwardMode,
    WalkForwardReport, WindowEvaluator,
};

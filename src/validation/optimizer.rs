//! Parameter Optimization
//!
//! Grid, random and genetic search over a typed parameter space, evaluating
//! candidates in parallel. All three expose the same surface and result
//! shape, and every stochastic step derives from an explicit seed.

use crate::bus::CancelToken;
use crate::errors::ValidationError;
use crate::strategy::ParameterValue;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

/// A concrete parameter assignment.
pub type ParamSet = BTreeMap<String, ParameterValue>;

/// Search range for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ParameterRange {
    Int { min: i64, max: i64, step: i64 },
    Float { min: f64, max: f64 },
    Choice { options: Vec<String> },
}

impl ParameterRange {
    /// Gaussian-mutation sigma: 10% of the range width.
    fn mutation_sigma(&self) -> f64 {
        match self {
            ParameterRange::Int { min, max, .. } => (max - min) as f64 * 0.1,
            ParameterRange::Float { min, max } => (max - min) * 0.1,
            ParameterRange::Choice { .. } => 0.0,
        }
    }

    fn sample(&self, rng: &mut ChaCha8Rng) -> ParameterValue {
        match self {
            ParameterRange::Int { min, max, .. } => {
                ParameterValue::Int(rng.gen_range(*min..=*max))
            }
            ParameterRange::Float { min, max } => {
                ParameterValue::Float(rng.gen_range(*min..=*max))
            }
            ParameterRange::Choice { options } => {
                ParameterValue::Choice(options[rng.gen_range(0..options.len())].clone())
            }
        }
    }

    fn clamp(&self, value: f64) -> ParameterValue {
        match self {
            ParameterRange::Int { min, max, .. } => {
                ParameterValue::Int((value.round() as i64).clamp(*min, *max))
            }
            ParameterRange::Float { min, max } => ParameterValue::Float(value.clamp(*min, *max)),
            ParameterRange::Choice { options } => ParameterValue::Choice(
                options
                    .get((value.round().max(0.0) as usize).min(options.len() - 1))
                    .cloned()
                    .unwrap_or_default(),
            ),
        }
    }

    /// Grid values at the configured resolution.
    fn grid_values(&self, float_samples: usize) -> Vec<ParameterValue> {
        match self {
            ParameterRange::Int { min, max, step } => {
                let step = (*step).max(1);
                (*min..=*max)
                    .step_by(step as usize)
                    .map(ParameterValue::Int)
                    .collect()
            }
            ParameterRange::Float { min, max } => {
                let samples = float_samples.max(2);
                (0..samples)
                    .map(|i| {
                        let fraction = i as f64 / (samples - 1) as f64;
                        ParameterValue::Float(min + fraction * (max - min))
                    })
                    .collect()
            }
            ParameterRange::Choice { options } => options
                .iter()
                .map(|o| ParameterValue::Choice(o.clone()))
                .collect(),
        }
    }
}

/// The full search space.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    pub params: BTreeMap<String, ParameterRange>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, range: ParameterRange) -> Self {
        self.params.insert(name.into(), range);
        self
    }

    fn sample(&self, rng: &mut ChaCha8Rng) -> ParamSet {
        self.params
            .iter()
            .map(|(name, range)| (name.clone(), range.sample(rng)))
            .collect()
    }
}

/// Optimization direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Maximize,
    Minimize,
}

impl Direction {
    #[inline]
    fn better(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Direction::Maximize => candidate > incumbent,
            Direction::Minimize => candidate < incumbent,
        }
    }

    fn worst(&self) -> f64 {
        match self {
            Direction::Maximize => f64::NEG_INFINITY,
            Direction::Minimize => f64::INFINITY,
        }
    }
}

/// Objective function evaluated per candidate. Implemented for closures.
pub trait Objective: Sync {
    fn evaluate(&self, params: &ParamSet) -> f64;
}

impl<F> Objective for F
where
    F: Fn(&ParamSet) -> f64 + Sync,
{
    fn evaluate(&self, params: &ParamSet) -> f64 {
        self(params)
    }
}

/// A single evaluated candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub params: ParamSet,
    pub score: f64,
}

/// Shared result shape for all methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub best_params: ParamSet,
    pub best_score: f64,
    pub all_results: Vec<Evaluation>,
    /// Best-so-far score after each iteration or generation.
    pub convergence: Vec<f64>,
    pub duration_ms: u64,
    pub iterations: usize,
}

/// Common optimizer surface, so harnesses can take `&dyn Optimizer`.
pub trait Optimizer: Sync {
    fn optimize(
        &self,
        space: &ParameterSpace,
        objective: &dyn Objective,
    ) -> Result<OptimizationResult, ValidationError>;
}

fn evaluate_batch(
    candidates: Vec<ParamSet>,
    objective: &dyn Objective,
    cancel: &CancelToken,
) -> Vec<Option<Evaluation>> {
    candidates
        .into_par_iter()
        .map(|params| {
            if cancel.is_cancelled() {
                return None;
            }
            let score = objective.evaluate(&params);
            Some(Evaluation { params, score })
        })
        .collect()
}

fn finish(
    direction: Direction,
    all_results: Vec<Evaluation>,
    convergence: Vec<f64>,
    started: Instant,
    iterations: usize,
) -> Result<OptimizationResult, ValidationError> {
    let mut best: Option<&Evaluation> = None;
    for eval in &all_results {
        if eval.score.is_nan() {
            continue;
        }
        match best {
            Some(incumbent) if !direction.better(eval.score, incumbent.score) => {}
            _ => best = Some(eval),
        }
    }
    let best = best.ok_or(ValidationError::Cancelled)?;
    Ok(OptimizationResult {
        best_params: best.params.clone(),
        best_score: best.score,
        all_results: all_results.clone(),
        convergence,
        duration_ms: started.elapsed().as_millis() as u64,
        iterations,
    })
}

// ============================================================================
// Grid
// ============================================================================

/// Exhaustive Cartesian sweep.
#[derive(Debug, Clone)]
pub struct GridOptimizer {
    pub direction: Direction,
    /// Samples per continuous parameter.
    pub float_samples: usize,
    pub cancel: CancelToken,
}

impl Default for GridOptimizer {
    fn default() -> Self {
        Self {
            direction: Direction::Maximize,
            float_samples: 10,
            cancel: CancelToken::new(),
        }
    }
}

impl GridOptimizer {
    fn expand(&self, space: &ParameterSpace) -> Vec<ParamSet> {
        let mut combos: Vec<ParamSet> = vec![BTreeMap::new()];
        for (name, range) in &space.params {
            let values = range.grid_values(self.float_samples);
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in &values {
                    let mut extended = combo.clone();
                    extended.insert(name.clone(), value.clone());
                    next.push(extended);
                }
            }
            combos = next;
        }
        combos
    }
}

impl Optimizer for GridOptimizer {
    fn optimize(
        &self,
        space: &ParameterSpace,
        objective: &dyn Objective,
    ) -> Result<OptimizationResult, ValidationError> {
        if space.params.is_empty() {
            return Err(ValidationError::EmptyParameterSpace);
        }
        let started = Instant::now();
        let combos = self.expand(space);
        let total = combos.len();
        debug!(total, "grid sweep starting");

        let evaluated = evaluate_batch(combos, objective, &self.cancel);
        let mut convergence = Vec::new();
        let mut best_so_far = self.direction.worst();
        let mut all_results = Vec::new();
        for eval in evaluated.into_iter().flatten() {
            if !eval.score.is_nan() && self.direction.better(eval.score, best_so_far) {
                best_so_far = eval.score;
            }
            convergence.push(best_so_far);
            all_results.push(eval);
        }
        finish(self.direction, all_results, convergence, started, total)
    }
}

// ============================================================================
// Random
// ============================================================================

/// Uniform random search.
#[derive(Debug, Clone)]
pub struct RandomOptimizer {
    pub direction: Direction,
    pub max_iterations: usize,
    pub seed: u64,
    pub cancel: CancelToken,
}

impl Default for RandomOptimizer {
    fn default() -> Self {
        Self {
            direction: Direction::Maximize,
            max_iterations: 100,
            seed: 42,
            cancel: CancelToken::new(),
        }
    }
}

impl Optimizer for RandomOptimizer {
    fn optimize(
        &self,
        space: &ParameterSpace,
        objective: &dyn Objective,
    ) -> Result<OptimizationResult, ValidationError> {
        if space.params.is_empty() {
            return Err(ValidationError::EmptyParameterSpace);
        }
        let started = Instant::now();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let candidates: Vec<ParamSet> = (0..self.max_iterations)
            .map(|_| space.sample(&mut rng))
            .collect();

        let evaluated = evaluate_batch(candidates, objective, &self.cancel);
        let mut convergence = Vec::new();
        let mut best_so_far = self.direction.worst();
        let mut all_results = Vec::new();
        for eval in evaluated.into_iter().flatten() {
            if !eval.score.is_nan() && self.direction.better(eval.score, best_so_far) {
                best_so_far = eval.score;
            }
            convergence.push(best_so_far);
            all_results.push(eval);
        }
        finish(
            self.direction,
            all_results,
            convergence,
            started,
            self.max_iterations,
        )
    }
}

// ============================================================================
// Genetic
// ============================================================================

/// Genetic search: tournament selection, uniform crossover, Gaussian
/// mutation, elitism.
#[derive(Debug, Clone)]
pub struct GeneticOptimizer {
    pub direction: Direction,
    pub population: usize,
    pub generations: usize,
    pub crossover_rate: f64,
    pub mutation_rate: f64,
    /// Individuals copied unchanged into the next generation.
    pub elitism: usize,
    pub tournament_size: usize,
    pub seed: u64,
    pub cancel: CancelToken,
}

impl Default for GeneticOptimizer {
    fn default() -> Self {
        Self {
            direction: Direction::Maximize,
            population: 30,
            generations: 20,
            crossover_rate: 0.8,
            mutation_rate: 0.1,
            elitism: 2,
            tournament_size: 3,
            seed: 42,
            cancel: CancelToken::new(),
        }
    }
}

impl GeneticOptimizer {
    fn tournament<'a>(
        &self,
        scored: &'a [Evaluation],
        rng: &mut ChaCha8Rng,
    ) -> &'a Evaluation {
        let mut winner = &scored[rng.gen_range(0..scored.len())];
        for _ in 1..self.tournament_size.max(1) {
            let challenger = &scored[rng.gen_range(0..scored.len())];
            if self.direction.better(challenger.score, winner.score) {
                winner = challenger;
            }
        }
        winner
    }

    fn crossover(
        &self,
        a: &ParamSet,
        b: &ParamSet,
        rng: &mut ChaCha8Rng,
    ) -> ParamSet {
        if rng.gen::<f64>() >= self.crossover_rate {
            return a.clone();
        }
        // Uniform crossover: each gene from either parent with equal odds
        a.iter()
            .map(|(name, value)| {
                let gene = if rng.gen::<bool>() {
                    value.clone()
                } else {
                    b.get(name).cloned().unwrap_or_else(|| value.clone())
                };
                (name.clone(), gene)
            })
            .collect()
    }

    fn mutate(&self, individual: &mut ParamSet, space: &ParameterSpace, rng: &mut ChaCha8Rng) {
        for (name, range) in &space.params {
            if rng.gen::<f64>() >= self.mutation_rate {
                continue;
            }
            let mutated = match (individual.get(name), range) {
                (Some(_), ParameterRange::Choice { .. }) => range.sample(rng),
                (Some(value), _) => {
                    let current = value.as_f64().unwrap_or_default();
                    let sigma = range.mutation_sigma();
                    // Box-Muller keeps the dependency surface small
                    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                    let u2: f64 = rng.gen::<f64>();
                    let gaussian =
                        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                    range.clamp(current + gaussian * sigma)
                }
                (None, _) => range.sample(rng),
            };
            individual.insert(name.clone(), mutated);
        }
    }
}

impl Optimizer for GeneticOptimizer {
    fn optimize(
        &self,
        space: &ParameterSpace,
        objective: &dyn Objective,
    ) -> Result<OptimizationResult, ValidationError> {
        if space.params.is_empty() {
            return Err(ValidationError::EmptyParameterSpace);
        }
        let started = Instant::now();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let population = self.population.max(2);

        let mut current: Vec<ParamSet> = (0..population).map(|_| space.sample(&mut rng)).collect();
        let mut all_results: Vec<Evaluation> = Vec::new();
        let mut convergence = Vec::new();
        let mut best_so_far = self.direction.worst();

        for generation in 0..self.generations.max(1) {
            if self.cancel.is_cancelled() {
                break;
            }
            let scored: Vec<Evaluation> =
                evaluate_batch(current.clone(), objective, &self.cancel)
                    .into_iter()
                    .flatten()
                    .collect();
            if scored.is_empty() {
                break;
            }
            for eval in &scored {
                if !eval.score.is_nan() && self.direction.better(eval.score, best_so_far) {
                    best_so_far = eval.score;
                }
            }
            convergence.push(best_so_far);
            all_results.extend(scored.iter().cloned());
            debug!(generation, best = best_so_far, "generation evaluated");

            // Elites survive unchanged; the rest are bred
            let mut ranked = scored.clone();
            ranked.sort_by(|a, b| match self.direction {
                Direction::Maximize => b.score.total_cmp(&a.score),
                Direction::Minimize => a.score.total_cmp(&b.score),
            });
            let mut next: Vec<ParamSet> = ranked
                .iter()
                .take(self.elitism.min(population))
                .map(|e| e.params.clone())
                .collect();
            while next.len() < population {
                let parent_a = self.tournament(&ranked, &mut rng);
                let parent_b = self.tournament(&ranked, &mut rng);
                let mut child = self.crossover(&parent_a.params, &parent_b.params, &mut rng);
                self.mutate(&mut child, space, &mut rng);
                next.push(child);
            }
            current = next;
        }

        finish(
            self.direction,
            all_results,
            convergence,
            started,
            self.generations,
        )
    }
}

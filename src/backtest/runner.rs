//! Backtest Run Registry
//!
//! Control surface behind `backtest.run / status / trades / cancel`. Each run
//! executes on a blocking task with its own cancellation token; progress
//! lands in the registry so a transport can poll or push it without touching
//! the engine.

use crate::backtest::engine::{BacktestEngine, BacktestReport, ProgressUpdate};
use crate::backtest::BacktestConfig;
use crate::bus::{CancelToken, EventBus};
use crate::errors::BacktestError;
use crate::types::{Bar, Trade};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Lifecycle of a registered run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Point-in-time run status for the control API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub id: Uuid,
    pub state: RunState,
    pub progress_pct: f64,
    pub events_processed: u64,
    pub trades_executed: u64,
    pub current_equity: Option<Decimal>,
    pub error: Option<String>,
}

struct RunEntry {
    state: RunState,
    progress: Option<ProgressUpdate>,
    report: Option<Arc<BacktestReport>>,
    error: Option<String>,
    cancel: CancelToken,
}

/// Registry of in-flight and completed backtest runs.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<Uuid, RunEntry>>>,
    bus: Option<Arc<EventBus>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            bus: None,
        }
    }

    /// Attach a bus handed to every spawned engine for observer events.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Start a run. Returns immediately with the run id; execution happens
    /// on a blocking task.
    pub fn start(&self, config: BacktestConfig, bars: Vec<Bar>) -> Uuid {
        let id = Uuid::new_v4();
        let cancel = CancelToken::new();
        self.runs.write().insert(
            id,
            RunEntry {
                state: RunState::Pending,
                progress: None,
                report: None,
                error: None,
                cancel: cancel.clone(),
            },
        );

        let runs = Arc::clone(&self.runs);
        let bus = self.bus.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(entry) = runs.write().get_mut(&id) {
                entry.state = RunState::Running;
            }
            info!(run_id = %id, "backtest run started");

            let mut engine = BacktestEngine::new(config).with_cancel_token(cancel);
            if let Some(bus) = bus {
                engine = engine.with_bus(bus);
            }
            {
                let runs = Arc::clone(&runs);
                engine = engine.with_progress(Box::new(move |update: &ProgressUpdate| {
                    if let Some(entry) = runs.write().get_mut(&id) {
                        entry.progress = Some(update.clone());
                    }
                }));
            }

            let result = engine.run(&bars);
            let mut runs = runs.write();
            let Some(entry) = runs.get_mut(&id) else {
                return;
            };
            match result {
                Ok(report) => {
                    entry.state = RunState::Completed;
                    entry.report = Some(Arc::new(report));
                    info!(run_id = %id, "backtest run completed");
                }
                Err(BacktestError::Cancelled) => {
                    entry.state = RunState::Cancelled;
                    info!(run_id = %id, "backtest run cancelled");
                }
                Err(err) => {
                    entry.state = RunState::Failed;
                    entry.error = Some(err.to_string());
                    error!(run_id = %id, %err, "backtest run failed");
                }
            }
        });
        id
    }

    pub fn status(&self, id: Uuid) -> Option<RunStatus> {
        let runs = self.runs.read();
        let entry = runs.get(&id)?;
        let (events_processed, trades_executed, current_equity, progress_pct) = match &entry.progress
        {
            Some(p) => (
                p.events_processed,
                p.trades_executed,
                Some(p.current_equity),
                if p.total_events > 0 {
                    p.events_processed as f64 / p.total_events as f64 * 100.0
                } else {
                    0.0
                },
            ),
            None => (0, 0, None, 0.0),
        };
        // Terminal states override the last progress snapshot.
        let progress_pct = match entry.state {
            RunState::Completed => 100.0,
            _ => progress_pct,
        };
        Some(RunStatus {
            id,
            state: entry.state,
            progress_pct,
            events_processed: entry
                .report
                .as_ref()
                .map(|r| r.events_processed)
                .unwrap_or(events_processed),
            trades_executed: entry
                .report
                .as_ref()
                .map(|r| r.trades.len() as u64)
                .unwrap_or(trades_executed),
            current_equity,
            error: entry.error.clone(),
        })
    }

    /// Trades of a completed run.
    pub fn trades(&self, id: Uuid) -> Option<Vec<Trade>> {
        self.runs
            .read()
            .get(&id)?
            .report
            .as_ref()
            .map(|report| report.trades.clone())
    }

    /// Full report of a completed run.
    pub fn result(&self, id: Uuid) -> Option<Arc<BacktestReport>> {
        self.runs.read().get(&id)?.report.clone()
    }

    /// Request cooperative cancellation. Returns false for unknown runs.
    pub fn cancel(&self, id: Uuid) -> bool {
        let runs = self.runs.read();
        match runs.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn run_ids(&self) -> Vec<Uuid> {
        self.runs.read().keys().copied().collect()
    }
}

use serde::Serialize;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::model::{FixedTransfer, ModelOptions, TransferMatrixModel, WindowInputs};
use super::solver::{LpSolver, SolveFailure};
use crate::domain::{InputSeries, ShiftWindow, TransferEntry, TransferMatrix};
use crate::error::{OptimizerError, Result};

/// Windows larger than this get a warning; the dense simplex grows quickly.
pub const DEFAULT_LARGE_WINDOW_STEPS: usize = 24 * 14;

/// Energy crossing a control boundary inside one solved window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spillover {
    /// Per window step: energy from before the boundary purchased here.
    pub add: Vec<f64>,
    /// Per window step: energy demanded here but purchased before the boundary.
    pub remove: Vec<f64>,
}

/// Result of one window solve, in absolute time indices.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSolution {
    pub range: Range<usize>,
    /// Transfers decided by this solve; fixed history is not repeated.
    pub transfers: TransferMatrix,
    /// Original demand over the window.
    pub demand: Vec<f64>,
    /// Net demand over the window including fixed history.
    pub net_demand: Vec<f64>,
    /// `Σ P[t]·N[t]` over the window.
    pub cost: f64,
}

impl WindowSolution {
    /// `N[t] - D[t]` over the window.
    pub fn shift(&self) -> Vec<f64> {
        self.net_demand
            .iter()
            .zip(&self.demand)
            .map(|(n, d)| n - d)
            .collect()
    }

    /// Decided transfers crossing `boundary`, indexed by window step.
    pub fn spillover(&self, boundary: usize) -> Spillover {
        let len = self.range.len();
        let mut add = vec![0.0; len];
        let mut remove = vec![0.0; len];
        for entry in self.transfers.entries() {
            if entry.origin < boundary && entry.destination >= boundary {
                add[entry.destination - self.range.start] += entry.amount;
            }
            if entry.destination < boundary && entry.origin >= boundary {
                remove[entry.origin - self.range.start] += entry.amount;
            }
        }
        Spillover { add, remove }
    }
}

/// Builds, solves and translates the transfer model for one lookahead window.
#[derive(Clone)]
pub struct SingleHorizonOptimizer {
    solver: Arc<dyn LpSolver>,
    options: ModelOptions,
    large_window_steps: usize,
}

impl std::fmt::Debug for SingleHorizonOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleHorizonOptimizer")
            .field("solver", &self.solver.name())
            .field("options", &self.options)
            .finish()
    }
}

impl SingleHorizonOptimizer {
    pub fn new(solver: Arc<dyn LpSolver>, options: ModelOptions) -> Self {
        Self {
            solver,
            options,
            large_window_steps: DEFAULT_LARGE_WINDOW_STEPS,
        }
    }

    pub fn with_large_window_warning(mut self, steps: usize) -> Self {
        self.large_window_steps = steps;
        self
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn solver_name(&self) -> &'static str {
        self.solver.name()
    }

    /// Solves `range` of the series with `fixed` (absolute) transfers held constant.
    ///
    /// Fixed entries with neither endpoint inside the range are ignored.
    pub fn optimize(
        &self,
        series: &InputSeries,
        window: &ShiftWindow,
        range: Range<usize>,
        fixed: &[TransferEntry],
    ) -> Result<WindowSolution> {
        if window.len() != series.len() {
            return Err(OptimizerError::config(format!(
                "shift window covers {} steps but series has {}",
                window.len(),
                series.len()
            )));
        }
        if range.is_empty() || range.end > series.len() {
            return Err(OptimizerError::config(format!(
                "window {}..{} is empty or outside series of length {}",
                range.start,
                range.end,
                series.len()
            )));
        }
        if range.len() > self.large_window_steps {
            warn!(
                steps = range.len(),
                threshold = self.large_window_steps,
                "large optimization window, solve may be slow"
            );
        }

        let local = window.restrict(range.clone())?;
        let to_local = |t: usize| range.contains(&t).then(|| t - range.start);
        let fixed_local: Vec<FixedTransfer> = fixed
            .iter()
            .filter_map(|e| {
                let origin = to_local(e.origin);
                let destination = to_local(e.destination);
                (origin.is_some() || destination.is_some()).then_some(FixedTransfer {
                    origin,
                    destination,
                    amount: e.amount,
                })
            })
            .collect();

        let inputs = WindowInputs {
            demand: &series.demand()[range.clone()],
            price: &series.price()[range.clone()],
            power_limit: &series.power_limit()[range.clone()],
        };
        let model = TransferMatrixModel::build(inputs, &local, &fixed_local, &self.options)?;

        let started = Instant::now();
        let solution = model.solve(self.solver.as_ref()).map_err(|failure| match failure {
            SolveFailure::Infeasible => OptimizerError::InfeasibleWindow {
                start: range.start,
                end: range.end,
            },
            other => OptimizerError::Solver(format!("{} ({})", other, self.solver.name())),
        })?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let transfers: TransferMatrix = solution
            .transfers
            .iter()
            .map(|t| TransferEntry::new(t.origin + range.start, t.destination + range.start, t.amount))
            .collect();

        let mut net_demand = inputs.demand.to_vec();
        let decided = transfers.entries();
        let history = fixed_local.iter().map(|f| {
            (
                f.origin.map(|i| i + range.start),
                f.destination.map(|j| j + range.start),
                f.amount,
            )
        });
        for (origin, destination, amount) in decided
            .map(|e| (Some(e.origin), Some(e.destination), e.amount))
            .chain(history)
        {
            if let Some(i) = origin {
                net_demand[i - range.start] -= amount;
            }
            if let Some(j) = destination {
                net_demand[j - range.start] += amount;
            }
        }

        let cost: f64 = net_demand
            .iter()
            .zip(inputs.price)
            .map(|(n, p)| n * p)
            .sum();

        debug!(
            start = range.start,
            end = range.end,
            variables = model.num_variables(),
            transfers = transfers.len(),
            fixed = fixed_local.len(),
            cost,
            objective = solution.objective,
            duration_ms,
            solver = self.solver.name(),
            "window solved"
        );

        Ok(WindowSolution {
            range,
            transfers,
            demand: inputs.demand.to_vec(),
            net_demand,
            cost,
        })
    }
}

//! Transfer matrix LP for a single optimization window.
//!
//! Variables are the permitted, not yet fixed `(i, j)` pairs of the window.
//! Net demand is affine in them, `N[t] = D[t] - RowSum(t) + ColSum(t)`, so the
//! cost `Σ P[t]·N[t]` splits into a constant plus `Σ x_ij (P[j] - P[i])`.
//! Everything here uses window-local indices.

use std::collections::HashSet;
use tracing::debug;

use super::solver::{LinearProgram, LpSolver, Sense, SolveFailure, VarId};
use crate::domain::{ShiftWindow, TransferEntry, AMOUNT_EPSILON};
use crate::error::{OptimizerError, Result};

/// A transfer decided earlier that this window must respect as a constant.
///
/// `None` marks an endpoint outside the window: a committed purchase before
/// the window start, or demand from an earlier period bought inside it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedTransfer {
    pub origin: Option<usize>,
    pub destination: Option<usize>,
    pub amount: f64,
}

/// Extra limits on top of the row and power constraints.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelOptions {
    /// Bound on energy added to, and separately removed from, any one step.
    pub max_rate: Option<f64>,
}

impl ModelOptions {
    pub fn validate(&self) -> Result<()> {
        match self.max_rate {
            Some(rate) if !(rate.is_finite() && rate > 0.0) => Err(OptimizerError::config(
                format!("max rate must be positive and finite, got {rate}"),
            )),
            _ => Ok(()),
        }
    }
}

/// Window slices of the input series.
#[derive(Debug, Clone, Copy)]
pub struct WindowInputs<'a> {
    pub demand: &'a [f64],
    pub price: &'a [f64],
    pub power_limit: &'a [f64],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSolution {
    /// Decided transfers in local indices; fixed transfers are not repeated.
    pub transfers: Vec<TransferEntry>,
    /// `Σ P[t]·N[t]` over the window, fixed contributions included.
    pub objective: f64,
}

#[derive(Debug, Clone)]
pub struct TransferMatrixModel {
    program: LinearProgram,
    pairs: Vec<(usize, usize)>,
    objective_constant: f64,
}

impl TransferMatrixModel {
    pub fn build(
        inputs: WindowInputs<'_>,
        window: &ShiftWindow,
        fixed: &[FixedTransfer],
        options: &ModelOptions,
    ) -> Result<Self> {
        let n = window.len();
        if inputs.demand.len() != n || inputs.price.len() != n || inputs.power_limit.len() != n {
            return Err(OptimizerError::config(format!(
                "window inputs (demand {}, price {}, power limit {}) do not match shift window length {}",
                inputs.demand.len(),
                inputs.price.len(),
                inputs.power_limit.len(),
                n
            )));
        }
        options.validate()?;

        let mut fixed_row = vec![0.0; n];
        let mut fixed_col = vec![0.0; n];
        let mut fixed_pairs = HashSet::new();
        for f in fixed {
            if !(f.amount.is_finite() && f.amount >= 0.0) {
                return Err(OptimizerError::config(format!(
                    "fixed transfer amount must be finite and non-negative, got {}",
                    f.amount
                )));
            }
            if f.origin.is_some_and(|i| i >= n) || f.destination.is_some_and(|j| j >= n) {
                return Err(OptimizerError::config(format!(
                    "fixed transfer {:?} -> {:?} outside window of length {n}",
                    f.origin, f.destination
                )));
            }
            if let Some(i) = f.origin {
                fixed_row[i] += f.amount;
            }
            if let Some(j) = f.destination {
                fixed_col[j] += f.amount;
            }
            if let (Some(i), Some(j)) = (f.origin, f.destination) {
                fixed_pairs.insert((i, j));
            }
        }

        let objective_constant: f64 = (0..n)
            .map(|t| inputs.price[t] * (inputs.demand[t] - fixed_row[t] + fixed_col[t]))
            .sum();

        let mut program = LinearProgram::new();
        let mut pairs = Vec::with_capacity(window.pair_count());
        let mut rows: Vec<Vec<VarId>> = vec![Vec::new(); n];
        let mut cols: Vec<Vec<VarId>> = vec![Vec::new(); n];

        for i in 0..n {
            // zero demand: nothing can leave this row
            if inputs.demand[i] <= 0.0 {
                continue;
            }
            for j in window.destinations(i) {
                if fixed_pairs.contains(&(i, j)) {
                    continue;
                }
                let var = program.add_variable(inputs.price[j] - inputs.price[i], inputs.demand[i]);
                pairs.push((i, j));
                rows[i].push(var);
                cols[j].push(var);
            }
        }

        for t in 0..n {
            program.add_constraint(
                rows[t].iter().map(|&v| (v, 1.0)).collect(),
                Sense::Le,
                snap(inputs.demand[t] - fixed_row[t]),
            );

            let limit = inputs.power_limit[t];
            if limit.is_finite() {
                let terms = cols[t]
                    .iter()
                    .map(|&v| (v, 1.0))
                    .chain(rows[t].iter().map(|&v| (v, -1.0)))
                    .collect();
                program.add_constraint(
                    terms,
                    Sense::Le,
                    snap(limit - inputs.demand[t] + fixed_row[t] - fixed_col[t]),
                );
            }

            if let Some(rate) = options.max_rate {
                program.add_constraint(
                    cols[t].iter().map(|&v| (v, 1.0)).collect(),
                    Sense::Le,
                    snap(rate - fixed_col[t]),
                );
                program.add_constraint(
                    rows[t].iter().map(|&v| (v, 1.0)).collect(),
                    Sense::Le,
                    snap(rate - fixed_row[t]),
                );
            }
        }

        debug!(
            steps = n,
            variables = program.num_variables(),
            constraints = program.num_constraints(),
            fixed = fixed.len(),
            "built transfer matrix model"
        );

        Ok(Self {
            program,
            pairs,
            objective_constant,
        })
    }

    pub fn program(&self) -> &LinearProgram {
        &self.program
    }

    pub fn num_variables(&self) -> usize {
        self.program.num_variables()
    }

    pub fn num_constraints(&self) -> usize {
        self.program.num_constraints()
    }

    /// Local `(origin, destination)` pair behind each variable.
    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    pub fn solve(&self, solver: &dyn LpSolver) -> std::result::Result<ModelSolution, SolveFailure> {
        let solution = solver.solve(&self.program)?;
        if solution.values.len() != self.pairs.len() {
            return Err(SolveFailure::Failed(format!(
                "solver returned {} values for {} variables",
                solution.values.len(),
                self.pairs.len()
            )));
        }

        let transfers = self
            .pairs
            .iter()
            .zip(&solution.values)
            .filter(|(_, &amount)| amount > AMOUNT_EPSILON)
            .map(|(&(i, j), &amount)| TransferEntry::new(i, j, amount))
            .collect();

        Ok(ModelSolution {
            transfers,
            objective: solution.objective + self.objective_constant,
        })
    }
}

/// Pulls round-off sized negatives back to zero.
fn snap(value: f64) -> f64 {
    if value < 0.0 && value > -AMOUNT_EPSILON {
        0.0
    } else {
        value
    }
}

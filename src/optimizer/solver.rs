//! Solver boundary
//!
//! The core only ever talks to an LP solver through [`LpSolver`]: a linear
//! objective, linear rows and non-negative variables go in; an optimal
//! assignment or a typed failure comes out.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Index of a decision variable inside a [`LinearProgram`].
pub type VarId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sense {
    Le,
    Ge,
    Eq,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearConstraint {
    pub terms: Vec<(VarId, f64)>,
    pub sense: Sense,
    pub rhs: f64,
}

impl LinearConstraint {
    /// Whether the row holds for an assignment, within `tolerance`.
    pub fn is_satisfied(&self, values: &[f64], tolerance: f64) -> bool {
        let lhs: f64 = self
            .terms
            .iter()
            .map(|&(var, coeff)| coeff * values.get(var).copied().unwrap_or(0.0))
            .sum();
        match self.sense {
            Sense::Le => lhs <= self.rhs + tolerance,
            Sense::Ge => lhs >= self.rhs - tolerance,
            Sense::Eq => (lhs - self.rhs).abs() <= tolerance,
        }
    }
}

/// Minimization problem over variables bounded below by zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinearProgram {
    pub objective: Vec<f64>,
    pub upper_bounds: Vec<f64>,
    pub constraints: Vec<LinearConstraint>,
}

impl LinearProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable in `[0, upper]` with the given objective coefficient.
    pub fn add_variable(&mut self, cost: f64, upper: f64) -> VarId {
        self.objective.push(cost);
        self.upper_bounds.push(upper);
        self.objective.len() - 1
    }

    pub fn add_constraint(&mut self, terms: Vec<(VarId, f64)>, sense: Sense, rhs: f64) {
        self.constraints.push(LinearConstraint { terms, sense, rhs });
    }

    pub fn num_variables(&self) -> usize {
        self.objective.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LpSolution {
    pub values: Vec<f64>,
    pub objective: f64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SolveFailure {
    #[error("problem is infeasible")]
    Infeasible,

    #[error("problem is unbounded")]
    Unbounded,

    #[error("solver timed out")]
    TimedOut,

    #[error("solver failed: {0}")]
    Failed(String),
}

/// A linear program solver.
///
/// Implementations must be deterministic: identical programs yield identical
/// solutions, so repeated runs commit identical transfer matrices.
#[cfg_attr(test, mockall::automock)]
pub trait LpSolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn solve(&self, problem: &LinearProgram) -> Result<LpSolution, SolveFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_assigns_sequential_ids() {
        let mut lp = LinearProgram::new();
        let x = lp.add_variable(1.0, f64::INFINITY);
        let y = lp.add_variable(-2.0, 3.0);
        lp.add_constraint(vec![(x, 1.0), (y, 1.0)], Sense::Le, 4.0);

        assert_eq!((x, y), (0, 1));
        assert_eq!(lp.num_variables(), 2);
        assert_eq!(lp.num_constraints(), 1);
    }

    #[test]
    fn test_constraint_satisfaction() {
        let row = LinearConstraint {
            terms: vec![(0, 1.0), (1, -1.0)],
            sense: Sense::Eq,
            rhs: 2.0,
        };
        assert!(row.is_satisfied(&[5.0, 3.0], 1e-9));
        assert!(!row.is_satisfied(&[5.0, 2.0], 1e-9));

        let empty = LinearConstraint {
            terms: vec![],
            sense: Sense::Le,
            rhs: -1.0,
        };
        assert!(!empty.is_satisfied(&[], 1e-9));
    }
}

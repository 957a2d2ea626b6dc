//! Pure-Rust LP backend built on `minilp`.

use minilp::{ComparisonOp, LinearExpr, OptimizationDirection, Problem};

use super::solver::{LinearProgram, LpSolution, LpSolver, Sense, SolveFailure};

/// Tolerance used for rows that carry no variables.
const EMPTY_ROW_TOLERANCE: f64 = 1e-7;

/// Dense-simplex solver from the `minilp` crate.
///
/// Deterministic for a given program: variables and rows are handed to the
/// backend in program order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinilpSolver;

impl MinilpSolver {
    pub fn new() -> Self {
        Self
    }
}

impl LpSolver for MinilpSolver {
    fn name(&self) -> &'static str {
        "minilp"
    }

    fn solve(&self, lp: &LinearProgram) -> Result<LpSolution, SolveFailure> {
        // Rows without variables are constants; check them here so that a
        // program with no variables at all still gets a definite answer.
        for row in lp.constraints.iter().filter(|c| c.terms.is_empty()) {
            if !row.is_satisfied(&[], EMPTY_ROW_TOLERANCE) {
                return Err(SolveFailure::Infeasible);
            }
        }

        if lp.num_variables() == 0 {
            return Ok(LpSolution {
                values: Vec::new(),
                objective: 0.0,
            });
        }

        let mut problem = Problem::new(OptimizationDirection::Minimize);
        let vars: Vec<_> = lp
            .objective
            .iter()
            .zip(&lp.upper_bounds)
            .map(|(&cost, &upper)| problem.add_var(cost, (0.0, upper)))
            .collect();

        for row in lp.constraints.iter().filter(|c| !c.terms.is_empty()) {
            let mut expr = LinearExpr::empty();
            for &(var, coeff) in &row.terms {
                let var = vars.get(var).copied().ok_or_else(|| {
                    SolveFailure::Failed(format!("constraint references unknown variable {var}"))
                })?;
                expr.add(var, coeff);
            }
            let op = match row.sense {
                Sense::Le => ComparisonOp::Le,
                Sense::Ge => ComparisonOp::Ge,
                Sense::Eq => ComparisonOp::Eq,
            };
            problem.add_constraint(expr, op, row.rhs);
        }

        let solution = problem.solve().map_err(|e| match e {
            minilp::Error::Infeasible => SolveFailure::Infeasible,
            minilp::Error::Unbounded => SolveFailure::Unbounded,
        })?;

        let values = vars.iter().map(|&v| solution[v].max(0.0)).collect();

        Ok(LpSolution {
            values,
            objective: solution.objective(),
        })
    }
}

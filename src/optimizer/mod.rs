pub mod minilp_solver;
pub mod model;
pub mod single;
pub mod solver;

pub use minilp_solver::MinilpSolver;
pub use model::*;
pub use single::*;
pub use solver::*;

use thiserror::Error;

/// Errors surfaced by the optimizer core.
///
/// None of these are retried internally. A configuration error is detected
/// before any solve; the other two halt the roll that produced them.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OptimizerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("window [{start}, {end}) has no feasible transfer plan")]
    InfeasibleWindow { start: usize, end: usize },

    #[error("solver error: {0}")]
    Solver(String),
}

impl OptimizerError {
    pub fn config(message: impl Into<String>) -> Self {
        OptimizerError::Configuration(message.into())
    }

    /// Short type name used in API error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OptimizerError::Configuration(_) => "ConfigurationError",
            OptimizerError::InfeasibleWindow { .. } => "InfeasibleWindowError",
            OptimizerError::Solver(_) => "SolverError",
        }
    }
}

pub type Result<T, E = OptimizerError> = std::result::Result<T, E>;

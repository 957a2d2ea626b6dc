use axum::{extract::State, Json};
use chrono::{DateTime, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use validator::Validate;

use crate::{
    api::{error::ApiError, response::ApiResponse, AppState},
    config::Config,
    controller::{ControlPlan, MovingHorizonController},
    domain::{CostSummary, FixedLookahead, InputSeries, ShiftWindow},
    optimizer::{LpSolver, ModelOptions, SingleHorizonOptimizer},
};

/// Load shift flexibility shared by both optimization endpoints.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoadShiftParams {
    /// Hours before the demand step energy may be purchased.
    #[validate(range(min = 0))]
    pub max_demand_advance: i64,
    /// Hours after the demand step energy may be purchased.
    #[validate(range(min = 0))]
    pub max_demand_delay: i64,
    /// kWh per hour.
    #[validate(range(exclusive_min = 0.0))]
    pub max_hourly_purchase: Option<f64>,
    /// kW moved into or out of any step.
    #[validate(range(exclusive_min = 0.0))]
    pub max_rate: Option<f64>,
    #[serde(default)]
    pub enforce_charge_direction: bool,
    #[serde(default = "default_solver")]
    pub solver: String,
}

fn default_solver() -> String {
    "auto".to_string()
}

impl LoadShiftParams {
    fn check_supported(&self, solver: &dyn LpSolver) -> Result<(), ApiError> {
        if self.enforce_charge_direction {
            return Err(ApiError::BadRequest(
                "enforce_charge_direction needs integer variables and is not supported".into(),
            ));
        }
        match self.solver.as_str() {
            "auto" => Ok(()),
            name if name == solver.name() => Ok(()),
            other => Err(ApiError::BadRequest(format!("unsupported solver '{other}'"))),
        }
    }

    /// Hourly limits become per-step energy on a grid of `steps_per_hour`.
    fn series(
        &self,
        demand: Vec<f64>,
        price: Vec<f64>,
        steps_per_hour: usize,
    ) -> Result<InputSeries, ApiError> {
        let limit = self
            .max_hourly_purchase
            .map_or(f64::INFINITY, |kwh| kwh / steps_per_hour as f64);
        Ok(InputSeries::with_uniform_power_limit(demand, price, limit)?)
    }

    /// Advance and delay are given in hours and converted to steps.
    fn window(&self, len: usize, steps_per_hour: usize) -> Result<ShiftWindow, ApiError> {
        let to_steps = |hours: i64, field: &str| {
            i64::try_from(steps_per_hour)
                .ok()
                .and_then(|sph| hours.checked_mul(sph))
                .ok_or_else(|| ApiError::BadRequest(format!("{field} of {hours} hours is too large")))
        };
        Ok(ShiftWindow::uniform(
            len,
            to_steps(self.max_demand_delay, "max_demand_delay")?,
            to_steps(self.max_demand_advance, "max_demand_advance")?,
        )?)
    }

    fn optimizer(
        &self,
        solver: Arc<dyn LpSolver>,
        cfg: &Config,
        steps_per_hour: usize,
    ) -> SingleHorizonOptimizer {
        SingleHorizonOptimizer::new(
            solver,
            ModelOptions {
                max_rate: self.max_rate.map(|kw| kw / steps_per_hour as f64),
            },
        )
        .with_large_window_warning(cfg.optimizer.large_window_warning_steps)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct OptimizationRequest {
    #[validate(length(min = 1))]
    pub price: Vec<f64>,
    #[validate(length(min = 1))]
    pub demand: Vec<f64>,
    #[serde(flatten)]
    #[validate(nested)]
    pub load_shift: LoadShiftParams,
    #[validate(range(min = 1))]
    pub n_control_hours: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct OptimizationResponse {
    pub optimal_demand: Vec<f64>,
    pub optimal_shift: Vec<f64>,
    #[serde(flatten)]
    pub summary: CostSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_spillover: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_spillover: Option<Vec<f64>>,
}

/// POST /api/v1/optimize - Solve the whole series as one window
pub async fn optimize(
    State(state): State<AppState>,
    Json(request): Json<OptimizationRequest>,
) -> Result<ApiResponse<OptimizationResponse>, ApiError> {
    request.validate()?;
    request.load_shift.check_supported(state.solver.as_ref())?;
    tracing::info!(
        steps = request.price.len(),
        control_hours = ?request.n_control_hours,
        "single window optimization requested"
    );

    let started = Instant::now();
    let solver_name = state.solver.name();
    let response =
        tokio::task::spawn_blocking(move || solve_single(request, state.solver, &state.cfg))
            .await??;

    Ok(ApiResponse::success(response)
        .with_duration(started.elapsed().as_millis() as u64)
        .with_solver(solver_name))
}

fn solve_single(
    request: OptimizationRequest,
    solver: Arc<dyn LpSolver>,
    cfg: &Config,
) -> Result<OptimizationResponse, ApiError> {
    let OptimizationRequest {
        price,
        demand,
        load_shift,
        n_control_hours,
    } = request;

    // plain arrays carry no timestamps and are taken as hourly
    let series = load_shift.series(demand, price, 1)?;
    let window = load_shift.window(series.len(), 1)?;
    let optimizer = load_shift.optimizer(solver, cfg, 1);
    let solution = optimizer.optimize(&series, &window, 0..series.len(), &[])?;

    let violations = solution
        .transfers
        .check_invariants(&series, &window, cfg.optimizer.tolerance);
    if let Err(msg) = violations {
        return Err(ApiError::OptimizationError(format!(
            "solved matrix violates constraints: {msg}"
        )));
    }

    let spillover = n_control_hours.map(|hours| solution.spillover(hours.min(series.len())));
    let optimized_cost = series.cost_of(&solution.net_demand);
    Ok(OptimizationResponse {
        optimal_shift: solution.shift(),
        summary: CostSummary::new(series.original_cost(), optimized_cost),
        remove_spillover: spillover.as_ref().map(|s| s.remove.clone()),
        add_spillover: spillover.map(|s| s.add),
        optimal_demand: solution.net_demand,
    })
}

#[derive(Debug, Deserialize, Validate)]
pub struct TimeSeriesData {
    #[validate(length(min = 1))]
    pub timestamps: Vec<String>,
    #[validate(length(min = 1))]
    pub values: Vec<f64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MovingHorizonRequest {
    #[validate(nested)]
    pub price_data: TimeSeriesData,
    #[validate(nested)]
    pub demand_data: TimeSeriesData,
    #[validate(range(min = 0, max = 23))]
    pub daily_decision_hour: u32,
    pub n_lookahead_hours: usize,
    #[validate(nested)]
    pub load_shift: LoadShiftParams,
}

#[derive(Debug, Serialize)]
pub struct MovingHorizonResponse {
    pub timestamps: Vec<String>,
    pub original_demand: Vec<f64>,
    pub optimal_demand: Vec<f64>,
    pub shift: Vec<f64>,
    pub price: Vec<f64>,
    #[serde(flatten)]
    pub summary: CostSummary,
    pub rolls: usize,
}

/// POST /api/v1/optimize/moving-horizon - Day by day rolling optimization
pub async fn optimize_moving_horizon(
    State(state): State<AppState>,
    Json(request): Json<MovingHorizonRequest>,
) -> Result<ApiResponse<MovingHorizonResponse>, ApiError> {
    request.validate()?;
    if request.n_lookahead_hours < state.cfg.horizon.min_lookahead_hours {
        return Err(ApiError::ValidationError(format!(
            "n_lookahead_hours must be at least {}",
            state.cfg.horizon.min_lookahead_hours
        )));
    }
    request.load_shift.check_supported(state.solver.as_ref())?;
    tracing::info!(
        steps = request.price_data.values.len(),
        decision_hour = request.daily_decision_hour,
        lookahead_hours = request.n_lookahead_hours,
        "moving horizon optimization requested"
    );

    let started = Instant::now();
    let solver_name = state.solver.name();
    let response =
        tokio::task::spawn_blocking(move || solve_moving_horizon(request, state.solver, &state.cfg))
            .await??;

    Ok(ApiResponse::success(response)
        .with_duration(started.elapsed().as_millis() as u64)
        .with_solver(solver_name))
}

fn solve_moving_horizon(
    request: MovingHorizonRequest,
    solver: Arc<dyn LpSolver>,
    cfg: &Config,
) -> Result<MovingHorizonResponse, ApiError> {
    let MovingHorizonRequest {
        price_data,
        demand_data,
        daily_decision_hour,
        n_lookahead_hours,
        load_shift,
    } = request;

    if price_data.timestamps != demand_data.timestamps {
        return Err(ApiError::BadRequest(
            "price_data and demand_data must share the same timestamps".into(),
        ));
    }
    if price_data.values.len() != price_data.timestamps.len()
        || demand_data.values.len() != demand_data.timestamps.len()
    {
        return Err(ApiError::BadRequest(
            "each series needs exactly one value per timestamp".into(),
        ));
    }

    let grid = TimeGrid::parse(&price_data.timestamps)?;
    let plan = ControlPlan::daily(grid.steps_per_day(), grid.decision_step(daily_decision_hour))?;

    let original_demand = demand_data.values.clone();
    let lookahead_steps = n_lookahead_hours
        .checked_mul(grid.steps_per_hour)
        .ok_or_else(|| {
            ApiError::BadRequest(format!(
                "n_lookahead_hours of {n_lookahead_hours} is too large"
            ))
        })?;
    let series = load_shift.series(
        demand_data.values,
        price_data.values.clone(),
        grid.steps_per_hour,
    )?;
    let window = load_shift.window(series.len(), grid.steps_per_hour)?;
    let provider = FixedLookahead::new(series, lookahead_steps)?;
    let optimizer = load_shift.optimizer(solver, cfg, grid.steps_per_hour);

    let controller = MovingHorizonController::new(provider, window, plan, optimizer)?;
    let result = controller.run()?;

    Ok(MovingHorizonResponse {
        timestamps: price_data.timestamps,
        original_demand,
        optimal_demand: result.net_demand,
        shift: result.shift,
        price: price_data.values,
        summary: result.summary,
        rolls: result.rolls.len(),
    })
}

/// Evenly spaced timestamps with a whole number of steps per hour.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TimeGrid {
    start: NaiveDateTime,
    steps_per_hour: usize,
}

impl TimeGrid {
    fn parse(timestamps: &[String]) -> Result<Self, ApiError> {
        let parsed = timestamps
            .iter()
            .map(|ts| parse_timestamp(ts.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let Some(&start) = parsed.first() else {
            return Err(ApiError::BadRequest("timestamps must not be empty".into()));
        };

        let step_secs = match parsed.get(1) {
            Some(second) => (*second - start).num_seconds(),
            None => 3600,
        };
        if step_secs <= 0 || 3600 % step_secs != 0 {
            return Err(ApiError::BadRequest(format!(
                "time step of {step_secs}s does not divide an hour"
            )));
        }
        let uneven = parsed
            .windows(2)
            .any(|pair| (pair[1] - pair[0]).num_seconds() != step_secs);
        if uneven {
            return Err(ApiError::BadRequest(
                "timestamps must be evenly spaced".into(),
            ));
        }

        Ok(Self {
            start,
            steps_per_hour: (3600 / step_secs) as usize,
        })
    }

    fn steps_per_day(&self) -> usize {
        24 * self.steps_per_hour
    }

    /// Steps from the series start to the first decision at `hour`.
    fn decision_step(&self, hour: u32) -> usize {
        let start_secs = self.start.num_seconds_from_midnight() as i64;
        let decision_secs = hour as i64 * 3600;
        let step_secs = 3600 / self.steps_per_hour as i64;
        let offset = (decision_secs - start_secs).rem_euclid(86_400);
        // Round up so a decision hour between two steps lands on the later one.
        let steps = (offset + step_secs - 1) / step_secs;
        steps as usize % self.steps_per_day()
    }
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, ApiError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.naive_local());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| ApiError::BadRequest(format!("invalid timestamp '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn hourly(start: &str, n: usize) -> Vec<String> {
        let start = parse_timestamp(start).unwrap();
        (0..n)
            .map(|i| {
                (start + chrono::Duration::hours(i as i64))
                    .format("%Y-%m-%dT%H:%M:%S")
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-01-01T00:00:00").is_ok());
        assert!(parse_timestamp("2024-01-01T00:00:00+01:00").is_ok());
        assert!(parse_timestamp("2024-01-01 13:15:00").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_time_grid_hourly() {
        let grid = TimeGrid::parse(&hourly("2024-01-01T00:00:00", 48)).unwrap();
        assert_eq!(grid.steps_per_hour, 1);
        assert_eq!(grid.steps_per_day(), 24);
    }

    #[test]
    fn test_time_grid_quarter_hourly() {
        let stamps = vec![
            "2024-01-01T00:00:00".to_string(),
            "2024-01-01T00:15:00".to_string(),
            "2024-01-01T00:30:00".to_string(),
        ];
        let grid = TimeGrid::parse(&stamps).unwrap();
        assert_eq!(grid.steps_per_hour, 4);
        assert_eq!(grid.decision_step(12), 48);
    }

    #[test]
    fn test_time_grid_rejects_gaps() {
        let stamps = vec![
            "2024-01-01T00:00:00".to_string(),
            "2024-01-01T01:00:00".to_string(),
            "2024-01-01T03:00:00".to_string(),
        ];
        assert!(TimeGrid::parse(&stamps).is_err());
    }

    #[rstest]
    #[case("2024-01-01T00:00:00", 12, 12)]
    #[case("2024-01-01T12:00:00", 12, 0)]
    #[case("2024-01-01T18:00:00", 12, 18)]
    #[case("2024-01-01T05:00:00", 0, 19)]
    fn test_decision_step(#[case] start: &str, #[case] hour: u32, #[case] expected: usize) {
        let grid = TimeGrid::parse(&hourly(start, 2)).unwrap();
        assert_eq!(grid.decision_step(hour), expected);
    }

    #[test]
    fn test_charge_direction_rejected() {
        let params = LoadShiftParams {
            max_demand_advance: 1,
            max_demand_delay: 1,
            max_hourly_purchase: None,
            max_rate: None,
            enforce_charge_direction: true,
            solver: default_solver(),
        };
        let solver = crate::optimizer::MinilpSolver::new();
        assert!(matches!(
            params.check_supported(&solver),
            Err(ApiError::BadRequest(_))
        ));
    }

    fn params(advance: i64, delay: i64) -> LoadShiftParams {
        LoadShiftParams {
            max_demand_advance: advance,
            max_demand_delay: delay,
            max_hourly_purchase: Some(20.0),
            max_rate: Some(8.0),
            enforce_charge_direction: false,
            solver: default_solver(),
        }
    }

    #[test]
    fn test_hourly_limits_scaled_to_quarter_hours() {
        let params = params(1, 2);

        let window = params.window(96, 4).unwrap();
        assert_eq!(window.forward(0), 8);
        assert_eq!(window.backward(50), 4);

        let series = params.series(vec![1.0; 96], vec![1.0; 96], 4).unwrap();
        assert_eq!(series.power_limit()[0], 5.0);

        let solver = Arc::new(crate::optimizer::MinilpSolver::new());
        let optimizer = params.optimizer(solver, &Config::default(), 4);
        assert_eq!(optimizer.options().max_rate, Some(2.0));
    }

    #[test]
    fn test_huge_shift_hours_rejected() {
        let params = params(i64::MAX, 0);
        assert!(matches!(params.window(96, 4), Err(ApiError::BadRequest(_))));
    }
}

use itertools::izip;
use serde::{Deserialize, Serialize};

use crate::error::{OptimizerError, Result};

/// Demand, price and power limit aligned to one time index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSeries {
    demand: Vec<f64>,
    price: Vec<f64>,
    power_limit: Vec<f64>,
}

impl InputSeries {
    pub fn new(demand: Vec<f64>, price: Vec<f64>, power_limit: Vec<f64>) -> Result<Self> {
        if demand.is_empty() {
            return Err(OptimizerError::config("series must contain at least one step"));
        }
        if price.len() != demand.len() || power_limit.len() != demand.len() {
            return Err(OptimizerError::config(format!(
                "series lengths differ: demand {}, price {}, power limit {}",
                demand.len(),
                price.len(),
                power_limit.len()
            )));
        }
        if let Some((t, d)) = demand
            .iter()
            .enumerate()
            .find(|(_, d)| !d.is_finite() || **d < 0.0)
        {
            return Err(OptimizerError::config(format!(
                "demand at step {t} must be finite and non-negative, got {d}"
            )));
        }
        if let Some((t, p)) = price.iter().enumerate().find(|(_, p)| !p.is_finite()) {
            return Err(OptimizerError::config(format!(
                "price at step {t} must be finite, got {p}"
            )));
        }
        // +inf is allowed and means unconstrained
        if let Some((t, l)) = power_limit
            .iter()
            .enumerate()
            .find(|(_, l)| l.is_nan() || **l < 0.0)
        {
            return Err(OptimizerError::config(format!(
                "power limit at step {t} must be non-negative, got {l}"
            )));
        }

        Ok(Self {
            demand,
            price,
            power_limit,
        })
    }

    /// Series with one power limit for every step (`f64::INFINITY` for none).
    pub fn with_uniform_power_limit(demand: Vec<f64>, price: Vec<f64>, limit: f64) -> Result<Self> {
        let power_limit = vec![limit; demand.len()];
        Self::new(demand, price, power_limit)
    }

    pub fn len(&self) -> usize {
        self.demand.len()
    }

    pub fn is_empty(&self) -> bool {
        self.demand.is_empty()
    }

    pub fn demand(&self) -> &[f64] {
        &self.demand
    }

    pub fn price(&self) -> &[f64] {
        &self.price
    }

    pub fn power_limit(&self) -> &[f64] {
        &self.power_limit
    }

    pub fn total_demand(&self) -> f64 {
        self.demand.iter().sum()
    }

    /// Cost of buying every unit at the step it was demanded.
    pub fn original_cost(&self) -> f64 {
        self.cost_of(&self.demand)
    }

    /// Cost of a net demand profile over the full series.
    pub fn cost_of(&self, net_demand: &[f64]) -> f64 {
        izip!(&self.price, net_demand).map(|(p, n)| p * n).sum()
    }
}

/// Source of the input series plus how far prices are known.
///
/// `price_known_through(start)` is the exclusive end of the price horizon
/// visible to a roll starting at `start`.
pub trait SeriesProvider {
    fn series(&self) -> &InputSeries;

    fn price_known_through(&self, roll_start: usize) -> usize;
}

/// All prices are known up front.
impl SeriesProvider for InputSeries {
    fn series(&self) -> &InputSeries {
        self
    }

    fn price_known_through(&self, _roll_start: usize) -> usize {
        self.len()
    }
}

/// Prices become known a fixed number of steps ahead of each roll.
#[derive(Debug, Clone)]
pub struct FixedLookahead {
    series: InputSeries,
    steps: usize,
}

impl FixedLookahead {
    pub fn new(series: InputSeries, steps: usize) -> Result<Self> {
        if steps == 0 {
            return Err(OptimizerError::config("lookahead must be at least one step"));
        }
        Ok(Self { series, steps })
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

impl SeriesProvider for FixedLookahead {
    fn series(&self) -> &InputSeries {
        &self.series
    }

    fn price_known_through(&self, roll_start: usize) -> usize {
        roll_start.saturating_add(self.steps).min(self.series.len())
    }
}

/// Per-step summary of original against optimized purchases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub original_cost: f64,
    pub optimized_cost: f64,
    pub cost_savings: f64,
    pub cost_savings_percent: f64,
}

impl CostSummary {
    pub fn new(original_cost: f64, optimized_cost: f64) -> Self {
        let cost_savings = original_cost - optimized_cost;
        let cost_savings_percent = if original_cost > 0.0 {
            cost_savings / original_cost * 100.0
        } else {
            0.0
        };
        Self {
            original_cost,
            optimized_cost,
            cost_savings,
            cost_savings_percent,
        }
    }
}

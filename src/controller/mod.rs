//! Moving horizon control
//!
//! Prices arrive incrementally, so the series is optimized as a sequence of
//! rolls. Each roll solves the lookahead window that prices are known for,
//! but only commits the transfers that touch its control period. Committed
//! transfers become fixed history for every later roll and are never
//! re-optimized, which keeps the stitched matrix feasible and conserving over
//! the whole series.

pub mod ledger;

use serde::{Deserialize, Serialize};
use std::ops::Range;
use strum::Display;
use tracing::{debug, info, warn};

pub use ledger::{CommitLedger, CommitRecord};

use crate::domain::{CostSummary, SeriesProvider, ShiftWindow, TransferEntry, TransferMatrix};
use crate::error::{OptimizerError, Result};
use crate::optimizer::SingleHorizonOptimizer;

/// How the time index is cut into control periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlan {
    /// Steps committed per roll.
    pub period: usize,
    /// Length of the first control period, when it differs from `period`.
    #[serde(default)]
    pub first_period: Option<usize>,
}

impl ControlPlan {
    pub fn new(period: usize) -> Result<Self> {
        let plan = Self {
            period,
            first_period: None,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Decisions once per day at `decision_step` (0-based step of the day).
    /// Steps before the first decision form a shorter initial period.
    pub fn daily(steps_per_day: usize, decision_step: usize) -> Result<Self> {
        if decision_step >= steps_per_day {
            return Err(OptimizerError::config(format!(
                "decision step {decision_step} outside day of {steps_per_day} steps"
            )));
        }
        let plan = Self {
            period: steps_per_day,
            first_period: (decision_step > 0).then_some(decision_step),
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.period == 0 || self.first_period == Some(0) {
            return Err(OptimizerError::config("control period must be at least one step"));
        }
        Ok(())
    }

    fn period_len(&self, roll: usize) -> usize {
        match (roll, self.first_period) {
            (0, Some(first)) => first,
            _ => self.period,
        }
    }
}

/// Controller lifecycle. Transitions only move forward; `Done` and `Failed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum RollPhase {
    Idle,
    RollScheduled,
    Solving,
    Committing,
    Done,
    Failed,
}

impl RollPhase {
    fn can_advance_to(self, next: RollPhase) -> bool {
        use RollPhase::*;
        matches!(
            (self, next),
            (Idle, RollScheduled)
                | (Idle, Done)
                | (RollScheduled, Solving)
                | (Solving, Committing)
                | (Committing, RollScheduled)
                | (Committing, Done)
                | (RollScheduled | Solving | Committing, Failed)
        )
    }
}

/// What one roll did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollReport {
    pub roll: usize,
    pub period: Range<usize>,
    pub lookahead: Range<usize>,
    /// Committed entries handed to the solve as fixed history.
    pub history: usize,
    /// Entries committed by this roll.
    pub committed: usize,
    /// Cost of the whole lookahead window as planned by this roll.
    pub window_cost: f64,
    /// Final cost of every period committed so far.
    pub cumulative_cost: f64,
}

/// Read-only view of what has been committed so far.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HorizonSnapshot {
    pub phase: RollPhase,
    pub committed_through: usize,
    pub transfers: TransferMatrix,
    /// Net demand of the committed periods, `0..committed_through`.
    pub net_demand: Vec<f64>,
    pub cumulative_cost: f64,
}

/// Stitched result of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HorizonResult {
    pub transfers: TransferMatrix,
    pub net_demand: Vec<f64>,
    pub shift: Vec<f64>,
    pub summary: CostSummary,
    pub rolls: Vec<RollReport>,
}

pub struct MovingHorizonController<P: SeriesProvider> {
    provider: P,
    window: ShiftWindow,
    plan: ControlPlan,
    optimizer: SingleHorizonOptimizer,
    ledger: CommitLedger,
    phase: RollPhase,
    roll: usize,
    next_start: usize,
    lookahead_end: usize,
    cumulative_cost: f64,
    reports: Vec<RollReport>,
}

impl<P: SeriesProvider> std::fmt::Debug for MovingHorizonController<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MovingHorizonController")
            .field("phase", &self.phase)
            .field("roll", &self.roll)
            .field("next_start", &self.next_start)
            .field("plan", &self.plan)
            .finish()
    }
}

impl<P: SeriesProvider> MovingHorizonController<P> {
    pub fn new(
        provider: P,
        window: ShiftWindow,
        plan: ControlPlan,
        optimizer: SingleHorizonOptimizer,
    ) -> Result<Self> {
        plan.validate()?;
        optimizer.options().validate()?;
        let len = provider.series().len();
        if window.len() != len {
            return Err(OptimizerError::config(format!(
                "shift window covers {} steps but series has {}",
                window.len(),
                len
            )));
        }

        Ok(Self {
            provider,
            window,
            plan,
            optimizer,
            ledger: CommitLedger::new(),
            phase: RollPhase::Idle,
            roll: 0,
            next_start: 0,
            lookahead_end: 0,
            cumulative_cost: 0.0,
            reports: Vec::new(),
        })
    }

    pub fn phase(&self) -> RollPhase {
        self.phase
    }

    pub fn ledger(&self) -> &CommitLedger {
        &self.ledger
    }

    pub fn reports(&self) -> &[RollReport] {
        &self.reports
    }

    fn advance(&mut self, next: RollPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal transition {} -> {}",
            self.phase,
            next
        );
        debug!(from = %self.phase, to = %next, roll = self.roll, "controller transition");
        self.phase = next;
    }

    fn fail(&mut self, error: OptimizerError) -> OptimizerError {
        warn!(roll = self.roll, error = %error, kind = error.kind(), "roll failed, controller halted");
        self.advance(RollPhase::Failed);
        error
    }

    /// Runs one roll. Returns `Ok(None)` once the series is covered.
    ///
    /// On error nothing from the roll is committed and the controller stays
    /// in `Failed`; the caller has to start over with a fixed configuration.
    pub fn step(&mut self) -> Result<Option<RollReport>> {
        match self.phase {
            RollPhase::Done => return Ok(None),
            RollPhase::Failed => {
                return Err(OptimizerError::config(
                    "controller halted after a failed roll",
                ))
            }
            _ => {}
        }

        let series = self.provider.series();
        let len = series.len();
        if self.next_start >= len {
            self.advance(RollPhase::Done);
            return Ok(None);
        }
        if self.phase == RollPhase::Idle {
            self.advance(RollPhase::RollScheduled);
        }

        let start = self.next_start;
        let period = start..(start + self.plan.period_len(self.roll)).min(len);
        let known = self.provider.price_known_through(start).min(len);
        if known < period.end {
            let err = OptimizerError::config(format!(
                "prices known through step {known} do not cover control period {}..{}",
                period.start, period.end
            ));
            return Err(self.fail(err));
        }
        // never look less far than the previous roll did
        let lookahead = start..known.max(self.lookahead_end).max(period.end).min(len);
        let history = self.ledger.touching(lookahead.clone());

        self.advance(RollPhase::Solving);
        let solution = match self.optimizer.optimize(
            self.provider.series(),
            &self.window,
            lookahead.clone(),
            &history,
        ) {
            Ok(solution) => solution,
            Err(e) => return Err(self.fail(e)),
        };

        self.advance(RollPhase::Committing);
        let entries: Vec<TransferEntry> = solution
            .transfers
            .entries()
            .filter(|e| period.contains(&e.origin) || period.contains(&e.destination))
            .collect();
        let committed = entries.len();
        let record = CommitRecord {
            roll: self.roll,
            period: period.clone(),
            entries,
        };
        if let Err(e) = self.ledger.append(record) {
            return Err(self.fail(e));
        }

        // every transfer touching this period is now committed, so its net
        // demand is final
        let period_cost = self.period_cost(period.clone());
        self.cumulative_cost += period_cost;

        let report = RollReport {
            roll: self.roll,
            period: period.clone(),
            lookahead: lookahead.clone(),
            history: history.len(),
            committed,
            window_cost: solution.cost,
            cumulative_cost: self.cumulative_cost,
        };
        info!(
            roll = self.roll,
            period_start = period.start,
            period_end = period.end,
            lookahead_end = lookahead.end,
            history = history.len(),
            committed,
            period_cost,
            cumulative_cost = self.cumulative_cost,
            "roll committed"
        );
        self.reports.push(report.clone());

        self.roll += 1;
        self.next_start = period.end;
        self.lookahead_end = lookahead.end;
        if self.next_start >= len {
            self.advance(RollPhase::Done);
        } else {
            self.advance(RollPhase::RollScheduled);
        }

        Ok(Some(report))
    }

    fn period_cost(&self, period: Range<usize>) -> f64 {
        let series = self.provider.series();
        let mut net: Vec<f64> = series.demand()[period.clone()].to_vec();
        for entry in self.ledger.touching(period.clone()) {
            if period.contains(&entry.origin) {
                net[entry.origin - period.start] -= entry.amount;
            }
            if period.contains(&entry.destination) {
                net[entry.destination - period.start] += entry.amount;
            }
        }
        net.iter()
            .zip(&series.price()[period])
            .map(|(n, p)| n * p)
            .sum()
    }

    /// Committed state after the last successful roll.
    pub fn snapshot(&self) -> HorizonSnapshot {
        let committed_through = self.ledger.committed_through();
        let transfers = self.ledger.matrix();
        let net_demand = transfers.net_demand(&self.provider.series().demand()[..committed_through]);
        HorizonSnapshot {
            phase: self.phase,
            committed_through,
            transfers,
            net_demand,
            cumulative_cost: self.cumulative_cost,
        }
    }

    /// Rolls until the series is covered.
    pub fn run(mut self) -> Result<HorizonResult> {
        while self.step()?.is_some() {}
        Ok(self.into_result())
    }

    fn into_result(self) -> HorizonResult {
        let series = self.provider.series();
        let transfers = self.ledger.matrix();
        let net_demand = transfers.net_demand(series.demand());
        let shift = transfers.shift(series.demand());
        let summary = CostSummary::new(series.original_cost(), series.cost_of(&net_demand));
        HorizonResult {
            transfers,
            net_demand,
            shift,
            summary,
            rolls: self.reports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FixedLookahead, InputSeries};
    use crate::optimizer::{
        LinearProgram, LpSolution, LpSolver, MinilpSolver, ModelOptions, SolveFailure,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Delegates to minilp until the given call, then fails.
    struct FailingOnCall {
        fail_on: usize,
        calls: AtomicUsize,
    }

    impl LpSolver for FailingOnCall {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn solve(&self, problem: &LinearProgram) -> std::result::Result<LpSolution, SolveFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.fail_on {
                Err(SolveFailure::Failed("injected".to_string()))
            } else {
                MinilpSolver.solve(problem)
            }
        }
    }

    fn optimizer() -> SingleHorizonOptimizer {
        SingleHorizonOptimizer::new(Arc::new(MinilpSolver), ModelOptions::default())
    }

    fn daily_series(days: usize) -> InputSeries {
        let hours = days * 24;
        let price = (0..hours)
            .map(|h| if (h % 24) < 6 { 1.0 } else if (h % 24) < 18 { 4.0 } else { 2.0 })
            .collect();
        InputSeries::with_uniform_power_limit(vec![3.0; hours], price, 8.0).unwrap()
    }

    #[test]
    fn test_plan_lengths() {
        let plan = ControlPlan::daily(24, 12).unwrap();
        assert_eq!(plan.period_len(0), 12);
        assert_eq!(plan.period_len(1), 24);

        let plan = ControlPlan::daily(24, 0).unwrap();
        assert_eq!(plan.period_len(0), 24);

        assert!(ControlPlan::daily(24, 24).is_err());
        assert!(ControlPlan::new(0).is_err());
    }

    #[test]
    fn test_phase_transitions_forward_only() {
        assert!(RollPhase::Idle.can_advance_to(RollPhase::RollScheduled));
        assert!(RollPhase::Committing.can_advance_to(RollPhase::RollScheduled));
        assert!(!RollPhase::Committing.can_advance_to(RollPhase::Solving));
        assert!(!RollPhase::Done.can_advance_to(RollPhase::RollScheduled));
        assert!(!RollPhase::Failed.can_advance_to(RollPhase::Idle));
    }

    #[test]
    fn test_steps_through_series() {
        let feed = FixedLookahead::new(daily_series(3), 36).unwrap();
        let window = ShiftWindow::uniform(72, 6, 6).unwrap();
        let mut controller =
            MovingHorizonController::new(feed, window, ControlPlan::new(24).unwrap(), optimizer()).unwrap();

        assert_eq!(controller.phase(), RollPhase::Idle);
        let first = controller.step().unwrap().unwrap();
        assert_eq!(first.period, 0..24);
        assert_eq!(first.lookahead, 0..36);
        assert_eq!(controller.phase(), RollPhase::RollScheduled);

        let second = controller.step().unwrap().unwrap();
        assert_eq!(second.lookahead, 24..60);
        let third = controller.step().unwrap().unwrap();
        assert_eq!(third.lookahead, 48..72);

        assert_eq!(controller.phase(), RollPhase::Done);
        assert!(controller.step().unwrap().is_none());

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.committed_through, 72);
        let total: f64 = snapshot.net_demand.iter().sum();
        assert!((total - 216.0).abs() < 1e-6);
    }

    #[test]
    fn test_history_carried_into_next_roll() {
        let feed = FixedLookahead::new(daily_series(2), 36).unwrap();
        let window = ShiftWindow::uniform(48, 8, 8).unwrap();
        let mut controller =
            MovingHorizonController::new(feed, window, ControlPlan::new(24).unwrap(), optimizer()).unwrap();

        controller.step().unwrap();
        let crossing = controller
            .ledger()
            .entries()
            .iter()
            .filter(|e| e.origin >= 24 || e.destination >= 24)
            .count();
        let second = controller.step().unwrap().unwrap();

        assert_eq!(second.history, crossing);
        assert!(crossing > 0, "cheap night hours should attract spillover");
    }

    #[test]
    fn test_failed_roll_commits_nothing() {
        let feed = FixedLookahead::new(daily_series(3), 36).unwrap();
        let window = ShiftWindow::uniform(72, 6, 6).unwrap();
        let solver = FailingOnCall {
            fail_on: 1,
            calls: AtomicUsize::new(0),
        };
        let optimizer = SingleHorizonOptimizer::new(Arc::new(solver), ModelOptions::default());
        let mut controller =
            MovingHorizonController::new(feed, window, ControlPlan::new(24).unwrap(), optimizer).unwrap();

        controller.step().unwrap();
        let before = controller.snapshot();

        let err = controller.step().unwrap_err();
        assert!(matches!(err, OptimizerError::Solver(_)));
        assert_eq!(controller.phase(), RollPhase::Failed);

        let after = controller.snapshot();
        assert_eq!(after.transfers, before.transfers);
        assert_eq!(after.committed_through, 24);
        assert_eq!(controller.ledger().records().len(), 1);
        assert!(controller.step().is_err());
    }

    #[test]
    fn test_unknown_prices_for_period_rejected() {
        let feed = FixedLookahead::new(daily_series(2), 12).unwrap();
        let window = ShiftWindow::uniform(48, 2, 2).unwrap();
        let mut controller =
            MovingHorizonController::new(feed, window, ControlPlan::new(24).unwrap(), optimizer()).unwrap();

        let err = controller.step().unwrap_err();
        assert!(matches!(err, OptimizerError::Configuration(_)));
        assert!(controller.ledger().is_empty());
    }

    #[test]
    fn test_window_length_mismatch_rejected() {
        let err = MovingHorizonController::new(
            daily_series(1),
            ShiftWindow::rigid(10),
            ControlPlan::new(24).unwrap(),
            optimizer(),
        )
        .unwrap_err();
        assert!(matches!(err, OptimizerError::Configuration(_)));
    }
}

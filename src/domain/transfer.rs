use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{InputSeries, ShiftWindow};

/// Amounts below this are treated as solver round-off and dropped.
pub const AMOUNT_EPSILON: f64 = 1e-9;

/// Energy demanded at `origin` and purchased at `destination`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferEntry {
    pub origin: usize,
    pub destination: usize,
    pub amount: f64,
}

impl TransferEntry {
    pub fn new(origin: usize, destination: usize, amount: f64) -> Self {
        Self {
            origin,
            destination,
            amount,
        }
    }
}

/// Sparse transfer matrix keyed by absolute `(origin, destination)`.
///
/// Only permitted, non-zero pairs are stored; iteration order is by origin
/// then destination, which keeps every derived series deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferMatrix {
    #[serde(with = "entry_list")]
    entries: BTreeMap<(usize, usize), f64>,
}

impl TransferMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `amount` to the pair, ignoring round-off sized amounts.
    pub fn add(&mut self, origin: usize, destination: usize, amount: f64) {
        if amount <= AMOUNT_EPSILON {
            return;
        }
        *self.entries.entry((origin, destination)).or_insert(0.0) += amount;
    }

    pub fn get(&self, origin: usize, destination: usize) -> f64 {
        self.entries
            .get(&(origin, destination))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = TransferEntry> + '_ {
        self.entries
            .iter()
            .map(|(&(origin, destination), &amount)| TransferEntry::new(origin, destination, amount))
    }

    /// Energy moved away from `origin`.
    pub fn row_sum(&self, origin: usize) -> f64 {
        self.entries
            .range((origin, 0)..=(origin, usize::MAX))
            .map(|(_, amount)| amount)
            .sum()
    }

    /// Energy moved into `destination`.
    pub fn col_sum(&self, destination: usize) -> f64 {
        self.entries
            .iter()
            .filter(|((_, j), _)| *j == destination)
            .map(|(_, amount)| amount)
            .sum()
    }

    pub fn total_transferred(&self) -> f64 {
        self.entries.values().sum()
    }

    /// `N[t] = D[t] - RowSum(t) + ColSum(t)` over the length of `demand`.
    /// Entries pointing outside the series are ignored.
    pub fn net_demand(&self, demand: &[f64]) -> Vec<f64> {
        let mut net = demand.to_vec();
        for (&(i, j), &amount) in &self.entries {
            if let Some(n) = net.get_mut(i) {
                *n -= amount;
            }
            if let Some(n) = net.get_mut(j) {
                *n += amount;
            }
        }
        net
    }

    /// `N[t] - D[t]`: positive where energy is added, negative where removed.
    pub fn shift(&self, demand: &[f64]) -> Vec<f64> {
        self.net_demand(demand)
            .iter()
            .zip(demand)
            .map(|(n, d)| n - d)
            .collect()
    }

    pub fn merge(&mut self, other: &TransferMatrix) {
        for entry in other.entries() {
            self.add(entry.origin, entry.destination, entry.amount);
        }
    }

    /// Checks the matrix invariants against a series and window, returning the
    /// first violation found.
    pub fn check_invariants(
        &self,
        series: &InputSeries,
        window: &ShiftWindow,
        tolerance: f64,
    ) -> Result<(), String> {
        for entry in self.entries() {
            if entry.amount < -tolerance {
                return Err(format!(
                    "negative transfer {} at ({}, {})",
                    entry.amount, entry.origin, entry.destination
                ));
            }
            if !window.permits(entry.origin, entry.destination) {
                return Err(format!(
                    "transfer ({}, {}) not permitted by shift window",
                    entry.origin, entry.destination
                ));
            }
        }

        let demand = series.demand();
        let mut rows = vec![0.0; demand.len()];
        for entry in self.entries() {
            match rows.get_mut(entry.origin) {
                Some(row) => *row += entry.amount,
                None => return Err(format!("origin {} outside series", entry.origin)),
            }
        }
        for (t, (row, d)) in rows.iter().zip(demand).enumerate() {
            if *row > d + tolerance {
                return Err(format!("row sum {row} exceeds demand {d} at step {t}"));
            }
        }

        let net = self.net_demand(demand);
        for (t, (n, limit)) in net.iter().zip(series.power_limit()).enumerate() {
            if *n > limit + tolerance {
                return Err(format!("net demand {n} exceeds power limit {limit} at step {t}"));
            }
        }

        let balance: f64 = net.iter().sum::<f64>() - series.total_demand();
        if balance.abs() > tolerance * demand.len().max(1) as f64 {
            return Err(format!("energy balance off by {balance}"));
        }

        Ok(())
    }
}

impl FromIterator<TransferEntry> for TransferMatrix {
    fn from_iter<I: IntoIterator<Item = TransferEntry>>(iter: I) -> Self {
        let mut matrix = TransferMatrix::new();
        for entry in iter {
            matrix.add(entry.origin, entry.destination, entry.amount);
        }
        matrix
    }
}

/// Serializes the sparse map as a list of entries; JSON keys cannot be tuples.
mod entry_list {
    use super::TransferEntry;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        entries: &BTreeMap<(usize, usize), f64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        entries
            .iter()
            .map(|(&(origin, destination), &amount)| TransferEntry::new(origin, destination, amount))
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<(usize, usize), f64>, D::Error> {
        let list = Vec::<TransferEntry>::deserialize(deserializer)?;
        Ok(list
            .into_iter()
            .map(|e| ((e.origin, e.destination), e.amount))
            .collect())
    }
}

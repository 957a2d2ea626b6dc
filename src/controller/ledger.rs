use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Range;

use crate::domain::{TransferEntry, TransferMatrix};
use crate::error::{OptimizerError, Result};

/// Entries committed by one roll. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitRecord {
    pub roll: usize,
    pub period: Range<usize>,
    pub entries: Vec<TransferEntry>,
}

/// Append-only history of committed transfers.
///
/// Entries are indexed by origin and by destination so that the history
/// touching a lookahead window can be collected without scanning the whole
/// ledger.
#[derive(Debug, Clone, Default)]
pub struct CommitLedger {
    records: Vec<CommitRecord>,
    entries: Vec<TransferEntry>,
    by_origin: BTreeMap<usize, Vec<usize>>,
    by_destination: BTreeMap<usize, Vec<usize>>,
}

impl CommitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a roll's commit. Nothing is written unless the whole record is
    /// accepted: periods must advance and no pair may be committed twice.
    pub fn append(&mut self, record: CommitRecord) -> Result<()> {
        let committed_through = self.committed_through();
        if record.period.start < committed_through || record.period.is_empty() {
            return Err(OptimizerError::config(format!(
                "roll {} period {}..{} does not advance past {}",
                record.roll, record.period.start, record.period.end, committed_through
            )));
        }

        for (k, entry) in record.entries.iter().enumerate() {
            let reopened = self.contains_pair(entry.origin, entry.destination)
                || record.entries[..k]
                    .iter()
                    .any(|e| e.origin == entry.origin && e.destination == entry.destination);
            if reopened {
                return Err(OptimizerError::config(format!(
                    "transfer ({}, {}) is already committed",
                    entry.origin, entry.destination
                )));
            }
        }

        for entry in &record.entries {
            let idx = self.entries.len();
            self.entries.push(*entry);
            self.by_origin.entry(entry.origin).or_default().push(idx);
            self.by_destination
                .entry(entry.destination)
                .or_default()
                .push(idx);
        }
        self.records.push(record);
        Ok(())
    }

    fn contains_pair(&self, origin: usize, destination: usize) -> bool {
        self.by_origin
            .get(&origin)
            .is_some_and(|ids| ids.iter().any(|&i| self.entries[i].destination == destination))
    }

    /// Every committed entry with origin or destination in `range`, once each,
    /// in commit order.
    pub fn touching(&self, range: Range<usize>) -> Vec<TransferEntry> {
        let mut ids: Vec<usize> = self
            .by_origin
            .range(range.clone())
            .chain(self.by_destination.range(range))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter().map(|i| self.entries[i]).collect()
    }

    /// End of the last committed control period.
    pub fn committed_through(&self) -> usize {
        self.records.last().map(|r| r.period.end).unwrap_or(0)
    }

    pub fn records(&self) -> &[CommitRecord] {
        &self.records
    }

    pub fn entries(&self) -> &[TransferEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The stitched matrix over absolute time.
    pub fn matrix(&self) -> TransferMatrix {
        self.entries.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(roll: usize, period: Range<usize>, entries: &[(usize, usize, f64)]) -> CommitRecord {
        CommitRecord {
            roll,
            period,
            entries: entries
                .iter()
                .map(|&(i, j, a)| TransferEntry::new(i, j, a))
                .collect(),
        }
    }

    #[test]
    fn test_touching_collects_both_directions_once() {
        let mut ledger = CommitLedger::new();
        ledger
            .append(record(0, 0..4, &[(1, 5, 2.0), (6, 3, 1.0), (2, 3, 4.0)]))
            .unwrap();

        let touching = ledger.touching(4..8);
        assert_eq!(
            touching,
            vec![TransferEntry::new(1, 5, 2.0), TransferEntry::new(6, 3, 1.0)]
        );
        assert!(ledger.touching(8..12).is_empty());
        assert_eq!(ledger.committed_through(), 4);
    }

    #[test]
    fn test_reopening_rejected_without_partial_write() {
        let mut ledger = CommitLedger::new();
        ledger.append(record(0, 0..4, &[(1, 5, 2.0)])).unwrap();

        let err = ledger
            .append(record(1, 4..8, &[(4, 6, 1.0), (1, 5, 1.0)]))
            .unwrap_err();
        assert!(matches!(err, OptimizerError::Configuration(_)));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.records().len(), 1);
    }

    #[test]
    fn test_periods_must_advance() {
        let mut ledger = CommitLedger::new();
        ledger.append(record(0, 0..4, &[])).unwrap();

        assert!(ledger.append(record(1, 2..6, &[])).is_err());
        assert!(ledger.append(record(1, 4..4, &[])).is_err());
        assert!(ledger.append(record(1, 4..6, &[])).is_ok());
    }

    #[test]
    fn test_matrix_stitches_records() {
        let mut ledger = CommitLedger::new();
        ledger.append(record(0, 0..2, &[(0, 2, 1.5)])).unwrap();
        ledger.append(record(1, 2..4, &[(3, 2, 0.5)])).unwrap();

        let matrix = ledger.matrix();
        assert_eq!(matrix.len(), 2);
        assert_eq!(matrix.col_sum(2), 2.0);
    }
}

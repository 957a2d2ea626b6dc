use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::{OptimizerError, Result};

/// Per-step bounds on how far demand may be moved.
///
/// For origin `i` the permitted destinations are `[i - backward(i), i + forward(i)]`
/// clipped to the time index, excluding `i` itself. Energy that stays at its origin
/// is implicit (`D[i] - RowSum(i)`), so `(i, i)` is never a transfer.
///
/// Limits are stored already clipped to the index boundaries, which keeps
/// `destinations` allocation-free and O(window) per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftWindow {
    forward: Vec<usize>,
    backward: Vec<usize>,
}

impl ShiftWindow {
    /// Same limits for every step.
    pub fn uniform(len: usize, forward: i64, backward: i64) -> Result<Self> {
        let forward = non_negative("forward", 0, forward)?;
        let backward = non_negative("backward", 0, backward)?;
        Ok(Self::clipped(vec![forward; len], vec![backward; len]))
    }

    /// Individual limits per step. Both arrays must cover the same time index.
    pub fn per_step(forward: &[i64], backward: &[i64]) -> Result<Self> {
        if forward.len() != backward.len() {
            return Err(OptimizerError::config(format!(
                "forward limits ({}) and backward limits ({}) differ in length",
                forward.len(),
                backward.len()
            )));
        }

        let forward = forward
            .iter()
            .enumerate()
            .map(|(i, &v)| non_negative("forward", i, v))
            .collect::<Result<Vec<_>>>()?;
        let backward = backward
            .iter()
            .enumerate()
            .map(|(i, &v)| non_negative("backward", i, v))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::clipped(forward, backward))
    }

    /// A window that permits no movement at all.
    pub fn rigid(len: usize) -> Self {
        Self {
            forward: vec![0; len],
            backward: vec![0; len],
        }
    }

    fn clipped(mut forward: Vec<usize>, mut backward: Vec<usize>) -> Self {
        let len = forward.len();
        for i in 0..len {
            forward[i] = forward[i].min(len - 1 - i);
            backward[i] = backward[i].min(i);
        }
        Self { forward, backward }
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn forward(&self, origin: usize) -> usize {
        self.forward.get(origin).copied().unwrap_or(0)
    }

    pub fn backward(&self, origin: usize) -> usize {
        self.backward.get(origin).copied().unwrap_or(0)
    }

    /// Whether energy demanded at `origin` may be purchased at `destination`.
    pub fn permits(&self, origin: usize, destination: usize) -> bool {
        if origin >= self.len() || destination >= self.len() || origin == destination {
            return false;
        }
        if destination > origin {
            destination - origin <= self.forward[origin]
        } else {
            origin - destination <= self.backward[origin]
        }
    }

    /// Permitted destinations for `origin` in ascending order.
    pub fn destinations(&self, origin: usize) -> impl Iterator<Item = usize> {
        let (lo, hi) = if origin < self.len() {
            (origin - self.backward[origin], origin + self.forward[origin])
        } else {
            (1, 0)
        };
        (lo..=hi).filter(move |&j| j != origin)
    }

    /// Number of permitted `(origin, destination)` pairs.
    pub fn pair_count(&self) -> usize {
        self.forward
            .iter()
            .zip(&self.backward)
            .map(|(f, b)| f + b)
            .sum()
    }

    /// True when no step may move anywhere.
    pub fn is_rigid(&self) -> bool {
        self.pair_count() == 0
    }

    /// The window seen from inside `range`, re-indexed so `range.start` is step 0.
    /// Destinations outside the range are dropped.
    pub fn restrict(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.len() {
            return Err(OptimizerError::config(format!(
                "window range {}..{} outside time index of length {}",
                range.start,
                range.end,
                self.len()
            )));
        }
        Ok(Self::clipped(
            self.forward[range.clone()].to_vec(),
            self.backward[range].to_vec(),
        ))
    }
}

fn non_negative(direction: &str, step: usize, value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        OptimizerError::config(format!(
            "{direction} shift limit at step {step} is negative ({value})"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_clips_at_boundaries() {
        let window = ShiftWindow::uniform(5, 2, 1).unwrap();

        assert_eq!(window.destinations(0).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(window.destinations(2).collect::<Vec<_>>(), vec![1, 3, 4]);
        assert_eq!(window.destinations(4).collect::<Vec<_>>(), vec![3]);
        assert!(!window.permits(0, 4));
        assert!(!window.permits(2, 2));
        assert!(window.permits(3, 2));
    }

    #[test]
    fn test_per_step_limits() {
        let window = ShiftWindow::per_step(&[3, 0, 0, 0], &[0, 0, 0, 0]).unwrap();

        assert_eq!(window.destinations(0).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(window.destinations(1).count(), 0);
        assert_eq!(window.pair_count(), 3);
        assert!(!window.is_rigid());
    }

    #[test]
    fn test_negative_limit_rejected() {
        let err = ShiftWindow::uniform(4, -1, 0).unwrap_err();
        assert!(matches!(err, OptimizerError::Configuration(_)));

        let err = ShiftWindow::per_step(&[1, 1], &[0, -2]).unwrap_err();
        assert!(err.to_string().contains("step 1"));
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let err = ShiftWindow::per_step(&[1, 1, 1], &[1, 1]).unwrap_err();
        assert!(matches!(err, OptimizerError::Configuration(_)));
    }

    #[test]
    fn test_out_of_range_origin_has_no_destinations() {
        let window = ShiftWindow::uniform(3, 1, 1).unwrap();
        assert_eq!(window.destinations(7).count(), 0);
        assert!(!window.permits(7, 2));
    }

    #[test]
    fn test_restrict_reindexes_and_clips() {
        let window = ShiftWindow::uniform(10, 3, 2).unwrap();
        let local = window.restrict(4..7).unwrap();

        assert_eq!(local.len(), 3);
        assert_eq!(local.destinations(0).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(local.destinations(2).collect::<Vec<_>>(), vec![0, 1]);
        assert!(window.restrict(8..12).is_err());
    }

    #[test]
    fn test_rigid_window() {
        let window = ShiftWindow::rigid(4);
        assert!(window.is_rigid());
        assert!((0..4).all(|i| window.destinations(i).next().is_none()));
    }
}

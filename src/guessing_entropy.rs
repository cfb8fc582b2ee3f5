//! Guessing entropy of a key byte attack.
//!
//! Tracks, batch after batch, the rank of the correct guess among all the guesses sorted by
//! decreasing peak correlation.
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::{distinguishers::cpa::Cpa, util::argmax_by};

/// Return the rank of `guess` given the peak value of every guess, 0 being the highest peak.
///
/// This is the position of the peak of `guess` once the peaks are sorted in descending order,
/// taking the first position on ties, i.e. the number of guesses with a strictly higher peak.
///
/// # Panics
/// Panic if `guess` is out of bounds.
pub fn rank(max_corr: ArrayView1<f64>, guess: usize) -> usize {
    let peak = max_corr[guess];

    max_corr.iter().filter(|&&x| x > peak).count()
}

/// Return, for each row, the signed coefficient with the highest absolute value.
///
/// On ties, the first sample is taken.
pub fn peaks(corr: ArrayView2<f64>) -> Array1<f64> {
    corr.axis_iter(Axis(0))
        .map(|row| row[argmax_by(row.mapv(f64::abs).view(), f64::total_cmp)])
        .collect()
}

/// State of a key byte attack after one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Number of traces consumed so far
    pub num_traces: usize,
    /// Maximum absolute correlation per guess
    pub max_corr: Array1<f64>,
    /// Signed correlation at the peak of each guess
    pub peaks: Array1<f64>,
    /// Guess with the highest peak
    pub best_guess: usize,
    /// Rank of the correct guess, when known
    pub rank: Option<usize>,
}

/// Records the progress of a key byte attack, one entry per processed batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankTracker {
    /// Correct key byte, if known
    correct_guess: Option<usize>,
    records: Vec<BatchRecord>,
}

impl RankTracker {
    /// Create a tracker. Without the correct guess, only peaks and best guesses are recorded.
    pub fn new(correct_guess: Option<usize>) -> Self {
        Self {
            correct_guess,
            records: Vec::new(),
        }
    }

    /// Record the correlation obtained after a batch.
    pub fn record(&mut self, cpa: &Cpa) -> &BatchRecord {
        let max_corr = cpa.max_corr();
        let record = BatchRecord {
            num_traces: cpa.num_traces(),
            peaks: cpa.peaks(),
            best_guess: argmax_by(max_corr.view(), f64::total_cmp),
            rank: self.correct_guess.map(|guess| rank(max_corr.view(), guess)),
            max_corr,
        };
        self.records.push(record);

        &self.records[self.records.len() - 1]
    }

    pub fn correct_guess(&self) -> Option<usize> {
        self.correct_guess
    }

    pub fn records(&self) -> &[BatchRecord] {
        &self.records
    }

    /// Rank of the correct guess after each batch, if it is known.
    pub fn ranks(&self) -> Option<Vec<usize>> {
        self.records.iter().map(|record| record.rank).collect()
    }

    /// Rank of the correct guess after the last batch, if it is known.
    pub fn final_rank(&self) -> Option<usize> {
        self.records.last().and_then(|record| record.rank)
    }
}

#[cfg(test)]
mod tests {
    use super::{RankTracker, peaks, rank};
    use crate::distinguishers::cpa::Cpa;
    use ndarray::{Array1, array};

    #[test]
    fn test_rank_unique_extremes() {
        let mut max_corr = Array1::from_shape_fn(256, |i| 0.1 + i as f64 * 1e-3);
        max_corr[42] = 0.9;
        assert_eq!(rank(max_corr.view(), 42), 0);

        max_corr[42] = 0.01;
        assert_eq!(rank(max_corr.view(), 42), 255);
    }

    #[test]
    fn test_rank_ties() {
        let max_corr = array![0.5, 0.7, 0.5, 0.7, 0.1];
        assert_eq!(rank(max_corr.view(), 1), 0);
        assert_eq!(rank(max_corr.view(), 3), 0);
        assert_eq!(rank(max_corr.view(), 0), 2);
        assert_eq!(rank(max_corr.view(), 2), 2);
        assert_eq!(rank(max_corr.view(), 4), 4);
    }

    #[test]
    fn test_peaks_keep_sign() {
        let corr = array![[0.1, -0.8, 0.3], [0.2, 0.2, -0.2], [0.0, 0.0, 0.0]];
        assert_eq!(peaks(corr.view()), array![-0.8, 0.2, 0.0]);
    }

    #[test]
    fn test_tracker() {
        let mut tracker = RankTracker::new(Some(1));
        tracker.record(&Cpa {
            corr: array![[0.9, 0.1], [0.2, -0.5], [0.3, 0.0]],
            num_traces: 10,
        });
        let record = tracker.record(&Cpa {
            corr: array![[0.1, 0.1], [0.2, -0.9], [0.3, 0.0]],
            num_traces: 20,
        });
        assert_eq!(record.best_guess, 1);
        assert_eq!(record.peaks, array![0.1, -0.9, 0.3]);

        assert_eq!(tracker.ranks(), Some(vec![1, 0]));
        assert_eq!(tracker.final_rank(), Some(0));
        assert_eq!(tracker.records()[0].num_traces, 10);

        let mut tracker = RankTracker::new(None);
        tracker.record(&Cpa {
            corr: array![[0.9, 0.1], [0.2, -0.5]],
            num_traces: 10,
        });
        assert_eq!(tracker.ranks(), None);
        assert_eq!(tracker.records()[0].best_guess, 0);
    }
}

use itertools::izip;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use num_traits::AsPrimitive;
use rayon::iter::{ParallelBridge, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::{fs::File, ops::Add, path::Path};

use crate::{
    Error,
    guessing_entropy::{peaks, rank},
    leakage_model::rsm::{GUESS_RANGE, hypotheses},
    util::{argmax_by, max_abs_per_row},
};

/// Compute the [`Cpa`] of the given traces against the RSM leakage model of one key byte.
///
/// `plaintexts` and `offsets` hold the plaintext byte and offset nibble of the targeted state
/// byte for each trace. Batches are processed in parallel and merged.
///
/// # Examples
/// ```
/// use maskcpa::distinguishers::cpa::cpa;
/// use ndarray::array;
///
/// let traces = array![
///     [77i16, 137, 51, 91],
///     [72, 61, 91, 83],
///     [39, 49, 52, 23],
///     [26, 114, 63, 45],
///     [30, 8, 97, 91],
///     [13, 68, 7, 45],
///     [17, 181, 60, 34],
///     [43, 88, 76, 78],
///     [0, 36, 35, 0],
///     [93, 191, 49, 26],
/// ];
/// let plaintexts = array![1u8, 3, 1, 2, 3, 2, 2, 1, 3, 1];
/// let offsets = array![0u8, 4, 7, 15, 2, 2, 9, 11, 3, 0];
/// let cpa = cpa(traces.view(), plaintexts.view(), offsets.view(), 3).unwrap();
/// assert_eq!(cpa.corr().shape(), &[256, 4]);
/// ```
///
/// # Errors
/// - [`Error::InvalidInput`] if `traces`, `plaintexts` and `offsets` lengths differ, or if
///   `batch_size` is 0.
/// - [`Error::DegenerateInput`] if there is no trace or no sample.
pub fn cpa<T>(
    traces: ArrayView2<T>,
    plaintexts: ArrayView1<u8>,
    offsets: ArrayView1<u8>,
    batch_size: usize,
) -> Result<Cpa, Error>
where
    T: AsPrimitive<f64> + Sync,
{
    if traces.shape()[0] != plaintexts.len() || traces.shape()[0] != offsets.len() {
        return Err(Error::InvalidInput(format!(
            "{} traces for {} plaintexts and {} offsets",
            traces.shape()[0],
            plaintexts.len(),
            offsets.len()
        )));
    }
    if batch_size == 0 {
        return Err(Error::InvalidInput("batch size must be positive".to_string()));
    }

    // From benchmarks fold + reduce_with is faster than map + reduce/reduce_with and fold + reduce
    izip!(
        traces.axis_chunks_iter(Axis(0), batch_size),
        plaintexts.axis_chunks_iter(Axis(0), batch_size),
        offsets.axis_chunks_iter(Axis(0), batch_size),
    )
    .par_bridge()
    .try_fold(
        || CpaProcessor::new(traces.shape()[1], GUESS_RANGE),
        |mut cpa, (trace_batch, plaintext_batch, offset_batch)| {
            let values = hypotheses(plaintext_batch, offset_batch)?;
            cpa.update(trace_batch, values.view())?;

            Ok::<_, Error>(cpa)
        },
    )
    .try_reduce_with(|a, b| Ok(a + b))
    .ok_or_else(|| Error::DegenerateInput("no trace to process".to_string()))??
    .finalize()
}

/// Result of the CPA[^1] on some traces.
///
/// [^1]: <https://www.iacr.org/archive/ches2004/31560016/31560016.pdf>
#[derive(Debug, Clone)]
pub struct Cpa {
    /// Pearson correlation coefficients, one row per guess
    pub(crate) corr: Array2<f64>,
    /// Number of traces the coefficients were computed on
    pub(crate) num_traces: usize,
}

impl Cpa {
    /// Return the Pearson correlation coefficients.
    pub fn corr(&self) -> ArrayView2<f64> {
        self.corr.view()
    }

    /// Return the number of traces the correlation was computed on.
    pub fn num_traces(&self) -> usize {
        self.num_traces
    }

    /// Return the maximum absolute Pearson correlation coefficient for each guess.
    pub fn max_corr(&self) -> Array1<f64> {
        max_abs_per_row(self.corr.view())
    }

    /// Return, for each guess, the signed correlation coefficient at the sample where its
    /// absolute value peaks.
    pub fn peaks(&self) -> Array1<f64> {
        peaks(self.corr.view())
    }

    /// Return the guess with the highest absolute Pearson correlation coefficient.
    ///
    /// On ties, the lowest guess wins.
    pub fn best_guess(&self) -> usize {
        argmax_by(self.max_corr().view(), f64::total_cmp)
    }

    /// Return the sample index where the correlation of `guess` peaks.
    pub fn best_sample(&self, guess: usize) -> usize {
        argmax_by(self.corr.row(guess).mapv(f64::abs).view(), f64::total_cmp)
    }

    /// Return the rank of `guess`, 0 being the most likely.
    pub fn rank_of(&self, guess: usize) -> usize {
        rank(self.max_corr().view(), guess)
    }
}

/// A processor that computes the [`Cpa`] of the given traces batch by batch.
///
/// Each batch is centered on its own means, and its sums of products of deviations are merged
/// into the running ones along with the between-batch term
/// `n_a * n_b / (n_a + n_b) * (mean_b - mean_a)`, so that the correlation does not depend on the
/// batch size[^1]. The coefficients are those of the whole trace set, not the pooled
/// within-batch ones.
///
/// [^1]: <https://doi.org/10.1007/978-3-642-51461-6_3>
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpaProcessor {
    /// Number of samples per trace
    num_samples: usize,
    /// Guess range upper excluded bound
    guess_range: usize,
    /// Sum of modeled leakages per guess
    guess_sum: Array1<f64>,
    /// Sum of traces
    traces_sum: Array1<f64>,
    /// Sum of products of the deviations of modeled leakages and traces
    cov: Array2<f64>,
    /// Sum of squared deviations of modeled leakages per guess
    guess_sq_dev: Array1<f64>,
    /// Sum of squared deviations of traces
    traces_sq_dev: Array1<f64>,
    /// Number of traces processed
    num_traces: usize,
}

impl CpaProcessor {
    pub fn new(num_samples: usize, guess_range: usize) -> Self {
        Self {
            num_samples,
            guess_range,
            guess_sum: Array1::zeros(guess_range),
            traces_sum: Array1::zeros(num_samples),
            cov: Array2::zeros((guess_range, num_samples)),
            guess_sq_dev: Array1::zeros(guess_range),
            traces_sq_dev: Array1::zeros(num_samples),
            num_traces: 0,
        }
    }

    /// Update the accumulators with a batch of traces.
    ///
    /// `hypotheses` is the modeled leakage of each trace of the batch, with shape
    /// `(guess_range, trace_batch.shape()[0])`.
    ///
    /// # Errors
    /// - [`Error::InvalidInput`] if the batch shapes do not match the processor.
    /// - [`Error::DegenerateInput`] if the batch is empty.
    pub fn update<T>(
        &mut self,
        trace_batch: ArrayView2<T>,
        hypotheses: ArrayView2<f64>,
    ) -> Result<(), Error>
    where
        T: AsPrimitive<f64>,
    {
        if trace_batch.shape()[1] != self.num_samples {
            return Err(Error::InvalidInput(format!(
                "traces have {} samples, expected {}",
                trace_batch.shape()[1],
                self.num_samples
            )));
        }
        if hypotheses.shape() != [self.guess_range, trace_batch.shape()[0]] {
            return Err(Error::InvalidInput(format!(
                "hypotheses shape {:?} does not match {} guesses and {} traces",
                hypotheses.shape(),
                self.guess_range,
                trace_batch.shape()[0]
            )));
        }
        if trace_batch.shape()[0] == 0 {
            return Err(Error::DegenerateInput("empty trace batch".to_string()));
        }

        let batch = Self::from_batch(trace_batch.mapv(|x| x.as_()).view(), hypotheses);
        self.merge(batch);

        Ok(())
    }

    /// Build the accumulators of a single batch, centered on the batch means.
    fn from_batch(traces: ArrayView2<f64>, hypotheses: ArrayView2<f64>) -> Self {
        let num_traces = traces.shape()[0];

        let guess_sum = hypotheses.sum_axis(Axis(1));
        let traces_sum = traces.sum_axis(Axis(0));

        // x - x_bar
        let guess_dev = &hypotheses - &(&guess_sum / num_traces as f64).insert_axis(Axis(1));
        // y - y_bar
        let traces_dev = &traces - &(&traces_sum / num_traces as f64);

        Self {
            num_samples: traces.shape()[1],
            guess_range: hypotheses.shape()[0],
            guess_sum,
            traces_sum,
            // sum((x - x_bar)(y - y_bar))
            cov: guess_dev.dot(&traces_dev),
            // sum((x - x_bar)^2)
            guess_sq_dev: guess_dev.mapv(|x| x * x).sum_axis(Axis(1)),
            // sum((y - y_bar)^2)
            traces_sq_dev: traces_dev.mapv(|x| x * x).sum_axis(Axis(0)),
            num_traces,
        }
    }

    /// Merge the accumulators of `rhs` into `self`.
    fn merge(&mut self, rhs: Self) {
        if rhs.num_traces == 0 {
            return;
        }
        if self.num_traces == 0 {
            *self = rhs;
            return;
        }

        let n_a = self.num_traces as f64;
        let n_b = rhs.num_traces as f64;
        let weight = n_a * n_b / (n_a + n_b);

        let guess_delta = &rhs.guess_sum / n_b - &self.guess_sum / n_a;
        let traces_delta = &rhs.traces_sum / n_b - &self.traces_sum / n_a;

        self.cov += &rhs.cov;
        self.cov.scaled_add(
            weight,
            &guess_delta
                .view()
                .insert_axis(Axis(1))
                .dot(&traces_delta.view().insert_axis(Axis(0))),
        );
        self.guess_sq_dev += &rhs.guess_sq_dev;
        self.guess_sq_dev
            .scaled_add(weight, &guess_delta.mapv(|x| x * x));
        self.traces_sq_dev += &rhs.traces_sq_dev;
        self.traces_sq_dev
            .scaled_add(weight, &traces_delta.mapv(|x| x * x));

        self.guess_sum += &rhs.guess_sum;
        self.traces_sum += &rhs.traces_sum;
        self.num_traces += rhs.num_traces;
    }

    /// Compute the correlation of all the traces processed so far.
    ///
    /// Coefficients whose denominator is zero (constant samples or constant modeled leakages)
    /// are set to 0. A sum of squared deviations below `f64::EPSILON * sum^2` is the rounding
    /// residue of a constant input and counts as zero.
    ///
    /// # Errors
    /// Returns [`Error::DegenerateInput`] if traces have no sample or no trace was processed.
    pub fn finalize(&self) -> Result<Cpa, Error> {
        if self.num_samples == 0 {
            return Err(Error::DegenerateInput("traces have no sample".to_string()));
        }
        if self.num_traces == 0 {
            return Err(Error::DegenerateInput("no trace processed".to_string()));
        }

        let guess_sq_dev =
            flush_rounding_residue(self.guess_sq_dev.view(), self.guess_sum.view());
        let traces_sq_dev =
            flush_rounding_residue(self.traces_sq_dev.view(), self.traces_sum.view());

        let mut corr = Array2::zeros((self.guess_range, self.num_samples));
        for guess in 0..self.guess_range {
            for u in 0..self.num_samples {
                // sqrt(sum((x - x_bar)^2) * sum((y - y_bar)^2))
                let denominator = f64::sqrt(guess_sq_dev[guess] * traces_sq_dev[u]);
                if denominator != 0.0 {
                    corr[[guess, u]] = self.cov[[guess, u]] / denominator;
                }
            }
        }

        Ok(Cpa {
            corr,
            num_traces: self.num_traces,
        })
    }

    /// Return the number of traces processed.
    pub fn num_traces(&self) -> usize {
        self.num_traces
    }

    /// Return the number of samples per trace.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Determine if two [`CpaProcessor`] are compatible for addition.
    ///
    /// If they were created with the same parameters, they are compatible.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.num_samples == other.num_samples && self.guess_range == other.guess_range
    }

    /// Save the [`CpaProcessor`] to a file.
    ///
    /// # Warning
    /// The file format is not stable, it might change between versions.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = File::create(path)?;
        serde_json::to_writer(file, self)?;

        Ok(())
    }

    /// Load a [`CpaProcessor`] from a file.
    ///
    /// # Warning
    /// The file format is not stable, it might change between versions.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;
        let p: CpaProcessor = serde_json::from_reader(file)?;

        Ok(p)
    }
}

/// Zero the sums of squared deviations that are only made of rounding errors.
///
/// Merging batch means of a constant input leaves a residue of the order of
/// `n^4 * f64::EPSILON^2 * mean^2`, far below `f64::EPSILON * sum^2`.
fn flush_rounding_residue(sq_dev: ArrayView1<f64>, sum: ArrayView1<f64>) -> Array1<f64> {
    Zip::from(sq_dev)
        .and(sum)
        .map_collect(|&sq_dev, &sum| {
            if sq_dev <= f64::EPSILON * sum * sum {
                0.0
            } else {
                sq_dev
            }
        })
}

impl Add for CpaProcessor {
    type Output = Self;

    /// Merge computations of two [`CpaProcessor`]. Processors need to be compatible to be merged
    /// together, otherwise it can panic or yield incoherent result (see
    /// [`CpaProcessor::is_compatible_with`]).
    ///
    /// # Panics
    /// Panics in debug if the processors are not compatible.
    fn add(mut self, rhs: Self) -> Self::Output {
        debug_assert!(self.is_compatible_with(&rhs));

        self.merge(rhs);
        self
    }
}

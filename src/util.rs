//! Convenient utility functions.

use std::cmp::Ordering;

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

#[cfg(feature = "progress_bar")]
use indicatif::{ProgressBar, ProgressStyle};
#[cfg(feature = "progress_bar")]
use std::time::Duration;

/// Creates a [`ProgressBar`] with a predefined default style.
#[cfg(feature = "progress_bar")]
pub fn progress_bar(len: usize) -> ProgressBar {
    let progress_bar = ProgressBar::new(len as u64).with_style(
        ProgressStyle::with_template("{elapsed_precise} {wide_bar} {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    progress_bar.enable_steady_tick(Duration::new(0, 100000000));
    progress_bar
}

/// Return an array where the i-th element contains the maximum absolute value of the i-th row of
/// the input array.
pub fn max_abs_per_row(arr: ArrayView2<f64>) -> Array1<f64> {
    arr.axis_iter(Axis(0))
        .map(|row| row.iter().fold(0f64, |acc, &x| acc.max(x.abs())))
        .collect()
}

/// Return the index of the maximum value in the given array.
///
/// On ties, the lowest index is returned.
pub fn argmax_by<T, F>(array: ArrayView1<T>, compare: F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut idx_max = 0;

    for i in 0..array.shape()[0] {
        if compare(&array[i], &array[idx_max]).is_gt() {
            idx_max = i;
        }
    }

    idx_max
}

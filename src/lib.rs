//! Correlation Power Analysis of the masked AES-128 of the DPA contest v4.2.
//!
//! The [`attack`] module recovers the key byte by byte: the [`leakage_model`] predicts the
//! leakage of each key guess, [`distinguishers::cpa::CpaProcessor`] correlates it with the traces
//! batch after batch and [`guessing_entropy`] follows the rank of the correct guess.
pub mod attack;
pub mod distinguishers;
pub mod dpacontest;
pub mod error;
pub mod guessing_entropy;
pub mod leakage_model;
pub mod util;

pub use crate::error::Error;

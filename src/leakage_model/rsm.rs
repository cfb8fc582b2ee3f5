//! Leakage model of the Rotating S-box Masking (RSM) AES implementation of the DPA contest v4.2.
//!
//! Each trace comes with 16 offset nibbles. The S-box output of state byte `i` is masked with
//! `MASK[(offset[i] + 1) % 16]`, so the model predicts the Hamming weight of the masked S-box
//! output for every key guess.
//!
//! [^1]: <https://www.dpacontest.org/v4/rsm_doc.php>
use itertools::izip;
use ndarray::{Array2, ArrayView1, Axis};

use crate::{
    Error,
    leakage_model::{aes::sbox, hw},
};

/// Number of key guesses for one AES key byte.
pub const GUESS_RANGE: usize = 256;

/// RSM mask table.
pub static MASK: [u8; 16] = [
    0x03, 0x0c, 0x35, 0x3a, 0x50, 0x5f, 0x66, 0x69, 0x96, 0x99, 0xa0, 0xaf, 0xc5, 0xca, 0xf3, 0xfc,
];

/// Returns the mask applied to the S-box output of a state byte with the given offset nibble.
///
/// The `+ 1` accounts for the mask rotation between the offset given in the index file and the
/// S-box lookup being attacked.
///
/// # Panics
/// Panic if `offset` is not a nibble.
pub fn mask(offset: u8) -> u8 {
    assert!(offset < 16, "offset {offset} is out of [0, 15]");

    MASK[(offset as usize + 1) % 16]
}

/// Predicted leakage of the first round masked S-box output.
///
/// # Panics
/// Panic if `offset` is not a nibble.
pub fn leakage(guess: u8, plaintext: u8, offset: u8) -> u8 {
    hw(sbox(guess ^ plaintext) ^ mask(offset))
}

/// Builds the hypothesis matrix of a batch of traces for a single key byte.
///
/// Entry `(guess, i)` is the predicted leakage of trace `i` under key byte `guess`.
///
/// # Errors
/// Returns [`Error::InvalidInput`] if `plaintexts` and `offsets` have different lengths or if an
/// offset is not a nibble.
///
/// # Examples
/// ```
/// use maskcpa::leakage_model::rsm::hypotheses;
/// use ndarray::array;
///
/// let h = hypotheses(array![0x00u8, 0x53].view(), array![15u8, 2].view()).unwrap();
/// assert_eq!(h.shape(), &[256, 2]);
/// // SBOX[0x00] ^ MASK[0] = 0x63 ^ 0x03 = 0x60
/// assert_eq!(h[[0, 0]], 2.0);
/// ```
pub fn hypotheses(
    plaintexts: ArrayView1<u8>,
    offsets: ArrayView1<u8>,
) -> Result<Array2<f64>, Error> {
    if plaintexts.len() != offsets.len() {
        return Err(Error::InvalidInput(format!(
            "{} plaintext bytes for {} offsets",
            plaintexts.len(),
            offsets.len()
        )));
    }
    if let Some(offset) = offsets.iter().find(|&&offset| offset > 15) {
        return Err(Error::InvalidInput(format!(
            "offset {offset} is out of [0, 15]"
        )));
    }

    let mut values = Array2::zeros((GUESS_RANGE, plaintexts.len()));
    for (guess, mut row) in values.axis_iter_mut(Axis(0)).enumerate() {
        for (value, &plaintext, &offset) in izip!(row.iter_mut(), plaintexts, offsets) {
            *value = leakage(guess as u8, plaintext, offset) as f64;
        }
    }

    Ok(values)
}

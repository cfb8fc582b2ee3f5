//! Load traces and metadata of the [DPA contest v4.2](https://www.dpacontest.org/v4/42_traces.php)
//! database.
//!
//! Traces are split in directories of raw trace files. A single index file holds, for every
//! trace, one line of 8 space separated columns:
//! - the AES-128 key (32 hexadecimal digits),
//! - the plaintext (32 hexadecimal digits),
//! - the ciphertext (32 hexadecimal digits),
//! - the Shuffle0 permutation (16 hexadecimal digits),
//! - the Shuffle10 permutation (16 hexadecimal digits),
//! - the offsets (16 hexadecimal digits),
//! - the directory name of the trace,
//! - the file name of the trace.
use ndarray::{Array2, ArrayView2, s};
use ndarray_npy::{ReadableElement, read_npy};
use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use crate::Error;

/// Size of the header preceding the samples in a trace file.
pub const TRACE_HEADER_LEN: usize = 357;

/// Metadata of the traces, one row per trace.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub keys: Array2<u8>,
    pub plaintexts: Array2<u8>,
    pub ciphertexts: Array2<u8>,
    pub shuffle0: Array2<u8>,
    pub shuffle10: Array2<u8>,
    /// Offset nibble of each state byte
    pub offsets: Array2<u8>,
    pub directory_names: Vec<String>,
    pub trace_names: Vec<String>,
}

impl Metadata {
    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.keys.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the key of the first record. The key is the same for every trace of a subset.
    pub fn key(&self) -> Option<[u8; 16]> {
        if self.is_empty() {
            return None;
        }

        let mut key = [0u8; 16];
        for (dst, &src) in key.iter_mut().zip(self.keys.row(0)) {
            *dst = src;
        }
        Some(key)
    }

    /// Plaintext bytes of all traces.
    pub fn plaintexts(&self) -> ArrayView2<u8> {
        self.plaintexts.view()
    }

    /// Offset nibbles of all traces.
    pub fn offsets(&self) -> ArrayView2<u8> {
        self.offsets.view()
    }
}

/// A single line of the index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub key: [u8; 16],
    pub plaintext: [u8; 16],
    pub ciphertext: [u8; 16],
    pub shuffle0: [u8; 16],
    pub shuffle10: [u8; 16],
    pub offsets: [u8; 16],
    pub directory_name: String,
    pub trace_name: String,
}

impl IndexRecord {
    /// Parses a line of the index file. `line_number` is only used in errors.
    pub fn parse(line: &str, line_number: usize) -> Result<Self, Error> {
        let parse_error = |reason: String| Error::ParseError {
            line: line_number,
            reason,
        };

        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() != 8 {
            return Err(parse_error(format!(
                "expected 8 columns, found {}",
                columns.len()
            )));
        }

        let bytes = |name: &str, column: &str| -> Result<[u8; 16], Error> {
            let mut value = [0u8; 16];
            hex::decode_to_slice(column, &mut value)
                .map_err(|e| parse_error(format!("invalid {name} \"{column}\": {e}")))?;
            Ok(value)
        };
        let nibbles = |name: &str, column: &str| -> Result<[u8; 16], Error> {
            let digits: Vec<u8> = column
                .chars()
                .map(|c| c.to_digit(16).map(|d| d as u8))
                .collect::<Option<_>>()
                .ok_or_else(|| parse_error(format!("invalid {name} \"{column}\"")))?;
            digits.try_into().map_err(|digits: Vec<u8>| {
                parse_error(format!("{name} has {} digits, expected 16", digits.len()))
            })
        };

        Ok(Self {
            key: bytes("key", columns[0])?,
            plaintext: bytes("plaintext", columns[1])?,
            ciphertext: bytes("ciphertext", columns[2])?,
            shuffle0: nibbles("shuffle0", columns[3])?,
            shuffle10: nibbles("shuffle10", columns[4])?,
            offsets: nibbles("offsets", columns[5])?,
            directory_name: columns[6].to_string(),
            trace_name: columns[7].to_string(),
        })
    }
}

/// Parses the first `max_count` records of an index file (all of them if `None`).
///
/// A malformed line aborts the parsing, so that metadata never gets misaligned with the traces.
pub fn parse_index_file<P: AsRef<Path>>(
    path: P,
    max_count: Option<usize>,
) -> Result<Metadata, Error> {
    let path = path.as_ref();
    let load_error = |e: io::Error| Error::LoadError {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let file = File::open(path).map_err(load_error)?;

    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).split(b'\n').enumerate() {
        if max_count.is_some_and(|max_count| records.len() >= max_count) {
            break;
        }

        let line = line.map_err(load_error)?;
        let line = String::from_utf8(line).map_err(|e| Error::ParseError {
            line: i + 1,
            reason: e.to_string(),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(IndexRecord::parse(&line, i + 1)?);
    }

    Ok(metadata_from_records(records))
}

fn metadata_from_records(records: Vec<IndexRecord>) -> Metadata {
    let n = records.len();
    let column = |f: fn(&IndexRecord) -> &[u8; 16]| {
        Array2::from_shape_fn((n, 16), |(i, j)| f(&records[i])[j])
    };

    Metadata {
        keys: column(|r| &r.key),
        plaintexts: column(|r| &r.plaintext),
        ciphertexts: column(|r| &r.ciphertext),
        shuffle0: column(|r| &r.shuffle0),
        shuffle10: column(|r| &r.shuffle10),
        offsets: column(|r| &r.offsets),
        directory_names: records.iter().map(|r| r.directory_name.clone()).collect(),
        trace_names: records.iter().map(|r| r.trace_name.clone()).collect(),
    }
}

/// Loads a single trace file, skipping its header.
pub fn load_trace<P: AsRef<Path>>(path: P) -> Result<Vec<i8>, Error> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| Error::LoadError {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if data.len() <= TRACE_HEADER_LEN {
        return Err(Error::LoadError {
            path: path.to_path_buf(),
            reason: format!("file is too short ({} bytes)", data.len()),
        });
    }

    Ok(data[TRACE_HEADER_LEN..].iter().map(|&x| x as i8).collect())
}

/// Loads the trace files of a directory, sorted by file name, up to `max_count` traces.
///
/// # Errors
/// Returns [`Error::LoadError`] if the directory cannot be read, holds no trace or if traces do
/// not all have the same length.
pub fn load_traces<P: AsRef<Path>>(dir: P, max_count: Option<usize>) -> Result<Array2<i8>, Error> {
    let dir = dir.as_ref();
    let load_error = |reason: String| Error::LoadError {
        path: dir.to_path_buf(),
        reason,
    };

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| load_error(e.to_string()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();
    if let Some(max_count) = max_count {
        paths.truncate(max_count);
    }

    log::info!("Loading {} traces from {}", paths.len(), dir.display());

    let mut samples = Vec::new();
    let mut trace_len = None;
    for path in paths.iter() {
        let trace = load_trace(path)?;
        match trace_len {
            None => trace_len = Some(trace.len()),
            Some(len) if len != trace.len() => {
                return Err(Error::LoadError {
                    path: path.clone(),
                    reason: format!("trace has {} samples, expected {len}", trace.len()),
                });
            }
            Some(_) => {}
        }
        samples.extend(trace);
    }

    let trace_len = trace_len.ok_or_else(|| load_error("no trace found".to_string()))?;
    Array2::from_shape_vec((paths.len(), trace_len), samples)
        .map_err(|e| load_error(e.to_string()))
}

/// Loads traces stored as a 2D `.npy` array, keeping the first `max_count` ones.
///
/// # Errors
/// Returns [`Error::LoadError`] if the file cannot be read or does not hold a 2D array of `T`.
pub fn load_npy_traces<T, P>(path: P, max_count: Option<usize>) -> Result<Array2<T>, Error>
where
    T: ReadableElement + Clone,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let traces: Array2<T> = read_npy(path).map_err(|e| Error::LoadError {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let count = max_count.map_or(traces.shape()[0], |max_count| {
        max_count.min(traces.shape()[0])
    });

    Ok(traces.slice(s![..count, ..]).to_owned())
}

//! Key recovery: runs a CPA on each targeted key byte and assembles the guessed key.
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_npy::write_npy;
use num_traits::AsPrimitive;
use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::{fs::File, ops::Range, path::Path};

use crate::{
    Error,
    distinguishers::cpa::{Cpa, CpaProcessor},
    dpacontest::Metadata,
    guessing_entropy::{BatchRecord, RankTracker},
    leakage_model::rsm::{GUESS_RANGE, hypotheses},
};

/// Number of bytes of an AES-128 key.
pub const KEY_SIZE: usize = 16;

/// Attack parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackConfig {
    /// Use at most this number of traces
    pub max_traces: Option<usize>,
    /// Number of traces per batch
    pub batch_size: usize,
    /// First sample of the analysed window
    pub window_start: usize,
    /// Excluded end of the analysed window, end of the traces if `None`
    pub window_end: Option<usize>,
    /// Key bytes to attack
    pub target_bytes: Vec<usize>,
    /// Attack key bytes in parallel
    pub parallel: bool,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            max_traces: None,
            batch_size: 300,
            window_start: 0,
            window_end: None,
            target_bytes: (0..KEY_SIZE).collect(),
            parallel: true,
        }
    }
}

impl AttackConfig {
    /// Load an [`AttackConfig`] from a JSON file. Missing fields take their default value.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;
        let config: AttackConfig = serde_json::from_reader(file)?;

        Ok(config)
    }

    /// Save the [`AttackConfig`] to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;

        Ok(())
    }

    /// Number of traces used out of `available`.
    pub fn num_traces(&self, available: usize) -> usize {
        self.max_traces
            .map_or(available, |max_traces| max_traces.min(available))
    }

    /// Sample window applied to traces of `num_samples` samples.
    pub fn window(&self, num_samples: usize) -> Range<usize> {
        self.window_start..self.window_end.unwrap_or(num_samples)
    }

    /// Check the configuration against a trace set.
    ///
    /// # Errors
    /// - [`Error::InvalidInput`] for a null batch size, a key byte out of range or a window out of
    ///   the traces.
    /// - [`Error::DegenerateInput`] if no trace would be used or the window is empty.
    pub fn validate(&self, num_traces: usize, num_samples: usize) -> Result<(), Error> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch size must be positive".to_string()));
        }
        if let Some(byte) = self.target_bytes.iter().find(|&&byte| byte >= KEY_SIZE) {
            return Err(Error::InvalidInput(format!(
                "key byte {byte} is out of [0, {KEY_SIZE})"
            )));
        }

        let window = self.window(num_samples);
        if window.end > num_samples {
            return Err(Error::InvalidInput(format!(
                "window end {} is beyond the {num_samples} samples of the traces",
                window.end
            )));
        }
        if window.is_empty() {
            return Err(Error::DegenerateInput(format!(
                "empty sample window {window:?}"
            )));
        }
        if self.num_traces(num_traces) == 0 {
            return Err(Error::DegenerateInput("no trace to attack".to_string()));
        }

        Ok(())
    }
}

/// Outcome of the attack of a single key byte.
#[derive(Debug, Clone)]
pub struct ByteAttack {
    target_byte: usize,
    guess: u8,
    cpa: Cpa,
    tracker: RankTracker,
}

impl ByteAttack {
    /// Index of the attacked byte in the key.
    pub fn target_byte(&self) -> usize {
        self.target_byte
    }

    /// Recovered key byte.
    pub fn guess(&self) -> u8 {
        self.guess
    }

    /// Correlation after the last batch.
    pub fn cpa(&self) -> &Cpa {
        &self.cpa
    }

    /// Attack state after each batch.
    pub fn records(&self) -> &[BatchRecord] {
        self.tracker.records()
    }

    /// Rank of the correct key byte after each batch, if it is known.
    pub fn ranks(&self) -> Option<Vec<usize>> {
        self.tracker.ranks()
    }

    /// Rank of the correct key byte after the last batch, if it is known.
    pub fn final_rank(&self) -> Option<usize> {
        self.tracker.final_rank()
    }

    /// Number of traces consumed after each batch.
    pub fn trace_counts(&self) -> Array1<usize> {
        self.tracker
            .records()
            .iter()
            .map(|record| record.num_traces)
            .collect()
    }

    /// Signed correlation peaks of every guess after each batch, one row per batch.
    pub fn peaks(&self) -> Array2<f64> {
        let records = self.tracker.records();
        let mut peaks = Array2::zeros((records.len(), GUESS_RANGE));
        for (mut row, record) in peaks.axis_iter_mut(Axis(0)).zip(records) {
            row.assign(&record.peaks);
        }
        peaks
    }
}

/// Result of a key recovery.
#[derive(Debug, Clone)]
pub struct Attack {
    bytes: Vec<ByteAttack>,
}

impl Attack {
    /// Attacked bytes, in the configured order.
    pub fn bytes(&self) -> &[ByteAttack] {
        &self.bytes
    }

    /// Attack of key byte `target_byte`, if it was attacked.
    pub fn byte(&self, target_byte: usize) -> Option<&ByteAttack> {
        self.bytes
            .iter()
            .find(|attack| attack.target_byte == target_byte)
    }

    /// Ranks of the correct key bytes after each batch, one row per attacked byte, if the key is
    /// known.
    pub fn rank_matrix(&self) -> Option<Array2<usize>> {
        let ranks: Vec<Vec<usize>> = self
            .bytes
            .iter()
            .map(ByteAttack::ranks)
            .collect::<Option<_>>()?;
        let num_batches = ranks.first().map_or(0, Vec::len);

        Some(Array2::from_shape_fn((ranks.len(), num_batches), |(i, j)| {
            ranks[i][j]
        }))
    }

    /// Recovered bytes, in the configured order.
    pub fn guessed_bytes(&self) -> Vec<u8> {
        self.bytes.iter().map(|attack| attack.guess).collect()
    }

    /// Recovered key, with `None` for bytes that were not attacked.
    pub fn guessed_key(&self) -> [Option<u8>; KEY_SIZE] {
        let mut key = [None; KEY_SIZE];
        for attack in self.bytes.iter() {
            key[attack.target_byte] = Some(attack.guess);
        }
        key
    }

    /// Recovered key, if all of its bytes were attacked.
    pub fn full_key(&self) -> Option<[u8; KEY_SIZE]> {
        let key = self.guessed_key();
        if key.iter().any(Option::is_none) {
            return None;
        }
        Some(key.map(|byte| byte.unwrap_or_default()))
    }

    /// Write the diagnostics to `dir`: `ranks.npy` (one row per attacked byte, if the key is
    /// known) and, for each attacked byte `XX`, `peaks_XX.npy` and `corr_XX.npy`.
    pub fn save_npy<P: AsRef<Path>>(&self, dir: P) -> Result<(), Error> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        if let Some(ranks) = self.rank_matrix() {
            write_npy(dir.join("ranks.npy"), &ranks.mapv(|rank| rank as u64))?;
        }

        for attack in self.bytes.iter() {
            write_npy(
                dir.join(format!("peaks_{:02}.npy", attack.target_byte)),
                &attack.peaks(),
            )?;
            write_npy(
                dir.join(format!("corr_{:02}.npy", attack.target_byte)),
                &attack.cpa.corr,
            )?;
        }

        Ok(())
    }
}

/// Attack a single key byte.
///
/// `traces`, `plaintexts` and `offsets` must have the same number of rows and are processed in
/// batches of `batch_size` traces. The correlation is recomputed after each batch to follow the
/// rank of `correct_guess`, when given.
///
/// # Errors
/// - [`Error::InvalidInput`] on mismatched lengths, invalid offsets or a null batch size.
/// - [`Error::DegenerateInput`] if there is no trace or no sample.
pub fn attack_byte<T>(
    traces: ArrayView2<T>,
    plaintexts: ArrayView1<u8>,
    offsets: ArrayView1<u8>,
    target_byte: usize,
    correct_guess: Option<u8>,
    batch_size: usize,
) -> Result<ByteAttack, Error>
where
    T: AsPrimitive<f64>,
{
    if batch_size == 0 {
        return Err(Error::InvalidInput("batch size must be positive".to_string()));
    }
    if plaintexts.len() != traces.shape()[0] || offsets.len() != traces.shape()[0] {
        return Err(Error::InvalidInput(format!(
            "{} traces for {} plaintexts and {} offsets",
            traces.shape()[0],
            plaintexts.len(),
            offsets.len()
        )));
    }
    if traces.shape()[0] == 0 || traces.shape()[1] == 0 {
        return Err(Error::DegenerateInput(format!(
            "cannot attack a trace set of shape {:?}",
            traces.shape()
        )));
    }

    let mut processor = CpaProcessor::new(traces.shape()[1], GUESS_RANGE);
    let mut tracker = RankTracker::new(correct_guess.map(usize::from));
    let mut cpa = None;
    for (trace_batch, (plaintext_batch, offset_batch)) in
        traces.axis_chunks_iter(Axis(0), batch_size).zip(
            plaintexts
                .axis_chunks_iter(Axis(0), batch_size)
                .zip(offsets.axis_chunks_iter(Axis(0), batch_size)),
        )
    {
        let values = hypotheses(plaintext_batch, offset_batch)?;
        processor.update(trace_batch, values.view())?;

        let batch_cpa = processor.finalize()?;
        let record = tracker.record(&batch_cpa);
        log::debug!(
            "Key byte {target_byte}: {} traces, best guess {:#04x}, rank {:?}",
            record.num_traces,
            record.best_guess,
            record.rank
        );
        cpa = Some(batch_cpa);
    }

    let cpa = cpa.ok_or_else(|| Error::DegenerateInput("no batch processed".to_string()))?;
    let guess = cpa.best_guess() as u8;
    match (tracker.correct_guess(), tracker.final_rank()) {
        (Some(correct), Some(rank)) => {
            log::info!(
                "Key byte {target_byte}: guessed {guess:#04x}, correct {correct:#04x}, rank {rank}"
            );
            if rank != 0 {
                log::warn!("Key byte {target_byte} was not recovered");
            }
        }
        _ => log::info!("Key byte {target_byte}: guessed {guess:#04x}"),
    }

    Ok(ByteAttack {
        target_byte,
        guess,
        cpa,
        tracker,
    })
}

/// Recover the key bytes listed in `config`.
///
/// `plaintexts` and `offsets` hold one row of 16 values per trace. When `known_key` is given,
/// the rank of each correct key byte is tracked after each batch.
///
/// # Errors
/// See [`AttackConfig::validate`] and [`attack_byte`]. Also returns [`Error::InvalidInput`] if
/// there are fewer metadata rows than traces to attack.
pub fn attack<T>(
    traces: ArrayView2<T>,
    plaintexts: ArrayView2<u8>,
    offsets: ArrayView2<u8>,
    known_key: Option<&[u8; KEY_SIZE]>,
    config: &AttackConfig,
) -> Result<Attack, Error>
where
    T: AsPrimitive<f64> + Sync,
{
    config.validate(traces.shape()[0], traces.shape()[1])?;

    let num_traces = config.num_traces(traces.shape()[0]);
    for (name, shape) in [("plaintexts", plaintexts.shape()), ("offsets", offsets.shape())] {
        if shape[0] < num_traces || shape[1] < KEY_SIZE {
            return Err(Error::InvalidInput(format!(
                "{name} of shape {shape:?} do not cover {num_traces} traces"
            )));
        }
    }

    let window = config.window(traces.shape()[1]);
    let traces = traces.slice(s![..num_traces, window.clone()]);
    log::info!(
        "Attacking {} key bytes with {num_traces} traces on samples {window:?}",
        config.target_bytes.len()
    );

    #[cfg(feature = "progress_bar")]
    let progress = crate::util::progress_bar(config.target_bytes.len());

    let run = |&target_byte: &usize| {
        let result = attack_byte(
            traces,
            plaintexts.slice(s![..num_traces, target_byte]),
            offsets.slice(s![..num_traces, target_byte]),
            target_byte,
            known_key.map(|key| key[target_byte]),
            config.batch_size,
        );
        #[cfg(feature = "progress_bar")]
        progress.inc(1);
        result
    };

    let bytes = if config.parallel {
        config
            .target_bytes
            .par_iter()
            .map(run)
            .collect::<Result<Vec<_>, _>>()?
    } else {
        config
            .target_bytes
            .iter()
            .map(run)
            .collect::<Result<Vec<_>, _>>()?
    };

    #[cfg(feature = "progress_bar")]
    progress.finish();

    Ok(Attack { bytes })
}

/// Recover the key bytes listed in `config` from traces and their parsed index file. The key of
/// the index file is used to track ranks.
pub fn attack_dataset<T>(
    traces: ArrayView2<T>,
    metadata: &Metadata,
    config: &AttackConfig,
) -> Result<Attack, Error>
where
    T: AsPrimitive<f64> + Sync,
{
    let key = metadata.key();
    attack(
        traces,
        metadata.plaintexts(),
        metadata.offsets(),
        key.as_ref(),
        config,
    )
}

#[cfg(test)]
mod tests {
    use super::{AttackConfig, KEY_SIZE, attack, attack_byte};
    use crate::{Error, leakage_model::rsm::leakage};
    use ndarray::{Array2, s};
    use ndarray_npy::read_npy;
    use ndarray_rand::{
        RandomExt,
        rand::{Rng, SeedableRng, rngs::StdRng},
        rand_distr::{Normal, Uniform},
    };

    const KEY: [u8; KEY_SIZE] = [
        0x6c, 0xec, 0xc6, 0x7f, 0x28, 0x7d, 0x08, 0x3d, 0xeb, 0x87, 0x66, 0xf0, 0x73, 0x8b, 0x36,
        0xcf,
    ];

    /// Sample where key byte `byte` leaks.
    fn leak_sample(byte: usize) -> usize {
        4 + 2 * byte
    }

    /// Synthetic traces of 40 samples. Key byte `i` leaks at `leak_sample(i)` with additive
    /// gaussian noise, every other sample is uniform noise.
    fn synthetic(
        num_traces: usize,
        noise: f64,
        seed: u64,
    ) -> (Array2<i16>, Array2<u8>, Array2<u8>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let plaintexts = Array2::random_using(
            (num_traces, KEY_SIZE),
            Uniform::new_inclusive(0u8, 255u8),
            &mut rng,
        );
        let offsets = Array2::random_using(
            (num_traces, KEY_SIZE),
            Uniform::new_inclusive(0u8, 15u8),
            &mut rng,
        );
        let mut traces =
            Array2::random_using((num_traces, 40), Uniform::new_inclusive(-8i16, 8i16), &mut rng);

        let normal = Normal::new(0.0, noise).unwrap();
        for i in 0..num_traces {
            for byte in 0..KEY_SIZE {
                let value = leakage(KEY[byte], plaintexts[[i, byte]], offsets[[i, byte]]) as f64;
                let noise = if noise > 0.0 { rng.sample(normal) } else { 0.0 };
                traces[[i, leak_sample(byte)]] = (value + noise).round() as i16;
            }
        }

        (traces, plaintexts, offsets)
    }

    #[test]
    fn test_recover_key_without_noise() {
        let (traces, plaintexts, offsets) = synthetic(200, 0.0, 0);
        let config = AttackConfig {
            batch_size: 64,
            ..Default::default()
        };
        let attack = attack(
            traces.view(),
            plaintexts.view(),
            offsets.view(),
            Some(&KEY),
            &config,
        )
        .unwrap();

        assert_eq!(attack.full_key(), Some(KEY));
        assert_eq!(attack.guessed_bytes(), KEY.to_vec());
        for byte in attack.bytes() {
            assert_eq!(byte.final_rank(), Some(0));
            let sample = byte.cpa().best_sample(KEY[byte.target_byte()] as usize);
            assert_eq!(sample, leak_sample(byte.target_byte()));
        }
        assert_eq!(attack.rank_matrix().unwrap().shape(), &[16, 4]);
    }

    #[test]
    fn test_rank_converges_with_noise() {
        let (traces, plaintexts, offsets) = synthetic(1500, 1.0, 1);
        let config = AttackConfig {
            batch_size: 300,
            target_bytes: vec![0, 5, 15],
            ..Default::default()
        };
        let attack = attack(
            traces.view(),
            plaintexts.view(),
            offsets.view(),
            Some(&KEY),
            &config,
        )
        .unwrap();

        for byte in attack.bytes() {
            assert_eq!(byte.guess(), KEY[byte.target_byte()]);
            assert_eq!(byte.ranks().unwrap().len(), 5);
            assert_eq!(byte.final_rank(), Some(0));
        }
        let key = attack.guessed_key();
        assert_eq!(key[5], Some(KEY[5]));
        assert_eq!(key[1], None);
        assert_eq!(attack.full_key(), None);
    }

    #[test]
    fn test_single_byte_end_to_end() {
        let (traces, plaintexts, offsets) = synthetic(300, 0.5, 2);
        let byte = attack_byte(
            traces.view(),
            plaintexts.column(0),
            offsets.column(0),
            0,
            Some(KEY[0]),
            100,
        )
        .unwrap();

        assert_eq!(byte.guess(), KEY[0]);
        assert_eq!(byte.trace_counts().to_vec(), vec![100, 200, 300]);
        assert_eq!(byte.final_rank(), Some(0));
        assert_eq!(byte.peaks().shape(), &[3, 256]);
        assert_eq!(byte.cpa().num_traces(), 300);
    }

    #[test]
    fn test_batch_size_does_not_change_result() {
        let (traces, plaintexts, offsets) = synthetic(120, 1.0, 3);
        let whole = attack_byte(
            traces.view(),
            plaintexts.column(3),
            offsets.column(3),
            3,
            None,
            120,
        )
        .unwrap();
        let single = attack_byte(
            traces.view(),
            plaintexts.column(3),
            offsets.column(3),
            3,
            None,
            1,
        )
        .unwrap();

        assert_eq!(single.records().len(), 120);
        assert_eq!(whole.ranks(), None);
        for (a, b) in whole.cpa().corr().iter().zip(single.cpa().corr().iter()) {
            assert!((a - b).abs() <= 1e-9 * a.abs().max(1.0));
        }
    }

    #[test]
    fn test_window_excluding_leakage() {
        let (traces, plaintexts, offsets) = synthetic(600, 1.0, 4);
        let run = |window_start, window_end| {
            let config = AttackConfig {
                window_start,
                window_end,
                target_bytes: vec![2],
                parallel: false,
                ..Default::default()
            };
            attack(
                traces.view(),
                plaintexts.view(),
                offsets.view(),
                Some(&KEY),
                &config,
            )
            .unwrap()
        };

        let full = run(0, None);
        assert_eq!(full.bytes()[0].final_rank(), Some(0));
        assert_eq!(full.bytes()[0].cpa().corr().shape(), &[256, 40]);

        // Key byte 2 leaks at sample 8
        let outside = run(0, Some(leak_sample(2)));
        assert_eq!(outside.bytes()[0].cpa().corr().shape(), &[256, 8]);
        assert!(outside.bytes()[0].final_rank().unwrap() > 0);

        let inside = run(leak_sample(2), Some(leak_sample(2) + 1));
        assert_eq!(inside.bytes()[0].final_rank(), Some(0));
    }

    #[test]
    fn test_max_traces() {
        let (traces, plaintexts, offsets) = synthetic(250, 0.0, 5);
        let config = AttackConfig {
            max_traces: Some(100),
            batch_size: 30,
            target_bytes: vec![7],
            ..Default::default()
        };
        let attack = attack(
            traces.view(),
            plaintexts.slice(s![..100, ..]),
            offsets.slice(s![..100, ..]),
            None,
            &config,
        )
        .unwrap();

        let byte = &attack.bytes()[0];
        assert_eq!(byte.trace_counts().to_vec(), vec![30, 60, 90, 100]);
        assert_eq!(byte.guess(), KEY[7]);
        assert!(attack.rank_matrix().is_none());
    }

    #[test]
    fn test_invalid_configuration() {
        let (traces, plaintexts, offsets) = synthetic(10, 0.0, 6);
        let run = |config: AttackConfig| {
            attack(
                traces.view(),
                plaintexts.view(),
                offsets.view(),
                None,
                &config,
            )
        };

        assert!(matches!(
            run(AttackConfig {
                batch_size: 0,
                ..Default::default()
            }),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            run(AttackConfig {
                target_bytes: vec![16],
                ..Default::default()
            }),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            run(AttackConfig {
                window_end: Some(41),
                ..Default::default()
            }),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            run(AttackConfig {
                window_start: 5,
                window_end: Some(5),
                ..Default::default()
            }),
            Err(Error::DegenerateInput(_))
        ));
        assert!(matches!(
            run(AttackConfig {
                max_traces: Some(0),
                ..Default::default()
            }),
            Err(Error::DegenerateInput(_))
        ));
        assert!(matches!(
            attack(
                traces.view(),
                plaintexts.slice(s![..5, ..]),
                offsets.view(),
                None,
                &AttackConfig::default(),
            ),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_config_json() {
        let config: AttackConfig =
            serde_json::from_str(r#"{"batch_size": 100, "window_end": 5000}"#).unwrap();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.window(10000), 0..5000);
        assert_eq!(config.target_bytes, (0..16).collect::<Vec<_>>());
        assert!(config.parallel);

        let serialized = serde_json::to_string(&config).unwrap();
        assert_eq!(
            serde_json::from_str::<AttackConfig>(&serialized).unwrap(),
            config
        );
    }

    #[test]
    fn test_save_npy() {
        let (traces, plaintexts, offsets) = synthetic(120, 0.0, 7);
        let config = AttackConfig {
            batch_size: 50,
            target_bytes: vec![3, 12],
            ..Default::default()
        };
        let dir = std::env::temp_dir().join(format!("maskcpa-attack-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let result = attack(
            traces.view(),
            plaintexts.view(),
            offsets.view(),
            Some(&KEY),
            &config,
        )
        .unwrap();
        result.save_npy(&dir).unwrap();

        let ranks: Array2<u64> = read_npy(dir.join("ranks.npy")).unwrap();
        assert_eq!(ranks, Array2::<u64>::zeros((2, 3)));
        for byte in [3, 12] {
            let peaks: Array2<f64> = read_npy(dir.join(format!("peaks_{byte:02}.npy"))).unwrap();
            assert_eq!(peaks, result.byte(byte).unwrap().peaks());
            let corr: Array2<f64> = read_npy(dir.join(format!("corr_{byte:02}.npy"))).unwrap();
            assert_eq!(corr.shape(), &[256, 40]);
            assert_eq!(corr, result.byte(byte).unwrap().cpa().corr());
        }
        assert!(!dir.join("peaks_00.npy").exists());
        std::fs::remove_dir_all(&dir).unwrap();

        // Ranks are only written when the key is known
        let result = attack(
            traces.view(),
            plaintexts.view(),
            offsets.view(),
            None,
            &config,
        )
        .unwrap();
        result.save_npy(&dir).unwrap();
        assert!(!dir.join("ranks.npy").exists());
        assert!(dir.join("corr_12.npy").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}

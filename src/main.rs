use anyhow::{Context, Result, bail};
use maskcpa::{
    attack::{AttackConfig, attack_dataset},
    dpacontest::{load_npy_traces, load_traces, parse_index_file},
};
use ndarray::Array2;
use std::{env, path::PathBuf};

const USAGE: &str = "Usage: maskcpa <traces.npy|trace_dir> <index_file> [config.json] [output_dir]";

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 2 || args.len() > 4 {
        bail!(USAGE);
    }
    let traces_path = PathBuf::from(&args[0]);
    let index_path = PathBuf::from(&args[1]);

    let config = match args.get(2) {
        Some(path) => AttackConfig::load(path).with_context(|| format!("Failed to read {path}"))?,
        None => AttackConfig::default(),
    };

    let traces: Array2<i8> = if traces_path.extension().is_some_and(|ext| ext == "npy") {
        load_npy_traces(&traces_path, config.max_traces)
    } else {
        load_traces(&traces_path, config.max_traces)
    }
    .with_context(|| format!("Failed to load traces from {}", traces_path.display()))?;

    let metadata = parse_index_file(&index_path, Some(traces.shape()[0]))
        .with_context(|| format!("Failed to parse {}", index_path.display()))?;

    let attack = attack_dataset(traces.view(), &metadata, &config)?;

    let guessed: String = attack
        .guessed_key()
        .iter()
        .map(|byte| byte.map_or("--".to_string(), |byte| format!("{byte:02x}")))
        .collect();
    println!("Guessed key: {guessed}");
    if let Some(key) = metadata.key() {
        println!("Correct key: {}", hex::encode(key));
    }
    for byte in attack.bytes() {
        if let Some(rank) = byte.final_rank() {
            println!("Key byte {:2}: rank {rank}", byte.target_byte());
        }
    }

    if let Some(output_dir) = args.get(3) {
        attack
            .save_npy(output_dir)
            .with_context(|| format!("Failed to save results to {output_dir}"))?;
    }

    Ok(())
}

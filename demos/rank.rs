use anyhow::{Context, Result};
use gnuplot::{AxesCommon, Figure, PlotOption::Caption};
use maskcpa::{
    attack::{AttackConfig, attack_dataset},
    dpacontest::{load_traces, parse_index_file},
};
use std::{env, path::PathBuf};

fn main() -> Result<()> {
    let traces_dir =
        PathBuf::from(env::var("TRACES_DIR").context("Missing TRACES_DIR environment variable")?);
    let index_file =
        PathBuf::from(env::var("INDEX_FILE").context("Missing INDEX_FILE environment variable")?);

    let config = AttackConfig {
        max_traces: Some(2500),
        batch_size: 100,
        ..Default::default()
    };

    let traces = load_traces(&traces_dir, config.max_traces).context("Failed to load traces")?;
    let metadata = parse_index_file(&index_file, Some(traces.shape()[0]))
        .context("Failed to parse index file")?;

    let attack = attack_dataset(traces.view(), &metadata, &config)?;
    println!("Guessed key: {}", hex::encode(attack.guessed_bytes()));

    // Let's plot the guessing entropy of each key byte
    let mut fg = Figure::new();
    let axes = fg
        .axes2d()
        .set_x_label("Traces", &[])
        .set_y_label("Rank of the correct key byte", &[]);
    for byte in attack.bytes() {
        let ranks = byte.ranks().context("Index file has no key")?;
        let caption = format!("Byte {}", byte.target_byte());
        axes.lines(
            byte.trace_counts().iter().map(|&n| n as f64),
            ranks.iter().map(|&rank| rank as f64),
            &[Caption(&caption)],
        );
    }
    fg.show()?;

    Ok(())
}

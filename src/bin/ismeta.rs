//! ismeta - dump Component A's metadata JSON for a master file.
//!
//! Ambient tooling, not a spec.md component of its own: useful for
//! operators diagnosing a detector's reported property set without
//! going through the full dispatcher/supervisor/worker pipeline.

use anyhow::{Context, Result};
use clap::Parser;
use is_kernel::metadata::MetadataExtractor;
use is_kernel::ui::Ui;
use std::io::IsTerminal;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Dump an HDF5 master file's recognized metadata as JSON")]
struct Args {
    /// Path to the HDF5 master file.
    master_file: String,
    /// Property table override file (defaults to the embedded table).
    #[arg(long)]
    property_table: Option<PathBuf>,
    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let extractor = MetadataExtractor::with_table_override(args.property_table.as_deref())
        .context("failed to load property table override")?;

    let meta = {
        let _stage = ui.stage(&format!("reading {}", args.master_file));
        extractor
            .extract(&args.master_file)
            .with_context(|| format!("failed to extract metadata from {}", args.master_file))?
    };

    println!("{}", serde_json::to_string_pretty(&meta)?);
    Ok(())
}

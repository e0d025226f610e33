use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

use wharf::checkpoint;
use wharf::logio::{self, LogReader};
use wharf::state;
use wharf::stream::MemoryStream;

#[derive(Parser)]
#[command(name = "wharf", version, about = "Inspect wharf record logs, checkpoints and state directories")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk a record log and report record counts, bytes, and recovered errors
    LogScan {
        /// Directory holding the log files
        dir: PathBuf,
        /// Log file base name (files are <base>_NNNNNNNNNN_NNNNNNNNNN)
        base: String,
        #[arg(short, long, default_value = "65536")]
        block_size: usize,
        #[arg(short = 'n', long, default_value = "1024")]
        blocks_per_file: u32,
        /// Print per-record positions and a hex preview
        #[arg(short, long)]
        verbose: bool,
    },
    /// Recover a log's base name and geometry from an existing directory
    LogDetect {
        dir: PathBuf,
    },
    /// Load a state directory (checkpoint + change-log replay) and print the map
    StateDump {
        dir: PathBuf,
        /// State name (files are <name>_checkpoint_* and <name>_statelog_*)
        name: String,
        #[arg(short, long, default_value = "128")]
        block_size: usize,
        #[arg(short = 'n', long, default_value = "100000")]
        blocks_per_file: u32,
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
    /// Validate one checkpoint file and print its entries
    CheckpointShow {
        file: PathBuf,
    },
    /// Remove old checkpoints, keeping the newest N
    CheckpointClean {
        dir: PathBuf,
        base: String,
        #[arg(short, long, default_value = "4")]
        keep: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        // ── Log scan ─────────────────────────────────────────────────────────
        Commands::LogScan { dir, base, block_size, blocks_per_file, verbose } => {
            let mut reader = LogReader::new(&dir, &base, block_size, blocks_per_file);
            let mut records = 0u64;
            let mut bytes = 0u64;
            let mut min_size = usize::MAX;
            let mut max_size = 0usize;
            loop {
                let pos = reader.tell();
                let mut record = MemoryStream::new();
                if !reader.get_next_record(&mut record) {
                    break;
                }
                records += 1;
                bytes += record.size() as u64;
                min_size = min_size.min(record.size());
                max_size = max_size.max(record.size());
                if verbose {
                    println!("  [{records:8}] @{pos}  {:8} B  {}", record.size(), record.dump_hex(16));
                }
            }
            println!("Log: {}/{base}", dir.display());
            println!("  Records:        {records}");
            println!("  Payload bytes:  {bytes}");
            if records > 0 {
                println!("  Record sizes:   {min_size}..{max_size} B");
            }
            println!("  Framing errors: {}", reader.num_errors());
            println!("  End position:   {}", reader.tell());
        }

        // ── Log detect ───────────────────────────────────────────────────────
        Commands::LogDetect { dir } => match logio::detect_log_settings(&dir)? {
            Some(settings) => {
                println!("Base:            {}", settings.base);
                println!("Block size:      {} B", settings.block_size);
                println!("Blocks per file: {}", settings.blocks_per_file);
            }
            None => {
                eprintln!("No detectable log in {} (need at least two files)", dir.display());
                std::process::exit(1);
            }
        },

        // ── State dump ───────────────────────────────────────────────────────
        Commands::StateDump { dir, name, block_size, blocks_per_file, json } => {
            let map = state::read_state(&dir, &name, block_size, blocks_per_file)?;
            if json {
                let printable: BTreeMap<&String, String> = map
                    .iter()
                    .map(|(k, v)| (k, String::from_utf8_lossy(v).into_owned()))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&printable)?);
            } else {
                println!("State: {}/{name}  ({} keys)", dir.display(), map.len());
                for (key, value) in &map {
                    match std::str::from_utf8(value) {
                        Ok(text) => println!("  {key} = {text}"),
                        Err(_) => println!("  {key} = <{} binary bytes> {}", value.len(),
                                           hex::encode(&value[..value.len().min(16)])),
                    }
                }
            }
        }

        // ── Checkpoint show ──────────────────────────────────────────────────
        Commands::CheckpointShow { file } => match checkpoint::read_checkpoint_file(&file) {
            Some(map) => {
                println!("Checkpoint: {}  ({} entries)", file.display(), map.len());
                for (name, value) in &map {
                    println!("  {name} = {}", String::from_utf8_lossy(value));
                }
            }
            None => {
                eprintln!("Corrupted or incomplete checkpoint: {}", file.display());
                std::process::exit(1);
            }
        },

        // ── Checkpoint clean ─────────────────────────────────────────────────
        Commands::CheckpointClean { dir, base, keep } => {
            let before = checkpoint::checkpoint_files(&dir, &base)?.len();
            checkpoint::clean_checkpoint_files(&dir, &base, keep)?;
            let after = checkpoint::checkpoint_files(&dir, &base)?.len();
            println!("Removed {} checkpoint(s), {} kept", before - after, after);
        }
    }

    Ok(())
}

#![forbid(unsafe_code)]
//! Operator tool: chain-state status and snapshot file inspection.

use clap::{Parser, Subcommand};
use colored::*;
use shieldchain::arith::encode_compact;
use shieldchain::config::{init_logging, load_config, load_config_from, Config, StorageBackend};
use shieldchain::consensus::FORK_CB_PER_BLOCK;
use shieldchain::fork::{snapshot_file_name, SnapshotReader};
use shieldchain::persistence::{CoinsView, Database};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./shieldchain.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Shows consensus parameters and the stored chain state
    Status,
    /// Works with fork-window snapshot files
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Reads a snapshot file and summarizes its records
    Inspect {
        file: PathBuf,
        /// Number of records to print
        #[arg(long, default_value_t = 5)]
        show: usize,
    },
    /// Prints the snapshot file expected for a block height
    Path { height: u32 },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    init_logging(&config.logging.level)?;

    match cli.command {
        Commands::Status => status(&config)?,
        Commands::Snapshot { command } => match command {
            SnapshotCommands::Inspect { file, show } => inspect(&file, show)?,
            SnapshotCommands::Path { height } => path(&config, height),
        },
    }
    Ok(())
}

fn status(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let params = config.consensus_params();
    println!("{}", "ShieldChain status".bright_cyan().bold());
    println!("{}", "------------------".bright_cyan());
    println!("  {:<18} {}", "network:".bright_white(), params.network.as_str().green());
    println!(
        "  {:<18} ({}, {}]",
        "fork window:".bright_white(),
        params.fork_start_height,
        params.fork_start_height + params.fork_height_range
    );
    println!("  {:<18} {:#010x}", "pow limit:".bright_white(), encode_compact(params.pow_limit));
    println!(
        "  {:<18} {:#010x}",
        "pre-fork limit:".bright_white(),
        encode_compact(params.pre_fork_pow_limit)
    );
    println!("  {:<18} {}", "puzzle (n, k):".bright_white(), format!("({}, {})", params.equihash_n, params.equihash_k));
    println!("  {:<18} {}", "checkpoints:".bright_white(), config.fork.checkpoints);

    let snapshot_dir = config.snapshot_dir();
    let snapshot_note = if snapshot_dir.is_dir() { "present".green() } else { "missing".yellow() };
    println!("  {:<18} {} ({})", "snapshots:".bright_white(), snapshot_dir.display(), snapshot_note);

    println!();
    if config.storage.backend == StorageBackend::Memory {
        println!("{}", "In-memory storage configured; nothing persisted.".yellow());
        return Ok(());
    }
    let db_path = config.database_path();
    if !db_path.exists() {
        println!("{}", format!("No chain state at {}", db_path.display()).yellow());
        return Ok(());
    }

    let db = Database::open(&db_path.to_string_lossy())?;
    let best_block = db
        .get_best_block()?
        .map(hex::encode)
        .unwrap_or_else(|| "none".to_string());
    println!("  {:<18} {}", "database:".bright_white(), db_path.display());
    println!("  {:<18} {}", "best block:".bright_white(), best_block.bright_green());
    println!("  {:<18} {}", "best anchor:".bright_white(), hex::encode(db.get_best_anchor()?));
    println!("  {:<18} {}", "coins:".bright_white(), db.coin_count()?);
    println!("  {:<18} {}", "nullifiers:".bright_white(), db.nullifier_count()?);
    println!("  {:<18} {}", "indexed blocks:".bright_white(), db.block_count()?);
    Ok(())
}

fn inspect(file: &PathBuf, show: usize) -> Result<(), Box<dyn std::error::Error>> {
    let reader = BufReader::new(File::open(file)?);
    let contents = SnapshotReader::new(reader).read_records(FORK_CB_PER_BLOCK);

    let total: u128 = contents.records.iter().map(|r| r.amount as u128).sum();
    println!("{}", format!("Snapshot {}", file.display()).bright_cyan().bold());
    println!("  {:<18} {}", "records:".bright_white(), contents.records.len());
    println!("  {:<18} {}", "complete:".bright_white(), contents.complete);
    println!("  {:<18} {}", "total amount:".bright_white(), total);
    if contents.complete != contents.records.len() {
        println!("{}", "  last record is truncated".red());
    }
    if contents.records.len() == FORK_CB_PER_BLOCK {
        println!("{}", format!("  stopped at the {} record limit", FORK_CB_PER_BLOCK).yellow());
    }

    for (i, record) in contents.records.iter().take(show).enumerate() {
        println!("  #{:<5} {:>16}  {}", i, record.amount, hex::encode(&record.script));
    }
    Ok(())
}

fn path(config: &Config, height: u32) {
    let params = config.consensus_params();
    if !params.is_fork_block(height as i64) {
        println!("{}", format!("Height {} is outside the fork window", height).yellow());
        return;
    }
    match snapshot_file_name(height, &params) {
        Some(name) => println!("{}", config.snapshot_dir().join(name).display()),
        None => println!("{}", "No snapshot name for this height".red()),
    }
}

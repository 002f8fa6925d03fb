//! AtlasWAL Command-Line Tool
//!
//! Inspects a data directory's log and runs recovery on it.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process;

use atlaswal::op::CodecRegistry;
use atlaswal::wal::{self, LogReader, LogRecord};
use atlaswal::{Config, Engine, FileStore, TxnId};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// Directory (under the data directory) holding resource files
const RESOURCE_DIR: &str = "resources";

/// AtlasWAL
#[derive(Parser, Debug)]
#[command(name = "atlaswal")]
#[command(about = "Inspect and recover AtlasWAL write-ahead logs")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a log's integrity without modifying it
    Verify {
        /// Data directory
        data_dir: PathBuf,
    },

    /// Print log records
    Dump {
        /// Data directory
        data_dir: PathBuf,

        /// Only records of this transaction
        #[arg(short, long)]
        txn: Option<TxnId>,
    },

    /// Run crash recovery against the file-backed resource store
    Recover {
        /// Data directory
        data_dir: PathBuf,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atlaswal=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::debug!("AtlasWAL v{}", atlaswal::VERSION);

    let outcome = match args.command {
        Commands::Verify { data_dir } => verify(&data_dir),
        Commands::Dump { data_dir, txn } => dump(&data_dir, txn),
        Commands::Recover { data_dir } => recover(&data_dir),
    };

    if let Err(e) = outcome {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn wal_path(data_dir: &Path) -> PathBuf {
    Config::builder().data_dir(data_dir).build().wal_path()
}

fn verify(data_dir: &Path) -> atlaswal::Result<()> {
    let report = wal::verify(&wal_path(data_dir))?;

    println!("records:     {}", report.records);
    println!("first lsn:   {}", format_lsn(report.first_lsn));
    println!("last lsn:    {}", format_lsn(report.last_lsn));
    println!("valid bytes: {} of {}", report.valid_len, report.file_len);
    println!("torn tail:   {}", if report.was_truncated { "yes" } else { "no" });
    for (kind, count) in &report.kinds {
        println!("  {:?}: {}", kind, count);
    }
    Ok(())
}

fn dump(data_dir: &Path, txn: Option<TxnId>) -> atlaswal::Result<()> {
    let path = wal_path(data_dir);
    let file = File::open(&path)?;
    let len = file.metadata()?.len();
    let codecs = CodecRegistry::builtin();

    let mut reader = LogReader::new(BufReader::new(file), 0, len);
    while let Some((offset, record)) = reader.next_entry()? {
        if txn.map_or(false, |id| id != record.txn_id) {
            continue;
        }
        println!("{:>10}  {}", offset, describe(&record, &codecs));
    }

    if reader.torn_tail() {
        println!("{:>10}  <torn tail>", reader.position());
    }
    Ok(())
}

fn recover(data_dir: &Path) -> atlaswal::Result<()> {
    let config = Config::builder().data_dir(data_dir).build();
    let store = FileStore::open(&data_dir.join(RESOURCE_DIR))?;

    let engine = Engine::open(config, store)?;
    let report = engine.last_recovery().clone();
    engine.close()?;

    println!("checkpoint:      {}", format_lsn(report.checkpoint_lsn));
    println!("redo start:      {}", format_lsn(report.redo_start));
    println!("analyzed:        {}", report.records_analyzed);
    println!("redone:          {}", report.records_redone);
    println!("already applied: {}", report.records_skipped);
    println!("rolled back:     {:?}", report.aborted);
    println!("compensations:   {}", report.compensations_written);
    println!("torn tail:       {}", if report.torn_tail { "dropped" } else { "none" });
    Ok(())
}

fn describe(record: &LogRecord, codecs: &CodecRegistry) -> String {
    let mut line = format!(
        "lsn={} txn={} kind={:?} prev={}",
        record.lsn,
        record.txn_id,
        record.kind,
        format_lsn(record.prev_lsn)
    );
    if let Some(resource) = &record.resource {
        line.push_str(&format!(" res={}", resource));
    }
    if let Some(undo_next) = record.undo_next_lsn {
        line.push_str(&format!(" undo_next={}", undo_next));
    }
    match codecs.decode(record.op_code, &record.payload) {
        Ok(payload) => line.push_str(&format!(" {:?}", payload)),
        Err(_) => {
            line.push_str(&format!(" op={} ({} bytes)", record.op_code, record.payload.len()))
        }
    }
    line
}

fn format_lsn(lsn: Option<atlaswal::Lsn>) -> String {
    lsn.map(|lsn| lsn.to_string())
        .unwrap_or_else(|| "-".to_string())
}

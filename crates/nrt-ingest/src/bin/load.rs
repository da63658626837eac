//! Load files of fixed-length records into the record store.
//!
//! Used to seed a store for testing or to replay an archive. Each file is read
//! record by record; undecodable records are skipped and counted.
//!
//! # Usage
//!
//! ```bash
//! # Append two day files
//! nrt-load --db-path ./data/nrt.db NZ.ABAZ.10.EHE.D.2016.079 NZ.ABAZ.10.EHE.D.2016.080
//!
//! # Replace the history of every stream found in the input
//! nrt-load --reset ./archive/
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use nrt_core::{Latency, NewRecord, RecordStore, StoreConfig, StreamId, mseed};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Load fixed-length records from files into the store.
#[derive(Parser, Debug)]
#[command(name = "nrt-load")]
#[command(about = "Load miniSEED record files into the near-real-time store")]
struct Args {
    /// Input files or directories
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// SQLite database path
    #[arg(long, env = "NRT_DB_PATH", default_value = "./data/nrt.db")]
    db_path: PathBuf,

    /// Delete each stream's existing records the first time it is seen
    #[arg(long, default_value = "false")]
    reset: bool,

    /// Record length in bytes
    #[arg(long, default_value = "512")]
    record_length: usize,

    /// Print progress every N records
    #[arg(long, default_value = "100000")]
    progress_interval: u64,
}

#[derive(Default)]
struct Stats {
    files: usize,
    records: u64,
    loaded: u64,
    malformed: u64,
    streams_reset: usize,
    records_replaced: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();

    let store = RecordStore::open(StoreConfig {
        path: args.db_path.clone(),
        max_connections: 1,
        ..Default::default()
    })
    .with_context(|| format!("Failed to open record store at {:?}", args.db_path))?;

    let files = collect_files(&args.inputs)?;
    info!("Loading {} files into {}", files.len(), args.db_path.display());

    let started = Instant::now();
    let mut stats = Stats::default();
    let mut seen: HashSet<StreamId> = HashSet::new();

    for path in &files {
        load_file(&store, &args, path, &mut seen, &mut stats)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        stats.files += 1;
    }

    let elapsed = started.elapsed();
    println!("\n══════════════════════════════════════════════════════════════════");
    println!("SUMMARY");
    println!("══════════════════════════════════════════════════════════════════\n");
    println!("Files:             {:>12}", stats.files);
    println!("Records read:      {:>12}", stats.records);
    println!("Records loaded:    {:>12}", stats.loaded);
    println!("Malformed:         {:>12}", stats.malformed);
    println!("Streams seen:      {:>12}", seen.len());
    if args.reset {
        println!("Streams reset:     {:>12}", stats.streams_reset);
        println!("Records replaced:  {:>12}", stats.records_replaced);
    }
    println!("Elapsed:           {:>11.1}s", elapsed.as_secs_f64());

    Ok(())
}

fn load_file(
    store: &RecordStore,
    args: &Args,
    path: &Path,
    seen: &mut HashSet<StreamId>,
    stats: &mut Stats,
) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = vec![0u8; args.record_length];

    loop {
        let filled = read_record(&mut reader, &mut buf)?;
        if filled == 0 {
            break;
        }
        stats.records += 1;

        if filled < buf.len() {
            stats.malformed += 1;
            warn!(
                file = %path.display(),
                record = stats.records,
                bytes = filled,
                "skipping truncated record at end of file"
            );
            break;
        }

        let header = match mseed::decode_with_length(&buf, args.record_length) {
            Ok(header) => header,
            Err(e) => {
                stats.malformed += 1;
                warn!(file = %path.display(), record = stats.records, error = %e, "skipping record");
                continue;
            }
        };

        if !seen.contains(&header.stream) {
            if args.reset {
                stats.records_replaced += store.reset_stream(&header.stream)?;
                stats.streams_reset += 1;
            }
            seen.insert(header.stream.clone());
        }

        store.save_record(
            &header.stream,
            &NewRecord::from_header(&header, &buf, Latency::default()),
        )?;
        stats.loaded += 1;

        if args.progress_interval > 0 && stats.loaded % args.progress_interval == 0 {
            info!(loaded = stats.loaded, malformed = stats.malformed, "progress");
        }
    }

    Ok(())
}

/// Fill `buf` from `reader`, returning how many bytes were read. Less than
/// `buf.len()` means the input ended mid-record.
fn read_record(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn collect_files(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for input in inputs {
        if input.is_dir() {
            let mut entries: Vec<_> = fs::read_dir(input)
                .with_context(|| format!("Failed to read directory: {}", input.display()))?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            entries.sort();
            files.extend(entries);
        } else {
            files.push(input.clone());
        }
    }

    Ok(files)
}

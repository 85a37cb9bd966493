//! quill-inspect - integrity and content tool for quill data files
//!
//! Usage:
//!   quill-inspect validate <file>            - Check footer, checksum and record count
//!   quill-inspect info <file>                - Show header and footer
//!   quill-inspect dump <file> [--limit N]    - List record sizes and leading bytes

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use quill_rs::recorder::{DataFileReader, FileFooter, FileValidationResult};

#[derive(Parser)]
#[command(name = "quill-inspect")]
#[command(about = "Integrity and content tool for quill data files")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate file integrity
    Validate {
        /// Path to the data file
        file: PathBuf,
    },

    /// Show file metadata
    Info {
        /// Path to the data file
        file: PathBuf,
    },

    /// Dump record sizes
    Dump {
        /// Path to the data file
        file: PathBuf,

        /// Stop after this many records
        #[arg(short, long)]
        limit: Option<usize>,

        /// Leading payload bytes to print as hex
        #[arg(long, default_value = "16")]
        bytes: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate { file } => validate_file(&file),
        Commands::Info { file } => show_info(&file),
        Commands::Dump { file, limit, bytes } => dump_records(&file, limit, bytes),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn format_time(ns: u64) -> String {
    DateTime::<Utc>::from_timestamp((ns / 1_000_000_000) as i64, (ns % 1_000_000_000) as u32)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| format!("{} ns", ns))
}

fn validate_file(path: &Path) -> anyhow::Result<bool> {
    println!("Validating: {}", path.display());
    println!();

    let mut reader = DataFileReader::open(path)?;
    let result = reader.validate();
    print_validation_result(&result);

    if result.is_valid {
        println!("\n\x1b[32m✓ File is valid\x1b[0m");
    } else if result.needs_recovery() {
        println!("\n\x1b[33m⚠ File is incomplete; leading records are readable\x1b[0m");
    } else {
        println!("\n\x1b[31m✗ File is corrupted\x1b[0m");
    }
    Ok(result.is_valid)
}

fn print_validation_result(result: &FileValidationResult) {
    println!("Header:   {}", if result.header.is_some() { "OK" } else { "MISSING" });
    match &result.footer {
        Some(footer) if footer.is_complete() => println!("Footer:   OK (complete)"),
        Some(_) => println!("Footer:   INCOMPLETE"),
        None => println!("Footer:   MISSING"),
    }
    println!("Readable records: {}", result.recoverable_records);
    for error in &result.errors {
        println!("  - {}", error);
    }
}

fn print_footer(footer: &FileFooter) {
    println!("=== Footer ===");
    println!("  Complete:       {}", footer.is_complete());
    println!("  Records:        {}", footer.record_count);
    println!("  Data bytes:     {}", footer.data_bytes);
    println!("  Checksum:       {:016x}", footer.data_checksum);
    match footer.sequence_range() {
        Some((first, last)) => println!("  Sequences:      {} ..= {}", first, last),
        None => println!("  Sequences:      (none)"),
    }
    println!("  End Time:       {}", format_time(footer.file_end_time_ns));
}

fn show_info(path: &Path) -> anyhow::Result<bool> {
    let mut reader = DataFileReader::open(path)?;

    println!("File: {}", path.display());
    println!("Size: {} bytes", reader.file_size());
    println!();

    let header = reader.header().clone();
    println!("=== Header ===");
    println!("  Version:        {}", header.version);
    println!("  Schema:         {}", header.schema_name);
    println!("  Fingerprint:    {:016x}", header.schema_fingerprint);
    println!("  Codec:          {}", header.codec);
    println!("  File Sequence:  {}", header.file_sequence);
    println!("  Start Time:     {}", format_time(header.file_start_time_ns));
    if !header.metadata.is_empty() {
        println!("  Metadata:");
        for (key, value) in &header.metadata {
            println!("    {}: {}", key, value);
        }
    }
    println!();

    match reader.read_footer() {
        Ok(footer) => print_footer(&footer),
        Err(e) => println!("=== Footer ===\n  Unreadable: {}", e),
    }
    Ok(true)
}

fn dump_records(path: &Path, limit: Option<usize>, bytes: usize) -> anyhow::Result<bool> {
    let mut reader = DataFileReader::open(path)?;

    let mut count = 0usize;
    let mut total = 0usize;
    for (index, record) in reader.records().enumerate() {
        if limit.is_some_and(|limit| index >= limit) {
            break;
        }
        let payload = record?;
        let head: String = payload
            .iter()
            .take(bytes)
            .map(|b| format!("{:02x}", b))
            .collect();
        println!("{:>8}  {:>8} B  {}", index, payload.len(), head);
        count += 1;
        total += payload.len();
    }

    println!();
    println!("{} records, {} payload bytes", count, total);
    Ok(true)
}

//! quill-writer - load-generating writer driven by a TOML config
//!
//! Usage:
//!   quill-writer --config writer.toml
//!   quill-writer --config writer.toml --producers 8 --records 1000000
//!
//! Runs `[load].producers` threads that each publish
//! `[load].records_per_producer` synthetic records, then shuts the writer
//! down and prints statistics. Ctrl+C drains and closes early.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use quill_rs::common::cli::WriterArgs;
use quill_rs::common::shutdown::{self, setup_shutdown};
use quill_rs::config::Config;
use quill_rs::{Publisher, Record, SchemaRef, WriterBuilder, WriterError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("quill_rs=info".parse()?))
        .init();

    let args = WriterArgs::parse();
    let mut config = Config::load(&args.common.config_file)
        .with_context(|| format!("loading {}", args.common.config_file))?;

    if let Some(destination) = args.destination {
        config.writer.destination = destination;
    }
    if let Some(producers) = args.producers {
        config.load.producers = producers;
    }
    if let Some(records) = args.records_per_producer {
        config.load.records_per_producer = records;
    }
    let seed = args.seed.unwrap_or_else(rand::random);

    info!(config_file = %args.common.config_file, "Loaded configuration");

    if let Some(dir) = config.writer.destination.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating output directory {}", dir.display()))?;
        }
    }

    let schema = config.writer.load_schema()?.into_ref();
    let publisher = Arc::new(WriterBuilder::from_config(&config)?.build()?);

    let (_shutdown_tx, mut shutdown_rx) = setup_shutdown();
    tokio::spawn(async move {
        if shutdown_rx.recv().await.is_ok() {
            println!("\nReceived Ctrl+C, shutting down...");
            let _ = tokio::task::spawn_blocking(shutdown::shutdown_all).await;
        }
    });

    println!("========================================");
    println!("    quill writer started");
    println!("========================================");
    println!();
    println!("  Destination:    {}", publisher.destination().display());
    println!("  Schema:         {}", schema.name());
    println!("  Codec:          {}", config.writer.codec);
    println!("  Ring buffer:    {}", publisher.ring_buffer_size());
    println!("  Wait strategy:  {}", publisher.wait_strategy_name());
    println!("  Producers:      {}", config.load.producers);
    println!("  Records each:   {}", config.load.records_per_producer);
    println!("  Payload bytes:  {}", config.load.payload_bytes);
    println!("  Seed:           {}", seed);
    println!();
    println!("  Press Ctrl+C to stop.");
    println!("========================================");

    let started = Instant::now();
    let mut handles = Vec::with_capacity(config.load.producers);
    for producer in 0..config.load.producers {
        let publisher = publisher.clone();
        let schema = schema.clone();
        let records = config.load.records_per_producer;
        let payload_bytes = config.load.payload_bytes;
        let handle = thread::Builder::new()
            .name(format!("producer-{}", producer))
            .spawn(move || {
                produce(
                    &publisher,
                    &schema,
                    producer as u32,
                    records,
                    payload_bytes,
                    seed,
                )
            })?;
        handles.push(handle);
    }

    let published: u64 = tokio::task::spawn_blocking(move || {
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_default())
            .sum()
    })
    .await?;

    publisher.shutdown();
    let elapsed = started.elapsed().as_secs_f64();
    let stats = publisher.stats();

    println!();
    println!("=== Statistics ===");
    println!("  Published:      {}", published);
    println!("  Written:        {}", stats.written);
    println!("  Dropped:        {}", stats.dropped);
    println!("  Files closed:   {}", stats.files_closed);
    println!("  Rolls:          {}", stats.rolls);
    println!("  Bytes:          {:.2} MB", stats.bytes as f64 / 1_000_000.0);
    println!("  Elapsed:        {:.3} s", elapsed);
    println!("  Rate:           {:.0} records/s", stats.write_rate(elapsed));

    Ok(())
}

/// Publish synthetic records until done or the writer closes
///
/// Payload: producer id (u32 LE), index (u64 LE), then random filler.
fn produce(
    publisher: &Publisher,
    schema: &SchemaRef,
    producer: u32,
    records: u64,
    payload_bytes: usize,
    seed: u64,
) -> u64 {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(producer as u64));
    let size = payload_bytes.max(12);
    let mut published = 0u64;

    for index in 0..records {
        let mut payload = vec![0u8; size];
        payload[0..4].copy_from_slice(&producer.to_le_bytes());
        payload[4..12].copy_from_slice(&index.to_le_bytes());
        rng.fill(&mut payload[12..]);

        match publisher.publish(Record::new(schema.clone(), payload)) {
            Ok(_) => published += 1,
            Err(WriterError::Closed) => {
                warn!(producer, published, "Writer closed, producer stopping");
                break;
            }
            Err(e) => {
                warn!(producer, error = %e, "Publish failed");
                break;
            }
        }
    }
    published
}

//! End-to-end writer tests: producers → ring → consumer → rolled files

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use quill_rs::common::ConsumerState;
use quill_rs::recorder::DataFileReader;
use quill_rs::rolling::{Clock, ManualClock, RollingError};
use quill_rs::{
    Codec, FaultPolicy, ProducerMode, Publisher, Record, RollingPolicy, RollingPolicyConfig,
    Schema, SchemaRef, WriterBuilder, WriterError,
};
use tempfile::tempdir;

fn schema() -> SchemaRef {
    Schema::parse(r#"{"type":"record","name":"Tick","fields":[{"name":"raw","type":"bytes"}]}"#)
        .unwrap()
        .into_ref()
}

fn march_15() -> Arc<ManualClock> {
    Arc::new(ManualClock::starting_at(
        Utc.with_ymd_and_hms(2024, 3, 15, 8, 30, 0).unwrap(),
    ))
}

fn payload(index: u64, size: usize) -> Vec<u8> {
    let mut data = vec![0x5A; size];
    data[..8].copy_from_slice(&index.to_le_bytes());
    data
}

fn wait_for_written(publisher: &Publisher, written: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while publisher.stats().written + publisher.stats().dropped < written {
        assert!(Instant::now() < deadline, "consumer did not catch up");
        thread::sleep(Duration::from_millis(1));
    }
}

fn read_valid(path: &Path) -> Vec<Vec<u8>> {
    let mut reader = DataFileReader::open(path).unwrap();
    let result = reader.validate();
    assert!(result.is_valid, "{}: {:?}", path.display(), result.errors);
    reader.records().map(|r| r.unwrap()).collect()
}

/// Collects every fault it is handed
#[derive(Debug, Default)]
struct RecordingFaults {
    events: Mutex<Vec<(u64, String)>>,
    startup: Mutex<Vec<String>>,
    shutdown: Mutex<Vec<String>>,
}

impl FaultPolicy for RecordingFaults {
    fn on_event_fault(&self, error: &WriterError, sequence: u64, _record: &Record) {
        self.events.lock().push((sequence, error.to_string()));
    }

    fn on_startup_fault(&self, error: &WriterError) {
        self.startup.lock().push(error.to_string());
    }

    fn on_shutdown_fault(&self, error: &WriterError) {
        self.shutdown.lock().push(error.to_string());
    }
}

/// Never rolls; panics inside chosen hooks
#[derive(Debug, Default)]
struct ScriptedPolicy {
    registered: Arc<Mutex<Vec<PathBuf>>>,
    panic_on_should_roll_call: Option<u32>,
    panic_on_open: bool,
    calls: AtomicU32,
}

impl RollingPolicy for ScriptedPolicy {
    fn register_filename(&mut self, path: &Path) -> Result<(), RollingError> {
        self.registered.lock().push(path.to_path_buf());
        Ok(())
    }

    fn should_roll(&mut self, _pending_write_size: u64) -> bool {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.panic_on_should_roll_call == Some(call) {
            panic!("scripted should_roll failure on call {}", call);
        }
        false
    }

    fn next_filename(&mut self) -> Result<PathBuf, RollingError> {
        Err(RollingError::NotRegistered)
    }

    fn file_opened(&mut self, _path: &Path) {
        if self.panic_on_open {
            panic!("scripted file_opened failure");
        }
    }

    fn record_written(&mut self, _bytes: u64) {}
}

#[test]
fn test_many_producers_all_records_written() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("ticks.quill");
    let schema = schema();

    let publisher = WriterBuilder::new()
        .writes_to(&dest)
        .unwrap()
        .writes_records_of(schema.clone())
        .unwrap()
        .with_ring_buffer_size(64)
        .build()
        .unwrap();

    thread::scope(|s| {
        for producer in 0..4u64 {
            let publisher = &publisher;
            let schema = schema.clone();
            s.spawn(move || {
                for i in 0..2_500u64 {
                    let index = producer * 1_000_000 + i;
                    publisher
                        .publish(Record::new(schema.clone(), payload(index, 32)))
                        .unwrap();
                }
            });
        }
    });
    publisher.shutdown();

    let stats = publisher.stats();
    assert_eq!(stats.published, 10_000);
    assert_eq!(stats.written, 10_000);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.files_closed, 1);

    // Per-producer order survives the ring
    let records = read_valid(&dest);
    assert_eq!(records.len(), 10_000);
    let mut last = [None::<u64>; 4];
    for record in &records {
        let index = u64::from_le_bytes(record[..8].try_into().unwrap());
        let producer = (index / 1_000_000) as usize;
        if let Some(prev) = last[producer] {
            assert!(index > prev);
        }
        last[producer] = Some(index);
    }
}

#[test]
fn test_size_roll_keeps_records_whole() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("events.quill");
    let schema = schema();

    let publisher = WriterBuilder::new()
        .writes_to(&dest)
        .unwrap()
        .writes_records_of(schema.clone())
        .unwrap()
        .with_ring_buffer_size(2048)
        .with_codec(Codec::None)
        .with_default_rolling_policy_config(
            RollingPolicyConfig::new().with_file_rolling_size_of(1_000_000),
        )
        .with_clock(march_15())
        .build()
        .unwrap();

    for i in 0..10_000u64 {
        publisher
            .publish(Record::new(schema.clone(), payload(i, 150)))
            .unwrap();
    }
    publisher.shutdown();

    let stats = publisher.stats();
    assert_eq!(stats.written, 10_000);
    assert_eq!(stats.rolls, 1);
    assert_eq!(stats.files_closed, 2);

    // 154-byte blocks: 6,493 fit under 1,000,000, the 6,494th rolls
    let first = read_valid(&dest);
    let rolled = dir.path().join("events.20240315.0001.quill");
    let second = read_valid(&rolled);
    assert_eq!(first.len(), 6_493);
    assert_eq!(second.len(), 3_507);

    let first_blocks = fs::metadata(&dest).unwrap().len();
    assert!(first_blocks > 6_493 * 154);

    let indexes: Vec<u64> = first
        .iter()
        .chain(second.iter())
        .map(|r| u64::from_le_bytes(r[..8].try_into().unwrap()))
        .collect();
    assert_eq!(indexes, (0..10_000).collect::<Vec<_>>());
}

#[test]
fn test_age_roll_with_manual_clock() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("metrics.quill");
    let schema = schema();
    let clock = march_15();

    let publisher = WriterBuilder::new()
        .writes_to(&dest)
        .unwrap()
        .writes_records_of(schema.clone())
        .unwrap()
        .with_default_rolling_policy_config(
            RollingPolicyConfig::new().with_file_rolling_age_of(Duration::from_secs(60)),
        )
        .with_clock(clock.clone() as Arc<dyn Clock>)
        .build()
        .unwrap();

    publisher.publish(Record::new(schema.clone(), payload(0, 16))).unwrap();
    publisher.publish(Record::new(schema.clone(), payload(1, 16))).unwrap();
    wait_for_written(&publisher, 2);

    clock.advance(Duration::from_secs(61));
    publisher.publish(Record::new(schema.clone(), payload(2, 16))).unwrap();
    publisher.shutdown();

    assert_eq!(publisher.stats().rolls, 1);
    assert_eq!(read_valid(&dest).len(), 2);
    assert_eq!(
        read_valid(&dir.path().join("metrics.20240315.0001.quill")).len(),
        1
    );
}

#[test]
fn test_bad_record_is_isolated() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("mixed.quill");
    let schema = schema();
    let other = Schema::parse(r#"{"name":"Other"}"#).unwrap().into_ref();
    let faults = Arc::new(RecordingFaults::default());

    let publisher = WriterBuilder::new()
        .writes_to(&dest)
        .unwrap()
        .writes_records_of(schema.clone())
        .unwrap()
        .with_fault_policy(faults.clone())
        .build()
        .unwrap();

    publisher.publish(Record::new(schema.clone(), payload(0, 16))).unwrap();
    let foreign = publisher.publish(Record::new(other, payload(1, 16))).unwrap();
    let empty = publisher.publish(Record::new(schema.clone(), Vec::new())).unwrap();
    publisher.publish(Record::new(schema.clone(), payload(3, 16))).unwrap();
    publisher.shutdown();

    let stats = publisher.stats();
    assert_eq!(stats.published, 4);
    assert_eq!(stats.written, 2);
    assert_eq!(stats.dropped, 2);
    assert_eq!(publisher.state(), ConsumerState::Closed);

    let events = faults.events.lock();
    let sequences: Vec<u64> = events.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(sequences, vec![foreign, empty]);
    assert!(events[0].1.contains("Schema mismatch"));
    assert!(faults.startup.lock().is_empty());
    assert!(faults.shutdown.lock().is_empty());

    assert_eq!(read_valid(&dest).len(), 2);
}

#[test]
fn test_panicking_policy_drops_only_that_record() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("panic.quill");
    let schema = schema();
    let faults = Arc::new(RecordingFaults::default());

    let policy = ScriptedPolicy {
        panic_on_should_roll_call: Some(3),
        ..Default::default()
    };
    let publisher = WriterBuilder::new()
        .writes_to(&dest)
        .unwrap()
        .writes_records_of(schema.clone())
        .unwrap()
        .with_rolling_policy(Box::new(policy))
        .with_fault_policy(faults.clone())
        .build()
        .unwrap();

    for i in 0..5u64 {
        publisher.publish(Record::new(schema.clone(), payload(i, 16))).unwrap();
    }
    publisher.shutdown();

    let stats = publisher.stats();
    assert_eq!(stats.written, 4);
    assert_eq!(stats.dropped, 1);
    assert_eq!(publisher.state(), ConsumerState::Closed);

    let events = faults.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, 2);
    assert!(events[0].1.contains("scripted should_roll failure"));

    let indexes: Vec<u64> = read_valid(&dest)
        .iter()
        .map(|r| u64::from_le_bytes(r[..8].try_into().unwrap()))
        .collect();
    assert_eq!(indexes, vec![0, 1, 3, 4]);
}

#[test]
fn test_custom_policy_gets_destination() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("custom.quill");
    let policy = ScriptedPolicy::default();
    let registered = policy.registered.clone();

    let publisher = WriterBuilder::new()
        .writes_to(&dest)
        .unwrap()
        .writes_records_of(schema())
        .unwrap()
        .with_rolling_policy(Box::new(policy))
        .build()
        .unwrap();
    publisher.shutdown();

    assert_eq!(*registered.lock(), vec![dest]);
}

#[test]
fn test_bad_capacity_creates_nothing() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("never.quill");

    let err = WriterBuilder::new()
        .writes_to(&dest)
        .unwrap()
        .writes_records_of(schema())
        .unwrap()
        .with_ring_buffer_size(3)
        .build()
        .unwrap_err();

    assert!(matches!(err, WriterError::InvalidConfiguration(_)));
    assert!(!dest.exists());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_startup_fault_leaves_writer_closed() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("startup.quill");
    let schema = schema();
    let faults = Arc::new(RecordingFaults::default());

    let policy = ScriptedPolicy {
        panic_on_open: true,
        ..Default::default()
    };
    let publisher = WriterBuilder::new()
        .writes_to(&dest)
        .unwrap()
        .writes_records_of(schema.clone())
        .unwrap()
        .with_rolling_policy(Box::new(policy))
        .with_fault_policy(faults.clone())
        .build()
        .unwrap();

    assert_eq!(publisher.state(), ConsumerState::Faulted);
    assert!(!publisher.is_accepting());
    assert!(matches!(
        publisher.publish(Record::new(schema.clone(), payload(0, 16))),
        Err(WriterError::Closed)
    ));

    let startup = faults.startup.lock().clone();
    assert_eq!(startup.len(), 1);
    assert!(startup[0].contains("scripted file_opened failure"));

    publisher.shutdown();
    assert_eq!(publisher.state(), ConsumerState::Faulted);
    assert_eq!(publisher.stats().written, 0);
}

#[test]
fn test_single_producer_mode() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("single.quill");
    let schema = schema();

    let publisher = WriterBuilder::new()
        .writes_to(&dest)
        .unwrap()
        .writes_records_of(schema.clone())
        .unwrap()
        .with_producer_mode(ProducerMode::Single)
        .with_ring_buffer_size(8)
        .with_codec(Codec::Lz4)
        .build()
        .unwrap();
    assert_eq!(publisher.producer_mode(), ProducerMode::Single);

    for i in 0..1_000u64 {
        assert_eq!(
            publisher.publish(Record::new(schema.clone(), payload(i, 64))).unwrap(),
            i
        );
    }
    publisher.shutdown();

    let records = read_valid(&dest);
    assert_eq!(records.len(), 1_000);
    assert_eq!(records[999], payload(999, 64));
}

#[test]
fn test_existing_destination_is_truncated() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("reuse.quill");
    fs::write(&dest, vec![0xFF; 10_000]).unwrap();
    let schema = schema();

    let publisher = WriterBuilder::new()
        .writes_to(&dest)
        .unwrap()
        .writes_records_of(schema.clone())
        .unwrap()
        .build()
        .unwrap();
    publisher.publish(Record::new(schema, payload(7, 16))).unwrap();
    publisher.shutdown();

    assert_eq!(read_valid(&dest), vec![payload(7, 16)]);
}

#[cfg(target_os = "linux")]
#[test]
fn test_failed_flush_is_not_counted_as_dropped() {
    let dest = Path::new("/dev/full");
    if !dest.exists() {
        return;
    }
    let schema = schema();
    let faults = Arc::new(RecordingFaults::default());

    let publisher = WriterBuilder::new()
        .writes_to(dest)
        .unwrap()
        .writes_records_of(schema.clone())
        .unwrap()
        .with_fault_policy(faults.clone())
        .build()
        .unwrap();
    publisher.publish(Record::new(schema, payload(0, 16))).unwrap();
    wait_for_written(&publisher, 1);
    publisher.shutdown();

    let stats = publisher.stats();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.written, 1);
    assert_eq!(stats.dropped, 0);
    assert!(stats.written + stats.dropped <= stats.published);
    assert!(faults.events.lock().is_empty());

    // Nothing reached the device; the close reports it
    assert_eq!(stats.files_closed, 0);
    let shutdown = faults.shutdown.lock();
    assert_eq!(shutdown.len(), 1);
    assert!(shutdown[0].contains("No space left"), "{}", shutdown[0]);
    assert_eq!(publisher.state(), ConsumerState::Closed);
}

/// Takes a fixed time to decide on every record
#[derive(Debug)]
struct SlowPolicy {
    delay: Duration,
}

impl RollingPolicy for SlowPolicy {
    fn register_filename(&mut self, _path: &Path) -> Result<(), RollingError> {
        Ok(())
    }

    fn should_roll(&mut self, _pending_write_size: u64) -> bool {
        thread::sleep(self.delay);
        false
    }

    fn next_filename(&mut self) -> Result<PathBuf, RollingError> {
        Err(RollingError::NotRegistered)
    }

    fn file_opened(&mut self, _path: &Path) {}

    fn record_written(&mut self, _bytes: u64) {}
}

#[test]
fn test_drain_timeout_halts_and_closes_file() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("slow.quill");
    let schema = schema();
    let faults = Arc::new(RecordingFaults::default());

    let publisher = WriterBuilder::new()
        .writes_to(&dest)
        .unwrap()
        .writes_records_of(schema.clone())
        .unwrap()
        .with_rolling_policy(Box::new(SlowPolicy {
            delay: Duration::from_millis(50),
        }))
        .with_fault_policy(faults.clone())
        .with_shutdown_timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    for i in 0..100u64 {
        publisher.publish(Record::new(schema.clone(), payload(i, 16))).unwrap();
    }

    let started = Instant::now();
    publisher.shutdown();
    let elapsed = started.elapsed();

    // Drain timeout plus the halt grace, with room for a slow machine
    assert!(elapsed < Duration::from_secs(2), "shutdown took {:?}", elapsed);
    assert_eq!(publisher.state(), ConsumerState::Closed);

    let shutdown = faults.shutdown.lock();
    assert_eq!(shutdown.len(), 1);
    assert!(shutdown[0].contains("timed out"), "{}", shutdown[0]);
    assert!(faults.events.lock().is_empty());

    let stats = publisher.stats();
    assert_eq!(stats.published, 100);
    assert!(stats.written < 100);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.files_closed, 1);

    // Records left in the ring are abandoned; the written ones form a valid file
    let records = read_valid(&dest);
    assert_eq!(records.len() as u64, stats.written);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(*record, payload(i as u64, 16));
    }
}

//! Recorder - the consumer side of the pipeline
//!
//! Architecture (single writer thread):
//! - `RecordConsumer::run` owns the active file and the rolling policy
//! - Records arrive from the ring buffer strictly in sequence order
//! - Every per-record failure is isolated and routed to the fault policy
//!
//! File format:
//! - Header: Magic "QUILL001" + length (4 bytes) + MsgPack metadata
//! - Record blocks: length (4 bytes LE) + codec-encoded payload (repeated)
//! - Footer: Fixed 64 bytes with magic "QLEND001", checksum, completion flag

mod codec;
mod format;

pub use codec::{Codec, DEFAULT_ZSTD_LEVEL};
pub use format::{
    ChecksumCalculator, ContainerWriter, DataFileReader, FileFooter, FileFormatError, FileHeader,
    FileValidationResult, RecordIterator, BLOCK_PREFIX_SIZE, FILE_MAGIC, FOOTER_MAGIC,
    FOOTER_SIZE, FORMAT_VERSION,
};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::common::{
    ConsumerLifecycle, ConsumerState, Record, SchemaRef, WriterError, WriterResult, WriterStats,
};
use crate::fault::FaultPolicy;
use crate::ring::{Delivered, RingConsumer};
use crate::rolling::{Clock, RollingPolicy, SystemClock};

/// Writes delivered records to the active file, rolling as the policy says
///
/// Lives on the consumer thread only; nothing in here is shared.
#[derive(Debug)]
pub struct RecordConsumer {
    destination: PathBuf,
    schema: SchemaRef,
    codec: Codec,
    policy: Box<dyn RollingPolicy>,
    fault: Arc<dyn FaultPolicy>,
    stats: Arc<WriterStats>,
    clock: Arc<dyn Clock>,
    file: Option<ContainerWriter>,
    file_sequence: u32,
}

impl RecordConsumer {
    /// `policy` must already have `destination` registered
    pub fn new(
        destination: PathBuf,
        schema: SchemaRef,
        codec: Codec,
        policy: Box<dyn RollingPolicy>,
        fault: Arc<dyn FaultPolicy>,
        stats: Arc<WriterStats>,
    ) -> Self {
        Self {
            destination,
            schema,
            codec,
            policy,
            fault,
            stats,
            clock: Arc::new(SystemClock),
            file: None,
            file_sequence: 0,
        }
    }

    /// Use `clock` for header and footer timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Path of the file currently receiving records
    pub fn active_file(&self) -> Option<&Path> {
        self.file.as_ref().map(ContainerWriter::path)
    }

    fn header(&self, file_sequence: u32) -> FileHeader {
        FileHeader::new(&self.schema, self.codec, file_sequence, self.clock.wall())
    }

    /// Create (truncating) the initial file at the destination
    pub fn on_start(&mut self) -> WriterResult<()> {
        if self.file.is_some() {
            return Err(WriterError::illegal_state("consumer already started"));
        }
        let header = self.header(0);
        let file = ContainerWriter::create(&self.destination, &header)?;
        self.policy.file_opened(&self.destination);
        self.file = Some(file);
        Ok(())
    }

    /// Encode, roll if needed, and append one record
    ///
    /// The record is buffered on return; `flush` pushes it to the OS.
    pub fn on_event(&mut self, sequence: u64, record: &Record) -> WriterResult<()> {
        record.validate_for(&self.schema)?;
        let block = self.codec.encode(record.payload())?;
        let block_size = BLOCK_PREFIX_SIZE + block.len() as u64;

        if self.policy.should_roll(block_size) {
            self.roll()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| WriterError::illegal_state("no active file"))?;
        let written = file.append(sequence, &block)?;
        self.policy.record_written(written);
        self.stats.record_written(written);
        Ok(())
    }

    /// Push buffered blocks of the active file to the OS
    pub fn flush(&mut self) -> WriterResult<()> {
        match self.file.as_mut() {
            Some(file) => Ok(file.flush()?),
            None => Ok(()),
        }
    }

    /// Open the next file, then finish the previous one
    ///
    /// If the new file cannot be opened the previous file stays active.
    fn roll(&mut self) -> WriterResult<()> {
        let next = self.policy.next_filename()?;
        let header = self.header(self.file_sequence + 1);
        let new_file = ContainerWriter::create(&next, &header)?;

        self.file_sequence += 1;
        let previous = self.file.replace(new_file);
        self.policy.file_opened(&next);
        self.stats.inc_rolls();

        if let Some(previous) = previous {
            debug!(from = %previous.path().display(), to = %next.display(), "Rolling file");
            previous.finish(self.clock.wall())?;
            self.stats.inc_files_closed();
        }
        Ok(())
    }

    /// Finish the active file
    pub fn on_shutdown(&mut self) -> WriterResult<()> {
        if let Some(file) = self.file.take() {
            file.finish(self.clock.wall())?;
            self.stats.inc_files_closed();
        }
        Ok(())
    }

    /// Drive the consumer until the ring is alerted and drained
    ///
    /// Runs on the dedicated consumer thread and reports its progress through
    /// `lifecycle`. Never returns an error; every failure goes to the fault
    /// policy.
    pub fn run(mut self, mut ring: RingConsumer<Record>, lifecycle: Arc<ConsumerLifecycle>) {
        let started = panic::catch_unwind(AssertUnwindSafe(|| self.on_start())).unwrap_or_else(
            |payload| {
                Err(WriterError::illegal_state(format!(
                    "consumer startup panicked: {}",
                    panic_message(payload.as_ref())
                )))
            },
        );
        if let Err(e) = started {
            self.fault.on_startup_fault(&e);
            lifecycle.transition(ConsumerState::Faulted);
            ring.ring().alert();
            return;
        }
        lifecycle.transition(ConsumerState::Running);
        info!(
            destination = %self.destination.display(),
            schema = self.schema.name(),
            codec = %self.codec,
            "Record consumer running"
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.event_loop(&mut ring, &lifecycle);
        }));

        if let Err(payload) = outcome {
            let err = WriterError::illegal_state(format!(
                "consumer loop panicked: {}",
                panic_message(payload.as_ref())
            ));
            self.fault.on_shutdown_fault(&err);
            ring.ring().alert();
            if let Err(e) = self.on_shutdown() {
                self.fault.on_shutdown_fault(&e);
            }
            if !lifecycle.transition(ConsumerState::Faulted) {
                // Died while draining: the file is closed, shutdown completes
                lifecycle.transition(ConsumerState::Closed);
            }
            return;
        }

        if let Err(e) = self.on_shutdown() {
            self.fault.on_shutdown_fault(&e);
        }
        if lifecycle.state() == ConsumerState::Running {
            lifecycle.transition(ConsumerState::ShuttingDown);
        }
        lifecycle.transition(ConsumerState::Closed);

        let stats = self.stats.snapshot();
        info!(
            written = stats.written,
            dropped = stats.dropped,
            files = stats.files_closed,
            bytes_mb = stats.bytes as f64 / 1_000_000.0,
            "Record consumer closed"
        );
    }

    fn event_loop(&mut self, ring: &mut RingConsumer<Record>, lifecycle: &ConsumerLifecycle) {
        while let Some(Delivered {
            sequence,
            value: record,
            end_of_batch,
        }) = ring.next_to_consume()
        {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| self.on_event(sequence, &record)));

            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(payload) => Some(WriterError::illegal_state(format!(
                    "record handler panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            };
            if let Some(e) = error {
                self.stats.inc_dropped();
                self.fault.on_event_fault(&e, sequence, &record);
            }

            // Appended records stay buffered if this fails and go out with
            // a later flush or the footer
            if end_of_batch {
                if let Err(e) = self.flush() {
                    warn!(sequence, error = %e, "Flush at end of batch failed");
                }
            }

            if lifecycle.halt_requested() {
                warn!(
                    next_sequence = ring.sequence(),
                    "Drain halted before the ring was empty"
                );
                break;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Schema;
    use crate::fault::LoggingFaultPolicy;
    use crate::rolling::{RollingError, RollingPolicyConfig, TimeAndSizeBasedRollingPolicy};
    use tempfile::tempdir;

    fn schema() -> SchemaRef {
        Schema::parse(r#"{"type":"record","name":"Reading","fields":[]}"#)
            .unwrap()
            .into_ref()
    }

    fn consumer(destination: &Path, max_size: u64) -> (RecordConsumer, Arc<WriterStats>) {
        let mut policy = TimeAndSizeBasedRollingPolicy::new(
            RollingPolicyConfig::new().with_file_rolling_size_of(max_size),
        )
        .unwrap();
        policy.register_filename(destination).unwrap();
        let stats = Arc::new(WriterStats::new());
        let consumer = RecordConsumer::new(
            destination.to_path_buf(),
            schema(),
            Codec::None,
            Box::new(policy),
            Arc::new(LoggingFaultPolicy),
            stats.clone(),
        );
        (consumer, stats)
    }

    fn read_all(path: &Path) -> Vec<Vec<u8>> {
        let mut reader = DataFileReader::open(path).unwrap();
        let result = reader.validate();
        assert!(result.is_valid, "{}: {:?}", path.display(), result.errors);
        reader.records().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_start_truncates_destination() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.quill");
        std::fs::write(&dest, vec![0xAA; 4096]).unwrap();

        let (mut consumer, _) = consumer(&dest, 1_000_000);
        consumer.on_start().unwrap();
        consumer.on_shutdown().unwrap();

        assert!(read_all(&dest).is_empty());
    }

    #[test]
    fn test_roll_keeps_records_whole() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.quill");
        let (mut consumer, stats) = consumer(&dest, 100);
        let schema = schema();

        consumer.on_start().unwrap();
        // 4 + 40 = 44 byte blocks: two fit in 100, the third rolls
        for seq in 0..5u64 {
            let record = Record::new(schema.clone(), vec![seq as u8 + 1; 40]);
            consumer.on_event(seq, &record).unwrap();
        }
        let rolled = consumer.active_file().unwrap().to_path_buf();
        consumer.on_shutdown().unwrap();

        assert_ne!(rolled, dest);
        assert_eq!(read_all(&dest).len(), 2);

        let snap = stats.snapshot();
        assert_eq!(snap.written, 5);
        assert_eq!(snap.rolls, 2);
        assert_eq!(snap.files_closed, 3);
        assert_eq!(snap.bytes, 5 * 44);
    }

    #[test]
    fn test_event_rejects_foreign_schema() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.quill");
        let (mut consumer, _) = consumer(&dest, 1_000_000);
        consumer.on_start().unwrap();

        let other = Schema::parse(r#"{"name":"Other"}"#).unwrap().into_ref();
        let err = consumer
            .on_event(0, &Record::new(other, vec![1u8]))
            .unwrap_err();
        assert!(matches!(err, WriterError::Encoding(_)));

        consumer.on_event(1, &Record::new(schema(), vec![2u8])).unwrap();
        consumer.on_shutdown().unwrap();
        assert_eq!(read_all(&dest), vec![vec![2u8]]);
    }

    /// Rolls on every record to a path that cannot be created
    #[derive(Debug)]
    struct UnwritableNextPolicy {
        next: PathBuf,
    }

    impl RollingPolicy for UnwritableNextPolicy {
        fn register_filename(&mut self, _path: &Path) -> Result<(), RollingError> {
            Ok(())
        }

        fn should_roll(&mut self, _pending_write_size: u64) -> bool {
            true
        }

        fn next_filename(&mut self) -> Result<PathBuf, RollingError> {
            Ok(self.next.clone())
        }

        fn file_opened(&mut self, _path: &Path) {}

        fn record_written(&mut self, _bytes: u64) {}
    }

    #[test]
    fn test_failed_roll_keeps_previous_file() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.quill");
        let mut consumer = RecordConsumer::new(
            dest.clone(),
            schema(),
            Codec::None,
            Box::new(UnwritableNextPolicy {
                next: dir.path().join("missing").join("next.quill"),
            }),
            Arc::new(LoggingFaultPolicy),
            Arc::new(WriterStats::new()),
        );

        consumer.on_start().unwrap();
        let err = consumer
            .on_event(0, &Record::new(schema(), vec![1u8; 8]))
            .unwrap_err();
        assert!(matches!(err, WriterError::Format(FileFormatError::Io(_))));
        assert_eq!(consumer.active_file(), Some(dest.as_path()));

        consumer.on_shutdown().unwrap();
        assert!(read_all(&dest).is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_flush_failure_leaves_record_written() {
        let dest = Path::new("/dev/full");
        if !dest.exists() {
            return;
        }
        let (mut consumer, stats) = consumer(dest, 1_000_000);
        consumer.on_start().unwrap();

        // The block fits the write buffer; only pushing it out fails
        consumer.on_event(0, &Record::new(schema(), vec![5u8; 16])).unwrap();
        assert!(matches!(
            consumer.flush(),
            Err(WriterError::Format(FileFormatError::Io(_)))
        ));

        let snap = stats.snapshot();
        assert_eq!(snap.written, 1);
        assert_eq!(snap.dropped, 0);
        assert!(consumer.on_shutdown().is_err());
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 7");
    }
}

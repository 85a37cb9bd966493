//! Publisher - the producer-facing side of a writer
//!
//! Architecture:
//! - Producers call `publish` from any thread; it only claims a ring slot
//! - One dedicated thread ("quill-consumer") runs the `RecordConsumer`
//! - `shutdown` stops intake, drains the ring and closes the file
//!
//! # Example
//! ```ignore
//! let publisher = WriterBuilder::new()
//!     .writes_to("./data/events.quill")?
//!     .writes_records_of(schema)?
//!     .build()?;
//! publisher.publish(Record::encode(schema.clone(), &event)?)?;
//! publisher.shutdown();
//! ```

mod builder;

pub use builder::{IntoSchema, OptionalSteps, SchemaStep, WriterBuilder, WriterConfig};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::common::shutdown::{self, ShutdownHandle};
use crate::common::{
    ConsumerLifecycle, ConsumerState, Record, StatsSnapshot, WriterError, WriterResult,
    WriterStats,
};
use crate::fault::FaultPolicy;
use crate::recorder::RecordConsumer;
use crate::ring::{ProducerMode, RingBuffer};

/// Default time `shutdown` waits for the drain
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra wait after a drain timeout for the consumer to close the file
const HALT_GRACE: Duration = Duration::from_secs(1);

static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

struct PublisherInner {
    id: u64,
    destination: PathBuf,
    ring: Arc<RingBuffer<Record>>,
    lifecycle: Arc<ConsumerLifecycle>,
    /// Publishes between the accepting check and the slot publish
    in_flight: AtomicUsize,
    executor: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    /// Serializes shutdown; true once it has completed
    shutdown_done: Mutex<bool>,
    shutdown_timeout: Duration,
    stats: Arc<WriterStats>,
    fault: Arc<dyn FaultPolicy>,
}

/// Decrements the in-flight count however `publish` returns
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PublisherInner {
    fn shutdown(&self) {
        let mut done = self.shutdown_done.lock();
        if *done {
            return;
        }
        let deadline = Instant::now() + self.shutdown_timeout;
        self.lifecycle.stop_accepting();

        if !self.started.load(Ordering::Acquire) {
            self.lifecycle.transition(ConsumerState::Closed);
            self.ring.alert();
            *done = true;
            debug!(writer = self.id, "Writer closed before its consumer started");
            return;
        }

        info!(writer = self.id, destination = %self.destination.display(), "Shutting down writer");

        // Publishers that passed the accepting check finish their slot first
        let wait = self.ring.wait_strategy().clone();
        let mut attempt = 0u32;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            wait.wait(attempt);
            attempt = attempt.saturating_add(1);
        }

        if self.lifecycle.state() == ConsumerState::Running {
            self.lifecycle.transition(ConsumerState::ShuttingDown);
        }
        self.ring.alert();

        let mut state = self.lifecycle.wait_terminal_until(deadline);
        if !state.is_terminal() {
            self.lifecycle.request_halt();
            let err = WriterError::timeout(format!(
                "consumer did not drain within {:?}; {} records left",
                self.shutdown_timeout,
                self.ring.claimed().saturating_sub(self.ring.consumed())
            ));
            self.fault.on_shutdown_fault(&err);
            state = self.lifecycle.wait_terminal(HALT_GRACE);
        }

        let handle = self.executor.lock().take();
        match handle {
            Some(handle) if state.is_terminal() => {
                if handle.join().is_err() {
                    warn!(writer = self.id, "Consumer thread panicked");
                }
            }
            Some(_) => warn!(writer = self.id, state = %state, "Consumer thread detached"),
            None => {}
        }

        *done = true;
        let stats = self.stats.snapshot();
        info!(
            writer = self.id,
            state = %state,
            published = stats.published,
            written = stats.written,
            dropped = stats.dropped,
            files = stats.files_closed,
            "Writer shut down"
        );
    }
}

impl ShutdownHandle for PublisherInner {
    fn handle_id(&self) -> u64 {
        self.id
    }

    fn shutdown_now(&self) {
        self.shutdown();
    }
}

/// Producer handle of one writer
///
/// Share it between producer threads by reference (or behind an `Arc`);
/// dropping it shuts the writer down.
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    /// Wrap a ring buffer whose consumer side is still unclaimed
    pub fn new(
        destination: PathBuf,
        ring: Arc<RingBuffer<Record>>,
        stats: Arc<WriterStats>,
        fault: Arc<dyn FaultPolicy>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                id: NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed),
                destination,
                ring,
                lifecycle: Arc::new(ConsumerLifecycle::new()),
                in_flight: AtomicUsize::new(0),
                executor: Mutex::new(None),
                started: AtomicBool::new(false),
                shutdown_done: Mutex::new(false),
                shutdown_timeout,
                stats,
                fault,
            }),
        }
    }

    /// Hand a record to the writer, returning its sequence
    ///
    /// Blocks (per wait strategy) while the ring is full. Fails with
    /// `Closed` when the writer is not accepting records.
    pub fn publish(&self, record: Record) -> WriterResult<u64> {
        let inner = &self.inner;
        let _in_flight = InFlight::enter(&inner.in_flight);
        if !inner.lifecycle.is_accepting() {
            return Err(WriterError::Closed);
        }

        let claim = inner.ring.claim()?;
        let sequence = claim.sequence();
        claim.publish(record);
        inner.stats.inc_published();
        Ok(sequence)
    }

    /// Start the consumer thread and wait until it is running or faulted
    ///
    /// A startup fault is not an error here: it went to the fault policy and
    /// the writer simply never accepts records.
    pub fn start_consumer_using(&self, consumer: RecordConsumer) -> WriterResult<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(WriterError::illegal_state("consumer already started"));
        }

        let ring_consumer = inner.ring.consumer()?;
        let lifecycle = inner.lifecycle.clone();
        let handle = thread::Builder::new()
            .name("quill-consumer".to_string())
            .spawn(move || consumer.run(ring_consumer, lifecycle))?;
        *inner.executor.lock() = Some(handle);

        match inner.lifecycle.wait_for_startup() {
            ConsumerState::Running => {
                info!(
                    writer = inner.id,
                    destination = %inner.destination.display(),
                    capacity = inner.ring.capacity(),
                    "Writer started"
                );
            }
            state => warn!(writer = inner.id, state = %state, "Writer did not start"),
        }
        Ok(())
    }

    /// Register with the process-wide shutdown registry
    pub fn register_executor_for_shutdown(&self) {
        let handle: Weak<dyn ShutdownHandle> = Arc::downgrade(&self.inner) as Weak<dyn ShutdownHandle>;
        shutdown::register(handle);
    }

    pub fn is_registered_for_shutdown(&self) -> bool {
        shutdown::is_registered(self.inner.id)
    }

    /// Stop intake, drain, close the file; idempotent
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn destination(&self) -> &Path {
        &self.inner.destination
    }

    pub fn state(&self) -> ConsumerState {
        self.inner.lifecycle.state()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.lifecycle.is_accepting()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn ring_buffer_size(&self) -> usize {
        self.inner.ring.capacity()
    }

    pub fn producer_mode(&self) -> ProducerMode {
        self.inner.ring.mode()
    }

    pub fn wait_strategy_name(&self) -> &'static str {
        self.inner.ring.wait_strategy().name()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.inner.shutdown_timeout
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("id", &self.inner.id)
            .field("destination", &self.inner.destination)
            .field("state", &self.state())
            .field("ring", &self.inner.ring)
            .finish()
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Schema;
    use crate::fault::LoggingFaultPolicy;
    use crate::recorder::{Codec, DataFileReader};
    use crate::ring::SleepingWaitStrategy;
    use crate::rolling::{RollingPolicy, RollingPolicyConfig, TimeAndSizeBasedRollingPolicy};
    use crate::common::SchemaRef;
    use tempfile::tempdir;

    fn schema() -> SchemaRef {
        Schema::parse(r#"{"name":"Reading"}"#).unwrap().into_ref()
    }

    fn parts(dest: &Path) -> (Publisher, RecordConsumer) {
        let ring = Arc::new(
            RingBuffer::new(
                16,
                ProducerMode::Multi,
                Arc::new(SleepingWaitStrategy::default()),
            )
            .unwrap(),
        );
        let stats = Arc::new(WriterStats::new());
        let fault: Arc<dyn FaultPolicy> = Arc::new(LoggingFaultPolicy);
        let mut policy = TimeAndSizeBasedRollingPolicy::new(RollingPolicyConfig::default()).unwrap();
        policy.register_filename(dest).unwrap();

        let consumer = RecordConsumer::new(
            dest.to_path_buf(),
            schema(),
            Codec::None,
            Box::new(policy),
            fault.clone(),
            stats.clone(),
        );
        let publisher = Publisher::new(
            dest.to_path_buf(),
            ring,
            stats,
            fault,
            Duration::from_secs(5),
        );
        (publisher, consumer)
    }

    #[test]
    fn test_publish_before_start_is_closed() {
        let dir = tempdir().unwrap();
        let (publisher, _consumer) = parts(&dir.path().join("out.quill"));
        assert!(matches!(
            publisher.publish(Record::new(schema(), vec![1u8])),
            Err(WriterError::Closed)
        ));
    }

    #[test]
    fn test_start_twice_fails() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.quill");
        let (publisher, consumer) = parts(&dest);
        publisher.start_consumer_using(consumer).unwrap();
        assert_eq!(publisher.state(), ConsumerState::Running);

        let (_, second) = parts(&dest);
        assert!(matches!(
            publisher.start_consumer_using(second),
            Err(WriterError::IllegalState(_))
        ));
    }

    #[test]
    fn test_publish_then_shutdown_drains() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.quill");
        let (publisher, consumer) = parts(&dest);
        publisher.start_consumer_using(consumer).unwrap();

        for i in 0..100u64 {
            assert_eq!(publisher.publish(Record::new(schema(), vec![i as u8 + 1])).unwrap(), i);
        }
        publisher.shutdown();
        assert_eq!(publisher.state(), ConsumerState::Closed);
        assert!(matches!(
            publisher.publish(Record::new(schema(), vec![1u8])),
            Err(WriterError::Closed)
        ));

        let stats = publisher.stats();
        assert_eq!(stats.published, 100);
        assert_eq!(stats.written, 100);
        assert_eq!(stats.pending(), 0);

        let mut reader = DataFileReader::open(&dest).unwrap();
        assert!(reader.validate().is_valid);
        assert_eq!(reader.records().count(), 100);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dir = tempdir().unwrap();
        let (publisher, consumer) = parts(&dir.path().join("out.quill"));
        publisher.start_consumer_using(consumer).unwrap();
        publisher.shutdown();
        publisher.shutdown();
        assert_eq!(publisher.state(), ConsumerState::Closed);
    }

    #[test]
    fn test_shutdown_without_start_closes() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.quill");
        let (publisher, _consumer) = parts(&dest);
        publisher.shutdown();
        assert_eq!(publisher.state(), ConsumerState::Closed);
        assert!(!dest.exists());
    }

    #[test]
    fn test_registration_follows_lifetime() {
        let dir = tempdir().unwrap();
        let (publisher, consumer) = parts(&dir.path().join("out.quill"));
        publisher.start_consumer_using(consumer).unwrap();
        assert!(!publisher.is_registered_for_shutdown());

        publisher.register_executor_for_shutdown();
        assert!(publisher.is_registered_for_shutdown());

        let id = publisher.id();
        drop(publisher);
        assert!(!shutdown::is_registered(id));
    }
}

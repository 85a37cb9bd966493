//! Staged construction of a writer
//!
//! `WriterBuilder` → `SchemaStep` → `OptionalSteps` → `Publisher`. The two
//! mandatory inputs are taken by dedicated stages so a writer without a
//! destination or schema cannot be expressed. Every check runs before any
//! thread is spawned or file created.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{Publisher, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::common::{Schema, SchemaRef, WriterError, WriterResult, WriterStats};
use crate::config::Config;
use crate::fault::{FaultPolicy, LoggingFaultPolicy};
use crate::recorder::{Codec, RecordConsumer};
use crate::ring::{ProducerMode, RingBuffer, SleepingWaitStrategy, WaitStrategy};
use crate::rolling::{
    Clock, RollingPolicy, RollingPolicyConfig, SystemClock, TimeAndSizeBasedRollingPolicy,
};

/// Default ring buffer capacity
pub const DEFAULT_RING_BUFFER_SIZE: usize = 2048;

/// Anything `writes_records_of` accepts as a schema
pub trait IntoSchema {
    fn into_schema(self) -> WriterResult<SchemaRef>;
}

impl IntoSchema for SchemaRef {
    fn into_schema(self) -> WriterResult<SchemaRef> {
        Ok(self)
    }
}

impl IntoSchema for Schema {
    fn into_schema(self) -> WriterResult<SchemaRef> {
        Ok(self.into_ref())
    }
}

impl IntoSchema for Option<SchemaRef> {
    fn into_schema(self) -> WriterResult<SchemaRef> {
        self.ok_or_else(|| WriterError::invalid_argument("a record schema is required"))
    }
}

impl IntoSchema for &str {
    fn into_schema(self) -> WriterResult<SchemaRef> {
        Schema::parse(self)
            .map(Schema::into_ref)
            .map_err(|e| WriterError::invalid_argument(format!("invalid schema: {}", e)))
    }
}

/// First stage: where the records go
#[derive(Debug, Default)]
pub struct WriterBuilder;

impl WriterBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Set the initial output file
    pub fn writes_to(self, path: impl AsRef<Path>) -> WriterResult<SchemaStep> {
        let destination = validate_destination(path.as_ref())?;
        Ok(SchemaStep { destination })
    }

    /// Builder pre-filled from a configuration file
    pub fn from_config(config: &Config) -> WriterResult<OptionalSteps> {
        let schema = config.writer.load_schema()?;
        Ok(Self::new()
            .writes_to(&config.writer.destination)?
            .writes_records_of(schema)?
            .with_ring_buffer_size(config.writer.ring_buffer_size)
            .with_producer_mode(config.writer.producer_mode)
            .with_wait_strategy(config.writer.wait_strategy.build())
            .with_codec(config.writer.codec)
            .with_default_rolling_policy_config(config.rolling.to_policy_config())
            .with_shutdown_timeout(config.writer.shutdown_timeout()))
    }
}

/// Second stage: what the records are
#[derive(Debug)]
pub struct SchemaStep {
    destination: PathBuf,
}

impl SchemaStep {
    pub fn writes_records_of(self, schema: impl IntoSchema) -> WriterResult<OptionalSteps> {
        let schema = schema.into_schema()?;
        Ok(OptionalSteps {
            destination: self.destination,
            schema,
            ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
            producer_mode: ProducerMode::default(),
            wait_strategy: Arc::new(SleepingWaitStrategy::default()),
            codec: Codec::default(),
            rolling_policy: None,
            rolling_config: None,
            fault_policy: Arc::new(LoggingFaultPolicy),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            clock: Arc::new(SystemClock),
        })
    }
}

/// Final stage: optional tuning, then `validate` or `build`
#[derive(Debug)]
pub struct OptionalSteps {
    destination: PathBuf,
    schema: SchemaRef,
    ring_buffer_size: usize,
    producer_mode: ProducerMode,
    wait_strategy: Arc<dyn WaitStrategy>,
    codec: Codec,
    rolling_policy: Option<Box<dyn RollingPolicy>>,
    rolling_config: Option<RollingPolicyConfig>,
    fault_policy: Arc<dyn FaultPolicy>,
    shutdown_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl OptionalSteps {
    /// Ring capacity; must be a power of two
    pub fn with_ring_buffer_size(mut self, size: usize) -> Self {
        self.ring_buffer_size = size;
        self
    }

    pub fn with_producer_mode(mut self, mode: ProducerMode) -> Self {
        self.producer_mode = mode;
        self
    }

    pub fn with_wait_strategy(mut self, strategy: Arc<dyn WaitStrategy>) -> Self {
        self.wait_strategy = strategy;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Replace the built-in rolling policy wholesale
    pub fn with_rolling_policy(mut self, policy: Box<dyn RollingPolicy>) -> Self {
        self.rolling_policy = Some(policy);
        self
    }

    /// Thresholds for the built-in time-and-size policy
    pub fn with_default_rolling_policy_config(mut self, config: RollingPolicyConfig) -> Self {
        self.rolling_config = Some(config);
        self
    }

    pub fn with_fault_policy(mut self, policy: Arc<dyn FaultPolicy>) -> Self {
        self.fault_policy = policy;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Time source for the built-in rolling policy and file timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check every setting and resolve the rolling policy
    pub fn validate(self) -> WriterResult<WriterConfig> {
        if self.ring_buffer_size == 0 || !self.ring_buffer_size.is_power_of_two() {
            return Err(WriterError::invalid_configuration(format!(
                "ring buffer size must be a power of two, got {}",
                self.ring_buffer_size
            )));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(WriterError::invalid_configuration(
                "shutdown timeout must be greater than zero",
            ));
        }

        let rolling_policy: Box<dyn RollingPolicy> = match (self.rolling_policy, self.rolling_config)
        {
            (Some(_), Some(_)) => {
                return Err(WriterError::invalid_configuration(
                    "a custom rolling policy cannot be combined with a default rolling policy config",
                ))
            }
            (Some(policy), None) => policy,
            (None, config) => Box::new(TimeAndSizeBasedRollingPolicy::with_clock(
                config.unwrap_or_default(),
                self.clock.clone(),
            )?),
        };

        Ok(WriterConfig {
            destination: self.destination,
            schema: self.schema,
            ring_buffer_size: self.ring_buffer_size,
            producer_mode: self.producer_mode,
            wait_strategy: self.wait_strategy,
            codec: self.codec,
            rolling_policy,
            fault_policy: self.fault_policy,
            shutdown_timeout: self.shutdown_timeout,
            clock: self.clock,
        })
    }

    /// Validate, then start the writer
    pub fn build(self) -> WriterResult<Publisher> {
        self.validate()?.start()
    }
}

/// Fully validated writer settings
#[derive(Debug)]
pub struct WriterConfig {
    pub destination: PathBuf,
    pub schema: SchemaRef,
    pub ring_buffer_size: usize,
    pub producer_mode: ProducerMode,
    pub wait_strategy: Arc<dyn WaitStrategy>,
    pub codec: Codec,
    pub rolling_policy: Box<dyn RollingPolicy>,
    pub fault_policy: Arc<dyn FaultPolicy>,
    pub shutdown_timeout: Duration,
    pub clock: Arc<dyn Clock>,
}

impl WriterConfig {
    /// Register the destination, start the consumer, register for shutdown
    pub fn start(mut self) -> WriterResult<Publisher> {
        self.rolling_policy.register_filename(&self.destination)?;

        let ring = Arc::new(RingBuffer::new(
            self.ring_buffer_size,
            self.producer_mode,
            self.wait_strategy,
        )?);
        let stats = Arc::new(WriterStats::new());

        let consumer = RecordConsumer::new(
            self.destination.clone(),
            self.schema,
            self.codec,
            self.rolling_policy,
            self.fault_policy.clone(),
            stats.clone(),
        )
        .with_clock(self.clock);

        let publisher = Publisher::new(
            self.destination,
            ring,
            stats,
            self.fault_policy,
            self.shutdown_timeout,
        );
        publisher.start_consumer_using(consumer)?;
        publisher.register_executor_for_shutdown();
        Ok(publisher)
    }
}

fn validate_destination(path: &Path) -> WriterResult<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(WriterError::invalid_argument("destination path is empty"));
    }

    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Err(WriterError::invalid_argument(format!(
            "destination {} is a directory",
            path.display()
        ))),
        Ok(meta) => {
            if meta.permissions().readonly() {
                return Err(WriterError::invalid_argument(format!(
                    "destination {} is not writable",
                    path.display()
                )));
            }
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| {
                    WriterError::invalid_argument(format!(
                        "destination {} is not readable and writable: {}",
                        path.display(),
                        e
                    ))
                })?;
            Ok(path.to_path_buf())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let parent = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            validate_parent(parent)?;
            debug!(path = %path.display(), "Destination will be created");
            Ok(path.to_path_buf())
        }
        Err(e) => Err(WriterError::invalid_argument(format!(
            "destination {} is not accessible: {}",
            path.display(),
            e
        ))),
    }
}

fn validate_parent(parent: &Path) -> WriterResult<()> {
    let meta = fs::metadata(parent).map_err(|_| {
        WriterError::invalid_argument(format!(
            "parent directory {} does not exist",
            parent.display()
        ))
    })?;
    if !meta.is_dir() {
        return Err(WriterError::invalid_argument(format!(
            "parent {} is not a directory",
            parent.display()
        )));
    }
    fs::read_dir(parent).map_err(|e| {
        WriterError::invalid_argument(format!(
            "parent directory {} is not readable: {}",
            parent.display(),
            e
        ))
    })?;
    if meta.permissions().readonly() {
        return Err(WriterError::invalid_argument(format!(
            "parent directory {} is not writable",
            parent.display()
        )));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(WriterError::invalid_argument(format!(
                "parent directory {} is not executable",
                parent.display()
            )));
        }
    }
    Ok(())
}

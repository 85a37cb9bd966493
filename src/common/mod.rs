//! Common types shared across the writer
//!
//! Records and schemas, the error type, statistics, the consumer lifecycle
//! and process-level shutdown plumbing.

pub mod cli;
pub mod error;
pub mod metrics;
pub mod record;
pub mod shutdown;
pub mod state;

pub use error::{WriterError, WriterResult};
pub use metrics::{StatsSnapshot, WriterStats};
pub use record::{EncodingError, Record, Schema, SchemaRef, MAX_RECORD_SIZE};
pub use state::{ConsumerLifecycle, ConsumerState};

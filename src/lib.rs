//! QUILL-RS: Asynchronous rolling record writer
//!
//! Many producer threads hand schema-described records to a lock-free ring
//! buffer; one dedicated thread writes them to container files, rolling to a
//! new file when a size or age threshold is reached.

pub mod common;
pub mod config;
pub mod fault;
pub mod publisher;
pub mod recorder;
pub mod ring;
pub mod rolling;

pub use common::{Record, Schema, SchemaRef, StatsSnapshot, WriterError, WriterResult};
pub use fault::{FaultPolicy, LoggingFaultPolicy};
pub use publisher::{Publisher, WriterBuilder, WriterConfig};
pub use recorder::Codec;
pub use ring::{ProducerMode, WaitStrategyKind};
pub use rolling::{RollingPolicy, RollingPolicyConfig, TimeAndSizeBasedRollingPolicy};

//! Fault policy - what happens when the consumer side fails
//!
//! Every failure the consumer thread hits is handed to a `FaultPolicy`
//! instead of being propagated. Producers never see runtime faults.

use std::fmt;

use tracing::error;

use crate::common::{Record, WriterError};

/// Receives consumer-side failures
///
/// Implementations must not panic; the hooks run on the consumer thread.
pub trait FaultPolicy: Send + Sync + fmt::Debug {
    /// A record failed to encode or write; it has been dropped
    fn on_event_fault(&self, error: &WriterError, sequence: u64, record: &Record);

    /// The initial file could not be opened; the writer will not start
    fn on_startup_fault(&self, error: &WriterError);

    /// Closing the file or draining the ring failed during shutdown
    fn on_shutdown_fault(&self, error: &WriterError);
}

/// Logs every fault with `tracing::error!`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFaultPolicy;

impl FaultPolicy for LoggingFaultPolicy {
    fn on_event_fault(&self, error: &WriterError, sequence: u64, record: &Record) {
        error!(
            sequence,
            schema = record.schema().name(),
            payload_bytes = record.len(),
            error = %error,
            "Dropped record after write fault"
        );
    }

    fn on_startup_fault(&self, error: &WriterError) {
        error!(error = %error, "Writer failed to start");
    }

    fn on_shutdown_fault(&self, error: &WriterError) {
        error!(error = %error, "Fault during writer shutdown");
    }
}

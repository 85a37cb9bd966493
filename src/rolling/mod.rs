//! Rolling policy - decides when the active file is replaced
//!
//! The policy is owned by the consumer thread. It sees every write through
//! `record_written` and every new file through `file_opened`, and is asked
//! `should_roll` before each write with the size the write would add.
//!
//! File naming: `<stem>.<YYYYMMDD>.<NNNN>.<ext>`
//!   - stem/ext: taken from the registered destination
//!   - YYYYMMDD: UTC date when the name was issued
//!   - NNNN: monotonic index (4 digits, zero-padded), never reused

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Default maximum file size (1 GiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Default maximum file age (10 minutes)
pub const DEFAULT_MAX_FILE_AGE: Duration = Duration::from_secs(600);

/// Rolling policy errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RollingError {
    #[error("Filename already registered: {0}")]
    AlreadyRegistered(PathBuf),

    #[error("No filename registered")]
    NotRegistered,

    #[error("Rolling policy needs a maximum file age or a maximum file size")]
    NoThreshold,

    #[error("Filename index exhausted for {0}")]
    Exhausted(PathBuf),
}

/// Decides when to roll and what the next file is called
pub trait RollingPolicy: Send + fmt::Debug {
    /// Bind the policy to the initial destination; exactly once
    fn register_filename(&mut self, path: &Path) -> Result<(), RollingError>;

    /// Whether writing `pending_write_size` more bytes must go to a new file
    fn should_roll(&mut self, pending_write_size: u64) -> bool;

    /// Name for the next file, distinct from every name issued before
    fn next_filename(&mut self) -> Result<PathBuf, RollingError>;

    /// A new file became active; resets size and age
    fn file_opened(&mut self, path: &Path);

    /// `bytes` were appended to the active file
    fn record_written(&mut self, bytes: u64);
}

/// Time source for age checks and roll filenames
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic time used for file age
    fn now(&self) -> Instant;

    /// Wall clock used for filenames and headers
    fn wall(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    wall_base: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Start the wall clock at `wall`
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            base: Instant::now(),
            wall_base: wall,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn wall(&self) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(*self.offset.lock())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_base + offset
    }
}

/// Thresholds for the built-in policy
///
/// `new()` starts with no threshold; `Default` carries 1 GiB and 10 minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingPolicyConfig {
    pub max_file_age: Option<Duration>,
    pub max_file_size: Option<u64>,
}

impl RollingPolicyConfig {
    pub fn new() -> Self {
        Self {
            max_file_age: None,
            max_file_size: None,
        }
    }

    pub fn with_file_rolling_size_of(mut self, bytes: u64) -> Self {
        self.max_file_size = Some(bytes);
        self
    }

    pub fn with_file_rolling_age_of(mut self, age: Duration) -> Self {
        self.max_file_age = Some(age);
        self
    }

    pub fn has_threshold(&self) -> bool {
        self.max_file_age.is_some() || self.max_file_size.is_some()
    }
}

impl Default for RollingPolicyConfig {
    fn default() -> Self {
        Self::new()
            .with_file_rolling_size_of(DEFAULT_MAX_FILE_SIZE)
            .with_file_rolling_age_of(DEFAULT_MAX_FILE_AGE)
    }
}

/// Rolls when the active file is too old or the next write would make it
/// too large, whichever comes first
#[derive(Debug)]
pub struct TimeAndSizeBasedRollingPolicy {
    config: RollingPolicyConfig,
    clock: Arc<dyn Clock>,
    base: Option<PathBuf>,
    current: Option<PathBuf>,
    current_size: u64,
    opened_at: Instant,
    /// Index of the next candidate name; only grows, so no name repeats
    next_index: u32,
}

impl TimeAndSizeBasedRollingPolicy {
    pub fn new(config: RollingPolicyConfig) -> Result<Self, RollingError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: RollingPolicyConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RollingError> {
        if !config.has_threshold() {
            return Err(RollingError::NoThreshold);
        }
        let opened_at = clock.now();
        Ok(Self {
            config,
            clock,
            base: None,
            current: None,
            current_size: 0,
            opened_at,
            next_index: 1,
        })
    }

    pub fn config(&self) -> &RollingPolicyConfig {
        &self.config
    }

    /// Active file, if one has been opened
    pub fn current_filename(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    fn candidate(base: &Path, date: &str, index: u32) -> PathBuf {
        let stem = base
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        let name = match base.extension() {
            Some(ext) => format!("{}.{}.{:04}.{}", stem, date, index, ext.to_string_lossy()),
            None => format!("{}.{}.{:04}", stem, date, index),
        };
        base.with_file_name(name)
    }
}

impl RollingPolicy for TimeAndSizeBasedRollingPolicy {
    fn register_filename(&mut self, path: &Path) -> Result<(), RollingError> {
        if let Some(existing) = &self.base {
            return Err(RollingError::AlreadyRegistered(existing.clone()));
        }
        self.base = Some(path.to_path_buf());
        debug!(path = %path.display(), "Rolling policy registered destination");
        Ok(())
    }

    fn should_roll(&mut self, pending_write_size: u64) -> bool {
        if let Some(max_age) = self.config.max_file_age {
            let age = self.clock.now().saturating_duration_since(self.opened_at);
            if age >= max_age {
                debug!(age_ms = age.as_millis() as u64, "File age threshold reached");
                return true;
            }
        }

        if let Some(max_size) = self.config.max_file_size {
            // An empty file takes the record whatever its size
            if self.current_size > 0 && self.current_size + pending_write_size > max_size {
                debug!(
                    current = self.current_size,
                    pending = pending_write_size,
                    max = max_size,
                    "File size threshold reached"
                );
                return true;
            }
        }

        false
    }

    fn next_filename(&mut self) -> Result<PathBuf, RollingError> {
        let base = self.base.clone().ok_or(RollingError::NotRegistered)?;
        let date = self.clock.wall().format("%Y%m%d").to_string();

        while self.next_index < u32::MAX {
            let candidate = Self::candidate(&base, &date, self.next_index);
            self.next_index += 1;
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(RollingError::Exhausted(base))
    }

    fn file_opened(&mut self, path: &Path) {
        self.current = Some(path.to_path_buf());
        self.current_size = 0;
        self.opened_at = self.clock.now();
        info!(path = %path.display(), "Rolling policy tracking new file");
    }

    fn record_written(&mut self, bytes: u64) {
        self.current_size += bytes;
    }
}

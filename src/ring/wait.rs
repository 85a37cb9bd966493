//! Wait strategies for producers (buffer full) and the consumer (buffer empty)
//!
//! A strategy is called in a retry loop with the number of failed checks so
//! far, so it can escalate from spinning to yielding to sleeping without
//! keeping per-thread state.

use std::fmt;
use std::hint;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;

/// How a thread waits when it cannot make progress
pub trait WaitStrategy: Send + Sync + fmt::Debug {
    /// Called after the `attempt`-th consecutive failed check
    fn wait(&self, attempt: u32);

    /// Wake every thread parked in `wait` (cursor moved)
    fn signal_all(&self) {}

    /// Short name for logs and configuration checks
    fn name(&self) -> &'static str;
}

/// Spin on the CPU; lowest latency, burns a core while idle
#[derive(Debug, Default, Clone, Copy)]
pub struct BusySpinWaitStrategy;

impl WaitStrategy for BusySpinWaitStrategy {
    #[inline]
    fn wait(&self, _attempt: u32) {
        hint::spin_loop();
    }

    fn name(&self) -> &'static str {
        "busy_spin"
    }
}

/// Spin for a while, then yield the thread
#[derive(Debug, Clone, Copy)]
pub struct YieldingWaitStrategy {
    spin_tries: u32,
}

impl YieldingWaitStrategy {
    pub fn new(spin_tries: u32) -> Self {
        Self { spin_tries }
    }
}

impl Default for YieldingWaitStrategy {
    fn default() -> Self {
        Self::new(100)
    }
}

impl WaitStrategy for YieldingWaitStrategy {
    #[inline]
    fn wait(&self, attempt: u32) {
        if attempt < self.spin_tries {
            hint::spin_loop();
        } else {
            thread::yield_now();
        }
    }

    fn name(&self) -> &'static str {
        "yielding"
    }
}

/// Spin, then yield, then sleep in short naps (default)
///
/// Bounded CPU use when idle, low latency under load.
#[derive(Debug, Clone, Copy)]
pub struct SleepingWaitStrategy {
    retries: u32,
    sleep: Duration,
}

impl SleepingWaitStrategy {
    pub const DEFAULT_RETRIES: u32 = 200;
    pub const DEFAULT_SLEEP: Duration = Duration::from_micros(100);

    pub fn new(retries: u32, sleep: Duration) -> Self {
        Self { retries, sleep }
    }
}

impl Default for SleepingWaitStrategy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RETRIES, Self::DEFAULT_SLEEP)
    }
}

impl WaitStrategy for SleepingWaitStrategy {
    #[inline]
    fn wait(&self, attempt: u32) {
        if attempt < self.retries / 2 {
            hint::spin_loop();
        } else if attempt < self.retries {
            thread::yield_now();
        } else {
            thread::sleep(self.sleep);
        }
    }

    fn name(&self) -> &'static str {
        "sleeping"
    }
}

/// Park on a condition variable until signalled
///
/// Parks are bounded so a signal that races the park only costs one
/// `park_timeout` of latency.
#[derive(Debug)]
pub struct BlockingWaitStrategy {
    lock: Mutex<()>,
    cond: Condvar,
    park_timeout: Duration,
}

impl BlockingWaitStrategy {
    pub fn new(park_timeout: Duration) -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
            park_timeout,
        }
    }
}

impl Default for BlockingWaitStrategy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl WaitStrategy for BlockingWaitStrategy {
    fn wait(&self, _attempt: u32) {
        let mut guard = self.lock.lock();
        self.cond.wait_for(&mut guard, self.park_timeout);
    }

    fn signal_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    fn name(&self) -> &'static str {
        "blocking"
    }
}

/// Wait strategy selector used by configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategyKind {
    BusySpin,
    Yielding,
    #[default]
    Sleeping,
    Blocking,
}

impl WaitStrategyKind {
    /// Instantiate the strategy with its default tuning
    pub fn build(self) -> Arc<dyn WaitStrategy> {
        match self {
            WaitStrategyKind::BusySpin => Arc::new(BusySpinWaitStrategy),
            WaitStrategyKind::Yielding => Arc::new(YieldingWaitStrategy::default()),
            WaitStrategyKind::Sleeping => Arc::new(SleepingWaitStrategy::default()),
            WaitStrategyKind::Blocking => Arc::new(BlockingWaitStrategy::default()),
        }
    }
}

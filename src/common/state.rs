//! Consumer lifecycle shared between the publisher and the consumer thread
//!
//! The consumer thread drives its own transitions; the publisher reads them
//! to decide whether records are accepted and waits on them during startup
//! and shutdown.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// Record consumer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerState {
    /// Opening the initial output file
    #[default]
    Initializing,
    /// Writing records
    Running,
    /// Draining published records before closing
    ShuttingDown,
    /// File finalized, thread finished
    Closed,
    /// Startup failed, or the consumer loop died
    Faulted,
}

impl ConsumerState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: ConsumerState) -> bool {
        use ConsumerState::*;
        matches!(
            (self, target),
            (Initializing, Running)
                | (Running, ShuttingDown)
                | (ShuttingDown, Closed)
                // Shutdown before the consumer was ever started
                | (Initializing, Closed)
                | (Initializing, Faulted)
                | (Running, Faulted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Closed | ConsumerState::Faulted)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Initializing => write!(f, "Initializing"),
            ConsumerState::Running => write!(f, "Running"),
            ConsumerState::ShuttingDown => write!(f, "ShuttingDown"),
            ConsumerState::Closed => write!(f, "Closed"),
            ConsumerState::Faulted => write!(f, "Faulted"),
        }
    }
}

/// State plus the flags producers read on the hot path
#[derive(Debug, Default)]
pub struct ConsumerLifecycle {
    state: Mutex<ConsumerState>,
    changed: Condvar,
    /// Mirrors `state == Running` until shutdown starts; read by every publish
    accepting: AtomicBool,
    /// Set when shutdown gave up waiting for the drain
    halt: AtomicBool,
}

impl ConsumerLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    /// Move to `target` if the transition table allows it
    ///
    /// Returns false (and leaves the state untouched) otherwise.
    pub fn transition(&self, target: ConsumerState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(target) {
            warn!(from = %*state, to = %target, "Rejected consumer state transition");
            return false;
        }
        debug!(from = %*state, to = %target, "Consumer state changed");
        *state = target;
        match target {
            ConsumerState::Running => self.accepting.store(true, Ordering::SeqCst),
            ConsumerState::Faulted | ConsumerState::Closed => {
                self.accepting.store(false, Ordering::SeqCst)
            }
            _ => {}
        }
        self.changed.notify_all();
        true
    }

    #[inline]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::Release);
    }

    #[inline]
    pub fn halt_requested(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    /// Block until the consumer has left `Initializing`
    pub fn wait_for_startup(&self) -> ConsumerState {
        let mut state = self.state.lock();
        while *state == ConsumerState::Initializing {
            self.changed.wait(&mut state);
        }
        *state
    }

    /// Block until a terminal state or `deadline`, returning the last state seen
    pub fn wait_terminal_until(&self, deadline: Instant) -> ConsumerState {
        let mut state = self.state.lock();
        while !state.is_terminal() {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state
    }

    pub fn wait_terminal(&self, timeout: Duration) -> ConsumerState {
        self.wait_terminal_until(Instant::now() + timeout)
    }
}

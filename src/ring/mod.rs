//! Fixed-capacity ring buffer handing records from producers to one consumer
//!
//! Architecture (claim / publish / consume):
//! - Producers claim a sequence from the claim cursor, fill the slot at
//!   `sequence & mask`, then release-store the slot's publication marker
//! - The single consumer acquires the marker for the next sequence, moves the
//!   value out and advances the consumed cursor
//! - A claim waits (per wait strategy) while it would lap the consumer; this
//!   is the only backpressure, there is no unbounded queue
//!
//! Slot markers hold `sequence + 1` so a marker left over from the previous
//! lap never matches the sequence the consumer is waiting for.

mod wait;

pub use wait::{
    BlockingWaitStrategy, BusySpinWaitStrategy, SleepingWaitStrategy, WaitStrategy,
    WaitStrategyKind, YieldingWaitStrategy,
};

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use serde::Deserialize;
use tracing::debug;

use crate::common::{WriterError, WriterResult};

/// Producer concurrency mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerMode {
    /// Exactly one thread ever publishes
    Single,
    /// Any number of threads publish concurrently
    #[default]
    Multi,
}

struct Slot<T> {
    /// `sequence + 1` once the slot holds `sequence`
    published: AtomicU64,
    value: UnsafeCell<Option<T>>,
}

/// Ring buffer of pre-allocated slots
pub struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    mask: u64,
    mode: ProducerMode,
    /// Next sequence to hand out
    claim_cursor: CachePadded<AtomicU64>,
    /// Every sequence below this has been taken by the consumer
    consumed: CachePadded<AtomicU64>,
    alerted: AtomicBool,
    consumer_taken: AtomicBool,
    single_claim_guard: AtomicBool,
    wait: Arc<dyn WaitStrategy>,
}

// SAFETY: slot values are only touched by the producer holding the claim
// (before the release-store of the marker) or by the single consumer (after
// acquiring it). A slot is not re-claimed until the consumer has advanced
// past it, so accesses to one `UnsafeCell` never overlap.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Allocate a ring of `capacity` slots
    ///
    /// `capacity` must be a non-zero power of two.
    pub fn new(
        capacity: usize,
        mode: ProducerMode,
        wait: Arc<dyn WaitStrategy>,
    ) -> WriterResult<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(WriterError::invalid_configuration(format!(
                "ring buffer capacity must be a power of two, got {}",
                capacity
            )));
        }

        let slots = (0..capacity)
            .map(|_| Slot {
                published: AtomicU64::new(0),
                value: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(capacity, mode = ?mode, wait = wait.name(), "Ring buffer allocated");

        Ok(Self {
            slots,
            mask: capacity as u64 - 1,
            mode,
            claim_cursor: CachePadded::new(AtomicU64::new(0)),
            consumed: CachePadded::new(AtomicU64::new(0)),
            alerted: AtomicBool::new(false),
            consumer_taken: AtomicBool::new(false),
            single_claim_guard: AtomicBool::new(false),
            wait,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn mode(&self) -> ProducerMode {
        self.mode
    }

    pub fn wait_strategy(&self) -> &Arc<dyn WaitStrategy> {
        &self.wait
    }

    /// Sequences handed out so far
    pub fn claimed(&self) -> u64 {
        self.claim_cursor.load(Ordering::Acquire)
    }

    /// Sequences taken by the consumer so far
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    #[inline]
    fn slot(&self, sequence: u64) -> &Slot<T> {
        &self.slots[(sequence & self.mask) as usize]
    }

    /// Reserve the next sequence, waiting while the ring is full
    ///
    /// Fails with `Closed` only if the ring is alerted while waiting for
    /// space. In single-producer mode concurrent claims are a usage error and
    /// panic rather than hand out the same slot twice.
    pub fn claim(&self) -> WriterResult<Claim<'_, T>> {
        let sequence = match self.mode {
            ProducerMode::Multi => self.claim_cursor.fetch_add(1, Ordering::AcqRel),
            ProducerMode::Single => {
                // The cursor itself is a plain load/store; the guard only
                // catches a second thread claiming at the same time.
                if self.single_claim_guard.swap(true, Ordering::Acquire) {
                    panic!("concurrent claim on a single-producer ring buffer");
                }
                let next = self.claim_cursor.load(Ordering::Relaxed);
                self.claim_cursor.store(next + 1, Ordering::Release);
                self.single_claim_guard.store(false, Ordering::Release);
                next
            }
        };

        let capacity = self.slots.len() as u64;
        let mut attempt = 0u32;
        while sequence >= self.consumed.load(Ordering::Acquire) + capacity {
            if self.alerted.load(Ordering::Acquire) {
                return Err(WriterError::Closed);
            }
            self.wait.wait(attempt);
            attempt = attempt.saturating_add(1);
        }

        Ok(Claim {
            ring: self,
            sequence,
            published: false,
        })
    }

    fn publish_slot(&self, sequence: u64, value: Option<T>) {
        let slot = self.slot(sequence);
        // SAFETY: the caller holds the claim for `sequence`; the consumer does
        // not read the cell until it observes the marker stored below.
        unsafe {
            *slot.value.get() = value;
        }
        slot.published.store(sequence + 1, Ordering::Release);
        self.wait.signal_all();
    }

    /// Wake every waiter and make the consumer stop once drained
    pub fn alert(&self) {
        self.alerted.store(true, Ordering::Release);
        self.wait.signal_all();
    }

    pub fn is_alerted(&self) -> bool {
        self.alerted.load(Ordering::Acquire)
    }

    /// Take the consumer side; only one consumer may exist
    pub fn consumer(self: &Arc<Self>) -> WriterResult<RingConsumer<T>> {
        if self.consumer_taken.swap(true, Ordering::AcqRel) {
            return Err(WriterError::illegal_state(
                "ring buffer consumer already taken",
            ));
        }
        Ok(RingConsumer {
            ring: Arc::clone(self),
            next: 0,
        })
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.slots.len())
            .field("mode", &self.mode)
            .field("claimed", &self.claimed())
            .field("consumed", &self.consumed())
            .field("wait", &self.wait.name())
            .finish()
    }
}

/// A claimed, not yet published slot
///
/// Dropping an unpublished claim publishes an empty slot so the consumer
/// skips the sequence instead of stalling on it.
#[must_use = "a claim must be published"]
pub struct Claim<'a, T> {
    ring: &'a RingBuffer<T>,
    sequence: u64,
    published: bool,
}

impl<T> Claim<'_, T> {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Store `value` and make it visible to the consumer
    pub fn publish(mut self, value: T) {
        self.published = true;
        self.ring.publish_slot(self.sequence, Some(value));
    }
}

impl<T> Drop for Claim<'_, T> {
    fn drop(&mut self) {
        if !self.published {
            self.ring.publish_slot(self.sequence, None);
        }
    }
}

/// One value delivered to the consumer
#[derive(Debug)]
pub struct Delivered<T> {
    pub sequence: u64,
    pub value: T,
    /// No later sequence was published when this one was taken
    pub end_of_batch: bool,
}

/// Consumer side of the ring
pub struct RingConsumer<T> {
    ring: Arc<RingBuffer<T>>,
    next: u64,
}

impl<T> RingConsumer<T> {
    /// Next sequence this consumer will return
    pub fn sequence(&self) -> u64 {
        self.next
    }

    pub fn ring(&self) -> &Arc<RingBuffer<T>> {
        &self.ring
    }

    /// Block until the next sequence is published and take it
    ///
    /// Sequences come back strictly increasing with no gaps. Returns `None`
    /// once the ring is alerted and the next sequence is not published.
    pub fn next_to_consume(&mut self) -> Option<Delivered<T>> {
        loop {
            let sequence = self.next;
            let slot = self.ring.slot(sequence);

            let mut attempt = 0u32;
            while slot.published.load(Ordering::Acquire) != sequence + 1 {
                if self.ring.alerted.load(Ordering::Acquire) {
                    // A publish may have landed between the check and the alert
                    if slot.published.load(Ordering::Acquire) == sequence + 1 {
                        break;
                    }
                    return None;
                }
                self.ring.wait.wait(attempt);
                attempt = attempt.saturating_add(1);
            }

            // SAFETY: the marker was acquired above, so the producer finished
            // writing; the slot cannot be re-claimed until `consumed` moves
            // past `sequence`, which happens after the take.
            let value = unsafe { (*slot.value.get()).take() };

            self.next = sequence + 1;
            self.ring.consumed.store(self.next, Ordering::Release);
            self.ring.wait.signal_all();

            let end_of_batch =
                self.ring.slot(self.next).published.load(Ordering::Acquire) != self.next + 1;

            match value {
                Some(value) => {
                    return Some(Delivered {
                        sequence,
                        value,
                        end_of_batch,
                    })
                }
                None => debug!(sequence, "Skipping abandoned claim"),
            }
        }
    }
}

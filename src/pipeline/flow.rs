//! Ready queue and admission control.
//!
//! The [`FlowGate`] is the single synchronization object shared between
//! the worker and the input-plane completion path: one mutex guarding
//! the ready queue and the in-flight count, one condition variable, and
//! a monotonic failure flag. The worker blocks in [`FlowGate::acquire`]
//! until a buffer is free *and* the pending-frame ceiling admits
//! another submission; the completion path returns buffers through
//! [`FlowGate::recycle`].

use crate::buffer::TransferBuffer;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

struct GateState {
    ready: VecDeque<TransferBuffer>,
    in_flight: usize,
}

/// Buffer pool gate: FIFO ready queue + pending-frame admission limit
/// + failure flag.
///
/// Acquiring a buffer reserves an in-flight slot in the same critical
/// section as the admission check, so the count can never exceed the
/// ceiling no matter how calls interleave. Recycling decrements the
/// count, requeues the buffer, and broadcasts; a broadcast is used
/// rather than a single wake because the predicate re-check is cheap
/// and either a freed buffer or a freed slot may unblock a waiter.
pub struct FlowGate {
    state: Mutex<GateState>,
    available: Condvar,
    failed: AtomicBool,
    ceiling: usize,
}

impl FlowGate {
    /// Create a gate admitting at most `ceiling` frames in flight.
    pub fn new(ceiling: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                ready: VecDeque::new(),
                in_flight: 0,
            }),
            available: Condvar::new(),
            failed: AtomicBool::new(false),
            ceiling,
        }
    }

    /// Seed the ready queue with the plane's buffer pool.
    ///
    /// Called once at pipeline construction; does not touch the
    /// in-flight count.
    pub fn seed(&self, buffers: Vec<TransferBuffer>) {
        let mut state = self.state.lock().unwrap();
        state.ready.extend(buffers);
        self.available.notify_all();
    }

    /// Block until a buffer is available and the ceiling admits another
    /// submission, then pop it and reserve the in-flight slot.
    ///
    /// Returns [`Error::Aborted`] as soon as the failure flag is
    /// observed, including while blocked.
    pub fn acquire(&self) -> Result<TransferBuffer> {
        let mut state = self.state.lock().unwrap();
        loop {
            if self.failed.load(Ordering::Acquire) {
                return Err(Error::Aborted);
            }
            if state.in_flight < self.ceiling {
                // Front pop + slot reservation under one lock hold:
                // the admission check cannot go stale before the
                // increment lands.
                if let Some(buffer) = state.ready.pop_front() {
                    state.in_flight += 1;
                    return Ok(buffer);
                }
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Return a spent buffer: release its in-flight slot, push it to
    /// the back of the ready queue, and wake waiters.
    pub fn recycle(&self, buffer: TransferBuffer) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.in_flight > 0, "recycle without matching acquire");
        state.in_flight = state.in_flight.saturating_sub(1);
        state.ready.push_back(buffer);
        self.available.notify_all();
    }

    /// Latch the failure flag and wake every blocked acquirer.
    ///
    /// Monotonic: once set it is never cleared. The store happens while
    /// holding the mutex so no waiter can re-check the predicate
    /// between the store and the broadcast and then sleep forever.
    pub fn fail(&self) {
        let _state = self.state.lock().unwrap();
        self.failed.store(true, Ordering::Release);
        self.available.notify_all();
    }

    /// Lock-free read of the failure flag, for hot paths.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Current number of frames in flight through the converter.
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }

    /// Current number of buffers waiting in the ready queue.
    pub fn ready_len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    /// The pending-frame ceiling.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }
}

//! Process-wide admission control for study runs
//!
//! A weighted semaphore over a memory budget of `capacity` (1.0 = the whole
//! machine). Coordinators register a request for a fraction of the budget and
//! poll it from their control loop. Only the request at the head of the
//! registry may be granted, so a large request is never starved by a stream
//! of small ones. Ordering is (priority desc, arrival asc); `bump` raises a
//! request's priority to move it toward the front.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

const EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct PendingRequest {
    id: u64,
    fraction: f64,
    priority: u32,
    seq: u64,
    since: Instant,
}

#[derive(Debug, Default)]
struct GateInner {
    in_use: f64,
    next_id: u64,
    pending: Vec<PendingRequest>,
    granted: HashMap<u64, f64>,
}

impl GateInner {
    fn head(&self) -> Option<&PendingRequest> {
        self.pending
            .iter()
            .min_by_key(|r| (std::cmp::Reverse(r.priority), r.seq))
    }

    fn position(&self, id: u64) -> Option<usize> {
        let target = self.pending.iter().find(|r| r.id == id)?;
        let key = (std::cmp::Reverse(target.priority), target.seq);
        Some(
            self.pending
                .iter()
                .filter(|r| (std::cmp::Reverse(r.priority), r.seq) < key)
                .count(),
        )
    }
}

#[derive(Debug)]
pub struct ConcurrencyGate {
    capacity: f64,
    inner: Mutex<GateInner>,
}

impl ConcurrencyGate {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(1.0)
    }

    /// A gate over `capacity`; a non-finite or non-positive capacity falls
    /// back to the whole machine.
    pub fn with_capacity(capacity: f64) -> Arc<Self> {
        let capacity = if capacity.is_finite() && capacity > EPSILON {
            capacity
        } else {
            warn!(capacity, "invalid gate capacity; using 1.0");
            1.0
        };
        Arc::new(Self {
            capacity,
            inner: Mutex::new(GateInner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a request for `fraction` of the budget.
    ///
    /// The fraction is clamped into `(0, capacity]`; NaN asks for the minimum.
    pub fn request(self: &Arc<Self>, fraction: f64) -> GateTicket {
        let fraction = fraction.max(EPSILON).min(self.capacity);
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.push(PendingRequest {
            id,
            fraction,
            priority: 0,
            seq: id,
            since: Instant::now(),
        });
        debug!(ticket = id, fraction, "gate request registered");

        GateTicket {
            gate: Arc::clone(self),
            id,
            fraction,
            granted: false,
        }
    }

    /// Move a waiting request toward the front. Returns false if it is not waiting.
    pub fn bump(&self, id: u64) -> bool {
        let mut inner = self.lock();
        match inner.pending.iter_mut().find(|r| r.id == id) {
            Some(request) => {
                request.priority += 1;
                info!(ticket = id, priority = request.priority, "gate request bumped");
                true
            }
            None => false,
        }
    }

    /// Budget currently held by granted permits.
    pub fn in_use(&self) -> f64 {
        self.lock().in_use
    }

    pub fn waiting(&self) -> usize {
        self.lock().pending.len()
    }

    /// Age of the oldest waiting request.
    pub fn longest_wait(&self) -> Option<Duration> {
        self.lock().pending.iter().map(|r| r.since.elapsed()).max()
    }

    fn try_grant(&self, id: u64) -> bool {
        let mut inner = self.lock();
        let Some(head) = inner.head() else {
            return false;
        };
        if head.id != id || inner.in_use + head.fraction > self.capacity + EPSILON {
            return false;
        }
        let fraction = head.fraction;
        inner.pending.retain(|r| r.id != id);
        inner.in_use += fraction;
        inner.granted.insert(id, fraction);
        info!(ticket = id, fraction, in_use = inner.in_use, "gate slot granted");
        true
    }

    fn withdraw(&self, id: u64) {
        let mut inner = self.lock();
        inner.pending.retain(|r| r.id != id);
    }

    fn release(&self, id: u64) {
        let mut inner = self.lock();
        if let Some(fraction) = inner.granted.remove(&id) {
            inner.in_use = (inner.in_use - fraction).max(0.0);
            debug!(ticket = id, fraction, in_use = inner.in_use, "gate slot released");
        }
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.lock().position(id)
    }
}

/// A waiting request. Dropping it withdraws the request.
#[derive(Debug)]
pub struct GateTicket {
    gate: Arc<ConcurrencyGate>,
    id: u64,
    fraction: f64,
    granted: bool,
}

impl GateTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Non-blocking poll; returns the permit once the request reaches the
    /// front and fits in the remaining budget.
    pub fn try_acquire(&mut self) -> Option<GatePermit> {
        if self.granted || !self.gate.try_grant(self.id) {
            return None;
        }
        self.granted = true;
        Some(GatePermit {
            gate: Arc::clone(&self.gate),
            id: self.id,
            fraction: self.fraction,
        })
    }

    pub fn bump(&self) -> bool {
        self.gate.bump(self.id)
    }

    /// Number of requests ahead of this one, if still waiting.
    pub fn position(&self) -> Option<usize> {
        self.gate.position(self.id)
    }
}

impl Drop for GateTicket {
    fn drop(&mut self) {
        if !self.granted {
            self.gate.withdraw(self.id);
        }
    }
}

/// A granted share of the budget, returned to the gate on drop.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
    id: u64,
    fraction: f64,
}

impl GatePermit {
    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    /// Process-count hint for workers: each of `worker_count` processes sizes
    /// its memory as if `worker_count / fraction` processes shared the machine.
    pub fn process_hint(&self, worker_count: usize) -> usize {
        ((worker_count as f64) / self.fraction).round().max(1.0) as usize
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release(self.id);
    }
}

/*
Time-queue for the hybrid memory simulation.

Two primitives live here:

    - `EventQueue`, the discrete-event scheduler owned by the simulation driver.  Every port
      interaction in the system is a callback scheduled on this queue, so a run is a single
      deterministic sequence of events ordered by (cycle, priority, insertion order).

    - `TimedServer`, a FIFO service model used by the stand-in memories and the access counter.
      It enforces a service law of a base latency plus a throughput component expressed in
      bytes-per-cycle, and refuses work once its bounded queue is full.

Rejected work comes back as a `Backpressure` carrying the original request so the caller can hold
on to it until the server frees a slot.
*/

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};

use serde::{Deserialize, Serialize};

pub type Cycle = u64;

/// Events that carry their own same-cycle ordering.  Lower values run first.
pub trait Prioritized {
    fn priority(&self) -> u8;
}

struct Scheduled<E> {
    at: Cycle,
    priority: u8,
    seq: u64,
    event: E,
}

impl<E> Scheduled<E> {
    fn key(&self) -> (Cycle, u8, u64) {
        (self.at, self.priority, self.seq)
    }
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Priority queue of scheduled callbacks.  Time only moves forward: `pop` advances `now` to the
/// cycle of the event it returns.
pub struct EventQueue<E> {
    now: Cycle,
    next_seq: u64,
    heap: BinaryHeap<Reverse<Scheduled<E>>>,
}

impl<E: Prioritized> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            now: 0,
            next_seq: 0,
            heap: BinaryHeap::new(),
        }
    }

    pub fn now(&self) -> Cycle {
        self.now
    }

    /// Schedule `event` at cycle `at`.  Events in the past are pulled forward to `now`.
    pub fn schedule(&mut self, at: Cycle, event: E) {
        let at = at.max(self.now);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Scheduled {
            at,
            priority: event.priority(),
            seq,
            event,
        }));
    }

    pub fn schedule_in(&mut self, delay: Cycle, event: E) {
        self.schedule(self.now.saturating_add(delay), event);
    }

    pub fn pop(&mut self) -> Option<(Cycle, E)> {
        let Reverse(next) = self.heap.pop()?;
        self.now = next.at;
        Some((next.at, next.event))
    }

    pub fn peek_time(&self) -> Option<Cycle> {
        self.heap.peek().map(|Reverse(next)| next.at)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<E: Prioritized> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

// Result of queueing a request with a timed server
#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    ready_at: Cycle,
}

impl Ticket {
    // Cycle at which the server hands the payload back.
    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        now >= self.ready_at
    }
}

#[derive(Debug)]
pub struct ServiceRequest<T> {
    pub payload: T,
    pub size_bytes: u32,
}

impl<T> ServiceRequest<T> {
    pub fn new(payload: T, size_bytes: u32) -> Self {
        Self { payload, size_bytes }
    }
}

#[derive(Debug)]
pub struct ServiceResult<T> {
    pub payload: T,
    pub ticket: Ticket,
}

/// The bounded FIFO was full; the request is handed back untouched.
#[derive(Debug)]
pub struct Backpressure<T> {
    pub request: ServiceRequest<T>,
    pub capacity: usize,
}

impl<T> Backpressure<T> {
    pub fn into_request(self) -> ServiceRequest<T> {
        self.request
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    // Fixed latency added to every request
    pub base_latency: Cycle,
    // Throughput
    pub bytes_per_cycle: u32,
    // Maximum number of outstanding requests the server will accept
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_latency: 0,
            bytes_per_cycle: 1,
            queue_capacity: 1,
        }
    }
}

impl ServerConfig {
    pub fn ensure_valid(&self) {
        assert!(self.bytes_per_cycle > 0, "bytes_per_cycle must be > 0");
        assert!(self.queue_capacity > 0, "queue_capacity must be > 0");
    }

    /// Unloaded service time of a request of `size_bytes`.
    pub fn latency_for(&self, size_bytes: u32) -> Cycle {
        self.base_latency
            .saturating_add(ceil_div_u64(size_bytes as u64, self.bytes_per_cycle as u64))
    }
}

#[derive(Debug)]
struct Inflight<T> {
    payload: T,
    ticket: Ticket,
}

// Single-lane server: transfers are serialized on the bandwidth component while the base latency
// is pipelined, and completions leave in arrival order.
#[derive(Debug)]
pub struct TimedServer<T> {
    config: ServerConfig,
    inflight: VecDeque<Inflight<T>>,
    busy_until: Cycle,
}

impl<T> TimedServer<T> {
    pub fn new(config: ServerConfig) -> Self {
        config.ensure_valid();
        Self {
            config,
            inflight: VecDeque::with_capacity(config.queue_capacity),
            busy_until: 0,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn try_enqueue(
        &mut self,
        now: Cycle,
        request: ServiceRequest<T>,
    ) -> Result<Ticket, Backpressure<T>> {
        if self.is_full() {
            return Err(Backpressure {
                request,
                capacity: self.config.queue_capacity,
            });
        }

        let start = self.busy_until.max(now);
        let transfer = ceil_div_u64(request.size_bytes as u64, self.config.bytes_per_cycle as u64);
        self.busy_until = start.saturating_add(transfer);
        let ready_at = self.busy_until.saturating_add(self.config.base_latency);
        let ticket = Ticket { ready_at };

        self.inflight.push_back(Inflight {
            payload: request.payload,
            ticket,
        });
        Ok(ticket)
    }

    /// Pop the oldest request if it has completed by `now`.
    pub fn pop_ready(&mut self, now: Cycle) -> Option<ServiceResult<T>> {
        if !self.inflight.front()?.ticket.is_ready(now) {
            return None;
        }
        let inflight = self.inflight.pop_front()?;
        Some(ServiceResult {
            payload: inflight.payload,
            ticket: inflight.ticket,
        })
    }

    pub fn is_full(&self) -> bool {
        self.inflight.len() >= self.config.queue_capacity
    }

    pub fn outstanding(&self) -> usize {
        self.inflight.len()
    }
}

fn ceil_div_u64(nom: u64, denom: u64) -> Cycle {
    debug_assert!(denom > 0);
    nom.div_ceil(denom)
}

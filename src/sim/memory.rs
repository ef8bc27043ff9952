use std::collections::HashMap;

use log::debug;
use serde::Serialize;

use crate::base::port::{PortName, PortPeer};
use crate::dispatch::request::{AccountingReply, MemRequest, MemResponse, Tier};
use crate::sim::event::{Scheduler, SimEvent, Unit};
use crate::timeq::{Cycle, ServerConfig, ServiceRequest, TimedServer};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryStats {
    served: u64,
    refused: u64,
    reads: u64,
    writes: u64,
    bytes: u64,
    atomic: u64,
    functional: u64,
}

impl MemoryStats {
    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn refused(&self) -> u64 {
        self.refused
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn atomic(&self) -> u64 {
        self.atomic
    }

    pub fn functional(&self) -> u64 {
        self.functional
    }
}

/// Memory stand-in behind one downstream port: a bounded FIFO with a latency/bandwidth law.
pub struct TimedMemory {
    name: &'static str,
    unit: Unit,
    served_by: Option<Tier>,
    server: TimedServer<MemRequest>,
    // port we refused a request on and owe a retry
    owes_retry: Option<PortName>,
    stats: MemoryStats,
}

impl TimedMemory {
    pub fn new(name: &'static str, unit: Unit, served_by: Option<Tier>, config: ServerConfig) -> Self {
        Self {
            name,
            unit,
            served_by,
            server: TimedServer::new(config),
            owes_retry: None,
            stats: MemoryStats::default(),
        }
    }

    pub fn tier(name: &'static str, tier: Tier, config: ServerConfig) -> Self {
        Self::new(name, Unit::Tier(tier), Some(tier), config)
    }

    pub fn flat(config: ServerConfig) -> Self {
        Self::new("flat", Unit::Flat, None, config)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Responses for everything finished by now.  Frees queue slots, so a retry owed to the
    /// sender goes out right after.
    pub fn drain_ready(&mut self, sched: &mut Scheduler) -> Vec<MemResponse> {
        let mut done = Vec::new();
        while let Some(result) = self.server.pop_ready(sched.now()) {
            let request = result.payload;
            self.stats.served += 1;
            self.stats.bytes = self.stats.bytes.saturating_add(request.bytes as u64);
            if request.kind.is_write() {
                self.stats.writes += 1;
            } else {
                self.stats.reads += 1;
            }
            done.push(MemResponse::completed(&request, self.served_by));
        }
        if !done.is_empty() {
            if let Some(port) = self.owes_retry.take() {
                sched.schedule_in(0, SimEvent::PortRetry(port));
            }
        }
        done
    }

    pub fn is_idle(&self) -> bool {
        self.server.outstanding() == 0
    }

    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }
}

impl PortPeer<MemRequest> for TimedMemory {
    fn recv_timing(&mut self, sched: &mut Scheduler, port: PortName, item: MemRequest) -> Result<(), MemRequest> {
        let bytes = item.bytes;
        match self.server.try_enqueue(sched.now(), ServiceRequest::new(item, bytes)) {
            Ok(ticket) => {
                sched.schedule(ticket.ready_at(), SimEvent::Complete(self.unit));
                Ok(())
            }
            Err(backpressure) => {
                debug!("{}: queue full ({}), refusing", self.name, backpressure.capacity);
                self.stats.refused += 1;
                self.owes_retry = Some(port);
                Err(backpressure.into_request().payload)
            }
        }
    }

    fn recv_retry(&mut self, _sched: &mut Scheduler, _port: PortName) {}

    fn recv_atomic(&mut self, _port: PortName, item: &MemRequest) -> Cycle {
        self.stats.atomic += 1;
        self.server.config().latency_for(item.bytes)
    }

    fn recv_functional(&mut self, _port: PortName, item: &MemRequest) {
        debug!("{}: functional {:?} at {:#x}", self.name, item.kind, item.addr);
        self.stats.functional += 1;
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PageCount {
    pub page: u64,
    pub accesses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountingSummary {
    pub accesses: u64,
    pub writes: u64,
    pub refused: u64,
    pub distinct_pages: usize,
    pub hottest: Vec<PageCount>,
}

/// Stand-in for the accounting stage: counts accesses per page and hands every request back
/// unchanged once its service time has passed.
pub struct AccessCounter {
    server: TimedServer<MemRequest>,
    page_bytes: u64,
    pages: HashMap<u64, u64>,
    owes_retry: Option<PortName>,
    accesses: u64,
    writes: u64,
    refused: u64,
}

impl AccessCounter {
    pub fn new(config: ServerConfig, page_bytes: u64) -> Self {
        Self {
            server: TimedServer::new(config),
            page_bytes: page_bytes.max(1),
            pages: HashMap::new(),
            owes_retry: None,
            accesses: 0,
            writes: 0,
            refused: 0,
        }
    }

    pub fn drain_ready(&mut self, sched: &mut Scheduler) -> Vec<AccountingReply> {
        let mut replies = Vec::new();
        while let Some(result) = self.server.pop_ready(sched.now()) {
            let request = result.payload;
            *self.pages.entry(request.addr / self.page_bytes).or_default() += 1;
            self.accesses += 1;
            if request.kind.is_write() {
                self.writes += 1;
            }
            replies.push(AccountingReply::Forward(request));
        }
        if !replies.is_empty() {
            if let Some(port) = self.owes_retry.take() {
                sched.schedule_in(0, SimEvent::PortRetry(port));
            }
        }
        replies
    }

    /// The `n` most accessed pages, hottest first, ties by page number.
    pub fn hottest(&self, n: usize) -> Vec<PageCount> {
        let mut pages: Vec<_> = self
            .pages
            .iter()
            .map(|(&page, &accesses)| PageCount { page, accesses })
            .collect();
        pages.sort_by(|a, b| b.accesses.cmp(&a.accesses).then(a.page.cmp(&b.page)));
        pages.truncate(n);
        pages
    }

    pub fn is_idle(&self) -> bool {
        self.server.outstanding() == 0
    }

    pub fn summary(&self) -> AccountingSummary {
        AccountingSummary {
            accesses: self.accesses,
            writes: self.writes,
            refused: self.refused,
            distinct_pages: self.pages.len(),
            hottest: self.hottest(8),
        }
    }
}

impl PortPeer<MemRequest> for AccessCounter {
    fn recv_timing(&mut self, sched: &mut Scheduler, port: PortName, item: MemRequest) -> Result<(), MemRequest> {
        let bytes = item.bytes;
        match self.server.try_enqueue(sched.now(), ServiceRequest::new(item, bytes)) {
            Ok(ticket) => {
                sched.schedule(ticket.ready_at(), SimEvent::Complete(Unit::Accounting));
                Ok(())
            }
            Err(backpressure) => {
                self.refused += 1;
                self.owes_retry = Some(port);
                Err(backpressure.into_request().payload)
            }
        }
    }

    fn recv_retry(&mut self, _sched: &mut Scheduler, _port: PortName) {}
}

use std::cell::RefCell;
use std::rc::Rc;

use crate::base::port::{Delivery, PortName, PortPeer};
use crate::dispatch::decoder::AddressRange;
use crate::dispatch::dispatcher::{Dispatcher, DispatcherConfig};
use crate::dispatch::error::DispatchError;
use crate::dispatch::request::{
    AccountingReply, MemRequest, MemResponse, RequestId, Source, Tier,
};
use crate::sim::event::{Scheduler, SimEvent, Unit};
use crate::timeq::Cycle;

/// Downstream stand-in: records what it accepts, refuses everything while `busy`.
#[derive(Debug, Default)]
pub struct MockSink {
    pub busy: bool,
    pub received: Vec<MemRequest>,
    pub seen: Vec<RequestId>,
    pub refused: usize,
    pub owes_retry: bool,
    pub atomic_latency: Cycle,
    pub functional: Vec<RequestId>,
}

impl PortPeer<MemRequest> for MockSink {
    fn recv_timing(&mut self, _sched: &mut Scheduler, _port: PortName, item: MemRequest) -> Result<(), MemRequest> {
        if self.busy {
            self.refused += 1;
            self.owes_retry = true;
            return Err(item);
        }
        self.seen.push(item.id);
        self.received.push(item);
        Ok(())
    }

    fn recv_retry(&mut self, _sched: &mut Scheduler, _port: PortName) {}

    fn recv_atomic(&mut self, _port: PortName, _item: &MemRequest) -> Cycle {
        self.atomic_latency
    }

    fn recv_functional(&mut self, _port: PortName, item: &MemRequest) {
        self.functional.push(item.id);
    }
}

/// Upstream stand-in: collects responses, refuses them while `busy`.
#[derive(Debug, Default)]
pub struct MockIssuer {
    pub busy: bool,
    pub responses: Vec<MemResponse>,
    pub retries: usize,
    pub owes_retry: bool,
}

impl PortPeer<MemResponse> for MockIssuer {
    fn recv_timing(&mut self, _sched: &mut Scheduler, _port: PortName, item: MemResponse) -> Result<(), MemResponse> {
        if self.busy {
            self.owes_retry = true;
            return Err(item);
        }
        self.responses.push(item);
        Ok(())
    }

    fn recv_retry(&mut self, _sched: &mut Scheduler, _port: PortName) {
        self.retries += 1;
    }
}

pub fn split_config() -> DispatcherConfig {
    DispatcherConfig {
        ranges: vec![
            AddressRange::new(0x0000, 0x8000, Tier::Fast),
            AddressRange::new(0x8000, 0x8000, Tier::Slow),
        ],
        ..DispatcherConfig::default()
    }
}

pub fn remap(id: u64, addr: u64) -> MemRequest {
    MemRequest::read(id, Source::Remap, id, addr)
}

pub fn migration(id: u64, addr: u64) -> MemRequest {
    MemRequest::write(id, Source::Migration, id, addr)
}

/// A dispatcher with every port wired to a mock, driven by hand.
pub struct Rig {
    pub sched: Scheduler,
    pub dispatcher: Dispatcher,
    pub remap: Rc<RefCell<MockIssuer>>,
    pub migration: Rc<RefCell<MockIssuer>>,
    pub accounting: Rc<RefCell<MockSink>>,
    pub fast: Rc<RefCell<MockSink>>,
    pub slow: Rc<RefCell<MockSink>>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_config(split_config())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        let dispatcher = Dispatcher::new(&config).unwrap();
        let rig = Self {
            sched: Scheduler::new(),
            dispatcher,
            remap: Rc::default(),
            migration: Rc::default(),
            accounting: Rc::default(),
            fast: Rc::default(),
            slow: Rc::default(),
        };
        rig.dispatcher.connect_upstream(Source::Remap, &rig.remap).unwrap();
        rig.dispatcher.connect_upstream(Source::Migration, &rig.migration).unwrap();
        rig.dispatcher.connect_accounting(&rig.accounting).unwrap();
        rig.dispatcher.connect_tier(Tier::Fast, &rig.fast).unwrap();
        rig.dispatcher.connect_tier(Tier::Slow, &rig.slow).unwrap();
        rig
    }

    pub fn send(&mut self, request: MemRequest) -> Delivery<MemRequest> {
        let source = request.source;
        self.dispatcher
            .recv_request(&mut self.sched, source, request)
            .unwrap()
    }

    pub fn tier(&self, tier: Tier) -> Rc<RefCell<MockSink>> {
        match tier {
            Tier::Fast => Rc::clone(&self.fast),
            Tier::Slow => Rc::clone(&self.slow),
        }
    }

    pub fn issuer(&self, source: Source) -> Rc<RefCell<MockIssuer>> {
        match source {
            Source::Remap => Rc::clone(&self.remap),
            Source::Migration => Rc::clone(&self.migration),
        }
    }

    /// Acknowledge everything the access counter has accepted so far, oldest first.
    pub fn ack_accounting(&mut self) -> Vec<RequestId> {
        let taken = std::mem::take(&mut self.accounting.borrow_mut().received);
        let ids: Vec<_> = taken.iter().map(|req| req.id).collect();
        for id in &ids {
            self.dispatcher
                .recv_from_accounting(&mut self.sched, AccountingReply::Ack(*id))
                .unwrap();
        }
        ids
    }

    /// Answer everything `tier` has accepted so far, oldest first.
    pub fn complete(&mut self, tier: Tier) -> Vec<RequestId> {
        let sink = self.tier(tier);
        let taken = std::mem::take(&mut sink.borrow_mut().received);
        for req in &taken {
            self.dispatcher
                .recv_from_tier(&mut self.sched, tier, MemResponse::ok(req, tier))
                .unwrap();
        }
        taken.iter().map(|req| req.id).collect()
    }

    /// Deliver the wake-ups the dispatcher left on the scheduler.  Returns how many ran.
    pub fn wake(&mut self) -> usize {
        let mut woken = 0;
        while let Some((_, event)) = self.sched.pop() {
            if event == SimEvent::Complete(Unit::Dispatcher) {
                self.dispatcher.wake(&mut self.sched).unwrap();
                woken += 1;
            }
        }
        woken
    }

    /// Run accounting and both tiers until nothing moves.
    pub fn settle(&mut self) {
        loop {
            let woken = self.wake();
            let acked = self.ack_accounting();
            let fast = self.complete(Tier::Fast);
            let slow = self.complete(Tier::Slow);
            if woken == 0 && acked.is_empty() && fast.is_empty() && slow.is_empty() {
                break;
            }
        }
    }

    pub fn retry(&mut self, port: PortName) -> Result<(), DispatchError> {
        self.dispatcher.recv_retry(&mut self.sched, port)
    }

    pub fn delivered(&self, source: Source) -> Vec<RequestId> {
        self.issuer(source)
            .borrow()
            .responses
            .iter()
            .map(|resp| resp.id)
            .collect()
    }
}

pub fn ids(raw: &[u64]) -> Vec<RequestId> {
    raw.iter().copied().map(RequestId).collect()
}

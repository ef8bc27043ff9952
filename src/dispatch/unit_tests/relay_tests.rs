use std::cell::RefCell;
use std::rc::Rc;

use super::support::{remap, MockIssuer, MockSink};
use crate::base::port::{Delivery, PortName};
use crate::dispatch::error::DispatchError;
use crate::dispatch::relay::FlatRelay;
use crate::dispatch::request::{MemResponse, RequestId};
use crate::sim::event::Scheduler;

struct RelayRig {
    sched: Scheduler,
    relay: FlatRelay,
    bus: Rc<RefCell<MockIssuer>>,
    mem: Rc<RefCell<MockSink>>,
}

impl RelayRig {
    fn new() -> Self {
        let rig = Self {
            sched: Scheduler::new(),
            relay: FlatRelay::new(),
            bus: Rc::default(),
            mem: Rc::default(),
        };
        rig.relay.connect_upstream(&rig.bus).unwrap();
        rig.relay.connect_memory(&rig.mem).unwrap();
        rig
    }

    fn answer(&mut self) -> Result<(), DispatchError> {
        let taken = std::mem::take(&mut self.mem.borrow_mut().received);
        for req in &taken {
            self.relay
                .recv_response(&mut self.sched, MemResponse::completed(req, None))?;
        }
        Ok(())
    }
}

#[test]
fn passes_request_and_response_through() {
    let mut rig = RelayRig::new();
    assert!(rig.relay.recv_request(&mut rig.sched, remap(1, 0x40)).unwrap().is_accepted());
    assert_eq!(vec![RequestId(1)], rig.mem.borrow().seen);
    rig.answer().unwrap();

    let bus = rig.bus.borrow();
    assert_eq!(1, bus.responses.len());
    assert_eq!(RequestId(1), bus.responses[0].id);
    assert_eq!(0x40, bus.responses[0].addr);
    assert!(rig.relay.is_idle());
    assert_eq!(1, rig.relay.stats().forwarded());
}

#[test]
fn one_request_at_a_time() {
    let mut rig = RelayRig::new();
    rig.relay.recv_request(&mut rig.sched, remap(1, 0x40)).unwrap();
    let second = rig.relay.recv_request(&mut rig.sched, remap(2, 0x80)).unwrap();
    assert_eq!(Delivery::Busy(remap(2, 0x80)), second);
    assert!(rig.relay.bus_port().needs_retry());

    rig.answer().unwrap();
    assert_eq!(1, rig.bus.borrow().retries);
    assert!(rig.relay.recv_request(&mut rig.sched, remap(2, 0x80)).unwrap().is_accepted());
    assert_eq!(1, rig.relay.stats().busy_rejects());
}

#[test]
fn busy_memory_gets_request_on_retry() {
    let mut rig = RelayRig::new();
    rig.mem.borrow_mut().busy = true;
    assert!(rig.relay.recv_request(&mut rig.sched, remap(1, 0x40)).unwrap().is_accepted());
    assert!(rig.mem.borrow().seen.is_empty());
    // nothing came back yet, so an early response is bogus
    let early = MemResponse::completed(&remap(1, 0x40), None);
    assert!(matches!(
        rig.relay.recv_response(&mut rig.sched, early),
        Err(DispatchError::ProtocolViolation { .. })
    ));

    rig.mem.borrow_mut().busy = false;
    rig.relay.recv_retry(&mut rig.sched, PortName::MemOut).unwrap();
    assert_eq!(vec![RequestId(1)], rig.mem.borrow().seen);
    rig.answer().unwrap();
    assert_eq!(1, rig.bus.borrow().responses.len());
}

#[test]
fn busy_bus_gets_response_on_retry() {
    let mut rig = RelayRig::new();
    rig.bus.borrow_mut().busy = true;
    rig.relay.recv_request(&mut rig.sched, remap(1, 0x40)).unwrap();
    rig.answer().unwrap();
    assert!(rig.bus.borrow().responses.is_empty());
    assert!(!rig.relay.is_idle());

    rig.bus.borrow_mut().busy = false;
    rig.relay.recv_retry(&mut rig.sched, PortName::BusIn).unwrap();
    assert_eq!(1, rig.bus.borrow().responses.len());
    assert!(rig.relay.is_idle());
    rig.relay.finish().unwrap();
}

#[test]
fn mismatched_response_is_a_violation() {
    let mut rig = RelayRig::new();
    rig.relay.recv_request(&mut rig.sched, remap(1, 0x40)).unwrap();
    let stray = MemResponse::completed(&remap(7, 0x40), None);
    assert!(matches!(
        rig.relay.recv_response(&mut rig.sched, stray),
        Err(DispatchError::ProtocolViolation { id: Some(RequestId(7)), .. })
    ));
    assert!(rig.relay.finish().is_err());
}

#[test]
fn unconnected_relay_reports_bus_port() {
    let mut sched = Scheduler::new();
    let mut relay = FlatRelay::new();
    assert_eq!(
        Err(DispatchError::PortNotConnected(PortName::BusIn)),
        relay.recv_request(&mut sched, remap(1, 0x40))
    );
}

#[test]
fn retry_on_dispatcher_port_is_a_violation() {
    let mut rig = RelayRig::new();
    assert!(matches!(
        rig.relay.recv_retry(&mut rig.sched, PortName::FastTierOut),
        Err(DispatchError::ProtocolViolation { .. })
    ));
}

#[test]
fn atomic_access_returns_memory_latency() {
    let mut rig = RelayRig::new();
    rig.mem.borrow_mut().atomic_latency = 12;
    assert_eq!(Ok(12), rig.relay.access_atomic(&remap(1, 0x40)));
}

#[test]
fn functional_access_bypasses_the_in_flight_slot() {
    let mut rig = RelayRig::new();
    rig.relay.recv_request(&mut rig.sched, remap(1, 0x40)).unwrap();
    rig.relay.access_functional(&remap(2, 0x80)).unwrap();
    assert_eq!(vec![RequestId(2)], rig.mem.borrow().functional);
    assert_eq!(vec![RequestId(1)], rig.mem.borrow().seen);
    assert!(!rig.relay.is_idle());
}

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;
use serde::Serialize;

use crate::base::port::{Delivery, Port, PortName, PortPeer};
use crate::dispatch::error::DispatchError;
use crate::dispatch::request::{MemRequest, MemResponse, RequestId};
use crate::sim::event::Scheduler;
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RelayStats {
    forwarded: u64,
    busy_rejects: u64,
    mem_busy: u64,
    bus_busy: u64,
}

impl RelayStats {
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn busy_rejects(&self) -> u64 {
        self.busy_rejects
    }

    pub fn mem_busy(&self) -> u64 {
        self.mem_busy
    }

    pub fn bus_busy(&self) -> u64 {
        self.bus_busy
    }
}

/// Single-port memory path: whatever comes in on the bus goes to memory unchanged, one request at
/// a time, and its response goes back the same way.
pub struct FlatRelay {
    bus_in: Port<MemResponse>,
    mem_out: Port<MemRequest>,
    inflight: Option<RequestId>,
    // accepted but refused by memory
    held_request: Option<MemRequest>,
    // answered but refused by the bus
    held_response: Option<MemResponse>,
    stats: RelayStats,
    initialized: bool,
}

impl Default for FlatRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl FlatRelay {
    pub fn new() -> Self {
        Self {
            bus_in: Port::new(PortName::BusIn),
            mem_out: Port::new(PortName::MemOut),
            inflight: None,
            held_request: None,
            held_response: None,
            stats: RelayStats::default(),
            initialized: false,
        }
    }

    pub fn connect_upstream<P>(&self, peer: &Rc<RefCell<P>>) -> Result<(), DispatchError>
    where
        P: PortPeer<MemResponse> + 'static,
    {
        self.bus_in.connect(peer)
    }

    pub fn connect_memory<P>(&self, peer: &Rc<RefCell<P>>) -> Result<(), DispatchError>
    where
        P: PortPeer<MemRequest> + 'static,
    {
        self.mem_out.connect(peer)
    }

    pub fn init(&mut self) -> Result<(), DispatchError> {
        if !self.bus_in.is_connected() {
            return Err(DispatchError::PortNotConnected(PortName::BusIn));
        }
        if !self.mem_out.is_connected() {
            return Err(DispatchError::PortNotConnected(PortName::MemOut));
        }
        self.initialized = true;
        Ok(())
    }

    fn ensure_init(&mut self) -> Result<(), DispatchError> {
        if self.initialized {
            return Ok(());
        }
        self.init()
    }

    pub fn bus_port(&self) -> &Port<MemResponse> {
        &self.bus_in
    }

    pub fn mem_port(&self) -> &Port<MemRequest> {
        &self.mem_out
    }

    pub fn recv_request(
        &mut self,
        sched: &mut Scheduler,
        request: MemRequest,
    ) -> Result<Delivery<MemRequest>, DispatchError> {
        self.ensure_init()?;
        if let Some(current) = self.inflight {
            debug!("relay busy with {}, refusing {}", current, request.id);
            self.bus_in.refuse();
            self.stats.busy_rejects = self.stats.busy_rejects.saturating_add(1);
            return Ok(Delivery::Busy(request));
        }
        self.inflight = Some(request.id);
        self.forward_request(sched, request)?;
        Ok(Delivery::Accepted)
    }

    pub fn recv_response(
        &mut self,
        sched: &mut Scheduler,
        response: MemResponse,
    ) -> Result<(), DispatchError> {
        self.ensure_init()?;
        if self.inflight != Some(response.id) {
            return Err(DispatchError::violation(
                response.id,
                format!("relay response does not match in-flight {:?}", self.inflight),
            ));
        }
        if self.held_request.is_some() {
            return Err(DispatchError::violation(
                response.id,
                "memory answered a request it never accepted",
            ));
        }
        self.forward_response(sched, response)
    }

    pub fn recv_retry(&mut self, sched: &mut Scheduler, port: PortName) -> Result<(), DispatchError> {
        self.ensure_init()?;
        match port {
            PortName::MemOut => {
                self.mem_out.recv_retry()?;
                if let Some(request) = self.held_request.take() {
                    self.forward_request(sched, request)?;
                }
                Ok(())
            }
            PortName::BusIn => {
                self.bus_in.recv_retry()?;
                match self.held_response.take() {
                    Some(response) => self.forward_response(sched, response),
                    None => Ok(()),
                }
            }
            other => Err(DispatchError::violation(
                None,
                format!("{other} is not a relay port"),
            )),
        }
    }

    pub fn access_atomic(&mut self, request: &MemRequest) -> Result<Cycle, DispatchError> {
        self.ensure_init()?;
        self.mem_out.send_atomic(request)
    }

    /// Pass a functional access straight to memory, even while a timing request is in flight.
    pub fn access_functional(&mut self, request: &MemRequest) -> Result<(), DispatchError> {
        self.ensure_init()?;
        self.mem_out.send_functional(request)
    }

    pub fn finish(&self) -> Result<(), DispatchError> {
        match self.inflight {
            Some(id) => Err(DispatchError::violation(id, "relay request still in flight at teardown")),
            None => Ok(()),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.inflight.is_none()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    fn forward_request(&mut self, sched: &mut Scheduler, request: MemRequest) -> Result<(), DispatchError> {
        if let Delivery::Busy(request) = self.mem_out.try_send(sched, request)? {
            debug!("memory busy, holding {}", request.id);
            self.stats.mem_busy = self.stats.mem_busy.saturating_add(1);
            self.held_request = Some(request);
        }
        Ok(())
    }

    fn forward_response(&mut self, sched: &mut Scheduler, response: MemResponse) -> Result<(), DispatchError> {
        match self.bus_in.try_send(sched, response)? {
            Delivery::Accepted => {
                self.inflight = None;
                self.stats.forwarded = self.stats.forwarded.saturating_add(1);
                self.bus_in.send_retry(sched)?;
            }
            Delivery::Busy(response) => {
                debug!("bus busy, holding response {}", response.id);
                self.stats.bus_busy = self.stats.bus_busy.saturating_add(1);
                self.held_response = Some(response);
            }
        }
        Ok(())
    }
}

/// `Port` models one flow-controlled attachment point of a component.
///
/// A port forwards items to exactly one peer.  The peer either accepts an item or reports busy; a
/// busy peer owes the port a retry, and until that retry arrives the port is blocked and refuses to
/// forward anything else.  The same handshake runs the other way: when the owner of a port turns
/// away an item offered by the peer it marks the port with `refuse`, and `send_retry` later tells
/// the peer to try again.
use std::cell::{OnceCell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use serde::Serialize;

use crate::dispatch::error::DispatchError;
use crate::sim::event::Scheduler;
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortName {
    RemapIn,
    MigrationIn,
    AccountingOut,
    FastTierOut,
    SlowTierOut,
    BusIn,
    MemOut,
}

impl PortName {
    pub fn as_str(self) -> &'static str {
        match self {
            PortName::RemapIn => "remap-in",
            PortName::MigrationIn => "migration-in",
            PortName::AccountingOut => "accounting-out",
            PortName::FastTierOut => "fast-tier-out",
            PortName::SlowTierOut => "slow-tier-out",
            PortName::BusIn => "bus-in",
            PortName::MemOut => "mem-out",
        }
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of offering an item to a peer.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery<T> {
    Accepted,
    /// The peer was busy; the item is handed back and must be held until a retry.
    Busy(T),
}

impl<T> Delivery<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Delivery::Accepted)
    }
}

/// The far side of a port.  Peers never call back into the port owner directly; anything they
/// need to tell it (completions, retries) goes through the scheduler.
pub trait PortPeer<T> {
    /// Offer `item` arriving over `port`.  `Err(item)` means busy, after which the peer must
    /// schedule a retry for `port` once it can accept again.
    fn recv_timing(&mut self, sched: &mut Scheduler, port: PortName, item: T) -> Result<(), T>;

    /// The owner of `port` refused an item from this peer earlier and is ready again.
    fn recv_retry(&mut self, sched: &mut Scheduler, port: PortName);

    /// Untimed access; returns the access latency.
    fn recv_atomic(&mut self, _port: PortName, _item: &T) -> Cycle {
        0
    }

    /// Untimed, zero-latency access that only updates functional state.
    fn recv_functional(&mut self, _port: PortName, _item: &T) {}
}

pub type PeerRef<T> = Rc<RefCell<dyn PortPeer<T>>>;

pub struct Port<T> {
    name: PortName,
    peer: OnceCell<Weak<RefCell<dyn PortPeer<T>>>>,
    // our last send bounced; waiting on the peer's retry
    blocked: bool,
    // we bounced the peer; it is waiting on our retry
    need_retry: bool,
    busy_count: u64,
}

impl<T: 'static> Port<T> {
    pub fn new(name: PortName) -> Self {
        Self {
            name,
            peer: OnceCell::new(),
            blocked: false,
            need_retry: false,
            busy_count: 0,
        }
    }

    pub fn name(&self) -> PortName {
        self.name
    }

    /// Bind this port to its only peer.  The port keeps a non-owning reference.
    pub fn connect<P>(&self, peer: &Rc<RefCell<P>>) -> Result<(), DispatchError>
    where
        P: PortPeer<T> + 'static,
    {
        let peer: PeerRef<T> = peer.clone();
        self.peer
            .set(Rc::downgrade(&peer))
            .map_err(|_| DispatchError::PortAlreadyConnected(self.name))
    }

    pub fn is_connected(&self) -> bool {
        self.peer().is_ok()
    }

    fn peer(&self) -> Result<PeerRef<T>, DispatchError> {
        self.peer
            .get()
            .and_then(Weak::upgrade)
            .ok_or(DispatchError::PortNotConnected(self.name))
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn needs_retry(&self) -> bool {
        self.need_retry
    }

    /// Number of sends the peer has turned away.
    pub fn busy_count(&self) -> u64 {
        self.busy_count
    }

    /// Offer `item` to the peer.  A blocked port does not bother the peer and hands the item
    /// straight back.
    pub fn try_send(&mut self, sched: &mut Scheduler, item: T) -> Result<Delivery<T>, DispatchError> {
        if self.blocked {
            return Ok(Delivery::Busy(item));
        }
        let peer = self.peer()?;
        let outcome = peer.borrow_mut().recv_timing(sched, self.name, item);
        match outcome {
            Ok(()) => Ok(Delivery::Accepted),
            Err(item) => {
                self.blocked = true;
                self.busy_count = self.busy_count.saturating_add(1);
                Ok(Delivery::Busy(item))
            }
        }
    }

    /// The peer can accept again.  A retry on a port that never bounced is a protocol error.
    pub fn recv_retry(&mut self) -> Result<(), DispatchError> {
        if !self.blocked {
            return Err(DispatchError::violation(
                None,
                format!("retry on {} which was not blocked", self.name),
            ));
        }
        self.blocked = false;
        Ok(())
    }

    /// Record that an item from the peer was turned away.
    pub fn refuse(&mut self) {
        self.need_retry = true;
    }

    /// Notify the peer if it is waiting on us.  Returns whether a retry went out.
    pub fn send_retry(&mut self, sched: &mut Scheduler) -> Result<bool, DispatchError> {
        if !self.need_retry {
            return Ok(false);
        }
        let peer = self.peer()?;
        self.need_retry = false;
        peer.borrow_mut().recv_retry(sched, self.name);
        Ok(true)
    }

    pub fn send_atomic(&self, item: &T) -> Result<Cycle, DispatchError> {
        let peer = self.peer()?;
        let latency = peer.borrow_mut().recv_atomic(self.name, item);
        Ok(latency)
    }

    pub fn send_functional(&self, item: &T) -> Result<(), DispatchError> {
        let peer = self.peer()?;
        peer.borrow_mut().recv_functional(self.name, item);
        Ok(())
    }
}

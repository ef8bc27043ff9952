use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

use log::{debug, info, warn};
use serde::Deserialize;

use crate::base::port::{Delivery, Port, PortName, PortPeer};
use crate::dispatch::decoder::{AddressDecoder, AddressRange};
use crate::dispatch::error::{ConfigError, DispatchError};
use crate::dispatch::pending::{PendingRequestTracker, Stage};
use crate::dispatch::request::{
    AccountingReply, MemRequest, MemResponse, RequestId, ResponseStatus, Source, Tier,
};
use crate::dispatch::stats::DispatcherStats;
use crate::sim::event::{Scheduler, SimEvent, Unit};
use crate::timeq::Cycle;

const HBM_BYTES: u64 = 1 << 20;
const DRAM_END: u64 = 1 << 32;

/// Which upstream sources have their traffic observed by the accounting stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountingPolicy {
    #[default]
    All,
    /// Page-copy traffic from the migration manager skips the access counter.
    RemapOnly,
}

impl AccountingPolicy {
    pub fn accounts(self, source: Source) -> bool {
        match self {
            AccountingPolicy::All => true,
            AccountingPolicy::RemapOnly => source == Source::Remap,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub ranges: Vec<AddressRange>,
    /// Per-source bound on requests staged inside the dispatcher.  `None` is unbounded.
    pub queue_depth: Option<usize>,
    pub accounting: AccountingPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ranges: vec![
                AddressRange::new(0, HBM_BYTES, Tier::Fast),
                AddressRange::new(HBM_BYTES, DRAM_END - HBM_BYTES, Tier::Slow),
            ],
            queue_depth: None,
            accounting: AccountingPolicy::All,
        }
    }
}

#[derive(Debug, Default)]
struct SourceQueues {
    // decoded, waiting for the accounting port; (seq, id)
    to_accounting: VecDeque<(u64, RequestId)>,
    // sent to accounting, reply outstanding
    awaiting_accounting: BTreeSet<u64>,
    // ready for a tier port, kept in issue order; (seq, id)
    to_tier: VecDeque<(u64, RequestId)>,
    // everything accepted and not yet delivered, in issue order
    in_flight: VecDeque<RequestId>,
    last_seq: Option<u64>,
}

impl SourceQueues {
    fn staged(&self) -> usize {
        self.to_accounting.len() + self.to_tier.len()
    }

    /// Oldest request of this source that has not made it through accounting yet.
    fn oldest_unaccounted(&self) -> Option<u64> {
        let queued = self.to_accounting.front().map(|(seq, _)| *seq);
        let waiting = self.awaiting_accounting.first().copied();
        match (queued, waiting) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn insert_for_tier(&mut self, seq: u64, id: RequestId) {
        let pos = self.to_tier.partition_point(|(s, _)| *s < seq);
        self.to_tier.insert(pos, (seq, id));
    }
}

/// Routes requests from the remapping table and the migration manager through the access
/// counter to the fast or slow tier, and steers every response back to the port it came from.
///
/// Each source is handled in strict issue order at every stage.  When both sources have work
/// for the same port, migration goes first.  A source whose path is stalled on a busy port gets
/// `Busy` for new requests and a retry once the path drains.
pub struct Dispatcher {
    decoder: AddressDecoder,
    queue_depth: Option<usize>,
    accounting: AccountingPolicy,
    tracker: PendingRequestTracker,
    remap_in: Port<MemResponse>,
    migration_in: Port<MemResponse>,
    accounting_out: Port<MemRequest>,
    fast_out: Port<MemRequest>,
    slow_out: Port<MemRequest>,
    queues: [SourceQueues; 2],
    stats: DispatcherStats,
    // accepted by the receive call in progress; its response must not overtake the acceptance
    arriving: Option<RequestId>,
    initialized: bool,
}

impl Dispatcher {
    pub fn new(config: &DispatcherConfig) -> Result<Self, ConfigError> {
        let decoder = AddressDecoder::new(&config.ranges)?;
        let (start, end) = decoder.span();
        info!(
            "dispatcher: {} ranges covering [{:#x}, {:#x}), accounting {:?}, queue depth {:?}",
            decoder.ranges().len(),
            start,
            end,
            config.accounting,
            config.queue_depth
        );
        Ok(Self {
            decoder,
            queue_depth: config.queue_depth,
            accounting: config.accounting,
            tracker: PendingRequestTracker::new(),
            remap_in: Port::new(PortName::RemapIn),
            migration_in: Port::new(PortName::MigrationIn),
            accounting_out: Port::new(PortName::AccountingOut),
            fast_out: Port::new(PortName::FastTierOut),
            slow_out: Port::new(PortName::SlowTierOut),
            queues: Default::default(),
            stats: DispatcherStats::default(),
            arriving: None,
            initialized: false,
        })
    }

    pub fn connect_upstream<P>(&self, source: Source, peer: &Rc<RefCell<P>>) -> Result<(), DispatchError>
    where
        P: PortPeer<MemResponse> + 'static,
    {
        self.upstream_port(source).connect(peer)
    }

    pub fn connect_accounting<P>(&self, peer: &Rc<RefCell<P>>) -> Result<(), DispatchError>
    where
        P: PortPeer<MemRequest> + 'static,
    {
        self.accounting_out.connect(peer)
    }

    pub fn connect_tier<P>(&self, tier: Tier, peer: &Rc<RefCell<P>>) -> Result<(), DispatchError>
    where
        P: PortPeer<MemRequest> + 'static,
    {
        self.tier_port(tier).connect(peer)
    }

    /// Check that all five ports have a peer.  Runs implicitly before the first event.
    pub fn init(&mut self) -> Result<(), DispatchError> {
        for (name, connected) in [
            (PortName::RemapIn, self.remap_in.is_connected()),
            (PortName::MigrationIn, self.migration_in.is_connected()),
            (PortName::AccountingOut, self.accounting_out.is_connected()),
            (PortName::FastTierOut, self.fast_out.is_connected()),
            (PortName::SlowTierOut, self.slow_out.is_connected()),
        ] {
            if !connected {
                return Err(DispatchError::PortNotConnected(name));
            }
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

    pub fn upstream_port(&self, source: Source) -> &Port<MemResponse> {
        match source {
            Source::Remap => &self.remap_in,
            Source::Migration => &self.migration_in,
        }
    }

    fn upstream_port_mut(&mut self, source: Source) -> &mut Port<MemResponse> {
        match source {
            Source::Remap => &mut self.remap_in,
            Source::Migration => &mut self.migration_in,
        }
    }

    pub fn accounting_port(&self) -> &Port<MemRequest> {
        &self.accounting_out
    }

    pub fn tier_port(&self, tier: Tier) -> &Port<MemRequest> {
        match tier {
            Tier::Fast => &self.fast_out,
            Tier::Slow => &self.slow_out,
        }
    }

    fn tier_port_mut(&mut self, tier: Tier) -> &mut Port<MemRequest> {
        match tier {
            Tier::Fast => &mut self.fast_out,
            Tier::Slow => &mut self.slow_out,
        }
    }

    pub fn recv_from_remap(
        &mut self,
        sched: &mut Scheduler,
        request: MemRequest,
    ) -> Result<Delivery<MemRequest>, DispatchError> {
        self.recv_request(sched, Source::Remap, request)
    }

    pub fn recv_from_migration(
        &mut self,
        sched: &mut Scheduler,
        request: MemRequest,
    ) -> Result<Delivery<MemRequest>, DispatchError> {
        self.recv_request(sched, Source::Migration, request)
    }

    /// Entry point for both upstream ports.  A refused request is handed back to the caller,
    /// which must hold it until this dispatcher retries its port.
    pub fn recv_request(
        &mut self,
        sched: &mut Scheduler,
        source: Source,
        request: MemRequest,
    ) -> Result<Delivery<MemRequest>, DispatchError> {
        self.ensure_init()?;
        if request.source != source {
            return Err(DispatchError::violation(
                request.id,
                format!(
                    "{} request arrived on {}",
                    request.source.as_str(),
                    self.upstream_port(source).name()
                ),
            ));
        }
        if let Some(last) = self.queues[source.index()].last_seq {
            if request.seq <= last {
                return Err(DispatchError::violation(
                    request.id,
                    format!("seq {} issued after seq {}", request.seq, last),
                ));
            }
        }

        if self.source_blocked(source) {
            debug!(
                "{} path blocked, refusing {} for addr {:#x}",
                source.as_str(),
                request.id,
                request.addr
            );
            self.upstream_port_mut(source).refuse();
            self.stats.record_busy_reject(source);
            return Ok(Delivery::Busy(request));
        }

        let (id, seq, addr) = (request.id, request.seq, request.addr);
        self.tracker.register(request)?;
        let queues = &mut self.queues[source.index()];
        queues.last_seq = Some(seq);
        queues.in_flight.push_back(id);
        self.stats.record_accept(source, self.tracker.len());

        match self.decoder.decode(addr) {
            Ok(tier) => {
                self.tracker.advance(id, Stage::Decoded)?.tier = Some(tier);
                debug!("{} {} accepted, addr {:#x} -> {} tier", source.as_str(), id, addr, tier.as_str());
                let queues = &mut self.queues[source.index()];
                if self.accounting.accounts(source) {
                    queues.to_accounting.push_back((seq, id));
                } else {
                    queues.insert_for_tier(seq, id);
                    self.stats.record_accounting_bypass();
                }
            }
            Err(err) => {
                warn!("{} {}: {}", source.as_str(), id, err);
                self.fail(id, ResponseStatus::AddressOutOfRange)?;
            }
        }

        self.arriving = Some(id);
        let pumped = self.pump(sched);
        self.arriving = None;
        pumped?;
        if self.stage_of(id) == Some(Stage::ResponseReceived) {
            // answered before the caller has seen the acceptance; hand it over on the next step
            sched.schedule_in(0, SimEvent::Complete(Unit::Dispatcher));
        }
        Ok(Delivery::Accepted)
    }

    /// Deferred work scheduled by this dispatcher itself: move whatever can move.
    pub fn wake(&mut self, sched: &mut Scheduler) -> Result<(), DispatchError> {
        self.ensure_init()?;
        self.pump(sched)
    }

    /// Continuation from the accounting stage.
    pub fn recv_from_accounting(
        &mut self,
        sched: &mut Scheduler,
        reply: AccountingReply,
    ) -> Result<(), DispatchError> {
        self.ensure_init()?;
        let id = reply.id();
        let entry = self.tracker.get_mut(id)?;
        if entry.stage != Stage::SentToAccounting || entry.accounted {
            return Err(DispatchError::violation(
                id,
                format!("accounting reply in stage {:?}", entry.stage),
            ));
        }
        if let AccountingReply::Forward(forwarded) = &reply {
            if forwarded.addr != entry.request.addr {
                return Err(DispatchError::violation(
                    id,
                    format!(
                        "accounting stage moved addr {:#x} to {:#x}",
                        entry.request.addr, forwarded.addr
                    ),
                ));
            }
        }
        entry.accounted = true;
        let (origin, seq) = (entry.origin, entry.request.seq);

        let queues = &mut self.queues[origin.index()];
        queues.awaiting_accounting.remove(&seq);
        let staged = queues.staged();
        match self.queue_depth.filter(|&depth| staged >= depth) {
            Some(depth) => {
                let err = DispatchError::RetryExhausted {
                    id,
                    source_name: origin.as_str(),
                    depth,
                };
                warn!("{}", err);
                self.fail(id, ResponseStatus::RetryExhausted)?;
            }
            None => self.queues[origin.index()].insert_for_tier(seq, id),
        }
        self.pump(sched)
    }

    pub fn recv_from_fast_tier(
        &mut self,
        sched: &mut Scheduler,
        response: MemResponse,
    ) -> Result<(), DispatchError> {
        self.recv_from_tier(sched, Tier::Fast, response)
    }

    pub fn recv_from_slow_tier(
        &mut self,
        sched: &mut Scheduler,
        response: MemResponse,
    ) -> Result<(), DispatchError> {
        self.recv_from_tier(sched, Tier::Slow, response)
    }

    pub fn recv_from_tier(
        &mut self,
        sched: &mut Scheduler,
        tier: Tier,
        response: MemResponse,
    ) -> Result<(), DispatchError> {
        self.ensure_init()?;
        let id = response.id;
        let entry = self.tracker.get(id)?;
        if entry.stage != Stage::SentToTier {
            return Err(DispatchError::violation(
                id,
                format!("{} tier response in stage {:?}", tier.as_str(), entry.stage),
            ));
        }
        if entry.tier != Some(tier) {
            return Err(DispatchError::violation(
                id,
                format!("{} tier answered a request routed elsewhere", tier.as_str()),
            ));
        }
        debug!("{} tier responded to {}", tier.as_str(), id);
        self.tracker.advance(id, Stage::ResponseReceived)?.response = Some(response);
        self.pump(sched)
    }

    /// A peer that turned us away earlier can take traffic again on `port`.
    pub fn recv_retry(&mut self, sched: &mut Scheduler, port: PortName) -> Result<(), DispatchError> {
        self.ensure_init()?;
        debug!("retry on {}", port);
        match port {
            PortName::RemapIn => self.remap_in.recv_retry()?,
            PortName::MigrationIn => self.migration_in.recv_retry()?,
            PortName::AccountingOut => self.accounting_out.recv_retry()?,
            PortName::FastTierOut => self.fast_out.recv_retry()?,
            PortName::SlowTierOut => self.slow_out.recv_retry()?,
            PortName::BusIn | PortName::MemOut => {
                return Err(DispatchError::violation(
                    None,
                    format!("{port} is not a dispatcher port"),
                ))
            }
        }
        self.pump(sched)
    }

    /// Untimed access: decode and hand straight to the tier, skipping accounting and flow control.
    pub fn access_atomic(&mut self, request: &MemRequest) -> Result<(Tier, Cycle), DispatchError> {
        self.ensure_init()?;
        let tier = self.decoder.decode(request.addr)?;
        let latency = self.tier_port(tier).send_atomic(request)?;
        Ok((tier, latency))
    }

    /// Untimed access that only touches functional state: decode and hand straight to the tier.
    /// Nothing is registered, accounted or queued.
    pub fn access_functional(&mut self, request: &MemRequest) -> Result<Tier, DispatchError> {
        self.ensure_init()?;
        let tier = self.decoder.decode(request.addr)?;
        debug!("functional {} {:#x} -> {} tier", request.id, request.addr, tier.as_str());
        self.tier_port(tier).send_functional(request)?;
        Ok(tier)
    }

    /// Teardown check: anything still pending means a response was lost.
    pub fn finish(&self) -> Result<(), DispatchError> {
        if !self.tracker.is_empty() {
            return Err(DispatchError::violation(
                None,
                format!("{} requests still pending at teardown", self.tracker.len()),
            ));
        }
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        self.tracker.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.tracker.len()
    }

    pub fn stage_of(&self, id: RequestId) -> Option<Stage> {
        self.tracker.get(id).ok().map(|entry| entry.stage)
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    fn source_blocked(&self, source: Source) -> bool {
        self.queues[source.index()].staged() > 0
    }

    fn fail(&mut self, id: RequestId, status: ResponseStatus) -> Result<(), DispatchError> {
        let entry = self.tracker.advance(id, Stage::ResponseReceived)?;
        entry.response = Some(MemResponse::error(&entry.request, status));
        self.stats.record_error(entry.origin, status);
        Ok(())
    }

    /// Move everything that can move, migration before remap at each stage, then wake any
    /// upstream source whose path has cleared.
    fn pump(&mut self, sched: &mut Scheduler) -> Result<(), DispatchError> {
        for source in Source::PRIORITY {
            self.drain_accounting(sched, source)?;
        }
        for source in Source::PRIORITY {
            self.drain_tier(sched, source)?;
        }
        for source in Source::PRIORITY {
            self.deliver(sched, source)?;
        }
        for source in Source::PRIORITY {
            if !self.source_blocked(source) && self.upstream_port(source).needs_retry() {
                debug!("{} path clear, sending retry", source.as_str());
                self.upstream_port_mut(source).send_retry(sched)?;
            }
        }
        Ok(())
    }

    fn drain_accounting(&mut self, sched: &mut Scheduler, source: Source) -> Result<(), DispatchError> {
        let idx = source.index();
        while let Some(&(seq, id)) = self.queues[idx].to_accounting.front() {
            let request = self.tracker.get(id)?.request.clone();
            let was_blocked = self.accounting_out.is_blocked();
            match self.accounting_out.try_send(sched, request)? {
                Delivery::Accepted => {
                    let queues = &mut self.queues[idx];
                    queues.to_accounting.pop_front();
                    queues.awaiting_accounting.insert(seq);
                    self.tracker.advance(id, Stage::SentToAccounting)?;
                    self.stats.record_accounting_send();
                }
                Delivery::Busy(_) => {
                    if !was_blocked {
                        debug!("access counter busy, holding {}", id);
                        self.stats.record_accounting_busy();
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    fn drain_tier(&mut self, sched: &mut Scheduler, source: Source) -> Result<(), DispatchError> {
        let idx = source.index();
        while let Some(&(seq, id)) = self.queues[idx].to_tier.front() {
            // an older request still inside accounting must reach the tier first
            if self.queues[idx]
                .oldest_unaccounted()
                .is_some_and(|oldest| oldest < seq)
            {
                break;
            }
            let entry = self.tracker.get(id)?;
            let tier = entry
                .tier
                .ok_or_else(|| DispatchError::violation(id, "staged for a tier before decode"))?;
            let request = entry.request.clone();
            let port = self.tier_port_mut(tier);
            let was_blocked = port.is_blocked();
            match port.try_send(sched, request)? {
                Delivery::Accepted => {
                    self.queues[idx].to_tier.pop_front();
                    self.tracker.advance(id, Stage::SentToTier)?;
                    self.stats.record_tier_send(tier);
                }
                Delivery::Busy(_) => {
                    if !was_blocked {
                        debug!("physical {} tier busy, holding {}", tier.as_str(), id);
                        self.stats.record_tier_busy(tier);
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    fn deliver(&mut self, sched: &mut Scheduler, source: Source) -> Result<(), DispatchError> {
        let idx = source.index();
        while let Some(&id) = self.queues[idx].in_flight.front() {
            if self.arriving == Some(id) {
                break;
            }
            let entry = self.tracker.get(id)?;
            if entry.stage != Stage::ResponseReceived {
                break;
            }
            let response = entry
                .response
                .clone()
                .ok_or_else(|| DispatchError::violation(id, "no response recorded"))?;
            let bytes = response.bytes;
            let port = self.upstream_port_mut(source);
            let was_blocked = port.is_blocked();
            match port.try_send(sched, response)? {
                Delivery::Accepted => {
                    self.queues[idx].in_flight.pop_front();
                    let token = self
                        .tracker
                        .token_for(id)
                        .ok_or_else(|| DispatchError::violation(id, "delivered without an entry"))?;
                    let origin = self.tracker.resolve(token)?;
                    debug_assert_eq!(origin, source);
                    self.stats.record_delivery(source, bytes);
                    debug!("delivered {} to {}", id, self.upstream_port(source).name());
                }
                Delivery::Busy(_) => {
                    if !was_blocked {
                        debug!("{} busy, holding response {}", self.upstream_port(source).name(), id);
                        self.stats.record_upstream_busy();
                    }
                    break;
                }
            }
        }
        Ok(())
    }
}

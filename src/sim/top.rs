use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{bail, Context};
use log::{info, warn};

use crate::base::port::Delivery;
use crate::dispatch::dispatcher::Dispatcher;
use crate::dispatch::error::DispatchError;
use crate::dispatch::relay::FlatRelay;
use crate::dispatch::request::{MemRequest, Source, Tier};
use crate::sim::config::{AccessMode, FabricMode, HybridConfig, SimConfig};
use crate::sim::event::{Scheduler, SimEvent, Unit};
use crate::sim::memory::{AccessCounter, TimedMemory};
use crate::sim::perf_log::{IssuerSummary, MemorySummary, RunSummary};
use crate::timeq::Cycle;
use crate::traffic::issuer::TrafficSource;

type Shared<T> = Rc<RefCell<T>>;

fn shared<T>(value: T) -> Shared<T> {
    Rc::new(RefCell::new(value))
}

/// What sits between the issuers and memory.
pub enum Fabric {
    Tiered {
        dispatcher: Dispatcher,
        accounting: Shared<AccessCounter>,
        fast: Shared<TimedMemory>,
        slow: Shared<TimedMemory>,
    },
    Flat {
        relay: FlatRelay,
        memory: Shared<TimedMemory>,
    },
}

impl Fabric {
    fn init(&mut self) -> Result<(), DispatchError> {
        match self {
            Fabric::Tiered { dispatcher, .. } => dispatcher.init(),
            Fabric::Flat { relay, .. } => relay.init(),
        }
    }

    fn finish(&self) -> Result<(), DispatchError> {
        match self {
            Fabric::Tiered { dispatcher, .. } => dispatcher.finish(),
            Fabric::Flat { relay, .. } => relay.finish(),
        }
    }

    fn outstanding(&self) -> usize {
        match self {
            Fabric::Tiered { dispatcher, .. } => dispatcher.outstanding(),
            Fabric::Flat { relay, .. } => usize::from(!relay.is_idle()),
        }
    }

    fn recv_request(
        &mut self,
        sched: &mut Scheduler,
        request: MemRequest,
    ) -> Result<Delivery<MemRequest>, DispatchError> {
        match self {
            Fabric::Tiered { dispatcher, .. } => {
                let source = request.source;
                dispatcher.recv_request(sched, source, request)
            }
            Fabric::Flat { relay, .. } => relay.recv_request(sched, request),
        }
    }

    fn access_atomic(&mut self, request: &MemRequest) -> Result<Cycle, DispatchError> {
        match self {
            Fabric::Tiered { dispatcher, .. } => dispatcher.access_atomic(request).map(|(_, latency)| latency),
            Fabric::Flat { relay, .. } => relay.access_atomic(request),
        }
    }

    fn access_functional(&mut self, request: &MemRequest) -> Result<(), DispatchError> {
        match self {
            Fabric::Tiered { dispatcher, .. } => dispatcher.access_functional(request).map(|_| ()),
            Fabric::Flat { relay, .. } => relay.access_functional(request),
        }
    }
}

/// Simulation driver: owns the scheduler, the fabric and every peer, and delivers each event to
/// the component it names.
pub struct Sim {
    config: SimConfig,
    sched: Scheduler,
    fabric: Fabric,
    issuers: Vec<Shared<TrafficSource>>,
    events: u64,
    accesses: u64,
    untimed_clock: Cycle,
}

impl Sim {
    pub fn new(config: HybridConfig) -> anyhow::Result<Sim> {
        config.validate()?;
        let (fabric, issuers) = match config.sim.mode {
            FabricMode::Tiered => Self::build_tiered(&config)?,
            FabricMode::Flat => Self::build_flat(&config)?,
        };
        Ok(Sim {
            config: config.sim,
            sched: Scheduler::new(),
            fabric,
            issuers,
            events: 0,
            accesses: 0,
            untimed_clock: 0,
        })
    }

    fn build_tiered(config: &HybridConfig) -> anyhow::Result<(Fabric, Vec<Shared<TrafficSource>>)> {
        let dispatcher = Dispatcher::new(&config.dispatcher).context("invalid address map")?;
        let accounting = shared(AccessCounter::new(
            config.accounting.server(),
            config.accounting.page_bytes,
        ));
        let fast = shared(TimedMemory::tier("fast", Tier::Fast, config.fast_tier));
        let slow = shared(TimedMemory::tier("slow", Tier::Slow, config.slow_tier));

        let mut issuers = Vec::new();
        for source in [Source::Remap, Source::Migration] {
            let issuer = shared(TrafficSource::new(source, config.traffic(source).clone()));
            dispatcher.connect_upstream(source, &issuer)?;
            issuers.push(issuer);
        }
        dispatcher.connect_accounting(&accounting)?;
        dispatcher.connect_tier(Tier::Fast, &fast)?;
        dispatcher.connect_tier(Tier::Slow, &slow)?;

        let fabric = Fabric::Tiered {
            dispatcher,
            accounting,
            fast,
            slow,
        };
        Ok((fabric, issuers))
    }

    fn build_flat(config: &HybridConfig) -> anyhow::Result<(Fabric, Vec<Shared<TrafficSource>>)> {
        let relay = FlatRelay::new();
        let memory = shared(TimedMemory::flat(config.flat_memory));
        let issuer = shared(TrafficSource::new(
            Source::Remap,
            config.traffic(Source::Remap).clone(),
        ));
        relay.connect_upstream(&issuer)?;
        relay.connect_memory(&memory)?;
        Ok((Fabric::Flat { relay, memory }, vec![issuer]))
    }

    pub fn issuers(&self) -> &[Shared<TrafficSource>] {
        &self.issuers
    }

    /// Run until every issuer is done.  Fails on a protocol error, a timeout, or a stall where
    /// the event queue runs dry with requests still outstanding.
    pub fn simulate(&mut self) -> anyhow::Result<RunSummary> {
        info!(
            "starting {:?} run in {:?} mode, timeout {} cycles",
            self.config.mode, self.config.access, self.config.timeout
        );
        self.fabric.init().context("fabric is not fully connected")?;
        match self.config.access {
            AccessMode::Timing => self.run_timing()?,
            AccessMode::Atomic | AccessMode::Functional => self.run_untimed()?,
        }
        self.fabric.finish().context("teardown")?;
        info!("run finished at cycle {} after {} events", self.clock(), self.events);
        Ok(self.summary())
    }

    fn run_timing(&mut self) -> anyhow::Result<()> {
        for issuer in &self.issuers {
            let issuer = issuer.borrow();
            if issuer.has_work() {
                self.sched.schedule(0, SimEvent::Issue(issuer.source()));
            }
        }

        while let Some((now, event)) = self.sched.pop() {
            if now > self.config.timeout {
                bail!(
                    "timeout at cycle {} with {} requests outstanding",
                    now,
                    self.fabric.outstanding()
                );
            }
            self.events += 1;
            match self.handle(event) {
                Ok(()) => {}
                Err(err) if !err.is_fatal() => warn!("cycle {}: {:?}: {}", now, event, err),
                Err(err) => {
                    return Err(err).with_context(|| format!("cycle {now}: handling {event:?}"))
                }
            }
            for issuer in &self.issuers {
                let issuer = issuer.borrow();
                if let Some(id) = issuer.misordered() {
                    bail!(
                        "cycle {}: {} issuer got response {} out of order",
                        now,
                        issuer.source().as_str(),
                        id
                    );
                }
            }
        }

        let stuck: Vec<_> = self
            .issuers
            .iter()
            .filter(|issuer| !issuer.borrow().is_done())
            .map(|issuer| {
                let issuer = issuer.borrow();
                format!("{} ({} outstanding)", issuer.source().as_str(), issuer.outstanding())
            })
            .collect();
        if !stuck.is_empty() {
            bail!(
                "stalled at cycle {}: no events left but {} not done",
                self.sched.now(),
                stuck.join(", ")
            );
        }
        Ok(())
    }

    /// Atomic and functional runs: one request per issuer per round, migration first, each
    /// answered on the spot.  Atomic latencies add up on a serial clock.
    fn run_untimed(&mut self) -> anyhow::Result<()> {
        let mut order = self.issuers.clone();
        order.sort_by_key(|issuer| {
            let source = issuer.borrow().source();
            Source::PRIORITY.iter().position(|&s| s == source)
        });
        loop {
            let mut progressed = false;
            for issuer in &order {
                let Some(request) = issuer.borrow_mut().next_request() else {
                    continue;
                };
                progressed = true;
                self.accesses += 1;
                let outcome = match self.config.access {
                    AccessMode::Functional => self.fabric.access_functional(&request).map(|()| 0),
                    _ => self.fabric.access_atomic(&request),
                };
                let latency = match outcome {
                    Ok(latency) => Some(latency),
                    Err(err) if !err.is_fatal() => {
                        warn!("{} {}: {}", request.source.as_str(), request.id, err);
                        None
                    }
                    Err(err) => {
                        return Err(err).with_context(|| format!("untimed access {}", request.id))
                    }
                };
                self.untimed_clock = self.untimed_clock.saturating_add(latency.unwrap_or(0));
                issuer.borrow_mut().complete_untimed(&request, latency);
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn clock(&self) -> Cycle {
        match self.config.access {
            AccessMode::Timing => self.sched.now(),
            AccessMode::Atomic | AccessMode::Functional => self.untimed_clock,
        }
    }

    fn handle(&mut self, event: SimEvent) -> Result<(), DispatchError> {
        match event {
            SimEvent::Issue(source) => self.issue(source),
            SimEvent::PortRetry(port) => match &mut self.fabric {
                Fabric::Tiered { dispatcher, .. } => dispatcher.recv_retry(&mut self.sched, port),
                Fabric::Flat { relay, .. } => relay.recv_retry(&mut self.sched, port),
            },
            SimEvent::Complete(unit) => self.complete(unit),
        }
    }

    fn issue(&mut self, source: Source) -> Result<(), DispatchError> {
        let Some(issuer) = self
            .issuers
            .iter()
            .find(|issuer| issuer.borrow().source() == source)
            .cloned()
        else {
            warn!("issue event for {} with no issuer", source.as_str());
            return Ok(());
        };
        // the issuer must not stay borrowed while the fabric runs; it may call back into it
        let Some(request) = issuer.borrow_mut().next_request() else {
            return Ok(());
        };
        let id = request.id;
        match self.fabric.recv_request(&mut self.sched, request)? {
            Delivery::Accepted => issuer.borrow_mut().accepted(&mut self.sched, id),
            Delivery::Busy(request) => issuer.borrow_mut().refused(request),
        }
        Ok(())
    }

    fn complete(&mut self, unit: Unit) -> Result<(), DispatchError> {
        let sched = &mut self.sched;
        match (&mut self.fabric, unit) {
            (Fabric::Tiered { dispatcher, accounting, .. }, Unit::Accounting) => {
                let replies = accounting.borrow_mut().drain_ready(sched);
                for reply in replies {
                    dispatcher.recv_from_accounting(sched, reply)?;
                }
            }
            (Fabric::Tiered { dispatcher, fast, slow, .. }, Unit::Tier(tier)) => {
                let memory = match tier {
                    Tier::Fast => fast,
                    Tier::Slow => slow,
                };
                let responses = memory.borrow_mut().drain_ready(sched);
                for response in responses {
                    dispatcher.recv_from_tier(sched, tier, response)?;
                }
            }
            (Fabric::Tiered { dispatcher, .. }, Unit::Dispatcher) => dispatcher.wake(sched)?,
            (Fabric::Flat { relay, memory }, Unit::Flat) => {
                let responses = memory.borrow_mut().drain_ready(sched);
                for response in responses {
                    relay.recv_response(sched, response)?;
                }
            }
            (_, unit) => warn!("completion from {:?} which this fabric does not have", unit),
        }
        Ok(())
    }

    pub fn summary(&self) -> RunSummary {
        let issuers = self
            .issuers
            .iter()
            .map(|issuer| IssuerSummary::from(issuer.borrow().stats()))
            .collect();
        let mut summary = RunSummary {
            mode: self.config.mode,
            access: self.config.access,
            cycles: self.clock(),
            events: self.events,
            untimed_accesses: self.accesses,
            issuers,
            memories: Vec::new(),
            dispatcher: None,
            accounting: None,
            relay: None,
        };
        match &self.fabric {
            Fabric::Tiered {
                dispatcher,
                accounting,
                fast,
                slow,
            } => {
                summary.dispatcher = Some(*dispatcher.stats());
                summary.accounting = Some(accounting.borrow().summary());
                for memory in [fast, slow] {
                    let memory = memory.borrow();
                    summary.memories.push(MemorySummary {
                        name: memory.name(),
                        stats: *memory.stats(),
                    });
                }
            }
            Fabric::Flat { relay, memory } => {
                summary.relay = Some(*relay.stats());
                let memory = memory.borrow();
                summary.memories.push(MemorySummary {
                    name: memory.name(),
                    stats: *memory.stats(),
                });
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::config::PatternKind;

    fn small_config() -> HybridConfig {
        let mut config = HybridConfig::default();
        config.traffic_mut(Source::Remap).requests = 300;
        config.traffic_mut(Source::Migration).requests = 120;
        config
    }

    #[test]
    fn tiered_run_completes_every_request() {
        let mut sim = Sim::new(small_config()).unwrap();
        let summary = sim.simulate().unwrap();
        assert_eq!(2, summary.issuers.len());
        for issuer in sim.issuers() {
            let issuer = issuer.borrow();
            assert!(issuer.is_done());
            assert_eq!(issuer.stats().issued(), issuer.stats().completed());
        }
        let dispatcher = summary.dispatcher.unwrap();
        assert_eq!(300, dispatcher.source(Source::Remap).delivered());
        assert_eq!(120, dispatcher.source(Source::Migration).delivered());
        assert_eq!(420, summary.accounting.unwrap().accesses);
    }

    #[test]
    fn tight_queues_and_busy_issuers_still_drain() {
        let mut config = small_config();
        config.fast_tier.queue_capacity = 1;
        config.slow_tier.queue_capacity = 1;
        config.accounting.queue_capacity = 1;
        config.traffic_mut(Source::Remap).resp_busy_every = 3;
        config.traffic_mut(Source::Migration).resp_busy_every = 5;
        let mut sim = Sim::new(config).unwrap();
        let summary = sim.simulate().unwrap();
        let dispatcher = summary.dispatcher.unwrap();
        assert!(dispatcher.source(Source::Remap).busy_rejects() > 0);
        assert!(dispatcher.upstream_busy() > 0);
        assert!(summary.memories.iter().any(|m| m.stats.refused() > 0));
        assert_eq!(
            420,
            dispatcher.source(Source::Remap).delivered() + dispatcher.source(Source::Migration).delivered()
        );
    }

    #[test]
    fn remap_only_accounting_skips_page_copies() {
        let mut config = small_config();
        config.dispatcher.accounting = crate::dispatch::dispatcher::AccountingPolicy::RemapOnly;
        let summary = Sim::new(config).unwrap().simulate().unwrap();
        assert_eq!(300, summary.accounting.unwrap().accesses);
        assert_eq!(120, summary.dispatcher.unwrap().bypassed_accounting());
    }

    #[test]
    fn out_of_range_traffic_gets_error_responses() {
        let mut config = small_config();
        let remap = config.traffic_mut(Source::Remap);
        remap.pattern = PatternKind::Sequential;
        remap.addr_min = 0xffff_0000;
        remap.addr_max = 0x1_0001_0000;
        remap.stride = 0x1000;
        let mut sim = Sim::new(config).unwrap();
        let summary = sim.simulate().unwrap();
        let dispatcher = summary.dispatcher.unwrap();
        // the window straddles the top of the slow tier; every other half-sweep is unmapped
        assert_eq!(144, dispatcher.source(Source::Remap).address_errors());
        let remap = &sim.issuers()[0];
        assert_eq!(144, remap.borrow().stats().errors());
        assert_eq!(300, remap.borrow().stats().completed());
    }

    #[test]
    fn flat_run_relays_one_at_a_time() {
        let mut config = small_config();
        config.sim.mode = FabricMode::Flat;
        config.traffic_mut(Source::Remap).resp_busy_every = 4;
        let mut sim = Sim::new(config).unwrap();
        let summary = sim.simulate().unwrap();
        assert_eq!(1, summary.issuers.len());
        let relay = summary.relay.unwrap();
        assert_eq!(300, relay.forwarded());
        assert!(relay.busy_rejects() > 0);
        assert!(summary.dispatcher.is_none());
    }

    #[test]
    fn unmapped_first_request_is_answered_not_fatal() {
        let mut config = small_config();
        config.traffic_mut(Source::Migration).requests = 0;
        let remap = config.traffic_mut(Source::Remap);
        remap.requests = 3;
        remap.addr_min = 0x2_0000_0000;
        remap.addr_max = 0x2_0001_0000;
        let mut sim = Sim::new(config).unwrap();
        let summary = sim.simulate().unwrap();
        let remap = &sim.issuers()[0];
        assert_eq!(3, remap.borrow().stats().completed());
        assert_eq!(3, remap.borrow().stats().errors());
        assert_eq!(3, summary.dispatcher.unwrap().source(Source::Remap).address_errors());
    }

    #[test]
    fn invalid_server_config_is_an_error_not_a_panic() {
        let mut config = small_config();
        config.fast_tier.queue_capacity = 0;
        assert!(Sim::new(config).is_err());
    }

    #[test]
    fn atomic_run_skips_accounting_and_sums_latency() {
        let mut config = small_config();
        config.sim.access = AccessMode::Atomic;
        let mut sim = Sim::new(config).unwrap();
        let summary = sim.simulate().unwrap();
        assert_eq!(420, summary.untimed_accesses);
        assert_eq!(0, summary.events);
        assert!(summary.cycles > 0);
        assert_eq!(0, summary.accounting.unwrap().accesses);
        let atomic: u64 = summary.memories.iter().map(|m| m.stats.atomic()).sum();
        assert_eq!(420, atomic);
        assert!(sim.issuers().iter().all(|issuer| issuer.borrow().is_done()));
    }

    #[test]
    fn functional_run_through_relay_takes_no_time() {
        let mut config = small_config();
        config.sim.mode = FabricMode::Flat;
        config.sim.access = AccessMode::Functional;
        let summary = Sim::new(config).unwrap().simulate().unwrap();
        assert_eq!(0, summary.cycles);
        assert_eq!(300, summary.memories[0].stats.functional());
        assert_eq!(0, summary.memories[0].stats.served());
        assert_eq!(0, summary.relay.unwrap().forwarded());
    }

    #[test]
    fn untimed_out_of_range_counts_as_error() {
        let mut config = small_config();
        config.sim.access = AccessMode::Functional;
        config.traffic_mut(Source::Migration).requests = 0;
        let remap = config.traffic_mut(Source::Remap);
        remap.requests = 4;
        remap.addr_min = 0x2_0000_0000;
        remap.addr_max = 0x2_0001_0000;
        let mut sim = Sim::new(config).unwrap();
        sim.simulate().unwrap();
        assert_eq!(4, sim.issuers()[0].borrow().stats().errors());
    }

    #[test]
    fn timeout_is_an_error() {
        let mut config = small_config();
        config.sim.timeout = 50;
        let err = Sim::new(config).unwrap().simulate().unwrap_err();
        assert!(err.to_string().contains("timeout"), "{err:#}");
    }

    #[test]
    fn summary_serializes_to_json() {
        let mut config = small_config();
        config.traffic_mut(Source::Remap).requests = 10;
        config.traffic_mut(Source::Migration).requests = 0;
        let summary = Sim::new(config).unwrap().simulate().unwrap();
        let json = summary.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!("tiered", value["mode"]);
        assert_eq!(10, value["issuers"][0]["completed"]);
        assert_eq!(0, value["issuers"][1]["issued"]);
    }
}

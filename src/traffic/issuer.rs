use std::collections::VecDeque;

use log::{debug, info};
use serde::Serialize;

use crate::base::port::{PortName, PortPeer};
use crate::dispatch::request::{MemRequest, MemResponse, RequestId, Source};
use crate::sim::event::{Scheduler, SimEvent};
use crate::timeq::Cycle;
use crate::traffic::config::TrafficConfig;
use crate::traffic::patterns::AddressPattern;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct IssuerStats {
    source: Source,
    issued: u64,
    completed: u64,
    errors: u64,
    refused: u64,
    responses_refused: u64,
    bytes: u64,
    total_latency: u64,
    max_latency: Cycle,
}

impl IssuerStats {
    fn new(source: Source) -> Self {
        Self {
            source,
            issued: 0,
            completed: 0,
            errors: 0,
            refused: 0,
            responses_refused: 0,
            bytes: 0,
            total_latency: 0,
            max_latency: 0,
        }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn refused(&self) -> u64 {
        self.refused
    }

    pub fn responses_refused(&self) -> u64 {
        self.responses_refused
    }

    fn record_completion(&mut self, latency: Cycle, response_ok: bool, bytes: u32) {
        self.completed += 1;
        self.total_latency = self.total_latency.saturating_add(latency);
        self.max_latency = self.max_latency.max(latency);
        if response_ok {
            self.bytes = self.bytes.saturating_add(bytes as u64);
        } else {
            self.errors += 1;
        }
    }

    pub fn avg_latency(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        self.total_latency as f64 / self.completed as f64
    }
}

/// Synthetic upstream issuer.  It offers one request per `Issue` event, holds a refused request
/// until the port it was refused on sends a retry, and checks that responses come back in the
/// order it issued them.
pub struct TrafficSource {
    source: Source,
    config: TrafficConfig,
    pattern: AddressPattern,
    id_base: u64,
    generated: u64,
    stash: Option<MemRequest>,
    waiting_retry: bool,
    outstanding: VecDeque<(RequestId, Cycle)>,
    resp_offers: u64,
    misordered: Option<RequestId>,
    stats: IssuerStats,
}

impl TrafficSource {
    pub fn new(source: Source, config: TrafficConfig) -> Self {
        let id_base = match source {
            Source::Remap => 1,
            Source::Migration => 1 << 40,
        };
        Self {
            source,
            pattern: AddressPattern::new(&config),
            config,
            id_base,
            generated: 0,
            stash: None,
            waiting_retry: false,
            outstanding: VecDeque::new(),
            resp_offers: 0,
            misordered: None,
            stats: IssuerStats::new(source),
        }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn has_work(&self) -> bool {
        self.config.requests > 0
    }

    /// The request to offer now: a previously refused one first, else a fresh one.  `None` while
    /// waiting for a retry or once everything has been issued.
    pub fn next_request(&mut self) -> Option<MemRequest> {
        if self.waiting_retry {
            return None;
        }
        if let Some(request) = self.stash.take() {
            return Some(request);
        }
        if self.generated >= self.config.requests {
            return None;
        }
        let (addr, kind) = self.pattern.next_access();
        let seq = self.generated;
        self.generated += 1;
        self.stats.issued += 1;
        Some(MemRequest::new(
            self.id_base + seq,
            self.source,
            seq,
            addr,
            kind,
            self.config.req_bytes,
        ))
    }

    pub fn accepted(&mut self, sched: &mut Scheduler, id: RequestId) {
        self.outstanding.push_back((id, sched.now()));
        if self.generated < self.config.requests {
            sched.schedule_in(self.config.issue_interval.max(1), SimEvent::Issue(self.source));
        } else {
            debug!("{} issuer: last request {} accepted", self.source.as_str(), id);
        }
    }

    pub fn refused(&mut self, request: MemRequest) {
        debug!("{} issuer: {} refused, waiting for retry", self.source.as_str(), request.id);
        self.stats.refused += 1;
        self.stash = Some(request);
        self.waiting_retry = true;
    }

    /// Close out a request answered outside the event loop.  `latency` is `None` when the fabric
    /// rejected it.
    pub fn complete_untimed(&mut self, request: &MemRequest, latency: Option<Cycle>) {
        self.stats
            .record_completion(latency.unwrap_or(0), latency.is_some(), request.bytes);
    }

    pub fn is_done(&self) -> bool {
        self.generated >= self.config.requests && self.stash.is_none() && self.outstanding.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len() + usize::from(self.stash.is_some())
    }

    /// First response that did not match the oldest outstanding request, if any.
    pub fn misordered(&self) -> Option<RequestId> {
        self.misordered
    }

    pub fn stats(&self) -> &IssuerStats {
        &self.stats
    }
}

impl PortPeer<MemResponse> for TrafficSource {
    fn recv_timing(&mut self, sched: &mut Scheduler, port: PortName, item: MemResponse) -> Result<(), MemResponse> {
        self.resp_offers += 1;
        let every = self.config.resp_busy_every;
        if every > 0 && self.resp_offers % every == 0 {
            self.stats.responses_refused += 1;
            sched.schedule_in(1, SimEvent::PortRetry(port));
            return Err(item);
        }

        match self.outstanding.front() {
            Some(&(id, issued_at)) if id == item.id => {
                self.outstanding.pop_front();
                let latency = sched.now().saturating_sub(issued_at);
                self.stats
                    .record_completion(latency, item.status.is_ok(), item.bytes);
            }
            _ => {
                self.misordered.get_or_insert(item.id);
            }
        }
        if self.is_done() {
            info!(
                "{} issuer: all {} requests done at cycle {}",
                self.source.as_str(),
                self.config.requests,
                sched.now()
            );
        }
        Ok(())
    }

    fn recv_retry(&mut self, sched: &mut Scheduler, _port: PortName) {
        self.waiting_retry = false;
        sched.schedule_in(0, SimEvent::Issue(self.source));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::request::ResponseStatus;

    fn source(requests: u64, resp_busy_every: u64) -> TrafficSource {
        TrafficSource::new(
            Source::Migration,
            TrafficConfig {
                requests,
                resp_busy_every,
                ..TrafficConfig::for_source(Source::Migration)
            },
        )
    }

    #[test]
    fn issues_with_increasing_seq_and_unique_ids() {
        let mut issuer = source(3, 0);
        let reqs: Vec<_> = std::iter::from_fn(|| issuer.next_request()).collect();
        assert_eq!(3, reqs.len());
        assert_eq!(vec![0, 1, 2], reqs.iter().map(|r| r.seq).collect::<Vec<_>>());
        assert!(reqs.iter().all(|r| r.id.0 >= 1 << 40 && r.source == Source::Migration));
    }

    #[test]
    fn refused_request_waits_for_retry() {
        let mut sched = Scheduler::new();
        let mut issuer = source(2, 0);
        let first = issuer.next_request().unwrap();
        issuer.refused(first.clone());
        assert_eq!(None, issuer.next_request());

        issuer.recv_retry(&mut sched, PortName::MigrationIn);
        assert_eq!(Some((0, SimEvent::Issue(Source::Migration))), sched.pop());
        assert_eq!(Some(first), issuer.next_request());
    }

    #[test]
    fn tracks_response_order_and_latency() {
        let mut sched = Scheduler::new();
        let mut issuer = source(2, 0);
        let a = issuer.next_request().unwrap();
        issuer.accepted(&mut sched, a.id);
        sched.pop();
        let b = issuer.next_request().unwrap();
        issuer.accepted(&mut sched, b.id);

        let err = MemResponse::error(&a, ResponseStatus::AddressOutOfRange);
        issuer.recv_timing(&mut sched, PortName::MigrationIn, err).unwrap();
        assert_eq!(None, issuer.misordered());
        assert_eq!(1, issuer.stats().errors());

        let wrong = MemResponse::completed(&a, None);
        issuer.recv_timing(&mut sched, PortName::MigrationIn, wrong).unwrap();
        assert_eq!(Some(a.id), issuer.misordered());
        assert!(!issuer.is_done());
    }

    #[test]
    fn refuses_every_nth_response_and_schedules_retry() {
        let mut sched = Scheduler::new();
        let mut issuer = source(1, 1);
        let a = issuer.next_request().unwrap();
        issuer.accepted(&mut sched, a.id);
        let resp = MemResponse::completed(&a, None);
        assert!(issuer.recv_timing(&mut sched, PortName::MigrationIn, resp).is_err());
        assert_eq!(1, issuer.stats().responses_refused());
        assert_eq!(Some((1, SimEvent::PortRetry(PortName::MigrationIn))), sched.pop());
    }

    #[test]
    fn untimed_completions_count_errors_and_latency() {
        let mut issuer = source(2, 0);
        let a = issuer.next_request().unwrap();
        issuer.complete_untimed(&a, Some(30));
        let b = issuer.next_request().unwrap();
        issuer.complete_untimed(&b, None);
        assert!(issuer.is_done());
        assert_eq!(2, issuer.stats().completed());
        assert_eq!(1, issuer.stats().errors());
        assert_eq!(15.0, issuer.stats().avg_latency());
    }
}

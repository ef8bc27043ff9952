use serde::Serialize;

use crate::dispatch::request::{ResponseStatus, Source, Tier};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SourceStats {
    accepted: u64,
    busy_rejects: u64,
    delivered: u64,
    address_errors: u64,
    retry_exhausted: u64,
    bytes_delivered: u64,
}

impl SourceStats {
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn busy_rejects(&self) -> u64 {
        self.busy_rejects
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn address_errors(&self) -> u64 {
        self.address_errors
    }

    pub fn retry_exhausted(&self) -> u64 {
        self.retry_exhausted
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatcherStats {
    remap: SourceStats,
    migration: SourceStats,
    to_accounting: u64,
    bypassed_accounting: u64,
    to_fast: u64,
    to_slow: u64,
    accounting_busy: u64,
    fast_busy: u64,
    slow_busy: u64,
    upstream_busy: u64,
    peak_outstanding: u64,
}

impl DispatcherStats {
    pub fn source(&self, source: Source) -> &SourceStats {
        match source {
            Source::Remap => &self.remap,
            Source::Migration => &self.migration,
        }
    }

    fn source_mut(&mut self, source: Source) -> &mut SourceStats {
        match source {
            Source::Remap => &mut self.remap,
            Source::Migration => &mut self.migration,
        }
    }

    pub fn to_accounting(&self) -> u64 {
        self.to_accounting
    }

    pub fn bypassed_accounting(&self) -> u64 {
        self.bypassed_accounting
    }

    pub fn to_tier(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Fast => self.to_fast,
            Tier::Slow => self.to_slow,
        }
    }

    pub fn accounting_busy(&self) -> u64 {
        self.accounting_busy
    }

    pub fn tier_busy(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Fast => self.fast_busy,
            Tier::Slow => self.slow_busy,
        }
    }

    pub fn upstream_busy(&self) -> u64 {
        self.upstream_busy
    }

    pub fn peak_outstanding(&self) -> u64 {
        self.peak_outstanding
    }

    pub fn record_accept(&mut self, source: Source, outstanding: usize) {
        let stats = self.source_mut(source);
        stats.accepted = stats.accepted.saturating_add(1);
        self.peak_outstanding = self.peak_outstanding.max(outstanding as u64);
    }

    pub fn record_busy_reject(&mut self, source: Source) {
        let stats = self.source_mut(source);
        stats.busy_rejects = stats.busy_rejects.saturating_add(1);
    }

    pub fn record_error(&mut self, source: Source, status: ResponseStatus) {
        let stats = self.source_mut(source);
        match status {
            ResponseStatus::AddressOutOfRange => {
                stats.address_errors = stats.address_errors.saturating_add(1)
            }
            ResponseStatus::RetryExhausted => {
                stats.retry_exhausted = stats.retry_exhausted.saturating_add(1)
            }
            ResponseStatus::Ok => {}
        }
    }

    pub fn record_delivery(&mut self, source: Source, bytes: u32) {
        let stats = self.source_mut(source);
        stats.delivered = stats.delivered.saturating_add(1);
        stats.bytes_delivered = stats.bytes_delivered.saturating_add(bytes as u64);
    }

    pub fn record_accounting_send(&mut self) {
        self.to_accounting = self.to_accounting.saturating_add(1);
    }

    pub fn record_accounting_bypass(&mut self) {
        self.bypassed_accounting = self.bypassed_accounting.saturating_add(1);
    }

    pub fn record_tier_send(&mut self, tier: Tier) {
        match tier {
            Tier::Fast => self.to_fast = self.to_fast.saturating_add(1),
            Tier::Slow => self.to_slow = self.to_slow.saturating_add(1),
        }
    }

    pub fn record_accounting_busy(&mut self) {
        self.accounting_busy = self.accounting_busy.saturating_add(1);
    }

    pub fn record_tier_busy(&mut self, tier: Tier) {
        match tier {
            Tier::Fast => self.fast_busy = self.fast_busy.saturating_add(1),
            Tier::Slow => self.slow_busy = self.slow_busy.saturating_add(1),
        }
    }

    pub fn record_upstream_busy(&mut self) {
        self.upstream_busy = self.upstream_busy.saturating_add(1);
    }
}

use anyhow::ensure;
use serde::{Deserialize, Serialize};

use crate::dispatch::request::Source;
use crate::sim::config::Config;
use crate::timeq::Cycle;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    #[default]
    Random,
    Sequential,
}

/// One synthetic issuer, `[traffic.remap]` or `[traffic.migration]`.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct TrafficConfig {
    pub requests: u64,
    pub req_bytes: u32,
    pub write_ratio: f64,
    pub pattern: PatternKind,
    pub addr_min: u64,
    pub addr_max: u64,
    pub stride: u64,
    pub issue_interval: Cycle,
    pub seed: u64,
    /// Turn away every Nth response offered back to the issuer; 0 never does.
    pub resp_busy_every: u64,
}

impl Config for TrafficConfig {}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            requests: 1000,
            req_bytes: 64,
            write_ratio: 0.3,
            pattern: PatternKind::Random,
            addr_min: 0,
            addr_max: 0x20_0000,
            stride: 64,
            issue_interval: 1,
            seed: 1,
            resp_busy_every: 0,
        }
    }
}

impl TrafficConfig {
    pub fn for_source(source: Source) -> Self {
        match source {
            Source::Remap => Self::default(),
            // page copies: streaming, write-heavy, slower cadence
            Source::Migration => Self {
                requests: 256,
                write_ratio: 0.5,
                pattern: PatternKind::Sequential,
                addr_min: 0x10_0000,
                issue_interval: 4,
                seed: 2,
                ..Self::default()
            },
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.req_bytes > 0, "req_bytes must be > 0");
        ensure!(
            self.addr_max > self.addr_min,
            "addr_max {:#x} must be above addr_min {:#x}",
            self.addr_max,
            self.addr_min
        );
        ensure!(
            (0.0..=1.0).contains(&self.write_ratio),
            "write_ratio {} outside [0, 1]",
            self.write_ratio
        );
        Ok(())
    }
}

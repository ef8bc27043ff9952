use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::dispatch::relay::RelayStats;
use crate::dispatch::stats::DispatcherStats;
use crate::sim::config::{AccessMode, FabricMode};
use crate::sim::memory::{AccountingSummary, MemoryStats};
use crate::timeq::Cycle;
use crate::traffic::issuer::IssuerStats;

#[derive(Debug, Serialize)]
pub struct MemorySummary {
    pub name: &'static str,
    #[serde(flatten)]
    pub stats: MemoryStats,
}

#[derive(Debug, Serialize)]
pub struct IssuerSummary {
    #[serde(flatten)]
    pub stats: IssuerStats,
    pub avg_latency: f64,
}

impl From<&IssuerStats> for IssuerSummary {
    fn from(stats: &IssuerStats) -> Self {
        Self {
            stats: *stats,
            avg_latency: stats.avg_latency(),
        }
    }
}

/// End-of-run report, printed and optionally written as JSON.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub mode: FabricMode,
    pub access: AccessMode,
    pub cycles: Cycle,
    pub events: u64,
    /// Requests answered outside the event loop in atomic or functional runs.
    pub untimed_accesses: u64,
    pub issuers: Vec<IssuerSummary>,
    pub memories: Vec<MemorySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatcher: Option<DispatcherStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounting: Option<AccountingSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayStats>,
}

impl RunSummary {
    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("cannot serialize run summary")
    }
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    let file = File::create(path)
        .with_context(|| format!("cannot create stats file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, summary)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

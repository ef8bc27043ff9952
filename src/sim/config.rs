use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{ensure, Context};
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::dispatch::dispatcher::DispatcherConfig;
use crate::dispatch::request::Source;
use crate::timeq::ServerConfig;
use crate::traffic::config::TrafficConfig;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FabricMode {
    /// Two issuers, the dispatcher, the access counter and two tiers.
    #[default]
    Tiered,
    /// One issuer straight through the pass-through relay to a single memory.
    Flat,
}

impl FromStr for FabricMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "tiered" => Ok(Self::Tiered),
            "flat" => Ok(Self::Flat),
            _ => Err(format!(
                "unsupported mode '{}', expected one of: tiered, flat",
                value
            )),
        }
    }
}

/// How requests travel through the fabric.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Event-driven, with flow control and per-request latency.
    #[default]
    Timing,
    /// Each request is routed and answered on the spot with its unloaded latency.
    Atomic,
    /// Routed straight to memory with no timing at all, e.g. to warm up state.
    Functional,
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "timing" => Ok(Self::Timing),
            "atomic" => Ok(Self::Atomic),
            "functional" => Ok(Self::Functional),
            _ => Err(format!(
                "unsupported access mode '{}', expected one of: timing, atomic, functional",
                value
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub mode: FabricMode,
    pub access: AccessMode,
    pub log_level: u64,
    pub timeout: u64,
    pub stats_json: Option<PathBuf>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            mode: FabricMode::Tiered,
            access: AccessMode::Timing,
            log_level: 0,
            timeout: 10_000_000,
            stats_json: None,
        }
    }
}

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> anyhow::Result<Self> {
        match section {
            Some(value) => value
                .clone()
                .try_into()
                .context("cannot deserialize config section"),
            None => {
                warn!("config section not found");
                Ok(Self::default())
            }
        }
    }
}

impl Config for SimConfig {}

impl Config for DispatcherConfig {}

/// Deserialize `section` over `base`: keys the section leaves out keep their value from `base`.
pub fn overlay<T>(section: Option<&Value>, base: T) -> anyhow::Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let Some(Value::Table(keys)) = section else {
        if section.is_some() {
            anyhow::bail!("config section is not a table");
        }
        return Ok(base);
    };
    let Value::Table(mut merged) = Value::try_from(base)? else {
        anyhow::bail!("config defaults do not serialize to a table");
    };
    merged.extend(keys.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(Value::Table(merged).try_into()?)
}

pub const FAST_TIER: ServerConfig = ServerConfig {
    base_latency: 20,
    bytes_per_cycle: 64,
    queue_capacity: 8,
};

pub const SLOW_TIER: ServerConfig = ServerConfig {
    base_latency: 80,
    bytes_per_cycle: 16,
    queue_capacity: 8,
};

pub const FLAT_MEMORY: ServerConfig = ServerConfig {
    base_latency: 40,
    bytes_per_cycle: 32,
    queue_capacity: 4,
};

/// `[accounting]`: service law of the access counter plus its page granularity.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct AccountingConfig {
    pub base_latency: u64,
    pub bytes_per_cycle: u32,
    pub queue_capacity: usize,
    pub page_bytes: u64,
}

impl Config for AccountingConfig {}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            base_latency: 2,
            bytes_per_cycle: 64,
            queue_capacity: 4,
            page_bytes: 4096,
        }
    }
}

impl AccountingConfig {
    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            base_latency: self.base_latency,
            bytes_per_cycle: self.bytes_per_cycle,
            queue_capacity: self.queue_capacity,
        }
    }
}

/// Everything one run needs, read from the TOML file.
#[derive(Debug, Clone)]
pub struct HybridConfig {
    pub sim: SimConfig,
    pub dispatcher: DispatcherConfig,
    pub fast_tier: ServerConfig,
    pub slow_tier: ServerConfig,
    pub flat_memory: ServerConfig,
    pub accounting: AccountingConfig,
    /// Indexed by `Source::index`.
    pub traffic: [TrafficConfig; 2],
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            sim: SimConfig::default(),
            dispatcher: DispatcherConfig::default(),
            fast_tier: FAST_TIER,
            slow_tier: SLOW_TIER,
            flat_memory: FLAT_MEMORY,
            accounting: AccountingConfig::default(),
            traffic: [
                TrafficConfig::for_source(Source::Remap),
                TrafficConfig::for_source(Source::Migration),
            ],
        }
    }
}

impl HybridConfig {
    pub fn from_toml(toml_string: &str) -> anyhow::Result<Self> {
        let table: Table = toml::from_str(toml_string).context("cannot parse config toml")?;
        let traffic = table.get("traffic");
        let traffic_section = |source: Source| traffic.and_then(|t| t.get(source.as_str()));

        let config = Self {
            sim: SimConfig::from_section(table.get("sim")).context("[sim]")?,
            dispatcher: DispatcherConfig::from_section(table.get("dispatcher"))
                .context("[dispatcher]")?,
            fast_tier: overlay(table.get("fast_tier"), FAST_TIER).context("[fast_tier]")?,
            slow_tier: overlay(table.get("slow_tier"), SLOW_TIER).context("[slow_tier]")?,
            flat_memory: overlay(table.get("flat_memory"), FLAT_MEMORY).context("[flat_memory]")?,
            accounting: AccountingConfig::from_section(table.get("accounting"))
                .context("[accounting]")?,
            traffic: [
                overlay(
                    traffic_section(Source::Remap),
                    TrafficConfig::for_source(Source::Remap),
                )
                .context("[traffic.remap]")?,
                overlay(
                    traffic_section(Source::Migration),
                    TrafficConfig::for_source(Source::Migration),
                )
                .context("[traffic.migration]")?,
            ],
        };
        config.validate()?;
        Ok(config)
    }

    pub fn traffic(&self, source: Source) -> &TrafficConfig {
        &self.traffic[source.index()]
    }

    pub fn traffic_mut(&mut self, source: Source) -> &mut TrafficConfig {
        &mut self.traffic[source.index()]
    }

    /// Reject values the models would otherwise trip over at run time.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, server) in [
            ("fast_tier", self.fast_tier),
            ("slow_tier", self.slow_tier),
            ("flat_memory", self.flat_memory),
            ("accounting", self.accounting.server()),
        ] {
            ensure!(server.bytes_per_cycle > 0, "[{name}] bytes_per_cycle must be > 0");
            ensure!(server.queue_capacity > 0, "[{name}] queue_capacity must be > 0");
        }
        ensure!(self.accounting.page_bytes > 0, "[accounting] page_bytes must be > 0");
        if let Some(depth) = self.dispatcher.queue_depth {
            ensure!(depth > 0, "[dispatcher] queue_depth must be > 0");
        }
        for source in Source::PRIORITY {
            self.traffic(source)
                .validate()
                .with_context(|| format!("[traffic.{}]", source.as_str()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::dispatcher::AccountingPolicy;
    use crate::dispatch::request::Tier;
    use crate::traffic::config::PatternKind;

    #[test]
    fn empty_file_uses_defaults() {
        let config = HybridConfig::from_toml("").unwrap();
        assert_eq!(FabricMode::Tiered, config.sim.mode);
        assert_eq!(FAST_TIER, config.fast_tier);
        assert_eq!(2, config.dispatcher.ranges.len());
        assert_eq!(PatternKind::Sequential, config.traffic(Source::Migration).pattern);
    }

    #[test]
    fn sections_override_only_given_keys() {
        let config = HybridConfig::from_toml(
            r#"
            [sim]
            mode = "flat"
            access = "atomic"
            timeout = 500

            [dispatcher]
            queue_depth = 4
            accounting = "remap_only"
            [[dispatcher.ranges]]
            base = 0
            size = 0x8000
            tier = "fast"
            [[dispatcher.ranges]]
            base = 0x8000
            size = 0x8000
            tier = "slow"

            [slow_tier]
            base_latency = 200

            [traffic.migration]
            requests = 3
            "#,
        )
        .unwrap();
        assert_eq!(FabricMode::Flat, config.sim.mode);
        assert_eq!(AccessMode::Atomic, config.sim.access);
        assert_eq!(500, config.sim.timeout);
        assert_eq!(Some(4), config.dispatcher.queue_depth);
        assert_eq!(AccountingPolicy::RemapOnly, config.dispatcher.accounting);
        assert_eq!(Tier::Slow, config.dispatcher.ranges[1].tier);
        assert_eq!(200, config.slow_tier.base_latency);
        assert_eq!(SLOW_TIER.queue_capacity, config.slow_tier.queue_capacity);
        assert_eq!(3, config.traffic(Source::Migration).requests);
        assert_eq!(4, config.traffic(Source::Migration).issue_interval);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(HybridConfig::from_toml("[fast_tier]\nqueue_capacity = 0\n").is_err());
        assert!(HybridConfig::from_toml("[traffic.remap]\nwrite_ratio = 1.5\n").is_err());
        assert!(HybridConfig::from_toml("[sim]\nmode = \"ring\"\n").is_err());
        assert!(HybridConfig::from_toml("[dispatcher]\nqueue_depth = 0\n").is_err());
    }

    #[test]
    fn mode_parses_from_cli_string() {
        assert_eq!(Ok(FabricMode::Flat), "flat".parse());
        assert!("hybrid".parse::<FabricMode>().is_err());
        assert_eq!(Ok(AccessMode::Functional), "functional".parse());
        assert!("burst".parse::<AccessMode>().is_err());
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;

use crate::dispatch::request::Source;
use crate::sim::config::{AccessMode, FabricMode, HybridConfig};
use crate::sim::top::Sim;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct HybridArgs {
    #[arg(help = "Path to config.toml")]
    pub config_path: PathBuf,
    #[arg(long, help = "Override fabric mode (tiered, flat)")]
    pub mode: Option<FabricMode>,
    #[arg(long, help = "Override access mode (timing, atomic, functional)")]
    pub access: Option<AccessMode>,
    #[arg(long, help = "Enable log at level (0:warn, 1:info, 2:debug)")]
    pub log: Option<u64>,
    #[arg(long, help = "Override number of requests per issuer")]
    pub requests: Option<u64>,
    #[arg(long, help = "Write the run summary as JSON to this path")]
    pub stats_json: Option<PathBuf>,
}

pub fn read_toml(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path.display()))
}

/// Parse the TOML configuration.
/// If `cli_args` is given, override TOML options with CLI arguments.
pub fn load_config(toml_string: &str, cli_args: Option<&HybridArgs>) -> anyhow::Result<HybridConfig> {
    let mut config = HybridConfig::from_toml(toml_string)?;

    // override toml configs with CLI args
    if let Some(args) = cli_args {
        config.sim.mode = args.mode.unwrap_or(config.sim.mode);
        config.sim.access = args.access.unwrap_or(config.sim.access);
        config.sim.log_level = args.log.unwrap_or(config.sim.log_level);
        if let Some(path) = &args.stats_json {
            config.sim.stats_json = Some(path.clone());
        }
        if let Some(requests) = args.requests {
            for source in Source::PRIORITY {
                config.traffic_mut(source).requests = requests;
            }
        }
    }
    Ok(config)
}

/// Make a Sim object from the TOML configuration.
pub fn make_sim(toml_string: &str, cli_args: Option<&HybridArgs>) -> anyhow::Result<Sim> {
    Sim::new(load_config(toml_string, cli_args)?)
}

use std::process::ExitCode;

use clap::Parser;
use log::error;

use hybridmem::sim::log::init_logger;
use hybridmem::sim::perf_log::write_summary;
use hybridmem::sim::top::Sim;
use hybridmem::ui::{load_config, read_toml, HybridArgs};

fn run(argv: &HybridArgs) -> anyhow::Result<()> {
    let toml_string = read_toml(&argv.config_path)?;
    let config = load_config(&toml_string, Some(argv))?;
    init_logger(config.sim.log_level);

    let stats_json = config.sim.stats_json.clone();
    let mut sim = Sim::new(config)?;
    let summary = sim.simulate()?;
    println!("{}", summary.to_json()?);
    if let Some(path) = stats_json {
        write_summary(&path, &summary)?;
    }
    Ok(())
}

pub fn main() -> ExitCode {
    let argv = HybridArgs::parse();
    match run(&argv) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            eprintln!("hybridmem: {err:#}");
            ExitCode::FAILURE
        }
    }
}

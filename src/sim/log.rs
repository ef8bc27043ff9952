use env_logger::Builder;
use log::{debug, LevelFilter};

/// `sim.log_level` / `--log`: 0 warnings only, 1 info, 2 debug, anything higher trace.
pub fn level_filter(ulevel: u64) -> LevelFilter {
    match ulevel {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install the global logger.  `RUST_LOG` takes precedence over the configured level.
/// Returns false if a logger was already installed, which is then kept.
pub fn init_logger(ulevel: u64) -> bool {
    let mut builder = Builder::new();
    builder.filter_level(level_filter(ulevel));
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    match builder.try_init() {
        Ok(()) => true,
        Err(err) => {
            debug!("keeping existing logger: {}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_to_filters() {
        assert_eq!(LevelFilter::Warn, level_filter(0));
        assert_eq!(LevelFilter::Info, level_filter(1));
        assert_eq!(LevelFilter::Debug, level_filter(2));
        assert_eq!(LevelFilter::Trace, level_filter(9));
    }

    #[test]
    fn second_init_keeps_first_logger() {
        init_logger(0);
        assert!(!init_logger(2));
    }
}

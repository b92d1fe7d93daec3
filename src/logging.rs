//! Logging setup (design §6 "Environment variables"): `TermLogger` the way the
//! original CLI sets it up, extended with an optional mirrored file sink.

use simplelog::{CombinedLogger, ConfigBuilder, LevelFilter, TermLogger, TerminalMode, WriteLogger};
use std::fs::OpenOptions;
use std::str::FromStr;

/// Reads `LOG_LEVEL` (default `info`) and `LOG_FILE` (unset by default) and
/// initializes the global logger accordingly. `LOG_LEVEL` accepts `debug` and
/// `trace` in addition to the three levels this crate's own messages use
/// (design §6: "supplementing the spec's three documented levels with the two
/// that `log`/`simplelog` already support natively").
pub fn init() -> Result<(), log::SetLoggerError> {
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|s| LevelFilter::from_str(&s).ok())
        .unwrap_or(LevelFilter::Info);

    let config = ConfigBuilder::new()
        .set_location_level(LevelFilter::Debug)
        .set_time_format_rfc3339()
        .build();

    let term_logger = TermLogger::new(level, config.clone(), TerminalMode::Mixed, simplelog::ColorChoice::Auto);

    match std::env::var("LOG_FILE") {
        Ok(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .unwrap_or_else(|e| panic!("could not open LOG_FILE '{}': {}", path, e));
            CombinedLogger::init(vec![term_logger, WriteLogger::new(level, config, file)])
        }
        Err(_) => CombinedLogger::init(vec![term_logger]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_log_level_falls_back_to_info() {
        std::env::remove_var("LOG_LEVEL");
        let level = std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| LevelFilter::from_str(&s).ok())
            .unwrap_or(LevelFilter::Info);
        assert_eq!(level, LevelFilter::Info);
    }
}

use std::error::Error;
use std::fs::File;
use std::path::Path;

use log::LevelFilter;
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode, WriteLogger};

/// Terminal logging through env_logger, or terminal plus file through
/// simplelog when a log file is requested.
pub fn init(level: Option<LevelFilter>, log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    match log_file {
        None => {
            let mut builder =
                env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
            if let Some(level) = level {
                builder.filter_level(level);
            }
            builder.try_init()?;
        }
        Some(path) => {
            let level = level.unwrap_or(LevelFilter::Info);
            let file = File::create(path)?;
            CombinedLogger::init(vec![
                TermLogger::new(level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto),
                WriteLogger::new(level, Config::default(), file),
            ])?;
        }
    }
    Ok(())
}

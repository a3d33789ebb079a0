// log4rs setup shared by both binaries: one timestamped file per run plus
// stderr. Stdout stays free for the service readiness line.

use chrono::Local;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::{Path, PathBuf};

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// `{log_dir}/{prefix}-{timestamp}.log`
pub fn log_file_path(log_dir: &Path, prefix: &str) -> PathBuf {
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    log_dir.join(format!("{prefix}-{timestamp}.log"))
}

pub fn setup_logging(
    log_dir: &Path,
    prefix: &str,
    level: LevelFilter,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_file_path(log_dir, prefix);

    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build(&log_path)?;
    let stderr_appender = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .appender(Appender::builder().build("stderr", Box::new(stderr_appender)))
        .build(
            Root::builder()
                .appender("file")
                .appender("stderr")
                .build(level),
        )?;

    log4rs::init_config(config)?;

    Ok(log_path)
}

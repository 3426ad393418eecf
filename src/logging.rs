//! Tracing subscriber setup

use crate::config::LoggingConfig;
use crate::error::EcgError;
use chrono::Local;
use std::fs::{create_dir_all, File};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. Logs go to stderr, or to a file when
/// `save_logs` is set; `RUST_LOG` directives are honored on top of `level`.
pub fn setup_logging(cfg: &LoggingConfig) -> Result<(), EcgError> {
    let level = cfg
        .level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    let result = if cfg.save_logs {
        let path = log_file_path(cfg);
        if let Some(dir) = Path::new(&path).parent() {
            create_dir_all(dir)?;
        }
        let file = File::create(&path)?;

        fmt()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init()
    };
    result.map_err(|e| EcgError::Logging(e.to_string()))
}

/// Configured path, or a timestamped sibling when old logs are kept
fn log_file_path(cfg: &LoggingConfig) -> String {
    if cfg.rewrite_last_logs {
        cfg.log_file_path.clone()
    } else {
        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        format!(
            "{}-{}.log",
            cfg.log_file_path.trim_end_matches(".log"),
            timestamp
        )
    }
}

// src/logging.rs

//! Tracing subscriber for the `jobdag` binary.
//!
//! `--log-level` sets one level for everything. Without it, `JOBDAG_LOG` is
//! read as an `EnvFilter` directive list, so a single noisy part of the
//! engine can be turned up on its own:
//!
//! ```text
//! JOBDAG_LOG=info,jobdag::engine::dispatch=trace jobdag --once
//! ```
//!
//! Output goes to stderr; stdout is left to `--dry-run` and the run report.

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "JOBDAG_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

/// Install the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    let filter = build_filter(cli_level, env.as_deref())?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))
}

/// The flag wins over the environment; a blank variable counts as unset.
fn build_filter(cli_level: Option<LogLevel>, env: Option<&str>) -> Result<EnvFilter> {
    if let Some(level) = cli_level {
        return Ok(EnvFilter::default().add_directive(LevelFilter::from(level).into()));
    }

    match env.map(str::trim).filter(|s| !s.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid {LOG_ENV} value '{directives}'")),
        None => Ok(EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_overrides_environment() {
        let filter = build_filter(Some(LogLevel::Warn), Some("trace")).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));
    }

    #[test]
    fn environment_accepts_per_module_directives() {
        let filter = build_filter(None, Some("warn,jobdag::engine::dispatch=trace")).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn blank_or_missing_environment_means_info() {
        for env in [None, Some(""), Some("   ")] {
            let filter = build_filter(None, env).unwrap();
            assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
        }
    }

    #[test]
    fn bad_level_in_environment_is_an_error() {
        let err = build_filter(None, Some("jobdag=loud")).unwrap_err();
        assert!(err.to_string().contains(LOG_ENV), "{err}");
    }
}

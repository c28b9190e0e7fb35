//! Observability infrastructure for strata.
//!
//! Structured logging with consistent spans. Every engine log line carries the
//! source, and per-key work additionally carries the natural key, so a single
//! record can be followed through classification, retries and quarantine.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Environment variable selecting the log format.
pub const LOG_FORMAT_ENV: &str = "STRATA_LOG_FORMAT";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Reads `STRATA_LOG_FORMAT`, defaulting to pretty when unset or unknown.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::configuration(format!(
                "unknown log format '{other}' (expected json or pretty)"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `strata_merge=debug`)
///
/// # Example
///
/// ```rust
/// use strata_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}

/// Creates a span covering one merge run.
///
/// # Example
///
/// ```rust
/// use strata_core::observability::run_span;
///
/// let span = run_span("run_incremental", "01HV...", "customers");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn run_span(operation: &str, run_id: &str, source: &str) -> Span {
    tracing::info_span!("run", op = operation, run_id = run_id, source = source)
}

/// Creates a span for work on a single natural key.
#[must_use]
pub fn merge_span(operation: &str, source: &str, natural_key: &str) -> Span {
    tracing::debug_span!(
        "merge",
        op = operation,
        source = source,
        natural_key = natural_key,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn spans_can_be_entered() {
        let span = run_span("run_incremental", "run_1", "customers");
        let _guard = span.enter();
        let key_span = merge_span("apply", "customers", "C001");
        let _inner = key_span.enter();
        tracing::info!("inside spans");
    }
}

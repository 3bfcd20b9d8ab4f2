//! Structured logging setup.
//!
//! The bus logs through `tracing` with structured fields (`event_type`,
//! `queue`, `worker`, `object_type`). This module installs the global
//! subscriber: plain text for development, JSON for log shippers.

use crate::{TelemetryConfig, TelemetryError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Returned by [`init_logging`]; logs a line when the host shuts down.
pub struct LoggingGuard {
    service_name: String,
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        tracing::info!(service = %self.service_name, "Shutting down logging");
    }
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
///
/// # Errors
///
/// `TelemetryError::Config` for an invalid filter directive,
/// `TelemetryError::LoggingInit` if a global subscriber is already set.
pub fn init_logging(config: &TelemetryConfig) -> Result<LoggingGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Config(e.to_string()))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    if !config.console_output {
        registry
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    } else if config.json_logs {
        // JSON output for containers/production
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(config.thread_names)
            .with_file(true)
            .with_line_number(true);

        registry
            .with(json_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    } else {
        // Pretty output for development
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(config.thread_names)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(true);

        registry
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    }

    tracing::info!(
        service = %config.service_name,
        json = config.json_logs,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        service_name: config.service_name.clone(),
    })
}

/// Install a test-friendly subscriber that writes through the test harness's
/// captured output. Safe to call from every test; only the first call wins.
pub fn init_test_logging() {
    let config = TelemetryConfig::for_tests();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_test_writer()
                .with_thread_names(true),
        )
        .try_init();
}

/// Helper to create structured log entries with a consistent `bus` field.
#[macro_export]
macro_rules! log_bus_event {
    ($level:ident, $bus:expr, $msg:expr $(, $($field:tt)*)?) => {
        $crate::tracing::$level!(
            bus = $bus,
            $($($field)*,)?
            $msg
        )
    };
}

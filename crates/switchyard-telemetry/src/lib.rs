//! # Switchyard Telemetry
//!
//! Logging and metrics for hosts embedding switchyard buses.
//!
//! ## Components
//!
//! - **Logging**: `tracing-subscriber` with env filter, text or JSON output
//! - **Metrics**: Prometheus gauges fed from [`switchyard::BusStats`] and a
//!   fault counter fed from a depot's [`switchyard::FaultChannel`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use switchyard_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_telemetry(&TelemetryConfig::from_env())?;
//!     switchyard_telemetry::count_faults(switchyard::Depot::global().faults());
//!
//!     // Bus logs and fault counts are now being collected
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_SERVICE_NAME` | `switchyard` | Service name in logs |
//! | `SWITCHYARD_LOG_LEVEL` | `info` | Log level filter (`RUST_LOG` also honoured) |
//! | `SWITCHYARD_JSON_LOGS` | `false` | JSON output (default on in containers) |
//! | `SWITCHYARD_CONSOLE_OUTPUT` | `true` | Write logs to stdout |
//! | `SWITCHYARD_THREAD_NAMES` | `true` | Include thread names |

mod config;
mod logging;
mod metrics;

pub use config::TelemetryConfig;
pub use logging::{init_logging, init_test_logging, LoggingGuard};
pub use metrics::{
    count_faults, encode_metrics, observe_bus, record_fault, register_metrics, MetricsHandle,
    BACKGROUND_DISPATCHES, DELAYED_FIRED, DISPATCH_FAULTS, EVENTS_DELIVERED, EVENTS_POSTED,
};

use thiserror::Error;

#[doc(hidden)]
pub use tracing;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and metrics.
///
/// Returns a guard that must be held for the lifetime of the application.
///
/// # Errors
///
/// Any [`TelemetryError`] from logging or metrics setup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    // Metrics first: they need no global subscriber
    let metrics = register_metrics()?;
    let logging = init_logging(config)?;

    Ok(TelemetryGuard {
        _logging: logging,
        _metrics: metrics,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    _logging: LoggingGuard,
    _metrics: MetricsHandle,
}

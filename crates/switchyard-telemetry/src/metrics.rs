//! Prometheus metrics for switchyard buses.
//!
//! All metrics follow the naming convention: `switchyard_<area>_<metric>`
//!
//! Bus counters live in each bus as [`BusStats`]; hosts export them by
//! calling [`observe_bus`] periodically. Dispatch faults are counted as they
//! happen once [`count_faults`] is installed on a depot's fault channel.

use crate::TelemetryError;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;
use switchyard::{BusStats, DispatchFault, FaultChannel};

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // BUS METRICS
    // =========================================================================

    /// Events accepted by `post`, per bus
    pub static ref EVENTS_POSTED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("switchyard_bus_events_posted", "Events accepted by post"),
        &["bus"]
    ).expect("metric creation failed");

    /// Main-mode callbacks completed, per bus
    pub static ref EVENTS_DELIVERED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("switchyard_bus_events_delivered", "Main-mode callbacks completed"),
        &["bus"]
    ).expect("metric creation failed");

    /// Deliveries handed to the background dispatcher, per bus
    pub static ref BACKGROUND_DISPATCHES: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "switchyard_bus_background_dispatches",
            "Deliveries handed to the background dispatcher"
        ),
        &["bus"]
    ).expect("metric creation failed");

    /// Delayed events fired, per bus
    pub static ref DELAYED_FIRED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("switchyard_bus_delayed_fired", "Delayed events whose timer fired"),
        &["bus"]
    ).expect("metric creation failed");

    // =========================================================================
    // FAULT METRICS
    // =========================================================================

    /// Background and marshalled failures by queue
    pub static ref DISPATCH_FAULTS: IntCounterVec = IntCounterVec::new(
        Opts::new("switchyard_dispatch_faults_total", "Failures with no synchronous caller"),
        &["queue"]
    ).expect("metric creation failed");
}

static REGISTERED: OnceLock<Result<(), String>> = OnceLock::new();

/// Handle proving the metrics are registered.
#[derive(Debug, Clone, Copy)]
pub struct MetricsHandle {
    _private: (),
}

/// Register all metrics with the global registry. Later calls return the
/// outcome of the first.
///
/// # Errors
///
/// `TelemetryError::MetricsInit` if registration fails.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    register_once(&REGISTERED, &REGISTRY)
}

fn register_once(
    outcome: &OnceLock<Result<(), String>>,
    registry: &Registry,
) -> Result<MetricsHandle, TelemetryError> {
    outcome
        .get_or_init(|| register_all(registry))
        .clone()
        .map(|()| MetricsHandle { _private: () })
        .map_err(TelemetryError::MetricsInit)
}

fn register_all(registry: &Registry) -> Result<(), String> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(EVENTS_POSTED.clone()),
        Box::new(EVENTS_DELIVERED.clone()),
        Box::new(BACKGROUND_DISPATCHES.clone()),
        Box::new(DELAYED_FIRED.clone()),
        Box::new(DISPATCH_FAULTS.clone()),
    ];
    for metric in metrics {
        registry.register(metric).map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Publish a bus's counters under `bus`.
pub fn observe_bus(bus: &str, stats: &BusStats) {
    let set = |gauge: &IntGaugeVec, value: u64| {
        gauge
            .with_label_values(&[bus])
            .set(i64::try_from(value).unwrap_or(i64::MAX));
    };
    set(&EVENTS_POSTED, stats.posted);
    set(&EVENTS_DELIVERED, stats.delivered);
    set(&BACKGROUND_DISPATCHES, stats.dispatched_in_background);
    set(&DELAYED_FIRED, stats.delayed_fired);
}

/// Count one fault.
pub fn record_fault(fault: &DispatchFault) {
    let queue = fault.queue.as_deref().unwrap_or("owner");
    DISPATCH_FAULTS.with_label_values(&[queue]).inc();
}

/// Count every fault reported on `channel`. Handlers already installed keep
/// receiving faults.
pub fn count_faults(channel: &FaultChannel) {
    channel.chain_handler(record_fault);
}

/// Encode all metrics as Prometheus text format.
///
/// # Errors
///
/// `TelemetryError::MetricsInit` if encoding fails.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

//! Relay metrics
//!
//! Process-wide Prometheus collectors behind the [`METRICS`] static. Call sites
//! use the recording helpers below; if the collectors could not be built the
//! helpers are no-ops and the relay keeps running without metrics.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

pub static METRICS: Lazy<Option<Metrics>> = Lazy::new(|| match Metrics::new() {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        warn!(error = %e, "Failed to set up metrics, continuing without them");
        None
    }
});

pub struct Metrics {
    registry: Registry,
    pub sessions_active: IntGauge,
    pub connections_active: IntGauge,
    pub joins: IntCounterVec,
    pub sync_results: IntCounterVec,
    pub edits_relayed: IntCounter,
    pub stalled_connections: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("coedit".into()), None)?;

        let sessions_active = IntGauge::new("sessions_active", "Sessions currently registered")?;
        let connections_active = IntGauge::new("connections_active", "Open client connections")?;
        let joins = IntCounterVec::new(
            Opts::new("joins_total", "Join attempts by outcome"),
            &["outcome"],
        )?;
        let sync_results = IntCounterVec::new(
            Opts::new("sync_results_total", "Join handshake results"),
            &["result"],
        )?;
        let edits_relayed = IntCounter::new("edits_relayed_total", "Edit operations fanned out")?;
        let stalled_connections = IntCounter::new(
            "stalled_connections_total",
            "Connections closed because their outbound queue was full",
        )?;

        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(joins.clone()))?;
        registry.register(Box::new(sync_results.clone()))?;
        registry.register(Box::new(edits_relayed.clone()))?;
        registry.register(Box::new(stalled_connections.clone()))?;

        Ok(Self {
            registry,
            sessions_active,
            connections_active,
            joins,
            sync_results,
            edits_relayed,
            stalled_connections,
        })
    }

    /// Text exposition of every collector.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn with_metrics(record: impl FnOnce(&Metrics)) {
    if let Some(metrics) = METRICS.as_ref() {
        record(metrics);
    }
}

pub fn session_opened() {
    with_metrics(|m| m.sessions_active.inc());
}

pub fn session_closed() {
    with_metrics(|m| m.sessions_active.dec());
}

pub fn connection_opened() {
    with_metrics(|m| m.connections_active.inc());
}

pub fn connection_closed() {
    with_metrics(|m| m.connections_active.dec());
}

pub fn record_join(outcome: &str) {
    with_metrics(|m| m.joins.with_label_values(&[outcome]).inc());
}

pub fn record_sync_result(result: &str) {
    with_metrics(|m| m.sync_results.with_label_values(&[result]).inc());
}

pub fn record_edit() {
    with_metrics(|m| m.edits_relayed.inc());
}

pub fn record_stalled_connection() {
    with_metrics(|m| m.stalled_connections.inc());
}

/// Text exposition of the process-wide collectors, `None` if metrics are off.
pub fn render() -> Option<Result<String, prometheus::Error>> {
    METRICS.as_ref().map(Metrics::render)
}

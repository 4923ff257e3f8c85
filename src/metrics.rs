//! Prometheus-based metrics module
//!
//! Every series is labelled with the multiplexer role (`client` / `server`).
//! Call [`init_metrics`] once to register them; [`gather_text`] renders the
//! registry in the Prometheus text format for whatever endpoint embeds us.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Crate-wide Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Session Metrics ===

    /// Sessions ever opened
    pub static ref MUX_SESSIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("netmux_sessions_total", "Total number of multiplexed sessions opened"),
        &["role"]
    ).unwrap();

    /// Sessions currently live
    pub static ref MUX_SESSIONS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("netmux_sessions_active", "Number of currently live multiplexed sessions"),
        &["role"]
    ).unwrap();

    /// Sessions per physical connection at the time the connection closed
    pub static ref MUX_SESSIONS_PER_CONNECTION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "netmux_sessions_per_connection",
            "Sessions carried by a physical connection over its lifetime"
        ).buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0]),
        &["role"]
    ).unwrap();

    // === Connection Metrics ===

    /// Physical connections ever opened
    pub static ref MUX_CONNECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("netmux_connections_total", "Total number of physical mux connections"),
        &["role"]
    ).unwrap();

    /// Physical connections currently open
    pub static ref MUX_CONNECTIONS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("netmux_connections_active", "Number of open physical mux connections"),
        &["role"]
    ).unwrap();

    // === Frame Metrics ===

    /// Frames decoded, by status
    pub static ref MUX_FRAMES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("netmux_frames_received_total", "Frames decoded per session status"),
        &["role", "status"]
    ).unwrap();

    /// Malformed frames (each one kills its connection)
    pub static ref MUX_FRAME_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("netmux_frame_errors_total", "Frame format errors"),
        &["role"]
    ).unwrap();

    // === Traffic Metrics ===

    /// Payload bytes framed onto the wire
    pub static ref MUX_BYTES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("netmux_bytes_sent_total", "Session payload bytes sent"),
        &["role"]
    ).unwrap();

    /// Payload bytes delivered from the wire
    pub static ref MUX_BYTES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("netmux_bytes_received_total", "Session payload bytes received"),
        &["role"]
    ).unwrap();
}

/// Initialize and register all metrics with the crate registry
pub fn init_metrics() {
    // Session metrics
    REGISTRY.register(Box::new(MUX_SESSIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(MUX_SESSIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(MUX_SESSIONS_PER_CONNECTION.clone())).ok();

    // Connection metrics
    REGISTRY.register(Box::new(MUX_CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(MUX_CONNECTIONS_ACTIVE.clone())).ok();

    // Frame metrics
    REGISTRY.register(Box::new(MUX_FRAMES_RECEIVED.clone())).ok();
    REGISTRY.register(Box::new(MUX_FRAME_ERRORS.clone())).ok();

    // Traffic metrics
    REGISTRY.register(Box::new(MUX_BYTES_SENT.clone())).ok();
    REGISTRY.register(Box::new(MUX_BYTES_RECEIVED.clone())).ok();
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!("[metrics] failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Tracks one physical connection: bumps the gauges on creation and
/// settles them on drop.
pub struct ConnectionMetrics {
    role: &'static str,
}

impl ConnectionMetrics {
    pub fn new(role: &'static str) -> Self {
        MUX_CONNECTIONS_TOTAL.with_label_values(&[role]).inc();
        MUX_CONNECTIONS_ACTIVE.with_label_values(&[role]).inc();
        Self { role }
    }

    /// Record how many sessions the connection carried
    pub fn record_sessions(&self, sessions: u16) {
        MUX_SESSIONS_PER_CONNECTION
            .with_label_values(&[self.role])
            .observe(sessions as f64);
    }
}

impl Drop for ConnectionMetrics {
    fn drop(&mut self) {
        MUX_CONNECTIONS_ACTIVE.with_label_values(&[self.role]).dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_after_init() {
        init_metrics();
        init_metrics();
        MUX_FRAMES_RECEIVED.with_label_values(&["client", "keep"]).inc();

        let text = gather_text();
        assert!(text.contains("netmux_frames_received_total"));
    }

    #[test]
    fn test_connection_gauge_settles() {
        let before = MUX_CONNECTIONS_TOTAL.with_label_values(&["test"]).get();
        {
            let conn = ConnectionMetrics::new("test");
            assert_eq!(MUX_CONNECTIONS_ACTIVE.with_label_values(&["test"]).get(), 1);
            conn.record_sessions(3);
        }
        assert_eq!(MUX_CONNECTIONS_ACTIVE.with_label_values(&["test"]).get(), 0);
        assert_eq!(MUX_CONNECTIONS_TOTAL.with_label_values(&["test"]).get(), before + 1);
    }
}

//! Metrics collection and export for Scribe.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use scribe_core::{HubHandle, SessionOutcome};
use scribe_protocol::Envelope;
use scribe_transport::{Connection, ConnectionId, FrameReader, FrameWriter, TransportError};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};

/// How often [`track_hub`] refreshes the hub gauges.
pub const HUB_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "scribe_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "scribe_connections_active";
    pub const ADMISSIONS_REJECTED: &str = "scribe_admissions_rejected_total";
    pub const SESSIONS_ENDED: &str = "scribe_sessions_ended_total";
    pub const MESSAGES_TOTAL: &str = "scribe_messages_total";
    pub const MESSAGES_BYTES: &str = "scribe_messages_bytes";
    pub const ROOMS_ACTIVE: &str = "scribe_rooms_active";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of admitted connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active sessions"
    );
    metrics::describe_counter!(
        names::ADMISSIONS_REJECTED,
        "Handshakes rejected before a session was created"
    );
    metrics::describe_counter!(names::SESSIONS_ENDED, "Sessions ended, by outcome");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Inbound messages published to the hub");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Inbound payload bytes published to the hub");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of rooms");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a rejected handshake.
pub fn record_rejection(reason: &'static str) {
    counter!(names::ADMISSIONS_REJECTED, "reason" => reason).increment(1);
}

/// Record how a session ended.
pub fn record_outcome(outcome: SessionOutcome) {
    counter!(names::SESSIONS_ENDED, "outcome" => outcome.as_str()).increment(1);
}

/// Record an inbound message.
pub fn record_message(bytes: usize) {
    counter!(names::MESSAGES_TOTAL).increment(1);
    counter!(names::MESSAGES_BYTES).increment(bytes as u64);
}

/// Update active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Refresh the room gauge from hub stats until the hub stops.
pub async fn track_hub(hub: HubHandle, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match hub.stats().await {
            Ok(stats) => set_active_rooms(stats.room_count),
            Err(_) => break,
        }
    }
    debug!("Hub stopped, no longer tracking room gauge");
}

/// Counts a session as active for as long as it lives.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

/// Wraps a connection so every inbound envelope is counted.
pub struct MeteredConnection {
    inner: Box<dyn Connection>,
}

impl MeteredConnection {
    #[must_use]
    pub fn new(inner: Box<dyn Connection>) -> Self {
        Self { inner }
    }
}

impl Connection for MeteredConnection {
    fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    fn remote_addr(&self) -> Option<String> {
        self.inner.remote_addr()
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (reader, writer) = self.inner.split();
        (Box::new(MeteredReader { inner: reader }), writer)
    }
}

struct MeteredReader {
    inner: Box<dyn FrameReader>,
}

#[async_trait]
impl FrameReader for MeteredReader {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        let next = self.inner.recv().await?;
        if let Some(envelope) = &next {
            record_message(envelope.payload.len());
        }
        Ok(next)
    }
}

//! Prometheus metrics for cowrite
//!
//! This module provides observability metrics for monitoring cowrite servers.
//! Metrics are exposed in Prometheus text format via HTTP.

use crate::{TransportError, TransportResult};
use cowrite_core::SessionManager;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// cowrite metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_active: IntGauge,
    pub handshakes_refused: IntCounter,

    // Edit metrics
    pub edits_total: IntCounterVec,
    pub broadcasts_sent: IntCounter,

    // Engine state, refreshed on scrape
    pub sessions_resident: IntGauge,
    pub presence_entries: IntGauge,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> TransportResult<Self> {
        let registry = Registry::new();

        let connections_total =
            IntCounter::new("cowrite_connections_total", "Total number of connections").map_err(metrics_error)?;
        let connections_active =
            IntGauge::new("cowrite_connections_active", "Number of active connections").map_err(metrics_error)?;
        let handshakes_refused = IntCounter::new(
            "cowrite_handshakes_refused_total",
            "Connections refused during the upgrade handshake",
        )
        .map_err(metrics_error)?;

        let edits_total = IntCounterVec::new(
            Opts::new("cowrite_edits_total", "Edit submissions by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let broadcasts_sent = IntCounter::new(
            "cowrite_broadcasts_sent_total",
            "Broadcast frames delivered to clients",
        )
        .map_err(metrics_error)?;

        let sessions_resident =
            IntGauge::new("cowrite_sessions_resident", "Documents with a resident coordinator")
                .map_err(metrics_error)?;
        let presence_entries =
            IntGauge::new("cowrite_presence_entries", "Live presence entries").map_err(metrics_error)?;

        registry.register(Box::new(connections_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(connections_active.clone())).map_err(metrics_error)?;
        registry.register(Box::new(handshakes_refused.clone())).map_err(metrics_error)?;
        registry.register(Box::new(edits_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(broadcasts_sent.clone())).map_err(metrics_error)?;
        registry.register(Box::new(sessions_resident.clone())).map_err(metrics_error)?;
        registry.register(Box::new(presence_entries.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            handshakes_refused,
            edits_total,
            broadcasts_sent,
            sessions_resident,
            presence_entries,
        })
    }

    /// Record a new connection
    pub fn record_connection(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed
    pub fn record_disconnection(&self) {
        self.connections_active.dec();
    }

    /// Record an edit outcome: accepted, overwrite, duplicate or malformed
    pub fn record_edit(&self, outcome: &str) {
        self.edits_total.with_label_values(&[outcome]).inc();
    }

    /// Refresh gauges from the session manager
    pub fn observe(&self, manager: &SessionManager) {
        let stats = manager.stats();
        self.sessions_resident.set(stats.session_count as i64);
        self.presence_entries.set(stats.connection_count as i64);
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

fn metrics_error(e: prometheus::Error) -> TransportError {
    TransportError::Metrics(e.to_string())
}

/// HTTP server for metrics endpoint
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    manager: Arc<SessionManager>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, manager: Arc<SessionManager>, addr: SocketAddr) -> Self {
        Self {
            metrics,
            manager,
            addr,
        }
    }

    /// Run the metrics HTTP server
    pub async fn run(&self) -> TransportResult<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Metrics server listening on http://{}/metrics", self.addr);

        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let metrics = self.metrics.clone();
                    let manager = self.manager.clone();

                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let n = match stream.read(&mut buf).await {
                            Ok(n) if n > 0 => n,
                            _ => return,
                        };
                        let request = String::from_utf8_lossy(&buf[..n]);

                        let response = if request.starts_with("GET /metrics") || request.starts_with("GET / ") {
                            metrics.observe(&manager);
                            let body = metrics.export();
                            format!(
                                "HTTP/1.1 200 OK\r\n\
                                 Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
                                 Content-Length: {}\r\n\
                                 \r\n\
                                 {}",
                                body.len(),
                                body
                            )
                        } else if request.starts_with("GET /health") {
                            "HTTP/1.1 200 OK\r\n\
                             Content-Type: text/plain\r\n\
                             Content-Length: 2\r\n\
                             \r\n\
                             OK"
                                .to_string()
                        } else {
                            "HTTP/1.1 404 Not Found\r\n\
                             Content-Length: 0\r\n\
                             \r\n"
                                .to_string()
                        };
                        let _ = stream.write_all(response.as_bytes()).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_recorded_edits() {
        let metrics = Metrics::new().unwrap();
        metrics.record_connection();
        metrics.record_edit("accepted");
        metrics.record_edit("accepted");
        metrics.record_edit("duplicate");

        let text = metrics.export();
        assert!(text.contains("cowrite_connections_total 1"));
        assert!(text.contains(r#"cowrite_edits_total{outcome="accepted"} 2"#));
        assert!(text.contains(r#"cowrite_edits_total{outcome="duplicate"} 1"#));
    }
}

//! Sync session configuration.

use std::time::Duration;

/// What happens to unacknowledged local edits after a reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Discard them; the server snapshot is authoritative
    #[default]
    AtMostOnce,
    /// Resend them with their original sequence numbers
    AtLeastOnce,
}

/// Configuration for one client sync session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:7070`
    pub url: String,
    pub document_id: String,
    /// Session token presented at connect
    pub token: String,
    /// Stable id of this client instance; scopes edit sequence numbers
    pub client_id: String,
    /// Overrides the interval advertised by the server
    pub heartbeat_interval: Option<Duration>,
    /// How long to wait for the snapshot after connecting
    pub attach_timeout: Duration,
    pub delivery: DeliveryPolicy,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl SyncConfig {
    /// Creates a configuration with a fresh client instance id.
    pub fn new(
        url: impl Into<String>,
        document_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            document_id: document_id.into(),
            token: token.into(),
            client_id: uuid::Uuid::new_v4().simple().to_string(),
            heartbeat_interval: None,
            attach_timeout: Duration::from_secs(10),
            delivery: DeliveryPolicy::default(),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(10),
        }
    }

    /// Sets the delivery policy.
    pub fn with_delivery(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }

    /// Sets a fixed heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Sets the attach timeout.
    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    /// Sets the reconnect backoff bounds.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Sets the client instance id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }
}

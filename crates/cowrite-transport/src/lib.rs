//! cowrite Transport Layer
//!
//! Network surface of the sync server:
//! - WebSocket: one connection per client per document, JSON frames
//! - Auth: session token verification during the upgrade handshake
//! - Metrics: Prometheus metrics (optional feature)

pub mod auth;
pub mod handler;
#[cfg(feature = "websocket")]
pub mod websocket;
#[cfg(feature = "metrics")]
pub mod metrics;

pub use auth::{AllowAnonymous, AuthError, Authenticator, Identity, StaticTokens, TokenSigner};
pub use handler::{ConnectionHandler, Outcome};
#[cfg(feature = "websocket")]
pub use websocket::{socket_config, ConnectTarget, WebSocketServer};
#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsServer};

use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "websocket")]
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] cowrite_protocol::ProtocolError),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

//! cowrite Client - Sync Session
//!
//! Keeps a local view of one document in step with the server:
//! - Explicit connection state machine with automatic reconnect
//! - Optimistic local edits, acknowledged or replaced by the server
//! - Pluggable [`Connector`] so the session can run over a mock transport

pub mod backoff;
pub mod config;
pub mod connector;
pub mod error;
pub mod session;

pub use backoff::Backoff;
pub use config::{DeliveryPolicy, SyncConfig};
pub use connector::{ConnectRequest, Connection, Connector, WebSocketConnector};
pub use error::{Result, SyncError};
pub use session::{spawn, ConnectionState, LocalView, SyncEvent, SyncHandle};

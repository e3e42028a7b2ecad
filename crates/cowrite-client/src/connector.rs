//! Connection establishment
//!
//! The sync session talks to the server through [`Connector`] and
//! [`Connection`], so tests can drive it with an in-memory transport.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use cowrite_protocol::{decode_server, encode, ClientMessage, ServerMessage, MAX_FRAME_BYTES};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// What a connection attempt carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub document_id: String,
    pub token: String,
    pub client_id: String,
}

/// An open duplex channel to the server
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, message: &ClientMessage) -> Result<()>;

    /// Next server message; `Ok(None)` once the server has closed
    async fn recv(&mut self) -> Result<Option<ServerMessage>>;

    async fn close(&mut self);
}

/// Opens connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Connection>>;
}

/// Connects over WebSocket to `{base}/ws/{documentId}?token=..&client=..`
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base_url: String,
}

impl WebSocketConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Full endpoint URL for a request
    pub fn endpoint(&self, request: &ConnectRequest) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SyncError::Transport(format!("invalid server url: {}", e)))?;

        url.path_segments_mut()
            .map_err(|_| SyncError::Transport("server url cannot be a base".into()))?
            .pop_if_empty()
            .push("ws")
            .push(&request.document_id);
        url.query_pairs_mut()
            .append_pair("token", &request.token)
            .append_pair("client", &request.client_id);

        Ok(url)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Connection>> {
        let url = self.endpoint(request)?;
        debug!(doc_id = %request.document_id, "Connecting to {}", url.host_str().unwrap_or("?"));

        // Broadcasts carry escaped content and may exceed the default frame limit
        let config = WebSocketConfig {
            max_message_size: Some(MAX_FRAME_BYTES),
            max_frame_size: Some(MAX_FRAME_BYTES),
            ..WebSocketConfig::default()
        };
        match connect_async_with_config(url.as_str(), Some(config), false).await {
            Ok((stream, _)) => Ok(Box::new(WebSocketConnection { stream })),
            Err(WsError::Http(response))
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                let reason = response
                    .body()
                    .as_ref()
                    .map(|body| String::from_utf8_lossy(body).into_owned())
                    .unwrap_or_else(|| response.status().to_string());
                Err(SyncError::Auth(reason))
            }
            Err(e) => Err(SyncError::Transport(e.to_string())),
        }
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let text = encode(message)?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => match decode_server(&text) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => debug!(error = %e, "Ignoring malformed server frame"),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed)) => return Ok(None),
                Some(Err(e)) => return Err(SyncError::Transport(e.to_string())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConnectRequest {
        ConnectRequest {
            document_id: "doc1".into(),
            token: "abc.def".into(),
            client_id: "c1".into(),
        }
    }

    #[test]
    fn test_endpoint() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:7070");
        let url = connector.endpoint(&request()).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:7070/ws/doc1?token=abc.def&client=c1");
    }

    #[test]
    fn test_endpoint_with_trailing_slash_and_prefix() {
        let connector = WebSocketConnector::new("ws://example.com/sync/");
        let url = connector.endpoint(&request()).unwrap();
        assert_eq!(url.path(), "/sync/ws/doc1");
    }

    #[test]
    fn test_endpoint_rejects_garbage() {
        let connector = WebSocketConnector::new("not a url");
        assert!(matches!(
            connector.endpoint(&request()),
            Err(SyncError::Transport(_))
        ));
    }
}

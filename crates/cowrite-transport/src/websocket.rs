//! WebSocket transport for cowrite
//!
//! Clients connect to `/ws/{documentId}?token=..&client=..`. The token is
//! verified during the upgrade; a refused handshake is answered with an HTTP
//! error status and never reaches a session.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};

use cowrite_core::{Attachment, DocumentId, SessionEvent, SessionManager};
use cowrite_protocol::{encode, frame_limit, ServerMessage};

use crate::auth::{Authenticator, Identity};
use crate::handler::{ConnectionHandler, Outcome};
#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
use crate::TransportResult;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Path prefix of the document endpoint
pub const ENDPOINT_PREFIX: &str = "/ws/";

/// Why a connection URI was not accepted
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Unknown path: {0}")]
    UnknownPath(String),

    #[error(transparent)]
    InvalidDocument(#[from] cowrite_core::Error),
}

/// The document and credentials named by a connection URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub document_id: DocumentId,
    pub token: Option<String>,
    pub client_id: Option<String>,
}

impl ConnectTarget {
    pub fn parse(path: &str, query: Option<&str>) -> Result<Self, TargetError> {
        let id = path
            .strip_prefix(ENDPOINT_PREFIX)
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .ok_or_else(|| TargetError::UnknownPath(path.to_string()))?;
        let document_id = DocumentId::new(id)?;

        let mut token = None;
        let mut client_id = None;
        if let Some(query) = query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "token" if !value.is_empty() => token = Some(value.into_owned()),
                    "client" if !value.is_empty() => client_id = Some(value.into_owned()),
                    _ => {}
                }
            }
        }

        Ok(Self {
            document_id,
            token,
            client_id,
        })
    }
}

/// WebSocket Server for cowrite
pub struct WebSocketServer {
    manager: Arc<SessionManager>,
    auth: Arc<dyn Authenticator>,
    addr: SocketAddr,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl WebSocketServer {
    pub fn new(manager: Arc<SessionManager>, auth: Arc<dyn Authenticator>, addr: SocketAddr) -> Self {
        Self {
            manager,
            auth,
            addr,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start the WebSocket server
    pub async fn run(&self) -> TransportResult<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> TransportResult<()> {
        info!(addr = %listener.local_addr()?, "cowrite WebSocket server listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let connection = Connection {
                        manager: self.manager.clone(),
                        auth: self.auth.clone(),
                        peer: peer_addr,
                        #[cfg(feature = "metrics")]
                        metrics: self.metrics.clone(),
                    };

                    tokio::spawn(async move {
                        if let Err(e) = connection.run(stream).await {
                            debug!(peer = %peer_addr, error = %e, "WebSocket connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Socket limits matching the frames the codec accepts
pub fn socket_config(max_content_bytes: usize) -> WebSocketConfig {
    let limit = frame_limit(max_content_bytes);
    WebSocketConfig {
        max_message_size: Some(limit),
        max_frame_size: Some(limit),
        ..WebSocketConfig::default()
    }
}

struct Connection {
    manager: Arc<SessionManager>,
    auth: Arc<dyn Authenticator>,
    peer: SocketAddr,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl Connection {
    async fn run(self, stream: TcpStream) -> TransportResult<()> {
        let mut accepted: Option<(ConnectTarget, Identity)> = None;
        let peer = self.peer;
        let auth = self.auth.as_ref();

        let callback = |request: &Request, response: Response| match authorize(request, auth) {
            Ok(found) => {
                accepted = Some(found);
                Ok(response)
            }
            Err((status, reason)) => {
                warn!(peer = %peer, status = status.as_u16(), reason = %reason, "Handshake refused");
                let mut refusal = ErrorResponse::new(Some(reason));
                *refusal.status_mut() = status;
                Err(refusal)
            }
        };

        let config = socket_config(self.manager.config().session.max_content_bytes);
        let ws_stream = match accept_hdr_async_with_config(stream, callback, Some(config)).await {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.metrics {
                    metrics.handshakes_refused.inc();
                }
                return Err(e.into());
            }
        };
        let Some((target, identity)) = accepted else {
            return Ok(());
        };
        let (mut write, mut read) = ws_stream.split();

        let attachment = match self
            .manager
            .attach(&target.document_id, &identity.user_id, &identity.display_name)
            .await
        {
            Ok(attachment) => attachment,
            Err(e) => {
                error!(doc_id = %target.document_id, error = %e, "Attach failed");
                close(&mut write, CloseCode::Error, e.to_string()).await;
                return Ok(());
            }
        };

        info!(
            peer = %peer,
            doc_id = %target.document_id,
            user = %identity.user_id,
            connection = %attachment.token,
            revision = attachment.snapshot.revision,
            "WebSocket client attached"
        );
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_connection();
        }

        let handler = ConnectionHandler::new(
            self.manager.clone(),
            &attachment,
            target.document_id.clone(),
            identity.user_id.clone(),
            target.client_id.clone(),
        );
        #[cfg(feature = "metrics")]
        let handler = match &self.metrics {
            Some(metrics) => handler.with_metrics(metrics.clone()),
            None => handler,
        };
        let mut handler = handler;

        let Attachment {
            snapshot,
            color,
            mut events,
            ..
        } = attachment;

        let result = match send(&mut write, &handler.attach_ack(&snapshot, &color)).await {
            Ok(()) => pump(&mut handler, &mut write, &mut read, &mut events).await,
            Err(e) => Err(e),
        };

        info!(peer = %peer, doc_id = %target.document_id, connection = %handler.token(), "WebSocket client disconnected");
        handler.close();
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_disconnection();
        }
        result
    }
}

/// Resolve the target and caller of an upgrade request
fn authorize(
    request: &Request,
    auth: &dyn Authenticator,
) -> Result<(ConnectTarget, Identity), (StatusCode, String)> {
    let uri = request.uri();
    let mut target = ConnectTarget::parse(uri.path(), uri.query()).map_err(|e| match e {
        TargetError::UnknownPath(_) => (StatusCode::NOT_FOUND, e.to_string()),
        TargetError::InvalidDocument(_) => (StatusCode::BAD_REQUEST, e.to_string()),
    })?;

    if target.token.is_none() {
        target.token = request
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string);
    }

    let credential = target.token.as_deref().unwrap_or_default();
    let identity = auth
        .authenticate(credential)
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()))?;

    Ok((target, identity))
}

async fn pump(
    handler: &mut ConnectionHandler,
    write: &mut WsSink,
    read: &mut WsSource,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> TransportResult<()> {
    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match handler.handle_frame(&text).await {
                        Outcome::Reply(reply) => send(write, &reply).await?,
                        Outcome::Ignore => {}
                        Outcome::Close(reason) => {
                            close(write, CloseCode::Policy, reason).await;
                            return Ok(());
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {
                        // Binary and pong frames carry nothing for us
                    }
                    Some(Err(e)) => {
                        warn!(connection = %handler.token(), error = %e, "WebSocket read error");
                        return Err(e.into());
                    }
                }
            }

            event = events.recv() => {
                match event {
                    Some(event) => send(write, &handler.event_message(event)).await?,
                    None => {
                        close(write, CloseCode::Away, "session closed".to_string()).await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn send(write: &mut WsSink, message: &ServerMessage) -> TransportResult<()> {
    let text = encode(message)?;
    write.send(Message::Text(text)).await?;
    Ok(())
}

async fn close(write: &mut WsSink, code: CloseCode, reason: String) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = write.send(Message::Close(Some(frame))).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let target = ConnectTarget::parse("/ws/doc1", Some("token=abc%2Edef&client=c-1")).unwrap();
        assert_eq!(target.document_id.as_str(), "doc1");
        assert_eq!(target.token.as_deref(), Some("abc.def"));
        assert_eq!(target.client_id.as_deref(), Some("c-1"));
    }

    #[test]
    fn test_socket_limits_follow_content_limit() {
        let config = socket_config(1024);
        assert_eq!(config.max_message_size, Some(frame_limit(1024)));
        assert_eq!(config.max_frame_size, Some(frame_limit(1024)));
        assert!(frame_limit(1024) >= 6 * 1024);
    }

    #[test]
    fn test_parse_target_without_query() {
        let target = ConnectTarget::parse("/ws/team:notes", None).unwrap();
        assert!(target.token.is_none());
        assert!(target.client_id.is_none());
    }

    #[test]
    fn test_parse_target_rejects_bad_paths() {
        assert!(matches!(
            ConnectTarget::parse("/api/doc1", None),
            Err(TargetError::UnknownPath(_))
        ));
        assert!(matches!(
            ConnectTarget::parse("/ws/", None),
            Err(TargetError::UnknownPath(_))
        ));
        assert!(matches!(
            ConnectTarget::parse("/ws/a/b", None),
            Err(TargetError::UnknownPath(_))
        ));
        assert!(matches!(
            ConnectTarget::parse("/ws/bad%20id", None),
            Err(TargetError::InvalidDocument(_))
        ));
    }
}

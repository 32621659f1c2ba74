//! Transport for the progress stream.
//!
//! The connection manager talks to a [`Connector`] that opens
//! [`Channel`]s. [`WsConnector`] is the real implementation over
//! tokio-tungstenite; tests plug in scripted channels.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// A transport-level frame, stripped of WebSocket details the manager
/// does not care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// One open bidirectional connection.
///
/// Implementations answer incoming pings on their own; [`Frame::Ping`]
/// is still surfaced so the caller can count it as liveness.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), ChannelError>;

    /// Next inbound frame, or `None` once the connection is gone.
    /// Must be cancel-safe: it is polled inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<Frame, ChannelError>>;
}

/// Opens new [`Channel`]s to the progress stream.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Channel>, ConnectError>;

    /// Where this connector points, for log lines.
    fn describe(&self) -> String {
        String::from("<channel>")
    }
}

// ---------------------------------------------------------------------------
// WebSocket implementation
// ---------------------------------------------------------------------------

/// Connects to the progress stream over WebSocket.
pub struct WsConnector {
    ws_url: String,
}

impl WsConnector {
    /// * `ws_url` - full WebSocket endpoint, e.g. `ws://host:3000/ws`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Endpoint with a fresh `clientId` query parameter so server logs
    /// can tell reconnects of the same process apart.
    fn url_with_client_id(&self, client_id: &str) -> String {
        let separator = if self.ws_url.contains('?') { '&' } else { '?' };
        format!("{}{separator}clientId={client_id}", self.ws_url)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Channel>, ConnectError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = self.url_with_client_id(&client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ConnectError::Connection(format!(
                "Failed to connect to progress stream at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(client_id = %client_id, "Connected to progress stream at {}", self.ws_url);

        Ok(Box::new(WsChannel { ws_stream }))
    }

    fn describe(&self) -> String {
        self.ws_url.clone()
    }
}

/// A live WebSocket connection.
pub struct WsChannel {
    ws_stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, frame: Frame) -> Result<(), ChannelError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Ping(payload) => Message::Ping(payload),
            Frame::Pong(payload) => Message::Pong(payload),
            Frame::Close => Message::Close(None),
        };
        self.ws_stream
            .send(message)
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, ChannelError>> {
        loop {
            let frame = match self.ws_stream.next().await? {
                Ok(Message::Text(text)) => Frame::Text(text),
                Ok(Message::Ping(payload)) => Frame::Ping(payload),
                Ok(Message::Pong(payload)) => Frame::Pong(payload),
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "Progress stream closed by server");
                    Frame::Close
                }
                Ok(Message::Binary(_)) => {
                    tracing::trace!("Ignoring binary frame");
                    continue;
                }
                Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(ChannelError::Receive(e.to_string()))),
            };
            return Some(Ok(frame));
        }
    }
}

/// Errors opening a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The handshake with the server did not complete.
    #[error("Connection error: {0}")]
    Connection(String),
}

/// Errors on an already-established connection.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Send error: {0}")]
    Send(String),

    #[error("Receive error: {0}")]
    Receive(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_is_appended_as_query() {
        let connector = WsConnector::new("ws://localhost:3000/ws");
        assert_eq!(
            connector.url_with_client_id("abc"),
            "ws://localhost:3000/ws?clientId=abc"
        );

        let connector = WsConnector::new("ws://localhost:3000/ws?v=2");
        assert_eq!(
            connector.url_with_client_id("abc"),
            "ws://localhost:3000/ws?v=2&clientId=abc"
        );
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let connector = WsConnector::new("ws://127.0.0.1:1/ws");
        let result = connector.connect().await;
        assert!(matches!(result, Err(ConnectError::Connection(_))));
    }
}

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

#[cfg(test)]
pub mod memory;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to relay {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("connection closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(#[source] tungstenite::Error),
    #[error("receive failed: {0}")]
    Receive(#[source] tungstenite::Error),
}

/// Message-oriented connection to the relay.
///
/// Payloads are opaque text messages. `recv` resolves to `None` once the
/// connection is closed by either side.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn send(&mut self, payload: String) -> Result<(), TransportError>;
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// WebSocket connection to a relay
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _) = connect_async(url).await.map_err(|source| TransportError::Connect {
            url: url.to_string(),
            source,
        })?;
        debug!("Connected to relay {}", url);
        Ok(Self { stream, closed: false })
    }
}

impl Transport for WsTransport {
    async fn send(&mut self, payload: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.stream.send(WsMessage::Text(payload)).await.map_err(|e| match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::Closed
            }
            other => TransportError::Send(other),
        })
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        if self.closed {
            return Ok(None);
        }
        while let Some(msg) = self.stream.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => return Ok(Some(text)),
                Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => continue, // Only text payloads carry messages
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {} // Ping/Pong are answered by tungstenite
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed)
                | Err(tungstenite::Error::Protocol(
                    tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
                )) => break,
                Err(e) => return Err(TransportError::Receive(e)),
            }
        }
        self.closed = true;
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Send(e)),
        }
    }
}

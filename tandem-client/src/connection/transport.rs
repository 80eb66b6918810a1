//! Transport seam between the connection manager and the WebSocket
//!
//! The manager only sees text frames. `recv` returns `None` for a clean
//! close (the server sent a Close frame) and `Some(Err(..))` for anything
//! unclean, which is what triggers a reconnect.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{Error, Result};

/// An established text-frame channel
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next text frame; None on clean close
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens transports; one call per connection attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

/// Room WebSocket over tokio-tungstenite
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return Some(
                        String::from_utf8(bytes)
                            .map_err(|e| Error::Connection(format!("non-UTF-8 frame: {}", e))),
                    )
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Server closed the socket: {:?}", frame);
                    return None;
                }
                // Ping/pong are answered by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(e.into())),
                None => {
                    return Some(Err(Error::Connection(
                        "socket ended without a close frame".to_string(),
                    )))
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

/// Connects to a fixed room socket URL
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let (stream, response) = connect_async(self.url.as_str()).await?;
        debug!("WebSocket upgrade to {} ({})", self.url, response.status());
        Ok(Box::new(WsTransport { stream }))
    }
}

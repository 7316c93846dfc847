use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Error(String),
    Closed { was_clean: bool },
}

#[async_trait]
pub trait Transport: Send + Sync {
    type Connection: TransportConnection + 'static;

    async fn connect(&self, endpoint: &Url) -> Result<Self::Connection, TransportError>;
}

#[async_trait]
pub trait TransportConnection: Send {
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError>;

    /// Yields events in arrival order. After `Closed` the connection is spent.
    async fn next_event(&mut self) -> TransportEvent;

    async fn close(&mut self);
}

pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    type Connection = WsConnection;

    async fn connect(&self, endpoint: &Url) -> Result<WsConnection, TransportError> {
        let (stream, response) = connect_async(endpoint.as_str()).await?;
        debug!(%endpoint, status = %response.status(), "websocket connected");
        Ok(WsConnection {
            stream,
            failed: false,
            finished: false,
        })
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    failed: bool,
    finished: bool,
}

#[async_trait]
impl TransportConnection for WsConnection {
    async fn send_text(&mut self, frame: String) -> Result<(), TransportError> {
        self.stream.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        if self.failed {
            // An error is always followed by an unclean close.
            self.failed = false;
            self.finished = true;
            return TransportEvent::Closed { was_clean: false };
        }
        if self.finished {
            return std::future::pending().await;
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Text(text),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "server closed websocket");
                    self.finished = true;
                    return TransportEvent::Closed { was_clean: true };
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    self.failed = true;
                    return TransportEvent::Error(err.to_string());
                }
                None => {
                    self.failed = true;
                    return TransportEvent::Error(
                        "stream ended without a closing handshake".to_string(),
                    );
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            debug!(%err, "websocket close failed");
        }
        self.finished = true;
    }
}

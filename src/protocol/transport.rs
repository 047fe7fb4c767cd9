use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::errors::{DeskPilotError, DeskPilotResult};

/// Opens one bidirectional frame stream per call. The engine calls it again
/// for every reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> DeskPilotResult<(Box<dyn FrameSink>, Box<dyn FrameSource>)>;
}

/// Write half. Only the writer task owns one.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> DeskPilotResult<()>;
    async fn close(&mut self) -> DeskPilotResult<()>;
}

/// Read half. `None` means the peer closed the stream.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<DeskPilotResult<String>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport to the realtime endpoint.
pub struct WsConnector {
    endpoint: String,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> DeskPilotResult<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let (socket, response) = connect_async(self.endpoint.as_str()).await?;
        tracing::info!(status = %response.status(), "websocket connected");
        let (sink, stream) = socket.split();
        Ok((Box::new(WsSink { inner: sink }), Box::new(WsSource { inner: stream })))
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> DeskPilotResult<()> {
        self.inner.send(Message::text(frame)).await?;
        Ok(())
    }

    /// Starts the close handshake.
    async fn close(&mut self) -> DeskPilotResult<()> {
        self.inner.close().await?;
        Ok(())
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<DeskPilotResult<String>> {
        while let Some(msg) = self.inner.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_string())),
                // the server sends JSON frames as binary messages too
                Ok(Message::Binary(data)) => {
                    return Some(String::from_utf8(data.to_vec()).map_err(|e| {
                        DeskPilotError::MalformedFrame(format!("binary frame is not UTF-8: {e}"))
                    }))
                }
                Ok(Message::Close(reason)) => {
                    tracing::info!(?reason, "websocket closed by peer");
                    return None;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }
}

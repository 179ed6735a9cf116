//! Socket layer under [`RelayConnection`](crate::connection::RelayConnection).
//!
//! A [`Connector`] opens a [`Socket`]: a pair of channels carrying text frames
//! out and [`SocketEvent`]s in. The production connector runs over
//! tokio-tungstenite; tests plug in an in-memory one.

use crate::error::{ClientError, Result};
use crate::relay_url::RelayUrl;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Something the socket reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// One text frame.
    Text(String),
    /// The peer (or our own close handshake) ended the socket.
    Closed {
        /// WebSocket close code
        code: u16,
        /// Close reason, may be empty
        reason: String,
    },
    /// The socket broke.
    Failure(String),
}

/// An open socket. Dropping `outbound` closes it.
#[derive(Debug)]
pub struct Socket {
    /// Text frames to write
    pub outbound: mpsc::UnboundedSender<String>,
    /// What the socket reports, ending after `Closed` or `Failure`
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

impl Socket {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<SocketEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

/// Opens sockets to relays.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &RelayUrl) -> Result<Socket>;
}

/// Whether a close reason or failure text describes a close we initiated.
///
/// The WebSocket stack reports our own shutdown through the same error path
/// as a network failure, so the text is all there is to go on.
pub fn is_local_close(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    [
        "closed normally",
        "closed by client",
        "work with closed connection",
        "socket closed",
        "client disconnect",
    ]
    .iter()
    .any(|marker| reason.contains(marker))
}

/// [`Connector`] over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &RelayUrl) -> Result<Socket> {
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

        let writer_url = url.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                debug!("Write to {} failed: {}", writer_url, e);
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    Some(ctrl) = ctrl_rx.recv() => {
                        if sink.send(ctrl).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let reader_url = url.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(SocketEvent::Text(text.as_str().to_string())).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = ctrl_tx.send(Message::Pong(data));
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                            .unwrap_or((1005, String::new()));
                        let _ = in_tx.send(SocketEvent::Closed { code, reason });
                        return;
                    }
                    Ok(Message::Binary(_)) => {
                        warn!("Ignoring binary frame from {}", reader_url);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = in_tx.send(SocketEvent::Failure(e.to_string()));
                        return;
                    }
                }
            }
            let _ = in_tx.send(SocketEvent::Closed {
                code: 1006,
                reason: "stream ended".to_string(),
            });
        });

        Ok(Socket::new(out_tx, in_rx))
    }
}

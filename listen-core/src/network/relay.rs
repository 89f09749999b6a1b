//! Relay socket seam
//!
//! The signaling client only needs a text-frame duplex to the relay and the
//! close code it ends with. [`WebSocketConnector`] provides that over
//! tokio-tungstenite; tests plug in an in-memory relay.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::signaling::{SignalingError, CLOSE_ABNORMAL, CLOSE_NO_STATUS};

/// Inbound event on a relay socket
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Text(String),
    /// The socket is gone. Always the last frame.
    ///
    /// `unsent` holds outbound text, oldest first, that was handed to the
    /// socket but never written.
    Closed {
        code: u16,
        reason: String,
        unsent: Vec<String>,
    },
}

/// An open relay socket
///
/// Dropping `outbound` closes the socket normally (code 1000).
pub struct RelaySocket {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<RelayFrame>,
}

/// Opens sockets to the relay
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<RelaySocket, SignalingError>;
}

/// [`RelayConnector`] over WebSockets
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<RelaySocket, SignalingError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        let (mut writer, mut reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut unsent = Vec::new();
            let (code, reason) = loop {
                tokio::select! {
                    outbound = out_rx.recv() => match outbound {
                        Some(text) => {
                            if let Err(e) = writer.send(Message::Text(text.clone().into())).await {
                                debug!("Relay write failed: {}", e);
                                unsent.push(text);
                                break (CLOSE_ABNORMAL, e.to_string());
                            }
                        }
                        // Sender dropped: close normally
                        None => {
                            let frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: String::new().into(),
                            };
                            let _ = writer.send(Message::Close(Some(frame))).await;
                            return;
                        }
                    },
                    inbound = reader.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(RelayFrame::Text(text.as_str().to_owned())).is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(Some(frame)))) => {
                            break (u16::from(frame.code), frame.reason.as_str().to_owned());
                        }
                        Some(Ok(Message::Close(None))) => break (CLOSE_NO_STATUS, String::new()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Relay socket error: {}", e);
                            break (CLOSE_ABNORMAL, e.to_string());
                        }
                        None => break (CLOSE_ABNORMAL, String::new()),
                    },
                }
            };

            // Hand back whatever never reached the wire
            out_rx.close();
            while let Ok(text) = out_rx.try_recv() {
                unsent.push(text);
            }
            let _ = in_tx.send(RelayFrame::Closed {
                code,
                reason,
                unsent,
            });
        });

        Ok(RelaySocket {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

//! Individual client connection management.
//!
//! Each connection wraps a WebSocket stream split into halves: a spawned
//! read task decodes frames into `ConnectionEvent`s, and the write half is
//! shared behind a mutex for responses and pushes.

use anyhow::{Result, anyhow};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tally_core::protocol::{ClientMessage, MAX_MESSAGE_SIZE, ServerMessage};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

pub type ConnId = String;

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A well-formed request from the client
    Message {
        conn_id: ConnId,
        message: ClientMessage,
    },
    /// A frame that could not be decoded
    Invalid { conn_id: ConnId, error: String },
    /// Connection was closed
    Closed { conn_id: ConnId },
}

type WriteHalf = futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>;

/// A single WebSocket connection to a client.
pub struct ClientConnection {
    pub conn_id: ConnId,
    write: Arc<Mutex<WriteHalf>>,
    read_task: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Wrap an upgraded stream and start its read task.
    pub fn new(
        conn_id: ConnId,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let read_conn_id = conn_id.clone();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_conn_id, read, event_tx).await;
        });

        Self {
            conn_id,
            write,
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        conn_id: ConnId,
        mut read: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let text = match msg {
                        Message::Text(text) => text.as_str().to_string(),
                        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                let _ = event_tx.send(ConnectionEvent::Invalid {
                                    conn_id: conn_id.clone(),
                                    error: "Binary frame is not UTF-8".into(),
                                });
                                continue;
                            }
                        },
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", conn_id);
                            break;
                        }
                    };

                    if text.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message from {} exceeds max size ({} > {}), dropping",
                            conn_id,
                            text.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    let event = match ClientMessage::from_json(&text) {
                        Ok(message) => ConnectionEvent::Message {
                            conn_id: conn_id.clone(),
                            message,
                        },
                        Err(e) => ConnectionEvent::Invalid {
                            conn_id: conn_id.clone(),
                            error: e.to_string(),
                        },
                    };
                    let _ = event_tx.send(event);
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", conn_id);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", conn_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", conn_id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed {
            conn_id: conn_id.clone(),
        });
    }

    /// Send one message as a text frame.
    pub async fn send(&self, message: &ServerMessage) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(message.to_json().into()))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

//! WebSocket transport on tokio-tungstenite.
//!
//! Each open spawns a writer task fed by the channel's `outgoing` queue and a
//! reader task that forwards frames to `incoming`. Dropping the outgoing
//! sender makes the writer send a close frame.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{Frame, Transport, TransportChannel, TransportEvent};
use crate::BoxFuture;
use crate::error::{FolioError, Result};

/// Client for `ws://` and `wss://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WebSocketTransport {
    fn open<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<TransportChannel>> {
        Box::pin(async move {
            log::info!("[WebSocket] Connecting to {}", url.path());
            let (ws_stream, _response) = connect_async(url.as_str())
                .await
                .map_err(|e| FolioError::Transport(e.to_string()))?;
            log::info!("[WebSocket] Connected");

            let (mut write, mut read) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

            // Writer task
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let msg = match frame {
                        Frame::Text(text) => Message::Text(text.into()),
                        Frame::Binary(data) => Message::Binary(data.into()),
                    };
                    if let Err(e) = write.send(msg).await {
                        log::warn!("[WebSocket] Send failed: {}", e);
                        return;
                    }
                }
                let _ = write.close().await;
                log::debug!("[WebSocket] Writer closed");
            });

            // Reader task
            tokio::spawn(async move {
                loop {
                    let event = match read.next().await {
                        Some(Ok(Message::Binary(data))) => {
                            TransportEvent::Frame(Frame::Binary(data.to_vec()))
                        }
                        Some(Ok(Message::Text(text))) => {
                            TransportEvent::Frame(Frame::Text(text.as_str().to_string()))
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.as_str().to_string())
                                .filter(|r| !r.is_empty());
                            log::info!("[WebSocket] Server closed connection");
                            let _ = in_tx.send(TransportEvent::Closed(reason));
                            break;
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::warn!("[WebSocket] Error: {}", e);
                            let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                        None => {
                            let _ = in_tx.send(TransportEvent::Closed(None));
                            break;
                        }
                    };
                    if in_tx.send(event).is_err() {
                        // Receiver dropped; the connection is being torn down
                        break;
                    }
                }
            });

            Ok(TransportChannel {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

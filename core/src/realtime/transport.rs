/// Transport seam for the realtime connection.
///
/// A [`Connector`] opens a [`Link`]: text-frame channels bridged to the real
/// socket by a background task. A socket write only counts once that task
/// confirms it, so frames still buffered when the socket fails come back as
/// send errors and get re-queued. The connection manager only ever sees the
/// channels, which lets tests plug in an in-process link.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

const LINK_BUFFER: usize = 64;

/// One frame waiting for a background writer. The writer reports back
/// through [`PendingWrite::complete`] once the socket took the frame.
#[derive(Debug)]
pub struct PendingWrite {
    pub frame: String,
    done: oneshot::Sender<Result<()>>,
}

impl PendingWrite {
    pub fn complete(self, result: Result<()>) {
        let _ = self.done.send(result);
    }
}

/// An open transport. Dropping it closes the connection.
#[derive(Debug)]
pub struct Link {
    outgoing: mpsc::Sender<PendingWrite>,
    incoming: mpsc::Receiver<String>,
}

impl Link {
    pub fn new(outgoing: mpsc::Sender<PendingWrite>, incoming: mpsc::Receiver<String>) -> Self {
        Self { outgoing, incoming }
    }

    /// Write one text frame. Returns once the writer confirmed it; a frame
    /// the writer failed or never took is an error.
    pub async fn send(&self, frame: String) -> Result<()> {
        let (done, written) = oneshot::channel();
        self.outgoing
            .send(PendingWrite { frame, done })
            .await
            .map_err(|_| closed())?;
        written.await.map_err(|_| closed())?
    }

    /// Next inbound frame; `None` once the remote side is gone
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }
}

fn closed() -> SyncError {
    SyncError::Connection("Transport closed while sending".to_string())
}

/// Opens transports to the realtime endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Link>;
}

/// WebSocket transport
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Link> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SyncError::Connection(format!("WebSocket connect to {} failed: {}", url, e)))?;
        debug!("WebSocket open to {}", url);

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<PendingWrite>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(LINK_BUFFER);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    write = out_rx.recv() => match write {
                        Some(PendingWrite { frame, done }) => {
                            if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                                warn!("WebSocket write failed: {}", e);
                                let _ = done.send(Err(SyncError::Connection(format!(
                                    "WebSocket write failed: {}",
                                    e
                                ))));
                                break;
                            }
                            let _ = done.send(Ok(()));
                        }
                        None => {
                            // Link dropped on our side: close politely
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },
                    msg = stream.next() => match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            if in_tx.send(text.to_string()).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            debug!("WebSocket closed by server: {:?}", frame);
                            break;
                        }
                        // Pings are answered by tungstenite itself
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("WebSocket read failed: {}", e);
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(Link::new(out_tx, in_rx))
    }
}

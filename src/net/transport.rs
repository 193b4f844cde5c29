//! TCP transport
//!
//! Each accepted connection gets a reader task and a writer task. The reader
//! forwards raw bytes to the simulation task as `InboundEvent::Data`; the
//! writer drains the session's outbound channel onto the socket. Neither task
//! looks at packet contents.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::error::{NetworkError, Result, ZoneError};
use crate::net::session::{ChannelOutbound, SessionId};
use crate::server::InboundEvent;

/// Read chunk size
const READ_BUFFER_SIZE: usize = 8192;

/// Flushes that may queue for one connection before writes fail
pub const OUTBOUND_QUEUE: usize = 256;

/// Hands out session ids
#[derive(Debug)]
pub struct SessionIds {
    next: AtomicU64,
}

impl SessionIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> SessionId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SessionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept connections until shutdown
pub async fn accept_connections(
    listener: TcpListener,
    events: mpsc::Sender<InboundEvent>,
    ids: Arc<SessionIds>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let session_id = ids.next();
                        info!(session_id, address = %addr, "New zone connection");
                        let events = events.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, session_id, events).await {
                                warn!(session_id, address = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Connection acceptor shutting down");
                break;
            }
        }
    }
}

/// Pump one connection until either side closes it
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    session_id: SessionId,
    events: mpsc::Sender<InboundEvent>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);

    events
        .send(InboundEvent::Connected {
            session_id,
            sink: Box::new(ChannelOutbound::new(tx)),
            addr,
        })
        .await
        .map_err(|_| ZoneError::Network(NetworkError::ConnectionClosed))?;

    let write_task = tokio::spawn(write_loop(writer, rx, session_id));
    let result = read_loop(reader, &events, session_id).await;

    // The simulation task drops the sink when it forgets the session
    let _ = events.send(InboundEvent::Disconnected { session_id }).await;
    if let Err(e) = write_task.await {
        trace!(session_id, error = %e, "Writer task ended abnormally");
    }
    debug!(session_id, "Connection handler ending");
    result
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    events: &mpsc::Sender<InboundEvent>,
    session_id: SessionId,
) -> Result<()> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            debug!(session_id, "Peer closed connection");
            return Ok(());
        }
        trace!(session_id, len = n, "Read bytes");
        let event = InboundEvent::Data {
            session_id,
            bytes: Bytes::copy_from_slice(&buf[..n]),
        };
        if events.send(event).await.is_err() {
            return Err(ZoneError::Network(NetworkError::ConnectionClosed));
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, session_id: SessionId) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            warn!(session_id, error = %e, "Write failed");
            break;
        }
    }
    if let Err(e) = writer.shutdown().await {
        trace!(session_id, error = %e, "Error during transport shutdown");
    }
}

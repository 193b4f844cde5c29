//! Session management module
//!
//! A session is one client connection as the simulation task sees it:
//! - inbound byte accumulation until a whole packet is framed
//! - the per-session opcode decoder
//! - a bounded outbound buffer flushed into the connection's sink
//! - the player bound to the connection once it has entered the map
//!
//! Sessions are owned by a single task, so no locking happens here. The sink
//! is the only part that crosses into the I/O tasks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::PacketKeys;
use crate::error::{NetworkError, ProtocolError};
use crate::net::buffer::OutBuffer;
use crate::protocol::obfuscation::{ObfuscationMode, OpcodeDecoder};
use crate::world::BlockId;

/// Unique session identifier
pub type SessionId = u64;

/// Where flushed bytes go
pub trait Outbound: Send {
    fn send(&mut self, data: Bytes) -> Result<(), NetworkError>;

    fn close(&mut self);

    fn is_active(&self) -> bool;
}

/// Sink backed by the connection's writer task
#[derive(Debug)]
pub struct ChannelOutbound {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl ChannelOutbound {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx: Some(tx) }
    }
}

impl Outbound for ChannelOutbound {
    fn send(&mut self, data: Bytes) -> Result<(), NetworkError> {
        let tx = self.tx.as_ref().ok_or(NetworkError::ConnectionClosed)?;
        tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::WriteBufferFull,
            mpsc::error::TrySendError::Closed(_) => NetworkError::ConnectionClosed,
        })
    }

    fn close(&mut self) {
        // Dropping the sender ends the writer task
        self.tx = None;
    }

    fn is_active(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// Sink that records everything it is sent
///
/// Clones share the same record, so a test can keep one handle and give the
/// other to a session.
#[derive(Debug, Clone, Default)]
pub struct RecordingOutbound {
    sent: Arc<Mutex<Vec<Bytes>>>,
    failing: Arc<Mutex<bool>>,
    closed: Arc<Mutex<bool>>,
}

impl RecordingOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail as if the peer had gone away
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Everything flushed so far, one entry per flush
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Opcodes of the flushed packets, assuming one packet per flush
    pub fn opcodes(&self) -> Vec<u16> {
        self.sent
            .lock()
            .iter()
            .filter(|b| b.len() >= 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl Outbound for RecordingOutbound {
    fn send(&mut self, data: Bytes) -> Result<(), NetworkError> {
        if *self.failing.lock() || *self.closed.lock() {
            return Err(NetworkError::ConnectionClosed);
        }
        self.sent.lock().push(data);
        Ok(())
    }

    fn close(&mut self) {
        *self.closed.lock() = true;
    }

    fn is_active(&self) -> bool {
        !*self.closed.lock()
    }
}

/// A connected client session
pub struct Session {
    /// Unique session identifier
    pub id: SessionId,
    /// Player bound once the client has entered the map
    player: Option<BlockId>,
    /// Bytes received but not yet consumed as whole packets
    inbound: BytesMut,
    outbound: OutBuffer,
    decoder: OpcodeDecoder,
    sink: Box<dyn Outbound>,
    closed: bool,
    /// Time of session creation
    pub created_at: Instant,
}

impl Session {
    pub fn new(
        id: SessionId,
        sink: Box<dyn Outbound>,
        mode: ObfuscationMode,
        keys: PacketKeys,
    ) -> Self {
        Self {
            id,
            player: None,
            inbound: BytesMut::new(),
            outbound: OutBuffer::new(),
            decoder: OpcodeDecoder::new(mode, keys),
            sink,
            closed: false,
            created_at: Instant::now(),
        }
    }

    pub fn player(&self) -> Option<BlockId> {
        self.player
    }

    pub fn is_active(&self) -> bool {
        !self.closed && self.sink.is_active()
    }

    pub fn decoder(&self) -> &OpcodeDecoder {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut OpcodeDecoder {
        &mut self.decoder
    }

    /// Append received bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
    }

    /// Bytes received and not yet consumed
    pub fn inbound(&self) -> &[u8] {
        &self.inbound
    }

    /// Split off the first `len` inbound bytes as one packet frame
    pub fn take_frame(&mut self, len: usize) -> Bytes {
        self.inbound.split_to(len).freeze()
    }

    /// Queue a packet in the outbound buffer
    pub fn write(&mut self, payload: &[u8]) -> Result<(), NetworkError> {
        if self.closed {
            return Err(NetworkError::ConnectionClosed);
        }
        self.outbound.push(payload).map_err(|e| match e {
            ProtocolError::BufferOverflow { .. } => NetworkError::WriteBufferFull,
            _ => NetworkError::ConnectionClosed,
        })
    }

    /// Hand everything buffered to the sink
    pub fn flush(&mut self) -> Result<(), NetworkError> {
        if self.outbound.is_empty() {
            return Ok(());
        }
        let data = self.outbound.take();
        self.sink.send(data)
    }

    /// Write and flush one packet
    pub fn send(&mut self, payload: &[u8]) -> Result<(), NetworkError> {
        self.write(payload)?;
        self.flush()
    }

    /// Stop accepting traffic; buffered bytes are discarded
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.outbound.clear();
        self.inbound.clear();
        self.sink.close();
        debug!(session_id = self.id, "Session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("player", &self.player)
            .field("decoder", &self.decoder.state())
            .field("pending_in", &self.inbound.len())
            .field("pending_out", &self.outbound.len())
            .field("closed", &self.closed)
            .finish()
    }
}

/// Session registry of the simulation task
#[derive(Debug)]
pub struct SessionTable {
    sessions: BTreeMap<SessionId, Session>,
    by_player: HashMap<BlockId, SessionId>,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            by_player: HashMap::new(),
            max_sessions,
        }
    }

    /// Register a session
    pub fn insert(&mut self, session: Session) -> Result<SessionId, NetworkError> {
        if self.sessions.len() >= self.max_sessions {
            warn!(
                session_id = session.id,
                max = self.max_sessions,
                "Session limit reached"
            );
            return Err(NetworkError::TooManySessions(self.max_sessions));
        }
        let id = session.id;
        self.sessions.insert(id, session);
        info!(session_id = id, total = self.sessions.len(), "Session registered");
        Ok(id)
    }

    /// Remove a session and its player binding
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;
        if let Some(player) = session.player.take() {
            self.by_player.remove(&player);
        }
        session.close();
        info!(session_id = id, total = self.sessions.len(), "Session removed");
        Some(session)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Bind a player to a session
    pub fn bind(&mut self, id: SessionId, player: BlockId) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if let Some(old) = session.player.replace(player) {
            self.by_player.remove(&old);
        }
        if let Some(previous) = self.by_player.insert(player, id) {
            if previous != id {
                if let Some(other) = self.sessions.get_mut(&previous) {
                    other.player = None;
                }
            }
        }
        debug!(session_id = id, player, "Player bound to session");
        true
    }

    pub fn unbind(&mut self, id: SessionId) -> Option<BlockId> {
        let player = self.sessions.get_mut(&id)?.player.take()?;
        self.by_player.remove(&player);
        Some(player)
    }

    pub fn session_of(&self, player: BlockId) -> Option<SessionId> {
        self.by_player.get(&player).copied()
    }

    /// Sessions with a bound player, in ascending session order
    pub fn bound(&self) -> impl Iterator<Item = (SessionId, BlockId)> + '_ {
        self.sessions
            .iter()
            .filter_map(|(id, s)| s.player.map(|p| (*id, p)))
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KEYS: PacketKeys = PacketKeys::new(1, 2, 3);

    fn session(id: SessionId) -> (Session, RecordingOutbound) {
        let sink = RecordingOutbound::new();
        let session = Session::new(id, Box::new(sink.clone()), ObfuscationMode::Disabled, KEYS);
        (session, sink)
    }

    #[test]
    fn test_write_and_flush() {
        let (mut s, sink) = session(1);
        s.write(&[0x7f, 0x00, 1, 2, 3, 4]).unwrap();
        s.write(&[0x80, 0x00]).unwrap();
        assert!(sink.sent().is_empty());

        s.flush().unwrap();
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(sink.sent()[0].as_ref(), &[0x7f, 0x00, 1, 2, 3, 4, 0x80, 0x00]);

        // Nothing buffered, nothing sent
        s.flush().unwrap();
        assert_eq!(sink.sent().len(), 1);
    }

    #[test]
    fn test_closed_session_rejects_writes() {
        let (mut s, sink) = session(1);
        s.close();
        assert!(!s.is_active());
        assert!(sink.is_closed());
        assert_eq!(s.write(&[1, 0]), Err(NetworkError::ConnectionClosed));
    }

    #[test]
    fn test_oversized_write() {
        let (mut s, _) = session(1);
        let big = vec![0u8; 70_000];
        assert_eq!(s.write(&big), Err(NetworkError::WriteBufferFull));
    }

    #[test]
    fn test_inbound_framing() {
        let (mut s, _) = session(1);
        s.feed(&[0x7d, 0x00, 0x7e]);
        assert_eq!(s.inbound(), &[0x7d, 0x00, 0x7e]);
        let frame = s.take_frame(2);
        assert_eq!(frame.as_ref(), &[0x7d, 0x00]);
        assert_eq!(s.inbound(), &[0x7e]);
    }

    #[test]
    fn test_table_binding() {
        let mut table = SessionTable::new(2);
        table.insert(session(1).0).unwrap();
        table.insert(session(2).0).unwrap();
        assert_eq!(
            table.insert(session(3).0),
            Err(NetworkError::TooManySessions(2))
        );

        assert!(table.bind(2, 500));
        assert!(table.bind(1, 400));
        assert_eq!(table.session_of(500), Some(2));
        assert_eq!(table.bound().collect::<Vec<_>>(), vec![(1, 400), (2, 500)]);

        assert_eq!(table.unbind(2), Some(500));
        assert_eq!(table.session_of(500), None);

        table.remove(1);
        assert_eq!(table.session_of(400), None);
        assert_eq!(table.ids(), vec![2]);
    }

    #[tokio::test]
    async fn test_channel_outbound() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = ChannelOutbound::new(tx);
        sink.send(Bytes::from_static(&[1, 2])).unwrap();
        assert_eq!(
            sink.send(Bytes::from_static(&[3])),
            Err(NetworkError::WriteBufferFull)
        );
        assert_eq!(rx.recv().await.unwrap().as_ref(), &[1, 2]);

        drop(rx);
        assert_eq!(
            sink.send(Bytes::from_static(&[4])),
            Err(NetworkError::ConnectionClosed)
        );
        assert!(!sink.is_active());
    }
}

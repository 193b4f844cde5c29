//! Inbound packet dispatch
//!
//! Frames packets out of a session's inbound bytes, resolves each opcode
//! through the session's decoder and runs the registered handler. A packet
//! that cannot be framed or decoded closes the session.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::error::ProtocolError;
use crate::net::buffer::get_u16_le;
use crate::net::session::Session;
use crate::protocol::codec::{decode_frame, frame_length};
use crate::protocol::handlers::{ClientRequest, HandlerContext};
use crate::protocol::packet_db::PacketDb;

/// Runs inbound packets through the packet table
#[derive(Debug, Clone)]
pub struct Dispatcher {
    db: Arc<PacketDb>,
}

impl Dispatcher {
    pub fn new(db: Arc<PacketDb>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &PacketDb {
        &self.db
    }

    /// Feed received bytes and handle every complete packet
    ///
    /// Returns the requests produced by the handlers, in arrival order. On
    /// error the session is closed and the remaining bytes are discarded.
    pub fn dispatch(
        &self,
        session: &mut Session,
        data: &[u8],
        server_tick: u32,
    ) -> Result<Vec<ClientRequest>, ProtocolError> {
        if !session.is_active() {
            return Err(ProtocolError::SessionClosed);
        }
        session.feed(data);

        let mut requests = Vec::new();
        loop {
            match self.next_packet(session, server_tick, &mut requests) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    let opcode = session.inbound().get(..2).map(|b| get_u16_le(b, 0));
                    warn!(
                        session_id = session.id,
                        opcode = opcode.map(|op| format!("0x{:04x}", op)),
                        error = %e,
                        "Closing session on bad packet"
                    );
                    session.close();
                    return Err(e);
                }
            }
        }
        Ok(requests)
    }

    /// Handle the packet at the front of the inbound buffer
    ///
    /// Returns `Ok(false)` when more bytes are needed.
    fn next_packet(
        &self,
        session: &mut Session,
        server_tick: u32,
        requests: &mut Vec<ClientRequest>,
    ) -> Result<bool, ProtocolError> {
        if session.inbound().len() < 2 {
            return Ok(false);
        }
        let cmd = get_u16_le(session.inbound(), 0);
        let db = &self.db;
        let opcode = session.decoder_mut().resolve(cmd, |op| db.contains(op));
        let descriptor = self
            .db
            .lookup(opcode)
            .ok_or(ProtocolError::UnknownOpcode { opcode })?;

        let Some(len) = frame_length(opcode, descriptor.len, session.inbound())? else {
            return Ok(false);
        };
        if session.inbound().len() < len {
            return Ok(false);
        }

        let frame = session.take_frame(len);
        let packet = decode_frame(descriptor.layout, opcode, frame)?;
        trace!(session_id = session.id, ?packet, "Packet received");

        if let Some(handler) = descriptor.handler {
            let mut ctx = HandlerContext::new(session.id, session.player(), server_tick);
            handler(&mut ctx, &packet)?;
            for reply in ctx.take_replies() {
                if let Err(e) = session.send(&reply) {
                    warn!(session_id = session.id, error = %e, "Failed to send reply");
                }
            }
            requests.extend(ctx.take_requests());
        }

        session.decoder_mut().packet_consumed();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptKey, PacketKeys};
    use crate::net::session::RecordingOutbound;
    use crate::protocol::handlers::register_core_handlers;
    use crate::protocol::obfuscation::{DecodeMode, DecoderState, ObfuscationMode};
    use crate::protocol::packet_db::PacketDbBuilder;
    use crate::protocol::version::PacketVersion;
    use pretty_assertions::assert_eq;

    const KEYS: PacketKeys = PacketKeys::new(0x053D5CED, 0x3DED6DED, 0x6DED6DED);

    fn dispatcher() -> Dispatcher {
        let mut builder = PacketDbBuilder::new(PacketVersion(20120410));
        register_core_handlers(&mut builder).unwrap();
        Dispatcher::new(Arc::new(builder.build()))
    }

    fn session(mode: ObfuscationMode) -> (Session, RecordingOutbound) {
        let sink = RecordingOutbound::new();
        (Session::new(1, Box::new(sink.clone()), mode, KEYS), sink)
    }

    #[test]
    fn test_partial_packets_wait() {
        let d = dispatcher();
        let (mut s, _) = session(ObfuscationMode::Disabled);

        assert_eq!(d.dispatch(&mut s, &[0x7d], 0).unwrap(), vec![]);
        assert_eq!(
            d.dispatch(&mut s, &[0x00, 0x7d], 0).unwrap(),
            vec![ClientRequest::LoadEnd]
        );
        assert_eq!(
            d.dispatch(&mut s, &[0x00], 0).unwrap(),
            vec![ClientRequest::LoadEnd]
        );
        assert!(s.inbound().is_empty());
    }

    #[test]
    fn test_tick_sync_replies() {
        let d = dispatcher();
        let (mut s, sink) = session(ObfuscationMode::Disabled);
        let requests = d
            .dispatch(&mut s, &[0x7e, 0x00, 0x10, 0x00, 0x00, 0x00], 0x1234)
            .unwrap();
        assert_eq!(requests, vec![ClientRequest::TickSync { client_tick: 0x10 }]);
        assert_eq!(
            sink.sent()[0].as_ref(),
            &[0x7f, 0x00, 0x34, 0x12, 0x00, 0x00]
        );
    }

    #[test]
    fn test_variable_length_message() {
        let d = dispatcher();
        let (mut s, _) = session(ObfuscationMode::Disabled);
        let mut packet = vec![0x8c, 0x00, 0x00, 0x00];
        packet.extend_from_slice(b"hi\0");
        packet[2] = packet.len() as u8;

        let requests = d.dispatch(&mut s, &packet, 0).unwrap();
        assert_eq!(
            requests,
            vec![ClientRequest::GlobalMessage {
                text: "hi".to_string()
            }]
        );
    }

    #[test]
    fn test_unknown_opcode_closes_session() {
        let d = dispatcher();
        let (mut s, sink) = session(ObfuscationMode::Disabled);
        assert_eq!(
            d.dispatch(&mut s, &[0xff, 0x7f, 0, 0], 0),
            Err(ProtocolError::UnknownOpcode { opcode: 0x7fff })
        );
        assert!(!s.is_active());
        assert!(sink.is_closed());
        assert_eq!(
            d.dispatch(&mut s, &[0x7d, 0x00], 0),
            Err(ProtocolError::SessionClosed)
        );
    }

    #[test]
    fn test_bad_variable_length_closes_session() {
        let d = dispatcher();
        let (mut s, _) = session(ObfuscationMode::Disabled);
        assert_eq!(
            d.dispatch(&mut s, &[0x8c, 0x00, 0x02, 0x00], 0),
            Err(ProtocolError::InvalidLength {
                opcode: 0x008c,
                length: 2
            })
        );
        assert!(!s.is_active());
    }

    #[test]
    fn test_obfuscated_stream() {
        let d = dispatcher();
        let (mut s, _) = session(ObfuscationMode::Always);

        let mut key = CryptKey::new(KEYS);
        let mut stream = Vec::new();
        for opcode in [0x007du16, 0x00e3] {
            stream.extend_from_slice(&key.encrypt(opcode).to_le_bytes());
            key.advance();
        }

        let requests = d.dispatch(&mut s, &stream, 0).unwrap();
        assert_eq!(requests, vec![ClientRequest::LoadEnd, ClientRequest::LeaveChat]);
        assert_eq!(s.decoder().key().current(), key.current());
    }

    #[test]
    fn test_auto_detect_pins_decrypt() {
        let d = dispatcher();
        let (mut s, _) = session(ObfuscationMode::Auto);
        let key = CryptKey::new(KEYS);
        let wire = key.encrypt(0x007d);
        assert!(!d.db().contains(wire));

        let requests = d.dispatch(&mut s, &wire.to_le_bytes(), 0).unwrap();
        assert_eq!(requests, vec![ClientRequest::LoadEnd]);
        assert_eq!(
            s.decoder().state(),
            DecoderState::Pinned(DecodeMode::Decrypt)
        );
    }
}

//! Core inbound handlers
//!
//! Handlers decode client packets into `ClientRequest` values. They run
//! synchronously inside the dispatch loop, never touch the world and may
//! queue replies for the sending session.

use tracing::trace;

use crate::error::{ProtocolError, RegistryError};
use crate::net::session::SessionId;
use crate::protocol::builders;
use crate::protocol::codec::DecodedPacket;
use crate::protocol::layout::{FieldDef, FieldKind, LayoutRow, LayoutTable, PacketLayout, PacketLen};
use crate::protocol::packet_db::PacketDbBuilder;
use crate::protocol::version::VersionRange;
use crate::world::BlockId;

/// What the player at the other end of a session asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Connect {
        account_id: u32,
        char_id: u32,
        login_id: u32,
        client_tick: u32,
        sex: u8,
    },
    LoadEnd,
    TickSync {
        client_tick: u32,
    },
    WalkTo {
        x: i16,
        y: i16,
    },
    Action {
        target_id: u32,
        action: ActionKind,
    },
    GlobalMessage {
        text: String,
    },
    ChangeDirection {
        head_dir: u8,
        dir: u8,
    },
    Emotion {
        kind: u8,
    },
    LeaveChat,
    Quit {
        kind: u16,
    },
}

/// Action request types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Attack,
    Sit,
    Stand,
    ContinuousAttack,
    Other(u8),
}

impl From<u8> for ActionKind {
    fn from(v: u8) -> Self {
        match v {
            0x00 => ActionKind::Attack,
            0x02 => ActionKind::Sit,
            0x03 => ActionKind::Stand,
            0x07 => ActionKind::ContinuousAttack,
            other => ActionKind::Other(other),
        }
    }
}

/// State a handler may read and the output it may produce
#[derive(Debug)]
pub struct HandlerContext {
    pub session_id: SessionId,
    pub player: Option<BlockId>,
    pub server_tick: u32,
    requests: Vec<ClientRequest>,
    replies: Vec<Vec<u8>>,
}

impl HandlerContext {
    pub fn new(session_id: SessionId, player: Option<BlockId>, server_tick: u32) -> Self {
        Self {
            session_id,
            player,
            server_tick,
            requests: Vec::new(),
            replies: Vec::new(),
        }
    }

    pub fn push_request(&mut self, request: ClientRequest) {
        self.requests.push(request);
    }

    /// Queue a packet for the sending session
    pub fn reply(&mut self, packet: Vec<u8>) {
        self.replies.push(packet);
    }

    pub fn take_requests(&mut self) -> Vec<ClientRequest> {
        std::mem::take(&mut self.requests)
    }

    pub fn take_replies(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.replies)
    }
}

// ============ Inbound layouts ============

static ENTER_FIELDS_0713: [FieldDef; 5] = [
    FieldDef::new("account_id", 12, FieldKind::U32),
    FieldDef::new("char_id", 22, FieldKind::U32),
    FieldDef::new("login_id", 30, FieldKind::U32),
    FieldDef::new("client_tick", 34, FieldKind::U32),
    FieldDef::new("sex", 38, FieldKind::U8),
];

static ENTER_FIELDS_0705: [FieldDef; 5] = [
    FieldDef::new("account_id", 5, FieldKind::U32),
    FieldDef::new("char_id", 9, FieldKind::U32),
    FieldDef::new("login_id", 13, FieldKind::U32),
    FieldDef::new("client_tick", 17, FieldKind::U32),
    FieldDef::new("sex", 21, FieldKind::U8),
];

static ENTER_FIELDS: [FieldDef; 5] = [
    FieldDef::new("account_id", 2, FieldKind::U32),
    FieldDef::new("char_id", 6, FieldKind::U32),
    FieldDef::new("login_id", 10, FieldKind::U32),
    FieldDef::new("client_tick", 14, FieldKind::U32),
    FieldDef::new("sex", 18, FieldKind::U8),
];

static ENTER_ROWS: [LayoutRow; 3] = [
    LayoutRow {
        versions: VersionRange::from(20040713),
        layout: PacketLayout {
            name: "enter",
            opcode: 0x0072,
            len: PacketLen::Fixed(39),
            fields: &ENTER_FIELDS_0713,
        },
    },
    LayoutRow {
        versions: VersionRange::between(20040705, 20040713),
        layout: PacketLayout {
            name: "enter",
            opcode: 0x0072,
            len: PacketLen::Fixed(22),
            fields: &ENTER_FIELDS_0705,
        },
    },
    LayoutRow {
        versions: VersionRange::before(20040705),
        layout: PacketLayout {
            name: "enter",
            opcode: 0x0072,
            len: PacketLen::Fixed(19),
            fields: &ENTER_FIELDS,
        },
    },
];

pub static ENTER: LayoutTable = LayoutTable {
    name: "enter",
    rows: &ENTER_ROWS,
};

static LOAD_END_ROWS: [LayoutRow; 1] = [LayoutRow {
    versions: VersionRange::ALL,
    layout: PacketLayout {
        name: "load_end",
        opcode: 0x007d,
        len: PacketLen::Fixed(2),
        fields: &[],
    },
}];

pub static LOAD_END: LayoutTable = LayoutTable {
    name: "load_end",
    rows: &LOAD_END_ROWS,
};

static TICK_FIELDS: [FieldDef; 1] = [FieldDef::new("client_tick", 2, FieldKind::U32)];

static TICK_ROWS: [LayoutRow; 1] = [LayoutRow {
    versions: VersionRange::ALL,
    layout: PacketLayout {
        name: "tick",
        opcode: 0x007e,
        len: PacketLen::Fixed(6),
        fields: &TICK_FIELDS,
    },
}];

pub static TICK: LayoutTable = LayoutTable {
    name: "tick",
    rows: &TICK_ROWS,
};

static WALK_FIELDS_0713: [FieldDef; 1] = [FieldDef::new("dest", 6, FieldKind::Pos)];
static WALK_FIELDS_0705: [FieldDef; 1] = [FieldDef::new("dest", 5, FieldKind::Pos)];
static WALK_FIELDS: [FieldDef; 1] = [FieldDef::new("dest", 2, FieldKind::Pos)];

static WALK_ROWS: [LayoutRow; 3] = [
    LayoutRow {
        versions: VersionRange::from(20040713),
        layout: PacketLayout {
            name: "walk",
            opcode: 0x0085,
            len: PacketLen::Fixed(9),
            fields: &WALK_FIELDS_0713,
        },
    },
    LayoutRow {
        versions: VersionRange::between(20040705, 20040713),
        layout: PacketLayout {
            name: "walk",
            opcode: 0x0085,
            len: PacketLen::Fixed(8),
            fields: &WALK_FIELDS_0705,
        },
    },
    LayoutRow {
        versions: VersionRange::before(20040705),
        layout: PacketLayout {
            name: "walk",
            opcode: 0x0085,
            len: PacketLen::Fixed(5),
            fields: &WALK_FIELDS,
        },
    },
];

pub static WALK: LayoutTable = LayoutTable {
    name: "walk",
    rows: &WALK_ROWS,
};

static ACTION_FIELDS: [FieldDef; 2] = [
    FieldDef::new("target_id", 2, FieldKind::U32),
    FieldDef::new("action", 6, FieldKind::U8),
];

static ACTION_ROWS: [LayoutRow; 1] = [LayoutRow {
    versions: VersionRange::ALL,
    layout: PacketLayout {
        name: "action",
        opcode: 0x0089,
        len: PacketLen::Fixed(7),
        fields: &ACTION_FIELDS,
    },
}];

pub static ACTION: LayoutTable = LayoutTable {
    name: "action",
    rows: &ACTION_ROWS,
};

static MESSAGE_FIELDS: [FieldDef; 1] = [FieldDef::new("message", 4, FieldKind::Tail)];

static MESSAGE_ROWS: [LayoutRow; 1] = [LayoutRow {
    versions: VersionRange::ALL,
    layout: PacketLayout {
        name: "global_message",
        opcode: 0x008c,
        len: PacketLen::Variable { min: 4 },
        fields: &MESSAGE_FIELDS,
    },
}];

pub static GLOBAL_MESSAGE: LayoutTable = LayoutTable {
    name: "global_message",
    rows: &MESSAGE_ROWS,
};

static DIR_FIELDS_0713: [FieldDef; 2] = [
    FieldDef::new("head_dir", 5, FieldKind::U16),
    FieldDef::new("dir", 12, FieldKind::U8),
];

static DIR_FIELDS: [FieldDef; 2] = [
    FieldDef::new("head_dir", 2, FieldKind::U16),
    FieldDef::new("dir", 4, FieldKind::U8),
];

static DIR_ROWS: [LayoutRow; 2] = [
    LayoutRow {
        versions: VersionRange::from(20040713),
        layout: PacketLayout {
            name: "change_dir",
            opcode: 0x009b,
            len: PacketLen::Fixed(13),
            fields: &DIR_FIELDS_0713,
        },
    },
    LayoutRow {
        versions: VersionRange::before(20040713),
        layout: PacketLayout {
            name: "change_dir",
            opcode: 0x009b,
            len: PacketLen::Fixed(5),
            fields: &DIR_FIELDS,
        },
    },
];

pub static CHANGE_DIR: LayoutTable = LayoutTable {
    name: "change_dir",
    rows: &DIR_ROWS,
};

static EMOTION_FIELDS: [FieldDef; 1] = [FieldDef::new("kind", 2, FieldKind::U8)];

static EMOTION_ROWS: [LayoutRow; 1] = [LayoutRow {
    versions: VersionRange::ALL,
    layout: PacketLayout {
        name: "emotion",
        opcode: 0x00bf,
        len: PacketLen::Fixed(3),
        fields: &EMOTION_FIELDS,
    },
}];

pub static EMOTION: LayoutTable = LayoutTable {
    name: "emotion",
    rows: &EMOTION_ROWS,
};

static LEAVE_CHAT_ROWS: [LayoutRow; 1] = [LayoutRow {
    versions: VersionRange::ALL,
    layout: PacketLayout {
        name: "leave_chat",
        opcode: 0x00e3,
        len: PacketLen::Fixed(2),
        fields: &[],
    },
}];

pub static LEAVE_CHAT: LayoutTable = LayoutTable {
    name: "leave_chat",
    rows: &LEAVE_CHAT_ROWS,
};

static QUIT_FIELDS: [FieldDef; 1] = [FieldDef::new("kind", 2, FieldKind::U16)];

static QUIT_ROWS: [LayoutRow; 1] = [LayoutRow {
    versions: VersionRange::ALL,
    layout: PacketLayout {
        name: "quit",
        opcode: 0x018a,
        len: PacketLen::Fixed(4),
        fields: &QUIT_FIELDS,
    },
}];

pub static QUIT: LayoutTable = LayoutTable {
    name: "quit",
    rows: &QUIT_ROWS,
};

/// Register every core handler for the builder's client version
pub fn register_core_handlers(builder: &mut PacketDbBuilder) -> Result<(), RegistryError> {
    builder
        .register_table(&ENTER, Some(handle_enter))?
        .register_table(&LOAD_END, Some(handle_load_end))?
        .register_table(&TICK, Some(handle_tick))?
        .register_table(&WALK, Some(handle_walk))?
        .register_table(&ACTION, Some(handle_action))?
        .register_table(&GLOBAL_MESSAGE, Some(handle_global_message))?
        .register_table(&CHANGE_DIR, Some(handle_change_dir))?
        .register_table(&EMOTION, Some(handle_emotion))?
        .register_table(&LEAVE_CHAT, Some(handle_leave_chat))?
        .register_table(&QUIT, Some(handle_quit))?;
    Ok(())
}

// ============ Handlers ============

fn handle_enter(ctx: &mut HandlerContext, packet: &DecodedPacket) -> Result<(), ProtocolError> {
    let v = &packet.values;
    ctx.push_request(ClientRequest::Connect {
        account_id: v.int_as("account_id")?,
        char_id: v.int_as("char_id")?,
        login_id: v.int_as("login_id")?,
        client_tick: v.int_as("client_tick")?,
        sex: v.int_as("sex")?,
    });
    Ok(())
}

fn handle_load_end(ctx: &mut HandlerContext, _packet: &DecodedPacket) -> Result<(), ProtocolError> {
    ctx.push_request(ClientRequest::LoadEnd);
    Ok(())
}

fn handle_tick(ctx: &mut HandlerContext, packet: &DecodedPacket) -> Result<(), ProtocolError> {
    let client_tick: u32 = packet.values.int_as("client_tick")?;
    trace!(session_id = ctx.session_id, client_tick, "Tick sync");
    let reply = builders::notify_time(ctx.server_tick)?;
    ctx.reply(reply);
    ctx.push_request(ClientRequest::TickSync { client_tick });
    Ok(())
}

fn handle_walk(ctx: &mut HandlerContext, packet: &DecodedPacket) -> Result<(), ProtocolError> {
    let dest = packet.values.pos("dest")?;
    let out_of_range = |_| ProtocolError::FieldOutOfRange { field: "dest" };
    ctx.push_request(ClientRequest::WalkTo {
        x: i16::try_from(dest.x).map_err(out_of_range)?,
        y: i16::try_from(dest.y).map_err(out_of_range)?,
    });
    Ok(())
}

fn handle_action(ctx: &mut HandlerContext, packet: &DecodedPacket) -> Result<(), ProtocolError> {
    let v = &packet.values;
    ctx.push_request(ClientRequest::Action {
        target_id: v.int_as("target_id")?,
        action: ActionKind::from(v.int_as::<u8>("action")?),
    });
    Ok(())
}

fn handle_global_message(ctx: &mut HandlerContext, packet: &DecodedPacket) -> Result<(), ProtocolError> {
    ctx.push_request(ClientRequest::GlobalMessage {
        text: packet.values.string("message")?.to_string(),
    });
    Ok(())
}

fn handle_change_dir(ctx: &mut HandlerContext, packet: &DecodedPacket) -> Result<(), ProtocolError> {
    let v = &packet.values;
    ctx.push_request(ClientRequest::ChangeDirection {
        head_dir: v.int_as("head_dir")?,
        dir: v.int_as("dir")?,
    });
    Ok(())
}

fn handle_emotion(ctx: &mut HandlerContext, packet: &DecodedPacket) -> Result<(), ProtocolError> {
    ctx.push_request(ClientRequest::Emotion {
        kind: packet.values.int_as("kind")?,
    });
    Ok(())
}

fn handle_leave_chat(ctx: &mut HandlerContext, _packet: &DecodedPacket) -> Result<(), ProtocolError> {
    ctx.push_request(ClientRequest::LeaveChat);
    Ok(())
}

fn handle_quit(ctx: &mut HandlerContext, packet: &DecodedPacket) -> Result<(), ProtocolError> {
    ctx.push_request(ClientRequest::Quit {
        kind: packet.values.int_as("kind")?,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{decode, encode, FieldValues};
    use crate::protocol::layout::PackedPos;
    use crate::protocol::version::PacketVersion;
    use pretty_assertions::assert_eq;

    fn run(version: u32, bytes: &[u8]) -> (Vec<ClientRequest>, Vec<Vec<u8>>) {
        let mut builder = PacketDbBuilder::new(PacketVersion(version));
        register_core_handlers(&mut builder).unwrap();
        let db = builder.build();

        let packet = decode(&db, bytes).unwrap();
        let handler = db.lookup(packet.opcode).unwrap().handler.unwrap();
        let mut ctx = HandlerContext::new(1, None, 1000);
        handler(&mut ctx, &packet).unwrap();
        (ctx.take_requests(), ctx.take_replies())
    }

    #[test]
    fn test_enter_per_version() {
        let values = FieldValues::new()
            .with("account_id", 2000001u32)
            .with("char_id", 150000u32)
            .with("login_id", 0xdeadbeefu32)
            .with("client_tick", 1234u32)
            .with("sex", 1u8);

        for version in [20040101, 20040705, 20101124] {
            let layout = ENTER.resolve(PacketVersion(version)).unwrap();
            let bytes = encode(layout, &values).unwrap();
            let (requests, _) = run(version, &bytes);
            assert_eq!(
                requests,
                vec![ClientRequest::Connect {
                    account_id: 2000001,
                    char_id: 150000,
                    login_id: 0xdeadbeef,
                    client_tick: 1234,
                    sex: 1,
                }]
            );
        }
    }

    #[test]
    fn test_walk_unpacks_position() {
        let layout = WALK.resolve(PacketVersion(20101124)).unwrap();
        let values = FieldValues::new().with("dest", PackedPos::new(155, 180, 0));
        let bytes = encode(layout, &values).unwrap();
        assert_eq!(bytes.len(), 9);
        let (requests, _) = run(20101124, &bytes);
        assert_eq!(requests, vec![ClientRequest::WalkTo { x: 155, y: 180 }]);
    }

    #[test]
    fn test_tick_replies_with_server_time() {
        let (requests, replies) = run(20101124, &[0x7e, 0x00, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(requests, vec![ClientRequest::TickSync { client_tick: 16 }]);
        assert_eq!(replies, vec![vec![0x7f, 0x00, 0xe8, 0x03, 0x00, 0x00]]);
    }

    #[test]
    fn test_global_message_strips_terminator() {
        let mut bytes = vec![0x8c, 0x00, 0x00, 0x00];
        bytes.extend_from_slice(b"Alice : hello\0");
        let len = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&len.to_le_bytes());
        let (requests, _) = run(20101124, &bytes);
        assert_eq!(
            requests,
            vec![ClientRequest::GlobalMessage {
                text: "Alice : hello".to_string()
            }]
        );
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let packet = |values: FieldValues| DecodedPacket {
            opcode: 0x00bf,
            values,
            frame: bytes::Bytes::new(),
        };
        let mut ctx = HandlerContext::new(1, None, 1000);

        assert_eq!(
            handle_emotion(&mut ctx, &packet(FieldValues::new().with("kind", 300))),
            Err(ProtocolError::FieldOutOfRange { field: "kind" })
        );
        assert_eq!(
            handle_walk(&mut ctx, &packet(FieldValues::new().with("dest", PackedPos::new(40000, 5, 0)))),
            Err(ProtocolError::FieldOutOfRange { field: "dest" })
        );
        assert_eq!(
            handle_tick(&mut ctx, &packet(FieldValues::new().with("client_tick", -1))),
            Err(ProtocolError::FieldOutOfRange { field: "client_tick" })
        );
        assert!(ctx.take_requests().is_empty());
    }

    #[test]
    fn test_action_kinds() {
        let (requests, _) = run(20101124, &[0x89, 0x00, 0, 0, 0, 0, 0x02]);
        assert_eq!(
            requests,
            vec![ClientRequest::Action {
                target_id: 0,
                action: ActionKind::Sit
            }]
        );
        assert_eq!(ActionKind::from(9), ActionKind::Other(9));
    }
}

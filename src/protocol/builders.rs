//! Outbound packet builders
//!
//! Unit appearance and damage packets changed opcode and layout several times
//! across client releases; their tables are resolved once per server for the
//! configured version. The remaining packets are stable and use a single
//! static layout.

use crate::error::{ProtocolError, RegistryError};
use crate::protocol::codec::{encode, FieldValues};
use crate::protocol::layout::{
    FieldDef, FieldKind, LayoutRow, LayoutTable, PackedMove, PackedPos, PacketLayout, PacketLen,
};
use crate::protocol::version::{PacketVersion, VersionRange};
use crate::visibility::ClearReason;
use crate::world::{BlockId, Entity, EntityData, EntityKind, Motion};

use FieldKind::*;

/// Cell footprint sent with every unit
const UNIT_SIZE: u8 = 5;

// ============ Unit appearance ============

static IDLE_2010: [FieldDef; 18] = [
    FieldDef::new("object_type", 4, U8),
    FieldDef::new("id", 5, U32),
    FieldDef::new("speed", 9, I16),
    FieldDef::new("body_state", 11, I16),
    FieldDef::new("health_state", 13, I16),
    FieldDef::new("effect_state", 15, I32),
    FieldDef::new("job", 19, I16),
    FieldDef::new("head", 21, I16),
    FieldDef::new("weapon", 23, I32),
    FieldDef::new("head_dir", 37, I16),
    FieldDef::new("guild_id", 41, U32),
    FieldDef::new("emblem_ver", 45, I16),
    FieldDef::new("sex", 54, U8),
    FieldDef::new("pos", 55, Pos),
    FieldDef::new("x_size", 58, U8),
    FieldDef::new("y_size", 59, U8),
    FieldDef::new("state", 60, U8),
    FieldDef::new("level", 61, I16),
];

static IDLE_2009: [FieldDef; 18] = [
    FieldDef::new("object_type", 4, U8),
    FieldDef::new("id", 5, U32),
    FieldDef::new("speed", 9, I16),
    FieldDef::new("body_state", 11, I16),
    FieldDef::new("health_state", 13, I16),
    FieldDef::new("effect_state", 15, I32),
    FieldDef::new("job", 19, I16),
    FieldDef::new("head", 21, I16),
    FieldDef::new("weapon", 23, I32),
    FieldDef::new("head_dir", 37, I16),
    FieldDef::new("guild_id", 39, U32),
    FieldDef::new("emblem_ver", 43, I16),
    FieldDef::new("sex", 52, U8),
    FieldDef::new("pos", 53, Pos),
    FieldDef::new("x_size", 56, U8),
    FieldDef::new("y_size", 57, U8),
    FieldDef::new("state", 58, U8),
    FieldDef::new("level", 59, I16),
];

static IDLE_2008: [FieldDef; 17] = [
    FieldDef::new("id", 2, U32),
    FieldDef::new("speed", 6, I16),
    FieldDef::new("body_state", 8, I16),
    FieldDef::new("health_state", 10, I16),
    FieldDef::new("effect_state", 12, I32),
    FieldDef::new("job", 16, I16),
    FieldDef::new("head", 18, I16),
    FieldDef::new("weapon", 20, I32),
    FieldDef::new("head_dir", 34, I16),
    FieldDef::new("guild_id", 36, U32),
    FieldDef::new("emblem_ver", 40, I16),
    FieldDef::new("sex", 49, U8),
    FieldDef::new("pos", 50, Pos),
    FieldDef::new("x_size", 53, U8),
    FieldDef::new("y_size", 54, U8),
    FieldDef::new("state", 55, U8),
    FieldDef::new("level", 56, I16),
];

static IDLE_ROWS: [LayoutRow; 3] = [
    LayoutRow {
        versions: VersionRange::from(20101124),
        layout: PacketLayout {
            name: "unit_idle",
            opcode: 0x0857,
            len: PacketLen::Variable { min: 65 },
            fields: &IDLE_2010,
        },
    },
    LayoutRow {
        versions: VersionRange::between(20091103, 20101124),
        layout: PacketLayout {
            name: "unit_idle",
            opcode: 0x07f9,
            len: PacketLen::Variable { min: 63 },
            fields: &IDLE_2009,
        },
    },
    LayoutRow {
        versions: VersionRange::between(20080102, 20091103),
        layout: PacketLayout {
            name: "unit_idle",
            opcode: 0x02ee,
            len: PacketLen::Fixed(60),
            fields: &IDLE_2008,
        },
    },
];

pub static UNIT_IDLE: LayoutTable = LayoutTable {
    name: "unit_idle",
    rows: &IDLE_ROWS,
};

static SPAWN_2010: [FieldDef; 17] = [
    FieldDef::new("object_type", 4, U8),
    FieldDef::new("id", 5, U32),
    FieldDef::new("speed", 9, I16),
    FieldDef::new("body_state", 11, I16),
    FieldDef::new("health_state", 13, I16),
    FieldDef::new("effect_state", 15, I32),
    FieldDef::new("job", 19, I16),
    FieldDef::new("head", 21, I16),
    FieldDef::new("weapon", 23, I32),
    FieldDef::new("head_dir", 37, I16),
    FieldDef::new("guild_id", 41, U32),
    FieldDef::new("emblem_ver", 45, I16),
    FieldDef::new("sex", 54, U8),
    FieldDef::new("pos", 55, Pos),
    FieldDef::new("x_size", 58, U8),
    FieldDef::new("y_size", 59, U8),
    FieldDef::new("level", 60, I16),
];

static SPAWN_2009: [FieldDef; 17] = [
    FieldDef::new("object_type", 4, U8),
    FieldDef::new("id", 5, U32),
    FieldDef::new("speed", 9, I16),
    FieldDef::new("body_state", 11, I16),
    FieldDef::new("health_state", 13, I16),
    FieldDef::new("effect_state", 15, I32),
    FieldDef::new("job", 19, I16),
    FieldDef::new("head", 21, I16),
    FieldDef::new("weapon", 23, I32),
    FieldDef::new("head_dir", 37, I16),
    FieldDef::new("guild_id", 39, U32),
    FieldDef::new("emblem_ver", 43, I16),
    FieldDef::new("sex", 52, U8),
    FieldDef::new("pos", 53, Pos),
    FieldDef::new("x_size", 56, U8),
    FieldDef::new("y_size", 57, U8),
    FieldDef::new("level", 58, I16),
];

static SPAWN_2008: [FieldDef; 16] = [
    FieldDef::new("id", 2, U32),
    FieldDef::new("speed", 6, I16),
    FieldDef::new("body_state", 8, I16),
    FieldDef::new("health_state", 10, I16),
    FieldDef::new("effect_state", 12, I32),
    FieldDef::new("job", 16, I16),
    FieldDef::new("head", 18, I16),
    FieldDef::new("weapon", 20, I32),
    FieldDef::new("head_dir", 34, I16),
    FieldDef::new("guild_id", 36, U32),
    FieldDef::new("emblem_ver", 40, I16),
    FieldDef::new("sex", 49, U8),
    FieldDef::new("pos", 50, Pos),
    FieldDef::new("x_size", 53, U8),
    FieldDef::new("y_size", 54, U8),
    FieldDef::new("level", 55, I16),
];

static SPAWN_ROWS: [LayoutRow; 3] = [
    LayoutRow {
        versions: VersionRange::from(20101124),
        layout: PacketLayout {
            name: "unit_spawn",
            opcode: 0x0858,
            len: PacketLen::Variable { min: 64 },
            fields: &SPAWN_2010,
        },
    },
    LayoutRow {
        versions: VersionRange::between(20091103, 20101124),
        layout: PacketLayout {
            name: "unit_spawn",
            opcode: 0x07f8,
            len: PacketLen::Variable { min: 62 },
            fields: &SPAWN_2009,
        },
    },
    LayoutRow {
        versions: VersionRange::between(20080102, 20091103),
        layout: PacketLayout {
            name: "unit_spawn",
            opcode: 0x02ed,
            len: PacketLen::Fixed(59),
            fields: &SPAWN_2008,
        },
    },
];

pub static UNIT_SPAWN: LayoutTable = LayoutTable {
    name: "unit_spawn",
    rows: &SPAWN_ROWS,
};

static WALKING_2010: [FieldDef; 18] = [
    FieldDef::new("object_type", 4, U8),
    FieldDef::new("id", 5, U32),
    FieldDef::new("speed", 9, I16),
    FieldDef::new("body_state", 11, I16),
    FieldDef::new("health_state", 13, I16),
    FieldDef::new("effect_state", 15, I32),
    FieldDef::new("job", 19, I16),
    FieldDef::new("head", 21, I16),
    FieldDef::new("weapon", 23, I32),
    FieldDef::new("move_start_time", 29, U32),
    FieldDef::new("head_dir", 41, I16),
    FieldDef::new("guild_id", 45, U32),
    FieldDef::new("emblem_ver", 49, I16),
    FieldDef::new("sex", 58, U8),
    FieldDef::new("move", 59, Move),
    FieldDef::new("x_size", 65, U8),
    FieldDef::new("y_size", 66, U8),
    FieldDef::new("level", 67, I16),
];

static WALKING_2009: [FieldDef; 18] = [
    FieldDef::new("object_type", 4, U8),
    FieldDef::new("id", 5, U32),
    FieldDef::new("speed", 9, I16),
    FieldDef::new("body_state", 11, I16),
    FieldDef::new("health_state", 13, I16),
    FieldDef::new("effect_state", 15, I32),
    FieldDef::new("job", 19, I16),
    FieldDef::new("head", 21, I16),
    FieldDef::new("weapon", 23, I32),
    FieldDef::new("move_start_time", 29, U32),
    FieldDef::new("head_dir", 41, I16),
    FieldDef::new("guild_id", 43, U32),
    FieldDef::new("emblem_ver", 47, I16),
    FieldDef::new("sex", 56, U8),
    FieldDef::new("move", 57, Move),
    FieldDef::new("x_size", 63, U8),
    FieldDef::new("y_size", 64, U8),
    FieldDef::new("level", 65, I16),
];

static WALKING_2008: [FieldDef; 18] = [
    FieldDef::new("object_type", 2, U8),
    FieldDef::new("id", 3, U32),
    FieldDef::new("speed", 7, I16),
    FieldDef::new("body_state", 9, I16),
    FieldDef::new("health_state", 11, I16),
    FieldDef::new("effect_state", 13, I32),
    FieldDef::new("job", 17, I16),
    FieldDef::new("head", 19, I16),
    FieldDef::new("weapon", 21, I32),
    FieldDef::new("move_start_time", 27, U32),
    FieldDef::new("head_dir", 39, I16),
    FieldDef::new("guild_id", 41, U32),
    FieldDef::new("emblem_ver", 45, I16),
    FieldDef::new("sex", 54, U8),
    FieldDef::new("move", 55, Move),
    FieldDef::new("x_size", 61, U8),
    FieldDef::new("y_size", 62, U8),
    FieldDef::new("level", 63, I16),
];

static WALKING_ROWS: [LayoutRow; 3] = [
    LayoutRow {
        versions: VersionRange::from(20101124),
        layout: PacketLayout {
            name: "unit_walking",
            opcode: 0x0856,
            len: PacketLen::Variable { min: 71 },
            fields: &WALKING_2010,
        },
    },
    LayoutRow {
        versions: VersionRange::between(20091103, 20101124),
        layout: PacketLayout {
            name: "unit_walking",
            opcode: 0x07f7,
            len: PacketLen::Variable { min: 69 },
            fields: &WALKING_2009,
        },
    },
    LayoutRow {
        versions: VersionRange::between(20080102, 20091103),
        layout: PacketLayout {
            name: "unit_walking",
            opcode: 0x02ec,
            len: PacketLen::Fixed(67),
            fields: &WALKING_2008,
        },
    },
];

pub static UNIT_WALKING: LayoutTable = LayoutTable {
    name: "unit_walking",
    rows: &WALKING_ROWS,
};

// ============ Damage ============

static DAMAGE_2013: [FieldDef; 10] = [
    FieldDef::new("src_id", 2, U32),
    FieldDef::new("dst_id", 6, U32),
    FieldDef::new("tick", 10, U32),
    FieldDef::new("src_speed", 14, I32),
    FieldDef::new("dst_speed", 18, I32),
    FieldDef::new("damage", 22, I32),
    FieldDef::new("is_sp", 26, U8),
    FieldDef::new("div", 27, I16),
    FieldDef::new("kind", 29, U8),
    FieldDef::new("left", 30, I32),
];

static DAMAGE_2007: [FieldDef; 9] = [
    FieldDef::new("src_id", 2, U32),
    FieldDef::new("dst_id", 6, U32),
    FieldDef::new("tick", 10, U32),
    FieldDef::new("src_speed", 14, I32),
    FieldDef::new("dst_speed", 18, I32),
    FieldDef::new("damage", 22, I32),
    FieldDef::new("div", 26, I16),
    FieldDef::new("kind", 28, U8),
    FieldDef::new("left", 29, I32),
];

static DAMAGE_BASE: [FieldDef; 9] = [
    FieldDef::new("src_id", 2, U32),
    FieldDef::new("dst_id", 6, U32),
    FieldDef::new("tick", 10, U32),
    FieldDef::new("src_speed", 14, I32),
    FieldDef::new("dst_speed", 18, I32),
    FieldDef::new("damage", 22, I16),
    FieldDef::new("div", 24, I16),
    FieldDef::new("kind", 26, U8),
    FieldDef::new("left", 27, I16),
];

static DAMAGE_ROWS: [LayoutRow; 3] = [
    LayoutRow {
        versions: VersionRange::from(20131223),
        layout: PacketLayout {
            name: "damage",
            opcode: 0x08c8,
            len: PacketLen::Fixed(34),
            fields: &DAMAGE_2013,
        },
    },
    LayoutRow {
        versions: VersionRange::between(20071113, 20131223),
        layout: PacketLayout {
            name: "damage",
            opcode: 0x02e1,
            len: PacketLen::Fixed(33),
            fields: &DAMAGE_2007,
        },
    },
    LayoutRow {
        versions: VersionRange::before(20071113),
        layout: PacketLayout {
            name: "damage",
            opcode: 0x008a,
            len: PacketLen::Fixed(29),
            fields: &DAMAGE_BASE,
        },
    },
];

pub static DAMAGE: LayoutTable = LayoutTable {
    name: "damage",
    rows: &DAMAGE_ROWS,
};

// ============ Stable packets ============

static VANISH_FIELDS: [FieldDef; 2] = [
    FieldDef::new("id", 2, U32),
    FieldDef::new("kind", 6, U8),
];

pub static VANISH: PacketLayout = PacketLayout {
    name: "vanish",
    opcode: 0x0080,
    len: PacketLen::Fixed(7),
    fields: &VANISH_FIELDS,
};

static TIME_FIELDS: [FieldDef; 1] = [FieldDef::new("tick", 2, U32)];

pub static NOTIFY_TIME: PacketLayout = PacketLayout {
    name: "notify_time",
    opcode: 0x007f,
    len: PacketLen::Fixed(6),
    fields: &TIME_FIELDS,
};

static CHAT_FIELDS: [FieldDef; 2] = [
    FieldDef::new("id", 4, U32),
    FieldDef::new("message", 8, Tail),
];

pub static NOTIFY_CHAT: PacketLayout = PacketLayout {
    name: "notify_chat",
    opcode: 0x008d,
    len: PacketLen::Variable { min: 8 },
    fields: &CHAT_FIELDS,
};

static SELF_CHAT_FIELDS: [FieldDef; 1] = [FieldDef::new("message", 4, Tail)];

pub static NOTIFY_SELF_CHAT: PacketLayout = PacketLayout {
    name: "notify_self_chat",
    opcode: 0x008e,
    len: PacketLen::Variable { min: 4 },
    fields: &SELF_CHAT_FIELDS,
};

static DIR_FIELDS: [FieldDef; 3] = [
    FieldDef::new("id", 2, U32),
    FieldDef::new("head_dir", 6, I16),
    FieldDef::new("dir", 8, U8),
];

pub static CHANGE_DIR: PacketLayout = PacketLayout {
    name: "change_dir",
    opcode: 0x009c,
    len: PacketLen::Fixed(9),
    fields: &DIR_FIELDS,
};

static EMOTION_FIELDS: [FieldDef; 2] = [
    FieldDef::new("id", 2, U32),
    FieldDef::new("kind", 6, U8),
];

pub static EMOTION: PacketLayout = PacketLayout {
    name: "emotion",
    opcode: 0x00c0,
    len: PacketLen::Fixed(7),
    fields: &EMOTION_FIELDS,
};

static QUIT_FIELDS: [FieldDef; 1] = [FieldDef::new("result", 2, U16)];

pub static QUIT_ACK: PacketLayout = PacketLayout {
    name: "quit_ack",
    opcode: 0x018b,
    len: PacketLen::Fixed(4),
    fields: &QUIT_FIELDS,
};

static ITEM_FIELDS: [FieldDef; 8] = [
    FieldDef::new("id", 2, U32),
    FieldDef::new("item_id", 6, U16),
    FieldDef::new("identified", 8, U8),
    FieldDef::new("x", 9, I16),
    FieldDef::new("y", 11, I16),
    FieldDef::new("amount", 13, I16),
    FieldDef::new("sub_x", 15, U8),
    FieldDef::new("sub_y", 16, U8),
];

pub static ITEM_ENTRY: PacketLayout = PacketLayout {
    name: "item_entry",
    opcode: 0x009d,
    len: PacketLen::Fixed(17),
    fields: &ITEM_FIELDS,
};

static ID_ONLY_FIELDS: [FieldDef; 1] = [FieldDef::new("id", 2, U32)];

pub static ITEM_DISAPPEAR: PacketLayout = PacketLayout {
    name: "item_disappear",
    opcode: 0x00a1,
    len: PacketLen::Fixed(6),
    fields: &ID_ONLY_FIELDS,
};

static SKILL_FIELDS: [FieldDef; 6] = [
    FieldDef::new("id", 2, U32),
    FieldDef::new("creator_id", 6, U32),
    FieldDef::new("x", 10, I16),
    FieldDef::new("y", 12, I16),
    FieldDef::new("unit_id", 14, U8),
    FieldDef::new("visible", 15, U8),
];

pub static SKILL_ENTRY: PacketLayout = PacketLayout {
    name: "skill_entry",
    opcode: 0x011f,
    len: PacketLen::Fixed(16),
    fields: &SKILL_FIELDS,
};

pub static SKILL_DISAPPEAR: PacketLayout = PacketLayout {
    name: "skill_disappear",
    opcode: 0x0120,
    len: PacketLen::Fixed(6),
    fields: &ID_ONLY_FIELDS,
};

static ROOM_FIELDS: [FieldDef; 6] = [
    FieldDef::new("owner_id", 4, U32),
    FieldDef::new("id", 8, U32),
    FieldDef::new("limit", 12, U16),
    FieldDef::new("users", 14, U16),
    FieldDef::new("public", 16, U8),
    FieldDef::new("title", 17, Tail),
];

pub static ROOM_ENTRY: PacketLayout = PacketLayout {
    name: "room_entry",
    opcode: 0x00d7,
    len: PacketLen::Variable { min: 17 },
    fields: &ROOM_FIELDS,
};

pub static ROOM_DESTROY: PacketLayout = PacketLayout {
    name: "room_destroy",
    opcode: 0x00d8,
    len: PacketLen::Fixed(6),
    fields: &ID_ONLY_FIELDS,
};

/// Server time reply to a tick sync
pub fn notify_time(tick: u32) -> Result<Vec<u8>, ProtocolError> {
    encode(&NOTIFY_TIME, &FieldValues::new().with("tick", tick))
}

/// Which appearance packet to send for a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppearKind {
    /// The unit just came into existence
    Spawn,
    /// The unit was already there
    Idle,
    /// The unit is moving
    Walking,
}

impl AppearKind {
    /// Appearance matching a unit's current motion
    pub fn for_motion(motion: &Motion) -> Self {
        match motion {
            Motion::Idle => AppearKind::Idle,
            Motion::Walking { .. } => AppearKind::Walking,
        }
    }
}

/// Damage display types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DamageKind {
    Normal = 0,
    PickUpItem = 1,
    SitDown = 2,
    StandUp = 3,
    Endure = 4,
    Splash = 5,
    Skill = 6,
    RepeatAttack = 7,
    MultiHit = 8,
    MultiHitEndure = 9,
    Critical = 10,
    LuckyDodge = 11,
}

/// Everything a damage packet carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageInfo {
    pub src: BlockId,
    pub dst: BlockId,
    pub tick: u32,
    pub src_speed: i32,
    pub dst_speed: i32,
    pub damage: i32,
    pub div: i16,
    pub kind: DamageKind,
    pub left: i32,
}

impl DamageInfo {
    /// Sit or stand notification, sent through the damage packet
    pub fn posture(id: BlockId, tick: u32, sitting: bool) -> Self {
        Self {
            src: id,
            dst: 0,
            tick,
            src_speed: 0,
            dst_speed: 0,
            damage: 0,
            div: 0,
            kind: if sitting {
                DamageKind::SitDown
            } else {
                DamageKind::StandUp
            },
            left: 0,
        }
    }
}

/// Version-resolved outbound layouts
#[derive(Debug, Clone)]
pub struct OutboundPackets {
    version: PacketVersion,
    spawn: &'static PacketLayout,
    idle: &'static PacketLayout,
    walking: &'static PacketLayout,
    damage: &'static PacketLayout,
}

impl OutboundPackets {
    /// Resolve every versioned layout, failing at startup if one is missing
    pub fn resolve(version: PacketVersion) -> Result<Self, RegistryError> {
        let packets = Self {
            version,
            spawn: UNIT_SPAWN.resolve(version)?,
            idle: UNIT_IDLE.resolve(version)?,
            walking: UNIT_WALKING.resolve(version)?,
            damage: DAMAGE.resolve(version)?,
        };
        for layout in [packets.spawn, packets.idle, packets.walking, packets.damage] {
            layout.validate()?;
        }
        for layout in [
            &VANISH,
            &NOTIFY_TIME,
            &NOTIFY_CHAT,
            &NOTIFY_SELF_CHAT,
            &CHANGE_DIR,
            &EMOTION,
            &QUIT_ACK,
            &ITEM_ENTRY,
            &ITEM_DISAPPEAR,
            &SKILL_ENTRY,
            &SKILL_DISAPPEAR,
            &ROOM_ENTRY,
            &ROOM_DESTROY,
        ] {
            layout.validate()?;
        }
        Ok(packets)
    }

    pub fn version(&self) -> PacketVersion {
        self.version
    }

    /// Packet that makes `entity` appear on a client
    ///
    /// With `negate_id` the id is sent negated, which is how a disguised
    /// player's own client tracks its real body.
    pub fn appear(
        &self,
        entity: &Entity,
        kind: AppearKind,
        tick: u32,
        negate_id: bool,
    ) -> Result<Vec<u8>, ProtocolError> {
        let id = wire_id(entity.id, negate_id);
        match &entity.data {
            EntityData::Item(item) => encode(
                &ITEM_ENTRY,
                &FieldValues::new()
                    .with("id", id)
                    .with("item_id", item.item_id)
                    .with("identified", item.identified)
                    .with("x", entity.pos.x)
                    .with("y", entity.pos.y)
                    .with("amount", item.amount as i64)
                    .with("sub_x", 8u8)
                    .with("sub_y", 8u8),
            ),
            EntityData::SkillUnit(unit) => encode(
                &SKILL_ENTRY,
                &FieldValues::new()
                    .with("id", id)
                    .with("creator_id", unit.owner)
                    .with("x", entity.pos.x)
                    .with("y", entity.pos.y)
                    .with("unit_id", unit.unit_id)
                    .with("visible", 1u8),
            ),
            EntityData::Chat(chat) => encode(
                &ROOM_ENTRY,
                &FieldValues::new()
                    .with("owner_id", chat.owner)
                    .with("id", id)
                    .with("limit", chat.limit)
                    .with("users", chat.members.len() as i64)
                    .with("public", chat.public)
                    .with("title", chat.title.as_str()),
            ),
            _ => {
                let layout = match kind {
                    AppearKind::Spawn => self.spawn,
                    AppearKind::Idle => self.idle,
                    AppearKind::Walking => self.walking,
                };
                encode(layout, &unit_values(entity, id, tick))
            }
        }
    }

    /// Packet that removes `entity` from a client
    pub fn disappear(
        &self,
        entity: &Entity,
        reason: ClearReason,
        negate_id: bool,
    ) -> Result<Vec<u8>, ProtocolError> {
        let id = wire_id(entity.id, negate_id);
        let values = FieldValues::new().with("id", id);
        match entity.kind() {
            EntityKind::Item => encode(&ITEM_DISAPPEAR, &values),
            EntityKind::SkillUnit => encode(&SKILL_DISAPPEAR, &values),
            EntityKind::Chat => encode(&ROOM_DESTROY, &values),
            _ => self.vanish(id, reason),
        }
    }

    /// `ZC_NOTIFY_VANISH` for a raw id
    pub fn vanish(&self, id: u32, reason: ClearReason) -> Result<Vec<u8>, ProtocolError> {
        encode(
            &VANISH,
            &FieldValues::new().with("id", id).with("kind", reason as u8),
        )
    }

    pub fn damage(&self, info: &DamageInfo) -> Result<Vec<u8>, ProtocolError> {
        // Older clients carry 16-bit damage; saturate rather than wrap
        let narrow = self
            .damage
            .field("damage")
            .is_some_and(|f| f.kind == FieldKind::I16);
        let clamp = |v: i32| -> i64 {
            if narrow {
                v.clamp(i16::MIN as i32, i16::MAX as i32) as i64
            } else {
                v as i64
            }
        };
        encode(
            self.damage,
            &FieldValues::new()
                .with("src_id", info.src)
                .with("dst_id", info.dst)
                .with("tick", info.tick)
                .with("src_speed", info.src_speed)
                .with("dst_speed", info.dst_speed)
                .with("damage", clamp(info.damage))
                .with("is_sp", 0u8)
                .with("div", info.div)
                .with("kind", info.kind as u8)
                .with("left", clamp(info.left)),
        )
    }

    /// Area chat line, already prefixed with the speaker's name
    pub fn chat(&self, id: BlockId, message: &str) -> Result<Vec<u8>, ProtocolError> {
        encode(
            &NOTIFY_CHAT,
            &FieldValues::new().with("id", id).with("message", message),
        )
    }

    /// Echo of the speaker's own chat line
    pub fn self_chat(&self, message: &str) -> Result<Vec<u8>, ProtocolError> {
        encode(
            &NOTIFY_SELF_CHAT,
            &FieldValues::new().with("message", message),
        )
    }

    pub fn change_dir(&self, id: BlockId, head_dir: u8, dir: u8) -> Result<Vec<u8>, ProtocolError> {
        encode(
            &CHANGE_DIR,
            &FieldValues::new()
                .with("id", id)
                .with("head_dir", head_dir as i16)
                .with("dir", dir),
        )
    }

    pub fn emotion(&self, id: BlockId, kind: u8) -> Result<Vec<u8>, ProtocolError> {
        encode(
            &EMOTION,
            &FieldValues::new().with("id", id).with("kind", kind),
        )
    }

    pub fn quit_ack(&self, result: u16) -> Result<Vec<u8>, ProtocolError> {
        encode(&QUIT_ACK, &FieldValues::new().with("result", result))
    }
}

fn wire_id(id: BlockId, negate: bool) -> u32 {
    if negate {
        (id as i32).wrapping_neg() as u32
    } else {
        id
    }
}

fn unit_values(entity: &Entity, id: u32, tick: u32) -> FieldValues {
    let (guild_id, state) = match entity.as_player() {
        Some(p) => (
            p.guild_id.unwrap_or(0),
            if p.dead {
                1u8
            } else if p.sitting {
                2
            } else {
                0
            },
        ),
        None => (0, 0),
    };
    let (from, to) = match entity.motion {
        Motion::Walking { from, to, .. } => (from, to),
        Motion::Idle => ((entity.pos.x, entity.pos.y), (entity.pos.x, entity.pos.y)),
    };

    FieldValues::new()
        .with("object_type", entity.kind().object_type())
        .with("id", id)
        .with("speed", entity.speed as i64)
        .with("body_state", 0i16)
        .with("health_state", 0i16)
        .with("effect_state", entity.option.bits() as i64)
        .with("job", entity.rendered_class() as i64)
        .with("head", entity.view.head as i64)
        .with("weapon", entity.view.weapon as i64)
        .with("move_start_time", tick)
        .with("head_dir", entity.view.head_dir as i16)
        .with("guild_id", guild_id)
        .with("emblem_ver", 0i16)
        .with("sex", entity.view.sex)
        .with(
            "pos",
            PackedPos::new(entity.pos.x as u16, entity.pos.y as u16, entity.dir),
        )
        .with(
            "move",
            PackedMove::new((from.0 as u16, from.1 as u16), (to.0 as u16, to.1 as u16)),
        )
        .with("x_size", UNIT_SIZE)
        .with("y_size", UNIT_SIZE)
        .with("state", state)
        .with("level", entity.level() as i64)
}

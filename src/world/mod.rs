//! World model
//!
//! Entities are the things a client can see on a map: players, monsters,
//! NPCs, companions, floor items, skill units and chat rooms. The protocol
//! core only needs their identity, position and what they look like; game
//! rules live elsewhere.

pub mod collab;
pub mod map;

use bitflags::bitflags;

pub use collab::{GroupKind, Membership, SpatialIndex, World};
pub use map::WorldMap;

/// Unique id of anything placed in the world
pub type BlockId = u32;

/// Map index
pub type MapId = u16;

/// View class of entities the client must never draw
pub const INVISIBLE_CLASS: u16 = 32767;

bitflags! {
    /// Status options shown on a unit
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusOption: u32 {
        const SIGHT = 0x0001;
        const HIDE = 0x0002;
        const CLOAK = 0x0004;
        const FALCON = 0x0010;
        const RIDING = 0x0020;
        /// Hidden from everyone who lacks the permission to see hidden units
        const INVISIBLE = 0x0040;
        const ORCISH = 0x0800;
        const CHASEWALK = 0x4000;
    }
}

bitflags! {
    /// Entity kinds selected by a spatial query
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KindMask: u16 {
        const PLAYER = 1 << 0;
        const MONSTER = 1 << 1;
        const NPC = 1 << 2;
        const PET = 1 << 3;
        const HOMUNCULUS = 1 << 4;
        const MERCENARY = 1 << 5;
        const ELEMENTAL = 1 << 6;
        const ITEM = 1 << 7;
        const SKILL_UNIT = 1 << 8;
        const CHAT = 1 << 9;
        const ALL = 0x03ff;
    }
}

/// Position on a map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Position {
    pub map: MapId,
    pub x: i16,
    pub y: i16,
}

impl Position {
    pub fn new(map: MapId, x: i16, y: i16) -> Self {
        Self { map, x, y }
    }

    /// Square-area check used by every area broadcast
    pub fn within(&self, other: &Position, radius: i16) -> bool {
        self.map == other.map
            && (self.x as i32 - other.x as i32).abs() <= radius as i32
            && (self.y as i32 - other.y as i32).abs() <= radius as i32
    }
}

/// How an entity is drawn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewData {
    pub class: u16,
    pub head: u16,
    pub weapon: u32,
    pub head_dir: u8,
    pub sex: u8,
}

/// Current motion of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Motion {
    #[default]
    Idle,
    Walking {
        from: (i16, i16),
        to: (i16, i16),
        started_at: u32,
    },
}

/// Kind tag of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Player,
    Monster,
    Npc,
    Pet,
    Homunculus,
    Mercenary,
    Elemental,
    Item,
    SkillUnit,
    Chat,
}

impl EntityKind {
    pub fn mask(self) -> KindMask {
        match self {
            EntityKind::Player => KindMask::PLAYER,
            EntityKind::Monster => KindMask::MONSTER,
            EntityKind::Npc => KindMask::NPC,
            EntityKind::Pet => KindMask::PET,
            EntityKind::Homunculus => KindMask::HOMUNCULUS,
            EntityKind::Mercenary => KindMask::MERCENARY,
            EntityKind::Elemental => KindMask::ELEMENTAL,
            EntityKind::Item => KindMask::ITEM,
            EntityKind::SkillUnit => KindMask::SKILL_UNIT,
            EntityKind::Chat => KindMask::CHAT,
        }
    }

    /// Object type byte carried by unit packets
    pub fn object_type(self) -> u8 {
        match self {
            EntityKind::Player => 0x0,
            EntityKind::Item => 0x2,
            EntityKind::SkillUnit => 0x3,
            EntityKind::Chat => 0x4,
            EntityKind::Monster => 0x5,
            EntityKind::Npc => 0x6,
            EntityKind::Pet => 0x7,
            EntityKind::Homunculus => 0x8,
            EntityKind::Mercenary => 0x9,
            EntityKind::Elemental => 0xa,
        }
    }
}

/// Player-specific state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerData {
    pub name: String,
    pub account_id: u32,
    pub char_id: u32,
    pub level: u16,
    pub party_id: Option<u32>,
    pub guild_id: Option<u32>,
    pub battleground_id: Option<u32>,
    pub clan_id: Option<u32>,
    pub duel_id: Option<u32>,
    /// Chat room the player currently sits in
    pub chat_id: Option<BlockId>,
    pub faction: Option<u32>,
    /// May see units hidden with `StatusOption::INVISIBLE`
    pub see_hidden: bool,
    /// Sees hostile units through stealth (clairvoyance, intravision)
    pub see_stealth: bool,
    /// View class shown to others while disguised
    pub disguise: Option<u16>,
    pub dead: bool,
    pub sitting: bool,
    /// False until the client has loaded the map
    pub placed: bool,
}

impl PlayerData {
    pub fn group(&self, kind: GroupKind) -> Option<u32> {
        match kind {
            GroupKind::Party => self.party_id,
            GroupKind::Guild => self.guild_id,
            GroupKind::Battleground => self.battleground_id,
            GroupKind::Clan => self.clan_id,
            GroupKind::Duel => self.duel_id,
        }
    }

    pub fn group_mut(&mut self, kind: GroupKind) -> &mut Option<u32> {
        match kind {
            GroupKind::Party => &mut self.party_id,
            GroupKind::Guild => &mut self.guild_id,
            GroupKind::Battleground => &mut self.battleground_id,
            GroupKind::Clan => &mut self.clan_id,
            GroupKind::Duel => &mut self.duel_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonsterData {
    pub level: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NpcData {
    pub name: String,
    pub chat_id: Option<BlockId>,
}

/// Pets, homunculi, mercenaries and elementals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompanionData {
    pub owner: BlockId,
    pub level: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemData {
    pub item_id: u16,
    pub amount: u16,
    pub identified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkillUnitData {
    pub owner: BlockId,
    pub unit_id: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatData {
    pub owner: BlockId,
    pub title: String,
    pub limit: u16,
    pub public: bool,
    pub members: Vec<BlockId>,
}

/// Variant payload of an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityData {
    Player(PlayerData),
    Monster(MonsterData),
    Npc(NpcData),
    Pet(CompanionData),
    Homunculus(CompanionData),
    Mercenary(CompanionData),
    Elemental(CompanionData),
    Item(ItemData),
    SkillUnit(SkillUnitData),
    Chat(ChatData),
}

/// Anything placed in the world
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: BlockId,
    pub pos: Position,
    pub dir: u8,
    pub speed: u16,
    pub option: StatusOption,
    pub view: ViewData,
    pub motion: Motion,
    pub data: EntityData,
}

impl Entity {
    pub fn new(id: BlockId, pos: Position, data: EntityData) -> Self {
        Self {
            id,
            pos,
            dir: 0,
            speed: 150,
            option: StatusOption::empty(),
            view: ViewData::default(),
            motion: Motion::Idle,
            data,
        }
    }

    /// A player with default appearance
    pub fn player(id: BlockId, name: &str, pos: Position) -> Self {
        Self::new(
            id,
            pos,
            EntityData::Player(PlayerData {
                name: name.to_string(),
                account_id: id,
                level: 1,
                placed: true,
                ..Default::default()
            }),
        )
    }

    pub fn kind(&self) -> EntityKind {
        match &self.data {
            EntityData::Player(_) => EntityKind::Player,
            EntityData::Monster(_) => EntityKind::Monster,
            EntityData::Npc(_) => EntityKind::Npc,
            EntityData::Pet(_) => EntityKind::Pet,
            EntityData::Homunculus(_) => EntityKind::Homunculus,
            EntityData::Mercenary(_) => EntityKind::Mercenary,
            EntityData::Elemental(_) => EntityKind::Elemental,
            EntityData::Item(_) => EntityKind::Item,
            EntityData::SkillUnit(_) => EntityKind::SkillUnit,
            EntityData::Chat(_) => EntityKind::Chat,
        }
    }

    pub fn is_player(&self) -> bool {
        matches!(self.data, EntityData::Player(_))
    }

    pub fn as_player(&self) -> Option<&PlayerData> {
        match &self.data {
            EntityData::Player(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_player_mut(&mut self) -> Option<&mut PlayerData> {
        match &mut self.data {
            EntityData::Player(p) => Some(p),
            _ => None,
        }
    }

    /// Hidden from observers without the see-hidden permission
    pub fn is_gm_hidden(&self) -> bool {
        self.option.contains(StatusOption::INVISIBLE)
    }

    /// Chat room this entity is attached to, if any
    pub fn chat_id(&self) -> Option<BlockId> {
        match &self.data {
            EntityData::Player(p) => p.chat_id,
            EntityData::Npc(n) => n.chat_id,
            EntityData::Chat(_) => Some(self.id),
            _ => None,
        }
    }

    /// View class other clients draw
    pub fn rendered_class(&self) -> u16 {
        match &self.data {
            EntityData::Player(PlayerData {
                disguise: Some(class),
                ..
            }) => *class,
            _ => self.view.class,
        }
    }

    pub fn is_disguised(&self) -> bool {
        matches!(
            self.data,
            EntityData::Player(PlayerData {
                disguise: Some(_),
                ..
            })
        )
    }

    pub fn level(&self) -> u16 {
        match &self.data {
            EntityData::Player(p) => p.level,
            EntityData::Monster(m) => m.level,
            EntityData::Pet(c)
            | EntityData::Homunculus(c)
            | EntityData::Mercenary(c)
            | EntityData::Elemental(c) => c.level,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_is_square() {
        let center = Position::new(1, 10, 10);
        assert!(Position::new(1, 24, 24).within(&center, 14));
        assert!(!Position::new(1, 25, 10).within(&center, 14));
        assert!(!Position::new(2, 10, 10).within(&center, 14));
    }

    #[test]
    fn test_rendered_class_follows_disguise() {
        let mut e = Entity::player(1, "Alice", Position::new(1, 5, 5));
        e.view.class = 4;
        assert_eq!(e.rendered_class(), 4);
        assert!(!e.is_disguised());

        if let Some(p) = e.as_player_mut() {
            p.disguise = Some(1002);
        }
        assert_eq!(e.rendered_class(), 1002);
        assert!(e.is_disguised());
    }

    #[test]
    fn test_kind_mask() {
        let e = Entity::new(
            5,
            Position::default(),
            EntityData::Item(ItemData::default()),
        );
        assert_eq!(e.kind(), EntityKind::Item);
        assert!(KindMask::ALL.contains(e.kind().mask()));
        assert_eq!(e.chat_id(), None);
    }
}

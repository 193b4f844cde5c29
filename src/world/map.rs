//! In-memory world
//!
//! `WorldMap` stores every placed entity and the group rosters, and answers
//! the spatial and membership queries of the protocol core.

use std::collections::HashMap;

use tracing::debug;

use crate::world::collab::{GroupKind, Membership, SpatialIndex};
use crate::world::{BlockId, ChatData, Entity, EntityData, KindMask, MapId, Position};

/// First id handed out to non-player entities
pub const FIRST_UNIT_ID: BlockId = 110_000_000;

/// Entity store with group and chat rosters
///
/// Players that have not finished loading the map are stored but left out
/// of spatial queries.
#[derive(Debug)]
pub struct WorldMap {
    entities: HashMap<BlockId, Entity>,
    groups: HashMap<(GroupKind, u32), Vec<BlockId>>,
    next_unit_id: BlockId,
}

impl WorldMap {
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
            groups: HashMap::new(),
            next_unit_id: FIRST_UNIT_ID,
        }
    }

    /// Allocate an id for a non-player entity
    pub fn allocate_id(&mut self) -> BlockId {
        let id = self.next_unit_id;
        self.next_unit_id = self.next_unit_id.wrapping_add(1);
        id
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn get(&self, id: BlockId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// Place an entity, replacing any previous entity with the same id
    pub fn insert(&mut self, entity: Entity) -> Option<Entity> {
        debug!(id = entity.id, kind = ?entity.kind(), map = entity.pos.map, "Entity placed");
        self.entities.insert(entity.id, entity)
    }

    /// Remove an entity and drop it from every roster
    pub fn remove(&mut self, id: BlockId) -> Option<Entity> {
        let entity = self.entities.remove(&id)?;
        for members in self.groups.values_mut() {
            members.retain(|m| *m != id);
        }
        self.groups.retain(|_, members| !members.is_empty());
        if let Some(chat_id) = entity.chat_id().filter(|c| *c != id) {
            self.remove_chat_member(chat_id, id);
        }
        if let EntityData::Chat(chat) = &entity.data {
            for member in &chat.members {
                match self.entities.get_mut(member).map(|e| &mut e.data) {
                    Some(EntityData::Player(p)) => p.chat_id = None,
                    Some(EntityData::Npc(n)) => n.chat_id = None,
                    _ => {}
                }
            }
        }
        debug!(id, "Entity removed");
        Some(entity)
    }

    /// Move an entity to a new cell on its map
    pub fn move_to(&mut self, id: BlockId, x: i16, y: i16) -> bool {
        match self.entities.get_mut(&id) {
            Some(entity) => {
                entity.pos.x = x;
                entity.pos.y = y;
                true
            }
            None => false,
        }
    }

    /// Add a player to a group roster
    pub fn join_group(&mut self, kind: GroupKind, group_id: u32, player: BlockId) -> bool {
        let Some(data) = self.entities.get_mut(&player).and_then(|e| e.as_player_mut()) else {
            return false;
        };
        let previous = data.group_mut(kind).replace(group_id);
        if let Some(old) = previous.filter(|old| *old != group_id) {
            if let Some(members) = self.groups.get_mut(&(kind, old)) {
                members.retain(|m| *m != player);
            }
        }
        let members = self.groups.entry((kind, group_id)).or_default();
        if !members.contains(&player) {
            members.push(player);
        }
        true
    }

    /// Remove a player from its group of `kind`
    pub fn leave_group(&mut self, kind: GroupKind, player: BlockId) -> Option<u32> {
        let data = self.entities.get_mut(&player)?.as_player_mut()?;
        let group_id = data.group_mut(kind).take()?;
        if let Some(members) = self.groups.get_mut(&(kind, group_id)) {
            members.retain(|m| *m != player);
            if members.is_empty() {
                self.groups.remove(&(kind, group_id));
            }
        }
        Some(group_id)
    }

    /// Open a chat room owned by `owner`, placed on the owner's cell
    pub fn open_chat(&mut self, owner: BlockId, title: &str, limit: u16) -> Option<BlockId> {
        let pos = self.entities.get(&owner)?.pos;
        let chat_id = self.allocate_id();
        let chat = Entity::new(
            chat_id,
            pos,
            EntityData::Chat(ChatData {
                owner,
                title: title.to_string(),
                limit,
                public: true,
                members: Vec::new(),
            }),
        );
        self.entities.insert(chat_id, chat);
        if self.join_chat(chat_id, owner) {
            Some(chat_id)
        } else {
            self.entities.remove(&chat_id);
            None
        }
    }

    /// Seat a player or NPC in a chat room
    pub fn join_chat(&mut self, chat_id: BlockId, member: BlockId) -> bool {
        let accepted = match self.entities.get_mut(&chat_id).map(|e| &mut e.data) {
            Some(EntityData::Chat(chat)) => {
                if !chat.members.contains(&member) {
                    chat.members.push(member);
                }
                true
            }
            _ => false,
        };
        if !accepted {
            return false;
        }
        match self.entities.get_mut(&member).map(|e| &mut e.data) {
            Some(EntityData::Player(p)) => p.chat_id = Some(chat_id),
            Some(EntityData::Npc(n)) => n.chat_id = Some(chat_id),
            _ => {
                self.remove_chat_member(chat_id, member);
                return false;
            }
        }
        true
    }

    /// Take a member out of its chat room
    pub fn leave_chat(&mut self, member: BlockId) -> Option<BlockId> {
        let chat_id = match self.entities.get_mut(&member).map(|e| &mut e.data) {
            Some(EntityData::Player(p)) => p.chat_id.take(),
            Some(EntityData::Npc(n)) => n.chat_id.take(),
            _ => None,
        }?;
        self.remove_chat_member(chat_id, member);
        Some(chat_id)
    }

    fn remove_chat_member(&mut self, chat_id: BlockId, member: BlockId) {
        if let Some(EntityData::Chat(chat)) = self.entities.get_mut(&chat_id).map(|e| &mut e.data) {
            chat.members.retain(|m| *m != member);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }
}

impl Default for WorldMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialIndex for WorldMap {
    fn entity(&self, id: BlockId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    fn entities_in_box(
        &self,
        map: MapId,
        x0: i16,
        y0: i16,
        x1: i16,
        y1: i16,
        kinds: KindMask,
    ) -> Vec<&Entity> {
        let mut found: Vec<&Entity> = self
            .entities
            .values()
            .filter(|e| {
                e.pos.map == map
                    && (x0..=x1).contains(&e.pos.x)
                    && (y0..=y1).contains(&e.pos.y)
                    && kinds.contains(e.kind().mask())
                    && e.as_player().map_or(true, |p| p.placed)
            })
            .collect();
        found.sort_by_key(|e| e.id);
        found
    }
}

impl Membership for WorldMap {
    fn members(&self, kind: GroupKind, group_id: u32) -> Vec<BlockId> {
        self.groups
            .get(&(kind, group_id))
            .cloned()
            .unwrap_or_default()
    }

    fn chat_members(&self, chat_id: BlockId) -> Vec<BlockId> {
        match self.entities.get(&chat_id).map(|e| &e.data) {
            Some(EntityData::Chat(chat)) => chat.members.clone(),
            _ => Vec::new(),
        }
    }

    fn is_hostile(&self, a: &Entity, b: &Entity) -> bool {
        let faction = |e: &Entity| e.as_player().and_then(|p| p.faction);
        match (faction(a), faction(b)) {
            (Some(fa), Some(fb)) => fa != fb,
            _ => false,
        }
    }
}

/// Position helper for tests and the binary
pub fn cell(map: MapId, x: i16, y: i16) -> Position {
    Position::new(map, x, y)
}

//! Collaborator interfaces the protocol core consumes
//!
//! The router and the visibility engine never own world state. They ask a
//! spatial index for entities near a point and a membership provider for
//! group rosters and hostility.

use crate::world::{BlockId, Entity, KindMask, MapId, Position};

/// Group rosters a player can belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    Party,
    Guild,
    Battleground,
    Clan,
    Duel,
}

/// Spatial queries over placed entities
pub trait SpatialIndex {
    fn entity(&self, id: BlockId) -> Option<&Entity>;

    /// Entities inside the inclusive box, in ascending id order
    fn entities_in_box(
        &self,
        map: MapId,
        x0: i16,
        y0: i16,
        x1: i16,
        y1: i16,
        kinds: KindMask,
    ) -> Vec<&Entity>;

    /// Entities within `radius` cells of `center`
    fn entities_around(&self, center: &Position, radius: i16, kinds: KindMask) -> Vec<&Entity> {
        self.entities_in_box(
            center.map,
            center.x.saturating_sub(radius),
            center.y.saturating_sub(radius),
            center.x.saturating_add(radius),
            center.y.saturating_add(radius),
            kinds,
        )
    }
}

/// Group and chat rosters plus hostility
pub trait Membership {
    /// Ordered members of a group
    fn members(&self, kind: GroupKind, group_id: u32) -> Vec<BlockId>;

    /// Ordered members of a chat room
    fn chat_members(&self, chat_id: BlockId) -> Vec<BlockId>;

    fn is_hostile(&self, a: &Entity, b: &Entity) -> bool;

    /// Roster of the group `entity` belongs to
    fn group_of(&self, entity: &Entity, kind: GroupKind) -> Option<Vec<BlockId>> {
        let group_id = entity.as_player()?.group(kind)?;
        Some(self.members(kind, group_id))
    }

    /// Roster of the chat room `entity` is attached to
    fn chat_of(&self, entity: &Entity) -> Option<Vec<BlockId>> {
        entity.chat_id().map(|chat_id| self.chat_members(chat_id))
    }
}

/// Everything the router and visibility engine need from the world
pub trait World: SpatialIndex + Membership {}

impl<T: SpatialIndex + Membership + ?Sized> World for T {}

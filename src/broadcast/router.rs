//! Broadcast router
//!
//! `Router::send` is the single path every outgoing packet takes. It turns a
//! `(origin, target)` pair into an ordered, duplicate-free list of sessions,
//! then copies the payload into each one. A failing recipient never stops
//! delivery to the rest; the first failure is reported once all are tried.

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};

use tracing::{error, trace, warn};

use crate::broadcast::target::SendTarget;
use crate::broadcast::AreaConfig;
use crate::error::RouterError;
use crate::net::buffer::MAX_PACKET_SIZE;
use crate::net::session::{SessionId, SessionTable};
use crate::world::{BlockId, Entity, EntityData, GroupKind, KindMask, World};

/// Where group members must be to receive a group-scoped packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupScope {
    Everywhere,
    SameMap,
    Area,
}

/// Multicast router
#[derive(Debug, Clone)]
pub struct Router {
    areas: AreaConfig,
    ally_only: bool,
}

impl Router {
    pub fn new(areas: AreaConfig) -> Self {
        Self {
            areas,
            ally_only: false,
        }
    }

    pub fn areas(&self) -> &AreaConfig {
        &self.areas
    }

    pub fn ally_only(&self) -> bool {
        self.ally_only
    }

    /// Hide area packets from hostile players until the returned scope drops
    pub fn ally_only_scope(&mut self) -> AllyOnlyScope<'_> {
        let previous = self.ally_only;
        self.ally_only = true;
        AllyOnlyScope {
            router: self,
            previous,
        }
    }

    /// Deliver `payload` to every session selected by `target`
    ///
    /// Returns the number of sessions the payload reached.
    pub fn send<W: World + ?Sized>(
        &self,
        world: &W,
        sessions: &mut SessionTable,
        payload: &[u8],
        origin: Option<&Entity>,
        target: SendTarget,
    ) -> Result<usize, RouterError> {
        if payload.is_empty() || payload.len() > MAX_PACKET_SIZE {
            warn!(len = payload.len(), ?target, "Refusing to route invalid payload");
            return Err(RouterError::InvalidPayload(payload.len()));
        }

        let recipients = self.recipients(world, sessions, origin, target)?;
        trace!(
            ?target,
            origin = origin.map(|o| o.id),
            recipients = recipients.len(),
            len = payload.len(),
            "Routing packet"
        );

        let mut delivered = 0;
        let mut first_failure = None;
        for session_id in recipients {
            let Some(session) = sessions.get_mut(session_id) else {
                continue;
            };
            match session.send(payload) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(session_id, error = %e, "Delivery failed");
                    first_failure.get_or_insert(RouterError::Delivery {
                        session_id,
                        source: e,
                    });
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(delivered),
        }
    }

    /// `send` for a target given by its wire code
    pub fn send_code<W: World + ?Sized>(
        &self,
        world: &W,
        sessions: &mut SessionTable,
        payload: &[u8],
        origin: Option<&Entity>,
        code: u8,
    ) -> Result<usize, RouterError> {
        let target = SendTarget::try_from(code).map_err(|e| {
            error!(code, "Unknown send target");
            e
        })?;
        self.send(world, sessions, payload, origin, target)
    }

    /// Resolve the ordered set of sessions `target` selects
    pub fn recipients<W: World + ?Sized>(
        &self,
        world: &W,
        sessions: &SessionTable,
        origin: Option<&Entity>,
        target: SendTarget,
    ) -> Result<Vec<SessionId>, RouterError> {
        let Some(origin) = origin else {
            return match target {
                SendTarget::SelfOnly => Ok(Vec::new()),
                _ => Err(RouterError::MissingOrigin),
            };
        };

        let Some(target) = invisibility_override(origin, target) else {
            return Ok(Vec::new());
        };

        let mut out = Recipients::new(sessions);
        match target {
            SendTarget::SelfOnly => {
                if origin.is_player() {
                    out.push_player(origin.id);
                }
            }
            SendTarget::AllClients => {
                for (session_id, _) in sessions.bound() {
                    out.push_session(session_id);
                }
            }
            SendTarget::AllSameMap => {
                for (session_id, player) in sessions.bound() {
                    if world
                        .entity(player)
                        .is_some_and(|p| p.pos.map == origin.pos.map)
                    {
                        out.push_session(session_id);
                    }
                }
            }
            SendTarget::Area
            | SendTarget::AreaWithoutSelf
            | SendTarget::AreaWithoutChat
            | SendTarget::AreaWithoutSameChat
            | SendTarget::AreaChatWithoutChat
            | SendTarget::AreaDead => self.collect_area(world, origin, target, &mut out),
            SendTarget::Chat | SendTarget::ChatWithoutSelf => {
                for member in world.chat_of(origin).unwrap_or_default() {
                    if target.excludes_self() && member == origin.id {
                        continue;
                    }
                    out.push_player(member);
                }
            }
            SendTarget::Party => self.collect_group(world, origin, GroupKind::Party, GroupScope::Everywhere, false, &mut out),
            SendTarget::PartyWithoutSelf => self.collect_group(world, origin, GroupKind::Party, GroupScope::Everywhere, true, &mut out),
            SendTarget::PartySameMap => self.collect_group(world, origin, GroupKind::Party, GroupScope::SameMap, false, &mut out),
            SendTarget::PartySameMapWithoutSelf => self.collect_group(world, origin, GroupKind::Party, GroupScope::SameMap, true, &mut out),
            SendTarget::PartyArea => self.collect_group(world, origin, GroupKind::Party, GroupScope::Area, false, &mut out),
            SendTarget::PartyAreaWithoutSelf => self.collect_group(world, origin, GroupKind::Party, GroupScope::Area, true, &mut out),
            SendTarget::Guild | SendTarget::GuildNoBattleground => self.collect_group(world, origin, GroupKind::Guild, GroupScope::Everywhere, false, &mut out),
            SendTarget::GuildWithoutSelf => self.collect_group(world, origin, GroupKind::Guild, GroupScope::Everywhere, true, &mut out),
            SendTarget::GuildSameMap => self.collect_group(world, origin, GroupKind::Guild, GroupScope::SameMap, false, &mut out),
            SendTarget::GuildSameMapWithoutSelf => self.collect_group(world, origin, GroupKind::Guild, GroupScope::SameMap, true, &mut out),
            SendTarget::GuildArea => self.collect_group(world, origin, GroupKind::Guild, GroupScope::Area, false, &mut out),
            SendTarget::GuildAreaWithoutSelf => self.collect_group(world, origin, GroupKind::Guild, GroupScope::Area, true, &mut out),
            SendTarget::Duel => self.collect_group(world, origin, GroupKind::Duel, GroupScope::Everywhere, false, &mut out),
            SendTarget::DuelWithoutSelf => self.collect_group(world, origin, GroupKind::Duel, GroupScope::Everywhere, true, &mut out),
            SendTarget::Battleground => self.collect_group(world, origin, GroupKind::Battleground, GroupScope::Everywhere, false, &mut out),
            SendTarget::BattlegroundWithoutSelf => self.collect_group(world, origin, GroupKind::Battleground, GroupScope::Everywhere, true, &mut out),
            SendTarget::BattlegroundSameMap => self.collect_group(world, origin, GroupKind::Battleground, GroupScope::SameMap, false, &mut out),
            SendTarget::BattlegroundSameMapWithoutSelf => self.collect_group(world, origin, GroupKind::Battleground, GroupScope::SameMap, true, &mut out),
            SendTarget::BattlegroundArea => self.collect_group(world, origin, GroupKind::Battleground, GroupScope::Area, false, &mut out),
            SendTarget::BattlegroundAreaWithoutSelf => self.collect_group(world, origin, GroupKind::Battleground, GroupScope::Area, true, &mut out),
            SendTarget::Clan => self.collect_group(world, origin, GroupKind::Clan, GroupScope::Everywhere, false, &mut out),
            SendTarget::ClanWithoutSelf => self.collect_group(world, origin, GroupKind::Clan, GroupScope::Everywhere, true, &mut out),
        }

        if target == SendTarget::GuildNoBattleground {
            out.retain_players(|id| {
                world
                    .entity(id)
                    .and_then(|e| e.as_player())
                    .is_some_and(|p| p.battleground_id.is_none())
            });
        }

        Ok(out.finish())
    }

    fn collect_area<W: World + ?Sized>(
        &self,
        world: &W,
        origin: &Entity,
        target: SendTarget,
        out: &mut Recipients<'_>,
    ) {
        let radius = match target {
            SendTarget::AreaChatWithoutChat => self.areas.chat_area_size,
            SendTarget::AreaDead => self.areas.dead_area_size,
            _ => self.areas.area_size,
        };

        let excluded_chat = match target {
            SendTarget::AreaWithoutChat | SendTarget::AreaChatWithoutChat => match &origin.data {
                EntityData::Player(p) => p.chat_id,
                _ => None,
            },
            SendTarget::AreaWithoutSameChat => match &origin.data {
                EntityData::Player(p) => p.chat_id,
                EntityData::Npc(n) => n.chat_id,
                _ => None,
            },
            _ => None,
        };

        for entity in world.entities_around(&origin.pos, radius, KindMask::PLAYER) {
            let Some(player) = entity.as_player() else {
                continue;
            };
            if target.excludes_self() && entity.id == origin.id {
                continue;
            }
            if excluded_chat.is_some() && player.chat_id == excluded_chat {
                continue;
            }
            if self.ally_only
                && entity.id != origin.id
                && !player.see_stealth
                && world.is_hostile(origin, entity)
            {
                continue;
            }
            out.push_player(entity.id);
        }

        // A player still loading its map is not in the index yet
        if matches!(target, SendTarget::Area | SendTarget::AreaWithoutSameChat)
            && origin.as_player().is_some_and(|p| !p.placed)
        {
            out.push_player(origin.id);
        }
    }

    fn collect_group<W: World + ?Sized>(
        &self,
        world: &W,
        origin: &Entity,
        kind: GroupKind,
        scope: GroupScope,
        without_self: bool,
        out: &mut Recipients<'_>,
    ) {
        let Some(members) = world.group_of(origin, kind) else {
            return;
        };
        for member_id in members {
            if without_self && member_id == origin.id {
                continue;
            }
            let Some(member) = world.entity(member_id) else {
                continue;
            };
            let in_scope = match scope {
                GroupScope::Everywhere => true,
                GroupScope::SameMap => member.pos.map == origin.pos.map,
                GroupScope::Area => member.pos.within(&origin.pos, self.areas.area_size),
            };
            if in_scope {
                out.push_player(member_id);
            }
        }
    }
}

/// Downgrade area targets of an invisible player; `None` means send nothing
fn invisibility_override(origin: &Entity, target: SendTarget) -> Option<SendTarget> {
    if !(origin.is_player() && origin.is_gm_hidden()) {
        return Some(target);
    }
    match target {
        SendTarget::Area | SendTarget::Battleground | SendTarget::BattlegroundArea => {
            Some(SendTarget::SelfOnly)
        }
        SendTarget::AreaWithoutSelf
        | SendTarget::BattlegroundWithoutSelf
        | SendTarget::BattlegroundAreaWithoutSelf => None,
        other => Some(other),
    }
}

/// Ordered, duplicate-free recipient list
struct Recipients<'a> {
    sessions: &'a SessionTable,
    seen: HashSet<SessionId>,
    list: Vec<(SessionId, Option<BlockId>)>,
}

impl<'a> Recipients<'a> {
    fn new(sessions: &'a SessionTable) -> Self {
        Self {
            sessions,
            seen: HashSet::new(),
            list: Vec::new(),
        }
    }

    fn push_player(&mut self, player: BlockId) {
        if let Some(session_id) = self.sessions.session_of(player) {
            if self.seen.insert(session_id) {
                self.list.push((session_id, Some(player)));
            }
        }
    }

    fn push_session(&mut self, session_id: SessionId) {
        if self.seen.insert(session_id) {
            let player = self.sessions.get(session_id).and_then(|s| s.player());
            self.list.push((session_id, player));
        }
    }

    fn retain_players(&mut self, keep: impl Fn(BlockId) -> bool) {
        self.list
            .retain(|(_, player)| player.map_or(true, |p| keep(p)));
    }

    fn finish(self) -> Vec<SessionId> {
        self.list.into_iter().map(|(id, _)| id).collect()
    }
}

/// Scoped `ally_only` flag; the previous value comes back on drop
pub struct AllyOnlyScope<'a> {
    router: &'a mut Router,
    previous: bool,
}

impl Deref for AllyOnlyScope<'_> {
    type Target = Router;

    fn deref(&self) -> &Router {
        self.router
    }
}

impl DerefMut for AllyOnlyScope<'_> {
    fn deref_mut(&mut self) -> &mut Router {
        self.router
    }
}

impl Drop for AllyOnlyScope<'_> {
    fn drop(&mut self) {
        self.router.ally_only = self.previous;
    }
}

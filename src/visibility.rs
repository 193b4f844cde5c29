//! Visibility transitions
//!
//! Tracks, for every observing player, which entities its client currently
//! draws. Movement, spawn and despawn events are turned into per-observer
//! appear and disappear packets, each delivered to the observer alone.
//!
//! A pair only changes state through this engine, so calling it again with
//! nothing moved sends nothing.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::broadcast::{Router, SendTarget};
use crate::net::session::SessionTable;
use crate::protocol::builders::{AppearKind, OutboundPackets};
use crate::world::{BlockId, Entity, KindMask, World, INVISIBLE_CLASS};

/// Why an entity left a client's view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClearReason {
    OutOfSight = 0,
    Died = 1,
    LoggedOut = 2,
    Teleported = 3,
    FeignedDeath = 4,
}

/// State of one (observer, observed) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityState {
    Unknown,
    Visible,
}

/// Per-observer visibility snapshots
#[derive(Debug)]
pub struct VisibilityEngine {
    snapshots: HashMap<BlockId, HashSet<BlockId>>,
    packets: Arc<OutboundPackets>,
}

/// Borrowed collaborators of one engine call
struct Outlet<'a, W: World + ?Sized> {
    world: &'a W,
    sessions: &'a mut SessionTable,
    router: &'a Router,
}

impl VisibilityEngine {
    pub fn new(packets: Arc<OutboundPackets>) -> Self {
        Self {
            snapshots: HashMap::new(),
            packets,
        }
    }

    pub fn state(&self, observer: BlockId, observed: BlockId) -> VisibilityState {
        match self.snapshots.get(&observer) {
            Some(set) if set.contains(&observed) => VisibilityState::Visible,
            _ => VisibilityState::Unknown,
        }
    }

    /// Ids the observer's client currently draws, ascending
    pub fn snapshot(&self, observer: BlockId) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self
            .snapshots
            .get(&observer)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// An entity was just placed on a map
    ///
    /// Returns the number of state transitions.
    pub fn spawn<W: World + ?Sized>(
        &mut self,
        world: &W,
        sessions: &mut SessionTable,
        router: &Router,
        id: BlockId,
        tick: u32,
    ) -> usize {
        let mut out = Outlet {
            world,
            sessions,
            router,
        };
        let mut transitions = self.update_observed(&mut out, id, tick, Some(AppearKind::Spawn));
        if let Some(entity) = world.entity(id) {
            if entity.is_disguised() {
                self.deliver_self_appear(&mut out, entity, AppearKind::Spawn, tick);
            }
            if entity.is_player() {
                transitions += self.refresh_with(&mut out, id, tick);
            }
        }
        transitions
    }

    /// An entity changed position or motion
    pub fn moved<W: World + ?Sized>(
        &mut self,
        world: &W,
        sessions: &mut SessionTable,
        router: &Router,
        id: BlockId,
        tick: u32,
    ) -> usize {
        let mut out = Outlet {
            world,
            sessions,
            router,
        };
        let mut transitions = self.update_observed(&mut out, id, tick, None);
        if let Some(entity) = world.entity(id) {
            if entity.is_disguised() {
                self.deliver_self_appear(&mut out, entity, AppearKind::for_motion(&entity.motion), tick);
            }
            if entity.is_player() {
                transitions += self.refresh_with(&mut out, id, tick);
            }
        }
        transitions
    }

    /// Bring one observer's snapshot in line with what is around it
    pub fn refresh_observer<W: World + ?Sized>(
        &mut self,
        world: &W,
        sessions: &mut SessionTable,
        router: &Router,
        observer: BlockId,
        tick: u32,
    ) -> usize {
        let mut out = Outlet {
            world,
            sessions,
            router,
        };
        self.refresh_with(&mut out, observer, tick)
    }

    /// An entity left the world or its map
    ///
    /// `entity` may already be gone from the world. Every observer that drew
    /// it gets a disappear packet with `reason`, and its own snapshot is
    /// dropped.
    pub fn despawn<W: World + ?Sized>(
        &mut self,
        world: &W,
        sessions: &mut SessionTable,
        router: &Router,
        entity: &Entity,
        reason: ClearReason,
    ) -> usize {
        let mut out = Outlet {
            world,
            sessions,
            router,
        };
        let observers = self.observers_of(entity.id);
        for observer_id in &observers {
            self.mark(*observer_id, entity.id, false);
            if let Some(observer) = world.entity(*observer_id) {
                self.deliver_disappear(&mut out, observer, entity, reason);
            }
        }
        if entity.is_disguised() {
            match self.packets.disappear(entity, reason, true) {
                Ok(packet) => deliver(&mut out, entity, &packet),
                Err(e) => warn!(id = entity.id, error = %e, "Failed to build self vanish"),
            }
        }
        self.forget_observer(entity.id);
        observers.len()
    }

    /// Forget everything an observer was shown, without sending anything
    pub fn forget_observer(&mut self, observer: BlockId) {
        self.snapshots.remove(&observer);
    }

    /// Reset every pair involving `observed` to Unknown without sending
    ///
    /// Used after a change that alters who may see an entity, so the next
    /// update evaluates it afresh.
    pub fn forget_observed(&mut self, observed: BlockId) {
        for set in self.snapshots.values_mut() {
            set.remove(&observed);
        }
    }

    fn refresh_with<W: World + ?Sized>(
        &mut self,
        out: &mut Outlet<'_, W>,
        observer_id: BlockId,
        tick: u32,
    ) -> usize {
        let world = out.world;
        let Some(observer) = world.entity(observer_id) else {
            return 0;
        };
        if !observer.is_player() {
            return 0;
        }
        let radius = out.router.areas().area_size;
        let in_range: BTreeSet<BlockId> = world
            .entities_around(&observer.pos, radius, KindMask::ALL)
            .iter()
            .map(|e| e.id)
            .filter(|id| *id != observer_id)
            .collect();

        let mut lost: Vec<BlockId> = self
            .snapshots
            .get(&observer_id)
            .map(|set| set.iter().copied().filter(|id| !in_range.contains(id)).collect())
            .unwrap_or_default();
        lost.sort_unstable();

        let mut transitions = 0;
        for id in lost {
            self.mark(observer_id, id, false);
            transitions += 1;
            if let Some(observed) = world.entity(id) {
                self.deliver_disappear(out, observer, observed, ClearReason::OutOfSight);
            }
        }
        for id in in_range {
            if !self.mark(observer_id, id, true) {
                continue;
            }
            transitions += 1;
            if let Some(observed) = world.entity(id) {
                let kind = AppearKind::for_motion(&observed.motion);
                self.deliver_appear(out, observer, observed, kind, tick);
            }
        }
        if transitions > 0 {
            trace!(observer = observer_id, transitions, "Observer refreshed");
        }
        transitions
    }

    /// Re-evaluate every observer of `id` against its current position
    fn update_observed<W: World + ?Sized>(
        &mut self,
        out: &mut Outlet<'_, W>,
        id: BlockId,
        tick: u32,
        kind: Option<AppearKind>,
    ) -> usize {
        let world = out.world;
        let Some(entity) = world.entity(id) else {
            return 0;
        };
        let radius = out.router.areas().area_size;
        let observers: Vec<&Entity> = world
            .entities_around(&entity.pos, radius, KindMask::PLAYER)
            .into_iter()
            .filter(|o| o.id != id)
            .collect();
        let in_range: HashSet<BlockId> = observers.iter().map(|o| o.id).collect();
        let kind = kind.unwrap_or_else(|| AppearKind::for_motion(&entity.motion));

        let mut transitions = 0;
        for observer in observers {
            if self.mark(observer.id, id, true) {
                transitions += 1;
                self.deliver_appear(out, observer, entity, kind, tick);
            }
        }

        let lost: Vec<BlockId> = self
            .observers_of(id)
            .into_iter()
            .filter(|o| !in_range.contains(o))
            .collect();
        for observer_id in lost {
            self.mark(observer_id, id, false);
            transitions += 1;
            if let Some(observer) = world.entity(observer_id) {
                self.deliver_disappear(out, observer, entity, ClearReason::OutOfSight);
            }
        }
        transitions
    }

    /// Observers currently drawing `observed`, ascending
    fn observers_of(&self, observed: BlockId) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self
            .snapshots
            .iter()
            .filter(|(_, set)| set.contains(&observed))
            .map(|(observer, _)| *observer)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Set a pair's state, returning whether it changed
    fn mark(&mut self, observer: BlockId, observed: BlockId, visible: bool) -> bool {
        if visible {
            self.snapshots.entry(observer).or_default().insert(observed)
        } else {
            let Some(set) = self.snapshots.get_mut(&observer) else {
                return false;
            };
            let removed = set.remove(&observed);
            if set.is_empty() {
                self.snapshots.remove(&observer);
            }
            removed
        }
    }

    fn deliver_appear<W: World + ?Sized>(
        &self,
        out: &mut Outlet<'_, W>,
        observer: &Entity,
        observed: &Entity,
        kind: AppearKind,
        tick: u32,
    ) {
        if appear_suppressed(observer, observed) {
            trace!(observer = observer.id, observed = observed.id, "Appear suppressed");
            return;
        }
        match self.packets.appear(observed, kind, tick, false) {
            Ok(packet) => deliver(out, observer, &packet),
            Err(e) => warn!(observed = observed.id, error = %e, "Failed to build appear packet"),
        }
    }

    fn deliver_disappear<W: World + ?Sized>(
        &self,
        out: &mut Outlet<'_, W>,
        observer: &Entity,
        observed: &Entity,
        reason: ClearReason,
    ) {
        if disappear_suppressed(observer, observed, reason) {
            trace!(observer = observer.id, observed = observed.id, ?reason, "Disappear suppressed");
            return;
        }
        match self.packets.disappear(observed, reason, false) {
            Ok(packet) => deliver(out, observer, &packet),
            Err(e) => warn!(observed = observed.id, error = %e, "Failed to build disappear packet"),
        }
    }

    /// Show a disguised player its own body under its negated id
    fn deliver_self_appear<W: World + ?Sized>(
        &self,
        out: &mut Outlet<'_, W>,
        entity: &Entity,
        kind: AppearKind,
        tick: u32,
    ) {
        match self.packets.appear(entity, kind, tick, true) {
            Ok(packet) => deliver(out, entity, &packet),
            Err(e) => warn!(id = entity.id, error = %e, "Failed to build self appear"),
        }
    }
}

fn sees_hidden(observer: &Entity) -> bool {
    observer.as_player().is_some_and(|p| p.see_hidden)
}

fn appear_suppressed(observer: &Entity, observed: &Entity) -> bool {
    observed.rendered_class() == INVISIBLE_CLASS
        || (observed.is_gm_hidden() && !sees_hidden(observer))
}

/// Out-of-sight departures of hidden units still go out so no stale body is
/// left on the client
fn disappear_suppressed(observer: &Entity, observed: &Entity, reason: ClearReason) -> bool {
    observed.rendered_class() == INVISIBLE_CLASS
        || (observed.is_gm_hidden()
            && reason != ClearReason::OutOfSight
            && !sees_hidden(observer))
}

fn deliver<W: World + ?Sized>(out: &mut Outlet<'_, W>, observer: &Entity, packet: &[u8]) {
    if let Err(e) = out.router.send(
        out.world,
        out.sessions,
        packet,
        Some(observer),
        SendTarget::SelfOnly,
    ) {
        warn!(observer = observer.id, error = %e, "Visibility packet not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::AreaConfig;
    use crate::crypto::PacketKeys;
    use crate::net::session::{RecordingOutbound, Session, SessionId};
    use crate::protocol::obfuscation::ObfuscationMode;
    use crate::protocol::version::PacketVersion;
    use crate::world::{EntityData, ItemData, Position, StatusOption, WorldMap};
    use pretty_assertions::assert_eq;

    const VANISH: u16 = 0x0080;
    const IDLE: u16 = 0x0857;
    const SPAWN: u16 = 0x0858;

    struct Fixture {
        world: WorldMap,
        sessions: SessionTable,
        router: Router,
        engine: VisibilityEngine,
        sinks: HashMap<BlockId, RecordingOutbound>,
    }

    impl Fixture {
        fn new() -> Self {
            let packets = OutboundPackets::resolve(PacketVersion(20120410)).unwrap();
            Self {
                world: WorldMap::new(),
                sessions: SessionTable::new(16),
                router: Router::new(AreaConfig::default()),
                engine: VisibilityEngine::new(Arc::new(packets)),
                sinks: HashMap::new(),
            }
        }

        fn player(&mut self, id: BlockId, x: i16, y: i16) {
            self.world
                .insert(Entity::player(id, "p", Position::new(1, x, y)));
            let sink = RecordingOutbound::new();
            self.sinks.insert(id, sink.clone());
            let session = Session::new(
                id as SessionId,
                Box::new(sink),
                ObfuscationMode::Disabled,
                PacketKeys::new(1, 2, 3),
            );
            self.sessions.insert(session).unwrap();
            self.sessions.bind(id as SessionId, id);
        }

        fn spawn(&mut self, id: BlockId) -> usize {
            self.engine
                .spawn(&self.world, &mut self.sessions, &self.router, id, 100)
        }

        fn moved(&mut self, id: BlockId) -> usize {
            self.engine
                .moved(&self.world, &mut self.sessions, &self.router, id, 200)
        }

        fn refresh(&mut self, id: BlockId) -> usize {
            self.engine
                .refresh_observer(&self.world, &mut self.sessions, &self.router, id, 300)
        }

        fn opcodes(&self, id: BlockId) -> Vec<u16> {
            self.sinks[&id].opcodes()
        }

        fn clear(&self) {
            for sink in self.sinks.values() {
                sink.clear();
            }
        }
    }

    #[test]
    fn test_spawn_shows_both_ways() {
        let mut f = Fixture::new();
        f.player(1, 10, 10);
        f.spawn(1);
        f.player(2, 12, 10);
        f.spawn(2);

        assert_eq!(f.engine.state(1, 2), VisibilityState::Visible);
        assert_eq!(f.engine.state(2, 1), VisibilityState::Visible);
        // 1 sees 2 spawn; 2 sees 1 standing
        assert_eq!(f.opcodes(1), vec![SPAWN]);
        assert_eq!(f.opcodes(2), vec![IDLE]);
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let mut f = Fixture::new();
        f.player(1, 10, 10);
        f.player(2, 12, 10);
        assert_eq!(f.refresh(1), 1);
        assert_eq!(f.opcodes(1), vec![IDLE]);

        assert_eq!(f.refresh(1), 0);
        assert_eq!(f.opcodes(1), vec![IDLE]);
        assert_eq!(f.engine.snapshot(1), vec![2]);
    }

    #[test]
    fn test_walking_out_of_sight() {
        let mut f = Fixture::new();
        f.player(1, 10, 10);
        f.player(2, 12, 10);
        f.spawn(1);
        f.spawn(2);
        f.clear();

        f.world.move_to(2, 100, 100);
        assert_eq!(f.moved(2), 2);
        assert_eq!(f.engine.state(1, 2), VisibilityState::Unknown);
        assert_eq!(f.engine.state(2, 1), VisibilityState::Unknown);
        assert_eq!(f.opcodes(1), vec![VANISH]);
        assert_eq!(f.opcodes(2), vec![VANISH]);
        assert_eq!(f.sinks[&1].sent()[0][6], ClearReason::OutOfSight as u8);
    }

    #[test]
    fn test_despawn_reason() {
        let mut f = Fixture::new();
        f.player(1, 10, 10);
        f.player(2, 12, 10);
        f.spawn(1);
        f.spawn(2);
        f.clear();

        let gone = f.world.remove(2).unwrap();
        let n = f
            .engine
            .despawn(&f.world, &mut f.sessions, &f.router, &gone, ClearReason::LoggedOut);
        assert_eq!(n, 1);
        let sent = f.sinks[&1].sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].as_ref(), &[0x80, 0x00, 2, 0, 0, 0, ClearReason::LoggedOut as u8]);
        assert!(f.engine.snapshot(2).is_empty());
    }

    #[test]
    fn test_invisible_class_never_shown() {
        let mut f = Fixture::new();
        f.player(1, 10, 10);
        f.player(2, 12, 10);
        f.world.get_mut(2).unwrap().view.class = INVISIBLE_CLASS;

        assert_eq!(f.refresh(1), 1);
        assert_eq!(f.engine.state(1, 2), VisibilityState::Visible);
        assert!(f.opcodes(1).is_empty());

        f.world.move_to(2, 100, 100);
        f.moved(2);
        assert!(f.opcodes(1).is_empty());
    }

    #[test]
    fn test_gm_hidden() {
        let mut f = Fixture::new();
        f.player(1, 10, 10);
        f.player(2, 12, 10);
        f.player(3, 11, 10);
        f.world.get_mut(2).unwrap().option |= StatusOption::INVISIBLE;
        f.world.get_mut(3).unwrap().as_player_mut().unwrap().see_hidden = true;
        f.refresh(1);
        f.refresh(3);
        // Player 1 only ever sees player 3
        assert_eq!(f.opcodes(1), vec![IDLE]);
        assert_eq!(f.opcodes(3), vec![IDLE, IDLE]);
        assert_eq!(f.engine.state(1, 2), VisibilityState::Visible);
        f.clear();

        // Leaving sight still clears the body
        f.world.move_to(2, 100, 100);
        f.moved(2);
        assert_eq!(f.opcodes(1), vec![VANISH]);
        assert_eq!(f.opcodes(3), vec![VANISH]);
        f.clear();

        f.world.move_to(2, 12, 10);
        f.moved(2);
        f.clear();
        let gone = f.world.remove(2).unwrap();
        f.engine
            .despawn(&f.world, &mut f.sessions, &f.router, &gone, ClearReason::Died);
        assert!(f.opcodes(1).is_empty());
        assert_eq!(f.opcodes(3), vec![VANISH]);
    }

    #[test]
    fn test_disguise_self_packet() {
        let mut f = Fixture::new();
        f.player(1, 10, 10);
        f.player(2, 12, 10);
        f.world.get_mut(2).unwrap().as_player_mut().unwrap().disguise = Some(1002);
        f.spawn(1);
        f.clear();
        f.spawn(2);

        let own = f.sinks[&2].sent();
        let negated = (-2i32) as u32;
        // Self packet first, then player 1 appearing
        assert_eq!(f.opcodes(2), vec![SPAWN, IDLE]);
        assert_eq!(&own[0][5..9], &negated.to_le_bytes());
        assert_eq!(&f.sinks[&1].sent()[0][5..9], &2u32.to_le_bytes());
    }

    #[test]
    fn test_disguise_self_packet_on_every_move() {
        let mut f = Fixture::new();
        f.player(1, 10, 10);
        f.player(2, 12, 10);
        f.world.get_mut(2).unwrap().as_player_mut().unwrap().disguise = Some(1002);
        f.spawn(1);
        f.spawn(2);
        f.clear();

        // Still in sight of player 1, so nothing changes state
        f.world.move_to(2, 13, 10);
        assert_eq!(f.moved(2), 0);
        let own = f.sinks[&2].sent();
        assert_eq!(f.opcodes(2), vec![IDLE]);
        assert_eq!(&own[0][5..9], &(-2i32).to_le_bytes());
    }

    #[test]
    fn test_items_appear() {
        let mut f = Fixture::new();
        f.player(1, 10, 10);
        let id = f.world.allocate_id();
        f.world.insert(Entity::new(
            id,
            Position::new(1, 11, 11),
            EntityData::Item(ItemData {
                item_id: 501,
                amount: 1,
                identified: true,
            }),
        ));
        assert_eq!(f.spawn(id), 1);
        assert_eq!(f.opcodes(1), vec![0x009d]);
    }
}

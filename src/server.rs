//! Zone server
//!
//! `ZoneServer` is the single owner of all protocol-core state. The network
//! tasks feed it `InboundEvent`s through a channel; everything else (dispatch,
//! routing, visibility and delayed emission) runs inside its own task, one
//! event or tick at a time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::broadcast::{Router, SendTarget};
use crate::config::ServerConfig;
use crate::error::{ProtocolError, Result, RouterError};
use crate::net::session::{Outbound, Session, SessionId, SessionTable};
use crate::protocol::builders::{DamageInfo, OutboundPackets};
use crate::protocol::dispatch::Dispatcher;
use crate::protocol::handlers::{register_core_handlers, ActionKind, ClientRequest};
use crate::protocol::packet_db::PacketDbBuilder;
use crate::scheduler::{DelayedEmitter, EmitFn, Tick, TickTimer};
use crate::visibility::{ClearReason, VisibilityEngine};
use crate::world::{BlockId, Entity, Motion, Position, WorldMap};

/// Something the network side reports to the simulation task
pub enum InboundEvent {
    Connected {
        session_id: SessionId,
        sink: Box<dyn Outbound>,
        addr: SocketAddr,
    },
    Data {
        session_id: SessionId,
        bytes: bytes::Bytes,
    },
    Disconnected {
        session_id: SessionId,
    },
}

impl std::fmt::Debug for InboundEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InboundEvent::Connected { session_id, addr, .. } => f
                .debug_struct("Connected")
                .field("session_id", session_id)
                .field("addr", addr)
                .finish(),
            InboundEvent::Data { session_id, bytes } => f
                .debug_struct("Data")
                .field("session_id", session_id)
                .field("len", &bytes.len())
                .finish(),
            InboundEvent::Disconnected { session_id } => f
                .debug_struct("Disconnected")
                .field("session_id", session_id)
                .finish(),
        }
    }
}

/// Protocol core of one zone
pub struct ZoneServer {
    config: ServerConfig,
    dispatcher: Dispatcher,
    packets: Arc<OutboundPackets>,
    sessions: SessionTable,
    world: WorldMap,
    router: Router,
    visibility: VisibilityEngine,
    emitter: DelayedEmitter,
    timer: TickTimer,
    /// Milliseconds since the server started
    tick: Tick,
}

impl ZoneServer {
    /// Build the packet tables for the configured client version
    pub fn new(config: ServerConfig) -> Result<Self> {
        let version = config.version();
        let mut builder = PacketDbBuilder::new(version);
        register_core_handlers(&mut builder)?;
        let db = Arc::new(builder.build());
        let packets = Arc::new(OutboundPackets::resolve(version)?);

        info!(
            server = %config.server_name,
            %version,
            opcodes = db.len(),
            obfuscation = ?config.obfuscation,
            "Zone protocol initialised"
        );

        Ok(Self {
            dispatcher: Dispatcher::new(db),
            visibility: VisibilityEngine::new(packets.clone()),
            packets,
            sessions: SessionTable::new(config.max_sessions),
            world: WorldMap::new(),
            router: Router::new(config.areas()),
            emitter: DelayedEmitter::new(),
            timer: TickTimer::new(),
            tick: 0,
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn world(&self) -> &WorldMap {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut WorldMap {
        &mut self.world
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn visibility(&self) -> &VisibilityEngine {
        &self.visibility
    }

    pub fn packets(&self) -> &Arc<OutboundPackets> {
        &self.packets
    }

    pub fn pending_emissions(&self) -> usize {
        self.emitter.pending()
    }

    /// Client tick carried in packets
    fn client_tick(&self) -> u32 {
        self.tick as u32
    }

    /// Route a packet from `origin`
    pub fn send(
        &mut self,
        payload: &[u8],
        origin: Option<BlockId>,
        target: SendTarget,
    ) -> std::result::Result<usize, RouterError> {
        let origin = origin.and_then(|id| self.world.get(id));
        self.router
            .send(&self.world, &mut self.sessions, payload, origin, target)
    }

    /// Send `builder`'s payload from `owner` at tick `at`
    pub fn schedule(
        &mut self,
        at: Tick,
        owner: BlockId,
        target: SendTarget,
        builder: EmitFn,
    ) -> std::result::Result<bool, RouterError> {
        self.emitter.schedule(
            &self.world,
            &mut self.sessions,
            &self.router,
            &mut self.timer,
            self.tick,
            at,
            owner,
            target,
            builder,
        )
    }

    /// Show a damage packet around its source at tick `at`
    pub fn schedule_damage(
        &mut self,
        at: Tick,
        info: DamageInfo,
    ) -> std::result::Result<bool, RouterError> {
        self.emitter.schedule_damage(
            &self.world,
            &mut self.sessions,
            &self.router,
            &mut self.timer,
            self.packets.clone(),
            self.tick,
            at,
            info,
        )
    }

    /// Place an entity and show it to everyone around
    pub fn spawn(&mut self, entity: Entity) -> BlockId {
        let id = entity.id;
        let tick = self.client_tick();
        self.world.insert(entity);
        self.visibility
            .spawn(&self.world, &mut self.sessions, &self.router, id, tick);
        id
    }

    /// Remove an entity, clearing it from every client that draws it
    pub fn despawn(&mut self, id: BlockId, reason: ClearReason) -> Option<Entity> {
        let entity = self.world.remove(id)?;
        self.visibility.despawn(
            &self.world,
            &mut self.sessions,
            &self.router,
            &entity,
            reason,
        );
        self.emitter.cancel_owner(id);
        Some(entity)
    }

    /// Advance the clock and fire due emissions
    pub fn advance(&mut self, elapsed_ms: u64) {
        self.tick = self.tick.saturating_add(elapsed_ms);
        if self.timer.due(self.tick).is_empty() {
            return;
        }
        let sent = self
            .emitter
            .fire(&self.world, &mut self.sessions, &self.router, self.tick);
        trace!(tick = self.tick, sent, "Delayed emissions fired");
    }

    pub fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Connected {
                session_id,
                sink,
                addr,
            } => {
                let session = Session::new(
                    session_id,
                    sink,
                    self.config.obfuscation,
                    self.config.keys(),
                );
                match self.sessions.insert(session) {
                    Ok(_) => debug!(session_id, address = %addr, "Client connected"),
                    Err(e) => warn!(session_id, address = %addr, error = %e, "Rejecting client"),
                }
            }
            InboundEvent::Data { session_id, bytes } => self.handle_data(session_id, &bytes),
            InboundEvent::Disconnected { session_id } => {
                debug!(session_id, "Client disconnected");
                self.drop_session(session_id);
            }
        }
    }

    fn handle_data(&mut self, session_id: SessionId, bytes: &[u8]) {
        let tick = self.client_tick();
        let Some(session) = self.sessions.get_mut(session_id) else {
            warn!(session_id, "Data for unknown session");
            return;
        };
        match self.dispatcher.dispatch(session, bytes, tick) {
            Ok(requests) => {
                for request in requests {
                    self.apply(session_id, request);
                }
            }
            Err(ProtocolError::SessionClosed) => {}
            Err(_) => self.drop_session(session_id),
        }
    }

    /// Carry out one client request
    fn apply(&mut self, session_id: SessionId, request: ClientRequest) {
        if let ClientRequest::Connect {
            account_id,
            char_id,
            sex,
            ..
        } = request
        {
            self.connect(session_id, account_id, char_id, sex);
            return;
        }

        let Some(id) = self.sessions.get(session_id).and_then(|s| s.player()) else {
            warn!(session_id, ?request, "Request before entering the map");
            return;
        };
        let tick = self.client_tick();

        match request {
            ClientRequest::Connect { .. } => {}
            ClientRequest::LoadEnd => {
                let Some(player) = self.world.get_mut(id).and_then(|e| e.as_player_mut()) else {
                    return;
                };
                if player.placed {
                    self.visibility.refresh_observer(
                        &self.world,
                        &mut self.sessions,
                        &self.router,
                        id,
                        tick,
                    );
                } else {
                    player.placed = true;
                    self.visibility
                        .spawn(&self.world, &mut self.sessions, &self.router, id, tick);
                    info!(session_id, player = id, "Player entered the map");
                }
            }
            ClientRequest::TickSync { client_tick } => {
                trace!(session_id, client_tick, "Client tick");
            }
            ClientRequest::WalkTo { x, y } => self.walk(id, x, y),
            ClientRequest::Action { target_id, action } => match action {
                ActionKind::Sit | ActionKind::Stand => {
                    let sitting = action == ActionKind::Sit;
                    if let Some(player) = self.world.get_mut(id).and_then(|e| e.as_player_mut()) {
                        player.sitting = sitting;
                    }
                    let packet = self.packets.damage(&DamageInfo::posture(id, tick, sitting));
                    self.emit(id, packet, SendTarget::Area);
                }
                other => debug!(player = id, target_id, action = ?other, "Unhandled action"),
            },
            ClientRequest::GlobalMessage { text } => self.global_message(id, &text),
            ClientRequest::ChangeDirection { head_dir, dir } => {
                if let Some(entity) = self.world.get_mut(id) {
                    entity.dir = dir;
                    entity.view.head_dir = head_dir;
                }
                let packet = self.packets.change_dir(id, head_dir, dir);
                self.emit(id, packet, SendTarget::AreaWithoutSelf);
            }
            ClientRequest::Emotion { kind } => {
                let packet = self.packets.emotion(id, kind);
                self.emit(id, packet, SendTarget::Area);
            }
            ClientRequest::LeaveChat => {
                if let Some(chat_id) = self.world.leave_chat(id) {
                    debug!(player = id, chat_id, "Left chat room");
                }
            }
            ClientRequest::Quit { kind } => {
                debug!(session_id, kind, "Quit requested");
                let packet = self.packets.quit_ack(0);
                self.emit(id, packet, SendTarget::SelfOnly);
                self.drop_session(session_id);
            }
        }
    }

    fn connect(&mut self, session_id: SessionId, account_id: u32, char_id: u32, sex: u8) {
        if self.world.contains(account_id) {
            warn!(session_id, account_id, "Account already in the zone");
            if let Some(session) = self.sessions.get_mut(session_id) {
                session.close();
            }
            return;
        }
        let spawn = &self.config.spawn;
        let mut entity = Entity::player(
            account_id,
            &format!("char{}", char_id),
            Position::new(spawn.map, spawn.x, spawn.y),
        );
        entity.view.sex = sex;
        if let Some(player) = entity.as_player_mut() {
            player.char_id = char_id;
            player.placed = false;
        }
        self.world.insert(entity);
        self.sessions.bind(session_id, account_id);
        info!(session_id, account_id, char_id, "Character connected");
    }

    fn walk(&mut self, id: BlockId, x: i16, y: i16) {
        let tick = self.client_tick();
        let Some(entity) = self.world.get_mut(id) else {
            return;
        };
        if entity.as_player().is_some_and(|p| p.dead || !p.placed) {
            return;
        }
        entity.motion = Motion::Walking {
            from: (entity.pos.x, entity.pos.y),
            to: (x, y),
            started_at: tick,
        };
        // No pathing here; the unit lands on its destination at once
        self.world.move_to(id, x, y);
        self.visibility
            .moved(&self.world, &mut self.sessions, &self.router, id, tick);
    }

    fn global_message(&mut self, id: BlockId, text: &str) {
        let Some(entity) = self.world.get(id) else {
            return;
        };
        let name = entity.as_player().map(|p| p.name.as_str()).unwrap_or_default();
        let line = format!("{} : {}", name, text);
        let in_chat = entity.chat_id().is_some();

        let packet = self.packets.chat(id, &line);
        if in_chat {
            self.emit(id, packet.clone(), SendTarget::ChatWithoutSelf);
        }
        self.emit(id, packet, SendTarget::AreaChatWithoutChat);
        let echo = self.packets.self_chat(&line);
        self.emit(id, echo, SendTarget::SelfOnly);
    }

    /// Route a freshly built packet, logging failures
    fn emit(
        &mut self,
        origin: BlockId,
        packet: std::result::Result<Vec<u8>, ProtocolError>,
        target: SendTarget,
    ) {
        let packet = match packet {
            Ok(packet) => packet,
            Err(e) => {
                warn!(origin, ?target, error = %e, "Failed to build packet");
                return;
            }
        };
        if let Err(e) = self.send(&packet, Some(origin), target) {
            warn!(origin, ?target, error = %e, "Routing failed");
        }
    }

    /// Tear down a session and the player it carried
    fn drop_session(&mut self, session_id: SessionId) {
        if let Some(player) = self.sessions.get(session_id).and_then(|s| s.player()) {
            self.despawn(player, ClearReason::LoggedOut);
        }
        self.sessions.remove(session_id);
    }

    /// Run until shutdown or until the network side goes away
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<InboundEvent>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) {
        let tick_rate = self.config.tick_rate_ms;
        info!(tick_rate_ms = tick_rate, "Starting zone loop");

        let mut tick_interval = interval(Duration::from_millis(tick_rate));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = tick_interval.tick() => {
                    self.advance(tick_rate);
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            info!("Event channel closed");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        for session_id in self.sessions.ids() {
            self.drop_session(session_id);
        }
        info!(uptime_ms = self.tick, "Zone loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::session::RecordingOutbound;
    use crate::world::map::cell;
    use pretty_assertions::assert_eq;

    fn server() -> ZoneServer {
        let config = ServerConfig {
            packet_version: 20120410,
            ..Default::default()
        };
        ZoneServer::new(config).unwrap()
    }

    fn connect(server: &mut ZoneServer, session_id: SessionId) -> RecordingOutbound {
        let sink = RecordingOutbound::new();
        server.handle_event(InboundEvent::Connected {
            session_id,
            sink: Box::new(sink.clone()),
            addr: "127.0.0.1:5000".parse().unwrap(),
        });
        sink
    }

    fn enter_packet(account_id: u32) -> Vec<u8> {
        let mut p = vec![0u8; 39];
        p[0] = 0x72;
        p[12..16].copy_from_slice(&account_id.to_le_bytes());
        p[22..26].copy_from_slice(&(account_id + 100).to_le_bytes());
        p
    }

    fn data(server: &mut ZoneServer, session_id: SessionId, bytes: &[u8]) {
        server.handle_event(InboundEvent::Data {
            session_id,
            bytes: bytes::Bytes::copy_from_slice(bytes),
        });
    }

    fn login(server: &mut ZoneServer, session_id: SessionId, account_id: u32) -> RecordingOutbound {
        let sink = connect(server, session_id);
        data(server, session_id, &enter_packet(account_id));
        data(server, session_id, &[0x7d, 0x00]);
        sink
    }

    #[test]
    fn test_enter_and_see_each_other() {
        let mut server = server();
        let a = login(&mut server, 1, 2000001);
        assert!(server.world().get(2000001).unwrap().as_player().unwrap().placed);
        assert!(a.sent().is_empty());

        let b = login(&mut server, 2, 2000002);
        assert_eq!(a.opcodes(), vec![0x0858]);
        assert_eq!(b.opcodes(), vec![0x0857]);
    }

    #[test]
    fn test_chat_reaches_neighbours_and_echoes() {
        let mut server = server();
        let a = login(&mut server, 1, 2000001);
        let b = login(&mut server, 2, 2000002);
        a.clear();
        b.clear();

        let mut msg = vec![0x8c, 0x00, 0x00, 0x00];
        msg.extend_from_slice(b"hello\0");
        msg[2] = msg.len() as u8;
        data(&mut server, 1, &msg);

        assert_eq!(a.opcodes(), vec![0x008e]);
        assert_eq!(b.opcodes(), vec![0x008d]);
    }

    #[test]
    fn test_walk_out_of_sight() {
        let mut server = server();
        let a = login(&mut server, 1, 2000001);
        let b = login(&mut server, 2, 2000002);
        a.clear();
        b.clear();

        // 0x0085 carries the destination at offset 6 for this client
        let mut walk = vec![0u8; 9];
        walk[0] = 0x85;
        let dest = crate::protocol::layout::PackedPos::new(250, 250, 0).to_bytes();
        walk[6..9].copy_from_slice(&dest);
        data(&mut server, 1, &walk);

        assert_eq!(server.world().get(2000001).unwrap().pos, cell(1, 250, 250));
        assert_eq!(a.opcodes(), vec![0x0080]);
        assert_eq!(b.opcodes(), vec![0x0080]);
    }

    #[test]
    fn test_quit_clears_player() {
        let mut server = server();
        let a = login(&mut server, 1, 2000001);
        let b = login(&mut server, 2, 2000002);
        b.clear();

        data(&mut server, 1, &[0x8a, 0x01, 0x00, 0x00]);
        assert!(server.world().get(2000001).is_none());
        assert!(server.sessions().get(1).is_none());
        assert!(a.opcodes().contains(&0x018b));
        assert_eq!(b.sent()[0].as_ref(), &[0x80, 0x00, 0x81, 0x84, 0x1e, 0x00, 2]);
    }

    #[test]
    fn test_bad_packet_drops_player() {
        let mut server = server();
        let _a = login(&mut server, 1, 2000001);
        data(&mut server, 1, &[0xff, 0x7f]);
        assert!(server.sessions().get(1).is_none());
        assert!(server.world().get(2000001).is_none());
    }

    #[test]
    fn test_scheduled_damage_fires_on_tick() {
        let mut server = server();
        let a = login(&mut server, 1, 2000001);
        let info = DamageInfo::posture(2000001, 0, true);
        assert!(!server.schedule_damage(100, info).unwrap());
        assert_eq!(server.pending_emissions(), 1);

        server.advance(50);
        assert!(a.sent().is_empty());
        server.advance(50);
        assert_eq!(a.opcodes(), vec![0x02e1]);
        assert_eq!(server.pending_emissions(), 0);
    }

    #[test]
    fn test_duplicate_account_rejected() {
        let mut server = server();
        let _a = login(&mut server, 1, 2000001);
        let b = connect(&mut server, 2);
        data(&mut server, 2, &enter_packet(2000001));
        assert!(b.is_closed());
        assert_eq!(server.sessions().session_of(2000001), Some(1));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let server = server();
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { server.run(rx, &mut shutdown_rx).await });

        let sink = RecordingOutbound::new();
        tx.send(InboundEvent::Connected {
            session_id: 1,
            sink: Box::new(sink.clone()),
            addr: "127.0.0.1:5000".parse().unwrap(),
        })
        .await
        .unwrap();
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(sink.is_closed());
    }
}

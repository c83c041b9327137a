//! Inbound packet dispatch.
//!
//! One [`PacketHandler`] is shared by every connection task. It is stateless
//! apart from the components it routes to, so handling is a pure function of
//! the packet bytes and the shared session/room state.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{info, warn};
use shared::{hex_dump, InboundPacketType, OutboundPacketType, PacketBuilder, PacketReader, WireError};
use thiserror::Error;

use crate::config::ServerConfig;
use crate::player::{SharedPlayer, NO_ROOM, NO_TIMESTAMP};
use crate::rooms::{RoomJoin, RoomTable};
use crate::server::{Outbound, OutboundSender};
use crate::session::SessionManager;
use crate::utils::now_millis;
use crate::validation::{validate_visuals, Verdict, VisualPolicy};

/// Failure while decoding or dispatching a validated packet.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Wire(#[from] WireError),
}

pub struct PacketHandler {
    sessions: Arc<SessionManager>,
    rooms: Arc<RoomTable>,
    policy: VisualPolicy,
    disallow_same_ip: bool,
    testing_mode: bool,
    outbound: OutboundSender,
}

impl PacketHandler {
    pub fn new(
        config: &ServerConfig,
        sessions: Arc<SessionManager>,
        rooms: Arc<RoomTable>,
        outbound: OutboundSender,
    ) -> Self {
        PacketHandler {
            sessions,
            rooms,
            policy: VisualPolicy::from(config),
            disallow_same_ip: config.disallow_same_ip,
            testing_mode: config.testing_mode,
            outbound,
        }
    }

    /// Handles one datagram. `stop` is the calling connection task's stop
    /// flag; a login stores it on the new player so kicks reach the task.
    /// Malformed packets are logged and dropped; a dispatch error gets the
    /// sender kicked if it maps to a session, so a misbehaving client cannot
    /// wedge its handler task.
    pub async fn handle(&self, addr: SocketAddr, bytes: &[u8], stop: &Arc<AtomicBool>) {
        let reader = PacketReader::new(bytes);
        if !reader.validate() {
            warn!("invalid packet from {}: [{}]", addr, hex_dump(bytes));
            return;
        }
        if let Err(e) = self.dispatch(addr, bytes, stop).await {
            warn!(
                "failed to handle packet from {}: {} [{}]",
                addr,
                e,
                hex_dump(bytes)
            );
            if let Some(player) = self.sessions.get_player_by_addr(addr).await {
                self.sessions.kick(&player, "Invalid message received").await;
            }
        }
    }

    async fn dispatch(
        &self,
        addr: SocketAddr,
        bytes: &[u8],
        stop: &Arc<AtomicBool>,
    ) -> Result<(), HandlerError> {
        let mut reader = PacketReader::new(bytes);
        // validate() ran in handle(), so the type byte is known.
        let kind = match reader.packet_type() {
            Some(kind) => kind,
            None => return Ok(()),
        };

        match kind {
            InboundPacketType::Login => self.handle_login(addr, stop).await,
            InboundPacketType::Heartbeat => {
                let token = reader.get_uuid()?;
                if let Some(player) = self.resolve(token, addr).await {
                    if self.testing_mode {
                        let id = player.lock().unwrap().id;
                        info!("heartbeat from player {} at {}", id, addr);
                    }
                    let bytes = PacketBuilder::new(OutboundPacketType::Heartbeat).build();
                    self.send(bytes, addr);
                }
                Ok(())
            }
            InboundPacketType::PlayerChangeRoom => {
                let token = reader.get_uuid()?;
                let room = reader.get_i16()? as i32;
                let sprite_index = reader.get_i16()? as i32;
                let frame_index = reader.get_i16()? as i32;
                let x = reader.get_f32()?;
                let y = reader.get_f32()?;
                if let Some(player) = self.resolve(token, addr).await {
                    self.handle_change_room(&player, room, sprite_index, frame_index, x, y)
                        .await;
                }
                Ok(())
            }
            InboundPacketType::PlayerVisualUpdate => {
                let token = reader.get_uuid()?;
                let sprite_index = reader.get_i16()? as i32;
                let frame_index = reader.get_i16()? as i32;
                let x = reader.get_f32()?;
                let y = reader.get_f32()?;
                if let Some(player) = self.resolve(token, addr).await {
                    self.handle_visual_update(&player, sprite_index, frame_index, x, y)
                        .await;
                }
                Ok(())
            }
        }
    }

    async fn handle_login(
        &self,
        addr: SocketAddr,
        stop: &Arc<AtomicBool>,
    ) -> Result<(), HandlerError> {
        if self.disallow_same_ip && self.sessions.has_session_from(addr.ip()) {
            warn!("refused second session from {}", addr.ip());
            let bytes = PacketBuilder::new(OutboundPacketType::KickMessage)
                .add_string("Only one session is allowed per IP address")
                .build();
            self.send(bytes, addr);
            return Ok(());
        }
        if let Some(existing) = self.sessions.get_player_by_addr(addr).await {
            self.sessions
                .kick(&existing, "Only one player per connection")
                .await;
            return Ok(());
        }
        let player = match self.sessions.create_player(addr, stop.clone()).await {
            Some(player) => player,
            None => {
                warn!("refused login from {}: server is full", addr);
                let bytes = PacketBuilder::new(OutboundPacketType::KickMessage)
                    .add_string("The server is full")
                    .build();
                self.send(bytes, addr);
                return Ok(());
            }
        };
        let (id, token) = {
            let p = player.lock().unwrap();
            (p.id, p.token)
        };
        info!("player {} logged in from {}", id, addr);
        let bytes = PacketBuilder::new(OutboundPacketType::Session)
            .add_i32(id)
            .add_uuid(token)
            .build();
        self.send(bytes, addr);
        Ok(())
    }

    async fn handle_change_room(
        &self,
        player: &SharedPlayer,
        room: i32,
        sprite_index: i32,
        frame_index: i32,
        x: f32,
        y: f32,
    ) {
        let now = now_millis();
        let (verdict, id) = {
            let mut p = player.lock().unwrap();
            // A room change requires the client to resend full visual state,
            // and the first movement packet afterwards is unconstrained.
            p.last_move_packet_time = NO_TIMESTAMP;
            let verdict =
                validate_visuals(&mut p, sprite_index, frame_index, x, y, now, &self.policy);
            (verdict, p.id)
        };
        if self.testing_mode {
            info!("player {} requests room {} -> {:?}", id, room, verdict);
        }
        if let Verdict::Reject(reason) = verdict {
            self.sessions.kick(player, reason).await;
            return;
        }
        // Out-of-range room identifiers mean "no room", not an error.
        let target = if room >= 0 && (room as usize) < self.rooms.room_count() {
            room
        } else {
            NO_ROOM
        };
        if self.rooms.add_player(player, target, now) == RoomJoin::TooFast {
            self.sessions
                .kick(player, "Kicked for changing rooms too fast")
                .await;
        }
    }

    async fn handle_visual_update(
        &self,
        player: &SharedPlayer,
        sprite_index: i32,
        frame_index: i32,
        x: f32,
        y: f32,
    ) {
        let now = now_millis();
        let (verdict, snapshot, room) = {
            let mut p = player.lock().unwrap();
            let verdict = validate_visuals(
                &mut p,
                sprite_index,
                frame_index,
                x,
                y,
                now,
                &self.policy,
            );
            // Corrections count as movement too; only a reject leaves the
            // timestamp untouched.
            if !matches!(verdict, Verdict::Reject(_)) {
                p.last_move_packet_time = now;
            }
            (verdict, p.snapshot(), p.room)
        };
        if self.testing_mode {
            info!(
                "player {} visuals: sprite {} frame {} at ({}, {}) -> {:?}",
                snapshot.id, sprite_index, frame_index, x, y, verdict
            );
        }

        match verdict {
            Verdict::Accept => {
                if room == NO_ROOM {
                    return;
                }
                let bytes = PacketBuilder::new(OutboundPacketType::PlayerVisualUpdate)
                    .add_i64(now)
                    .add_i32(room)
                    .add_i32(snapshot.id)
                    .add_i16(snapshot.sprite_index as i16)
                    .add_i16(snapshot.frame_index as i16)
                    .add_f32(snapshot.x)
                    .add_f32(snapshot.y)
                    .build();
                for other in self.rooms.players_in(room) {
                    if other.id != snapshot.id {
                        self.send(bytes.clone(), other.addr);
                    }
                }
            }
            Verdict::Corrected => {
                // Snap the client back to its last accepted position.
                let bytes = PacketBuilder::new(OutboundPacketType::ForceTeleport)
                    .add_f32(snapshot.x)
                    .add_f32(snapshot.y)
                    .build();
                self.send(bytes, snapshot.addr);
            }
            Verdict::Reject(reason) => {
                self.sessions.kick(player, reason).await;
            }
        }
    }

    /// Looks up the session for a token, refreshes its activity timestamp
    /// and re-keys the connection if the client's address changed. Unknown
    /// tokens are dropped silently; the token is the only credential.
    async fn resolve(&self, token: uuid::Uuid, addr: SocketAddr) -> Option<SharedPlayer> {
        let player = self.sessions.get_player(&token).await?;
        player.lock().unwrap().last_packet_time = now_millis();
        self.sessions.rebind(&player, addr).await;
        Some(player)
    }

    fn send(&self, bytes: Vec<u8>, addr: SocketAddr) {
        let _ = self.outbound.send(Outbound { bytes, addr });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{MAGIC, PROTOCOL_VERSION};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    struct Harness {
        handler: PacketHandler,
        sessions: Arc<SessionManager>,
        rooms: Arc<RoomTable>,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    fn harness(config: ServerConfig) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let rooms = Arc::new(RoomTable::new(
            config.room_count(),
            config.room_change_cooldown_ms,
            tx.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(&config, rooms.clone(), tx.clone()));
        let handler = PacketHandler::new(&config, sessions.clone(), rooms.clone(), tx);
        Harness {
            handler,
            sessions,
            rooms,
            rx,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    fn inbound(kind: InboundPacketType) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(PROTOCOL_VERSION);
        bytes.push(kind.id());
        bytes
    }

    fn push_token(bytes: &mut Vec<u8>, token: Uuid) {
        let (msb, lsb) = token.as_u64_pair();
        bytes.extend_from_slice(&msb.to_le_bytes());
        bytes.extend_from_slice(&lsb.to_le_bytes());
    }

    fn change_room_packet(token: Uuid, room: i16, sprite: i16, x: f32, y: f32) -> Vec<u8> {
        let mut bytes = inbound(InboundPacketType::PlayerChangeRoom);
        push_token(&mut bytes, token);
        bytes.extend_from_slice(&room.to_le_bytes());
        bytes.extend_from_slice(&sprite.to_le_bytes());
        bytes.extend_from_slice(&0i16.to_le_bytes());
        bytes.extend_from_slice(&x.to_le_bytes());
        bytes.extend_from_slice(&y.to_le_bytes());
        bytes
    }

    fn visual_update_packet(token: Uuid, sprite: i16, frame: i16, x: f32, y: f32) -> Vec<u8> {
        let mut bytes = inbound(InboundPacketType::PlayerVisualUpdate);
        push_token(&mut bytes, token);
        bytes.extend_from_slice(&sprite.to_le_bytes());
        bytes.extend_from_slice(&frame.to_le_bytes());
        bytes.extend_from_slice(&x.to_le_bytes());
        bytes.extend_from_slice(&y.to_le_bytes());
        bytes
    }

    /// Logs in from `addr` and returns the (id, token) from the reply.
    async fn login(h: &mut Harness, addr: SocketAddr) -> (i32, Uuid) {
        h.handler.handle(addr, &inbound(InboundPacketType::Login), &flag()).await;
        let sent = drain(&mut h.rx);
        let reply = sent.last().unwrap();
        assert_eq!(reply.bytes[4], OutboundPacketType::Session.id());
        let mut reader = PacketReader::new(&reply.bytes);
        let id = reader.get_i32().unwrap();
        let token = reader.get_uuid().unwrap();
        (id, token)
    }

    #[tokio::test]
    async fn login_creates_session_and_replies() {
        let mut h = harness(ServerConfig::default());
        let (id, token) = login(&mut h, addr(4000)).await;
        assert_eq!(id, 0);
        assert!(h.sessions.get_player(&token).await.is_some());
        assert_eq!(h.sessions.player_count(), 1);
    }

    #[tokio::test]
    async fn login_when_full_sends_kick_message() {
        let config = ServerConfig {
            max_players: 1,
            ..ServerConfig::default()
        };
        let mut h = harness(config);
        login(&mut h, addr(4000)).await;

        h.handler.handle(addr(4001), &inbound(InboundPacketType::Login), &flag()).await;
        let sent = drain(&mut h.rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].addr, addr(4001));
        assert_eq!(sent[0].bytes[4], OutboundPacketType::KickMessage.id());
        assert_eq!(&sent[0].bytes[5..], b"The server is full\0");
        assert_eq!(h.sessions.player_count(), 1);
    }

    #[tokio::test]
    async fn second_login_from_same_ip_refused_when_policy_enabled() {
        let config = ServerConfig {
            disallow_same_ip: true,
            ..ServerConfig::default()
        };
        let mut h = harness(config);
        login(&mut h, addr(4000)).await;

        h.handler.handle(addr(4001), &inbound(InboundPacketType::Login), &flag()).await;
        let sent = drain(&mut h.rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].bytes[4], OutboundPacketType::KickMessage.id());
        assert_eq!(h.sessions.player_count(), 1);
    }

    #[tokio::test]
    async fn heartbeat_echoes_and_refreshes_activity() {
        let mut h = harness(ServerConfig::default());
        let (_, token) = login(&mut h, addr(4000)).await;
        let player = h.sessions.get_player(&token).await.unwrap();
        player.lock().unwrap().last_packet_time = 0;

        let mut bytes = inbound(InboundPacketType::Heartbeat);
        push_token(&mut bytes, token);
        h.handler.handle(addr(4000), &bytes, &flag()).await;

        let sent = drain(&mut h.rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].bytes[4], OutboundPacketType::Heartbeat.id());
        assert!(player.lock().unwrap().last_packet_time > 0);
    }

    #[tokio::test]
    async fn heartbeat_with_unknown_token_is_dropped() {
        let mut h = harness(ServerConfig::default());
        let mut bytes = inbound(InboundPacketType::Heartbeat);
        push_token(&mut bytes, Uuid::new_v4());
        h.handler.handle(addr(4000), &bytes, &flag()).await;
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn change_room_applies_visuals_and_joins() {
        let mut h = harness(ServerConfig::default());
        let (_, token) = login(&mut h, addr(4000)).await;

        let packet = change_room_packet(token, 12, 1100, 64.0, 96.0);
        h.handler.handle(addr(4000), &packet, &flag()).await;

        let player = h.sessions.get_player(&token).await.unwrap();
        {
            let p = player.lock().unwrap();
            assert_eq!(p.room, 12);
            assert_eq!(p.sprite_index, 1100);
            assert_eq!(p.last_move_packet_time, NO_TIMESTAMP);
        }
        assert_eq!(h.rooms.players_in(12).len(), 1);
    }

    #[tokio::test]
    async fn relogin_over_an_active_session_kicks_it() {
        let mut h = harness(ServerConfig::default());
        let (_, token) = login(&mut h, addr(4000)).await;

        h.handler.handle(addr(4000), &inbound(InboundPacketType::Login), &flag()).await;

        let sent = drain(&mut h.rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].bytes[4], OutboundPacketType::KickMessage.id());
        assert_eq!(&sent[0].bytes[5..], b"Only one player per connection\0");
        assert!(h.sessions.get_player(&token).await.is_none());
        assert_eq!(h.sessions.player_count(), 0);
    }

    #[tokio::test]
    async fn out_of_range_room_means_no_room() {
        let config = ServerConfig {
            room_change_cooldown_ms: 0,
            ..ServerConfig::default()
        };
        let mut h = harness(config);
        let (_, token) = login(&mut h, addr(4000)).await;

        h.handler
            .handle(addr(4000), &change_room_packet(token, 5, 1100, 0.0, 0.0), &flag())
            .await;
        h.handler
            .handle(addr(4000), &change_room_packet(token, 9999, 1100, 0.0, 0.0), &flag())
            .await;

        let player = h.sessions.get_player(&token).await.unwrap();
        assert_eq!(player.lock().unwrap().room, NO_ROOM);
        assert!(h.rooms.players_in(5).is_empty());
    }

    #[tokio::test]
    async fn change_room_with_stored_invalid_sprite_kicks() {
        let mut h = harness(ServerConfig::default());
        let (_, token) = login(&mut h, addr(4000)).await;
        h.handler
            .handle(addr(4000), &visual_update_packet(token, 9999, 0, 0.0, 0.0), &flag())
            .await;

        h.handler
            .handle(addr(4000), &change_room_packet(token, 5, 1100, 0.0, 0.0), &flag())
            .await;

        assert!(h.sessions.get_player(&token).await.is_none());
        let sent = drain(&mut h.rx);
        let kick = sent.last().unwrap();
        assert_eq!(kick.bytes[4], OutboundPacketType::KickMessage.id());
        assert_eq!(&kick.bytes[5..], b"Kicked for invalid visuals (may be a bug)\0");
    }

    #[tokio::test]
    async fn correction_still_refreshes_movement_timestamp() {
        let mut h = harness(ServerConfig::default());
        let (_, token) = login(&mut h, addr(4000)).await;
        h.handler
            .handle(addr(4000), &visual_update_packet(token, 1100, 0, 0.0, 0.0), &flag())
            .await;
        let player = h.sessions.get_player(&token).await.unwrap();
        // 10 ms of budget only allows a couple of pixels.
        let before = now_millis() - 10;
        player.lock().unwrap().last_move_packet_time = before;

        h.handler
            .handle(addr(4000), &visual_update_packet(token, 1100, 0, 100.0, 0.0), &flag())
            .await;

        let p = player.lock().unwrap();
        assert!(p.last_move_packet_time > before);
        assert_eq!(p.x, 0.0);
    }

    #[tokio::test]
    async fn rapid_room_changes_kick() {
        let mut h = harness(ServerConfig::default());
        let (_, token) = login(&mut h, addr(4000)).await;

        h.handler
            .handle(addr(4000), &change_room_packet(token, 1, 1100, 0.0, 0.0), &flag())
            .await;
        h.handler
            .handle(addr(4000), &change_room_packet(token, 2, 1100, 0.0, 0.0), &flag())
            .await;

        let sent = drain(&mut h.rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].bytes[4], OutboundPacketType::KickMessage.id());
        assert_eq!(&sent[0].bytes[5..], b"Kicked for changing rooms too fast\0");
        assert!(h.sessions.get_player(&token).await.is_none());
    }

    #[tokio::test]
    async fn visual_update_broadcasts_to_roommates_only() {
        let mut h = harness(ServerConfig::default());
        let (a_id, a_token) = login(&mut h, addr(4000)).await;
        let (b_id, b_token) = login(&mut h, addr(4001)).await;
        h.handler
            .handle(addr(4000), &change_room_packet(a_token, 3, 1100, 0.0, 0.0), &flag())
            .await;
        h.handler
            .handle(addr(4001), &change_room_packet(b_token, 3, 1100, 0.0, 0.0), &flag())
            .await;
        drain(&mut h.rx);

        let packet = visual_update_packet(a_token, 1101, 2, 30.0, -15.0);
        h.handler.handle(addr(4000), &packet, &flag()).await;

        let sent = drain(&mut h.rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].addr, addr(4001));
        assert_eq!(sent[0].bytes[4], OutboundPacketType::PlayerVisualUpdate.id());
        let mut reader = PacketReader::new(&sent[0].bytes);
        assert!(reader.get_i64().unwrap() > 0);
        assert_eq!(reader.get_i32(), Ok(3));
        assert_eq!(reader.get_i32(), Ok(a_id));
        assert_eq!(reader.get_i16(), Ok(1101));
        assert_eq!(reader.get_i16(), Ok(2));
        assert_ne!(a_id, b_id);
    }

    #[tokio::test]
    async fn implausible_movement_force_teleports_back() {
        let mut h = harness(ServerConfig::default());
        let (_, token) = login(&mut h, addr(4000)).await;
        h.handler
            .handle(addr(4000), &change_room_packet(token, 3, 1100, 10.0, 20.0), &flag())
            .await;
        // First update after the room change is unconstrained.
        h.handler
            .handle(addr(4000), &visual_update_packet(token, 1100, 0, 10.0, 20.0), &flag())
            .await;
        drain(&mut h.rx);

        h.handler
            .handle(addr(4000), &visual_update_packet(token, 1100, 0, 5000.0, 20.0), &flag())
            .await;

        let sent = drain(&mut h.rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].addr, addr(4000));
        assert_eq!(sent[0].bytes[4], OutboundPacketType::ForceTeleport.id());
        let mut reader = PacketReader::new(&sent[0].bytes);
        assert_eq!(reader.get_f32(), Ok(10.0));
        assert_eq!(reader.get_f32(), Ok(20.0));
        // Session survives a correction.
        assert!(h.sessions.get_player(&token).await.is_some());
    }

    #[tokio::test]
    async fn invalid_visuals_kick_on_the_following_packet() {
        let mut h = harness(ServerConfig::default());
        let (_, token) = login(&mut h, addr(4000)).await;
        h.handler
            .handle(addr(4000), &visual_update_packet(token, 9999, 0, 0.0, 0.0), &flag())
            .await;
        assert!(h.sessions.get_player(&token).await.is_some());

        h.handler
            .handle(addr(4000), &visual_update_packet(token, 1100, 0, 0.0, 0.0), &flag())
            .await;
        assert!(h.sessions.get_player(&token).await.is_none());
        let sent = drain(&mut h.rx);
        let kick = sent.last().unwrap();
        assert_eq!(kick.bytes[4], OutboundPacketType::KickMessage.id());
    }

    #[tokio::test]
    async fn malformed_packets_are_dropped() {
        let mut h = harness(ServerConfig::default());
        h.handler.handle(addr(4000), b"garbage", &flag()).await;
        h.handler.handle(addr(4000), &[], &flag()).await;
        let mut short = inbound(InboundPacketType::Heartbeat);
        short.push(0);
        h.handler.handle(addr(4000), &short, &flag()).await;
        assert!(drain(&mut h.rx).is_empty());
        assert_eq!(h.sessions.player_count(), 0);
    }

    #[tokio::test]
    async fn visual_update_outside_any_room_is_not_broadcast() {
        let mut h = harness(ServerConfig::default());
        let (_, token) = login(&mut h, addr(4000)).await;
        h.handler
            .handle(addr(4000), &visual_update_packet(token, 1100, 0, 1.0, 1.0), &flag())
            .await;
        assert!(drain(&mut h.rx).is_empty());
        let player = h.sessions.get_player(&token).await.unwrap();
        assert_eq!(player.lock().unwrap().sprite_index, 1100);
    }
}

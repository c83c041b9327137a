//! Per-room occupant lists and join/leave notifications.

use std::sync::atomic::Ordering;
use std::sync::Mutex;

use log::info;
use shared::{OutboundPacketType, PacketBuilder};

use crate::player::{PlayerSnapshot, SharedPlayer, NO_ROOM, NO_TIMESTAMP};
use crate::server::{Outbound, OutboundSender};

/// Result of a room move request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomJoin {
    /// The move was applied (or was a no-op).
    Moved,
    /// The minimum room-change interval has not elapsed; the caller must
    /// kick the player.
    TooFast,
}

/// Holds, per room identifier, the players currently present.
///
/// One lock per room, so moves in unrelated rooms never contend. Callers
/// must not hold a player's lock across these methods; the table takes the
/// room lock first and player locks second, briefly, in every path.
pub struct RoomTable {
    rooms: Vec<Mutex<Vec<SharedPlayer>>>,
    cooldown_ms: i64,
    outbound: OutboundSender,
}

impl RoomTable {
    pub fn new(room_count: usize, cooldown_ms: i64, outbound: OutboundSender) -> Self {
        let mut rooms = Vec::with_capacity(room_count);
        for _ in 0..room_count {
            rooms.push(Mutex::new(Vec::new()));
        }
        RoomTable {
            rooms,
            cooldown_ms,
            outbound,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn valid_room(&self, room: i32) -> bool {
        room >= 0 && (room as usize) < self.rooms.len()
    }

    /// Ordered snapshot of a room's occupants. Invalid rooms are empty.
    /// The snapshot does not reflect later mutations.
    pub fn players_in(&self, room: i32) -> Vec<PlayerSnapshot> {
        if !self.valid_room(room) {
            return Vec::new();
        }
        let list = self.rooms[room as usize].lock().unwrap();
        list.iter().map(|p| p.lock().unwrap().snapshot()).collect()
    }

    /// Moves a player into `target` (or out of every room for
    /// [`NO_ROOM`]), notifying the occupants involved.
    ///
    /// Joining a room sends the existing occupants one PLAYER_JOIN_ROOM
    /// describing the newcomer, and the newcomer one PLAYER_JOIN_ROOM
    /// listing the existing occupants (omitted when the room was empty).
    ///
    /// Room identifiers outside the valid range (other than [`NO_ROOM`])
    /// and moves into the player's current room are no-ops.
    pub fn add_player(&self, player: &SharedPlayer, target: i32, now: i64) -> RoomJoin {
        if target != NO_ROOM && !self.valid_room(target) {
            return RoomJoin::Moved;
        }

        let (current, last_change) = {
            let p = player.lock().unwrap();
            (p.room, p.last_room_change_time)
        };
        if current == target {
            return RoomJoin::Moved;
        }
        if last_change != NO_TIMESTAMP && now - last_change < self.cooldown_ms {
            return RoomJoin::TooFast;
        }

        if current != NO_ROOM {
            self.leave(player, current);
        }

        if target == NO_ROOM {
            let mut p = player.lock().unwrap();
            p.room = NO_ROOM;
            p.last_room_change_time = now;
            return RoomJoin::Moved;
        }

        // The room field and list membership change together under the room
        // lock, and a player whose stop flag was raised by a release is not
        // re-added.
        let (joining, occupants) = {
            let mut list = self.rooms[target as usize].lock().unwrap();
            let joining = {
                let mut p = player.lock().unwrap();
                if p.stop.load(Ordering::Relaxed) {
                    return RoomJoin::Moved;
                }
                p.room = target;
                p.last_room_change_time = now;
                p.snapshot()
            };
            let occupants: Vec<PlayerSnapshot> =
                list.iter().map(|o| o.lock().unwrap().snapshot()).collect();
            list.push(player.clone());
            (joining, occupants)
        };

        // Tell the current occupants about the newcomer.
        let announce = PacketBuilder::new(OutboundPacketType::PlayerJoinRoom)
            .add_i32(target)
            .add_i16(1)
            .add_i32(joining.id)
            .add_i16(joining.sprite_index as i16)
            .add_i16(joining.frame_index as i16)
            .add_f32(joining.x)
            .add_f32(joining.y)
            .build();
        for other in &occupants {
            self.send(announce.clone(), other.addr);
        }

        // Tell the newcomer who was already there.
        if !occupants.is_empty() {
            let mut roster = PacketBuilder::new(OutboundPacketType::PlayerJoinRoom)
                .add_i32(target)
                .add_i16(occupants.len() as i16);
            for other in &occupants {
                roster = roster
                    .add_i32(other.id)
                    .add_i16(other.sprite_index as i16)
                    .add_i16(other.frame_index as i16)
                    .add_f32(other.x)
                    .add_f32(other.y);
            }
            self.send(roster.build(), joining.addr);
        }

        RoomJoin::Moved
    }

    /// Removes a player from its current room, if any, and broadcasts a
    /// PLAYER_LEAVE_ROOM to the remaining occupants.
    pub fn remove_player(&self, player: &SharedPlayer) {
        let room = player.lock().unwrap().room;
        if !self.valid_room(room) {
            return;
        }
        self.leave(player, room);
    }

    fn leave(&self, player: &SharedPlayer, room: i32) {
        let id = player.lock().unwrap().id;
        let remaining = {
            let mut list = self.rooms[room as usize].lock().unwrap();
            list.retain(|other| other.lock().unwrap().id != id);
            list.iter()
                .map(|o| o.lock().unwrap().snapshot())
                .collect::<Vec<_>>()
        };
        player.lock().unwrap().room = NO_ROOM;
        info!("player {} left room {}", id, room);

        let bytes = PacketBuilder::new(OutboundPacketType::PlayerLeaveRoom)
            .add_i32(room)
            .add_i32(id)
            .build();
        for other in &remaining {
            self.send(bytes.clone(), other.addr);
        }
    }

    fn send(&self, bytes: Vec<u8>, addr: std::net::SocketAddr) {
        let _ = self.outbound.send(Outbound { bytes, addr });
    }
}

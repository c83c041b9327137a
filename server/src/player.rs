use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// Sentinel room value for a player that is not in any room.
pub const NO_ROOM: i32 = -1;

/// Sentinel for "no timestamp recorded".
pub const NO_TIMESTAMP: i64 = -1;

/// Initial sprite assigned to a fresh session; the first value in the
/// allow-list, so a client that never sends visuals still passes validation.
pub const INITIAL_SPRITE: i32 = 1088;

/// One player per active session.
///
/// Owned by the session manager; mutated by the connection handler
/// processing this player's packets and by the room table on membership
/// changes. The `stop` flag is shared with the owning connection handler so
/// a kick from another task halts that handler's packet loop.
#[derive(Debug)]
pub struct Player {
    /// Public ID broadcast to other clients; densely packed, reused.
    pub id: i32,
    /// Private session token the client must present to act as this player.
    pub token: Uuid,
    /// Most recent source address; refreshed on every authenticated packet.
    pub addr: SocketAddr,

    pub room: i32,
    pub sprite_index: i32,
    pub frame_index: i32,
    pub x: f32,
    pub y: f32,

    /// Timestamp of the last packet of any kind, for idle eviction.
    pub last_packet_time: i64,
    /// Timestamp of the last movement packet; reset on room change.
    pub last_move_packet_time: i64,
    /// Timestamp of the last room change, for the change-rate check.
    pub last_room_change_time: i64,

    /// Non-owning link to the connection handler's stop flag.
    pub stop: Arc<AtomicBool>,
}

/// Players are shared between the session manager, room table and
/// connection handlers; each mutation takes the per-player lock briefly.
pub type SharedPlayer = Arc<Mutex<Player>>;

/// Immutable copy of the fields other components need while not holding the
/// player's lock (join/leave packets, broadcast fan-out).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerSnapshot {
    pub id: i32,
    pub addr: SocketAddr,
    pub sprite_index: i32,
    pub frame_index: i32,
    pub x: f32,
    pub y: f32,
}

impl Player {
    pub fn new(token: Uuid, id: i32, addr: SocketAddr, now: i64) -> Self {
        Player {
            id,
            token,
            addr,
            room: NO_ROOM,
            sprite_index: INITIAL_SPRITE,
            frame_index: 0,
            x: 0.0,
            y: 0.0,
            last_packet_time: now,
            last_move_packet_time: NO_TIMESTAMP,
            last_room_change_time: NO_TIMESTAMP,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            id: self.id,
            addr: self.addr,
            sprite_index: self.sprite_index,
            frame_index: self.frame_index,
            x: self.x,
            y: self.y,
        }
    }

    pub fn shared(self) -> SharedPlayer {
        Arc::new(Mutex::new(self))
    }
}

//! Session token / public ID bookkeeping.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use shared::{OutboundPacketType, PacketBuilder};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::player::{Player, SharedPlayer};
use crate::rooms::RoomTable;
use crate::server::{Outbound, OutboundSender};
use crate::utils::now_millis;

/// Owns the authoritative token → player and connection → token maps, and
/// the allocation of public IDs.
///
/// Lookups take the outer read/write locks only long enough to touch the
/// map entry; player fields are guarded by each player's own mutex, so
/// unrelated players never serialize on a single table lock.
pub struct SessionManager {
    max_players: usize,
    disallow_same_ip: bool,
    idle_timeout_ms: i64,

    sessions: RwLock<HashMap<Uuid, SharedPlayer>>,
    connections: RwLock<HashMap<SocketAddr, Uuid>>,
    player_ids: Mutex<HashSet<i32>>,
    /// Source IPs with an active session; only populated when the same-IP
    /// policy is enabled.
    addresses: Mutex<HashSet<IpAddr>>,

    rooms: Arc<RoomTable>,
    outbound: OutboundSender,
}

impl SessionManager {
    pub fn new(config: &ServerConfig, rooms: Arc<RoomTable>, outbound: OutboundSender) -> Self {
        SessionManager {
            max_players: config.max_players,
            disallow_same_ip: config.disallow_same_ip,
            idle_timeout_ms: config.idle_timeout_ms,
            sessions: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            player_ids: Mutex::new(HashSet::new()),
            addresses: Mutex::new(HashSet::new()),
            rooms,
            outbound,
        }
    }

    /// Creates a player for a connection, or returns `None` when the server
    /// is at capacity. The public ID is the lowest unused integer below the
    /// player cap; the session token is a fresh random 128-bit value. `stop`
    /// is the owning connection handler's stop flag, stored on the player so
    /// a kick from any task halts that handler's packet loop.
    pub async fn create_player(
        &self,
        addr: SocketAddr,
        stop: Arc<AtomicBool>,
    ) -> Option<SharedPlayer> {
        let id = {
            let mut ids = self.player_ids.lock().unwrap();
            if ids.len() >= self.max_players {
                return None;
            }
            let mut id = 0;
            while ids.contains(&id) {
                id += 1;
            }
            ids.insert(id);
            id
        };

        let token = Uuid::new_v4();
        let mut player = Player::new(token, id, addr, now_millis());
        player.stop = stop;
        let player = player.shared();

        self.sessions.write().await.insert(token, player.clone());
        self.connections.write().await.insert(addr, token);
        if self.disallow_same_ip {
            self.addresses.lock().unwrap().insert(addr.ip());
        }

        Some(player)
    }

    pub async fn get_player(&self, token: &Uuid) -> Option<SharedPlayer> {
        self.sessions.read().await.get(token).cloned()
    }

    pub async fn get_player_by_addr(&self, addr: SocketAddr) -> Option<SharedPlayer> {
        let token = *self.connections.read().await.get(&addr)?;
        self.get_player(&token).await
    }

    /// Re-keys a session whose client migrated to a new source address, and
    /// records the address on the player for future direct sends. Under the
    /// same-IP policy the tracked IP moves with the session.
    pub async fn rebind(&self, player: &SharedPlayer, addr: SocketAddr) {
        let (token, old) = {
            let p = player.lock().unwrap();
            (p.token, p.addr)
        };
        if old == addr {
            return;
        }
        player.lock().unwrap().addr = addr;
        if self.disallow_same_ip && old.ip() != addr.ip() {
            let mut addresses = self.addresses.lock().unwrap();
            addresses.remove(&old.ip());
            addresses.insert(addr.ip());
        }
        let mut connections = self.connections.write().await;
        if connections.get(&old) == Some(&token) {
            connections.remove(&old);
        }
        connections.insert(addr, token);
    }

    /// Removes the session's three indices (token, public ID, connection),
    /// raises the player's stop flag and evicts the player from its room.
    /// The flag goes up before the room eviction so a room join racing this
    /// release sees it and backs off instead of re-adding the player.
    /// Returns false if the token was already released; safe to call twice.
    pub async fn release_player(&self, token: Uuid) -> bool {
        let player = match self.sessions.write().await.remove(&token) {
            Some(player) => player,
            None => return false,
        };
        let (id, addr, stop) = {
            let p = player.lock().unwrap();
            (p.id, p.addr, p.stop.clone())
        };
        stop.store(true, Ordering::Relaxed);
        info!("removing player {} ({})", id, token);

        self.connections.write().await.retain(|_, t| *t != token);
        self.player_ids.lock().unwrap().remove(&id);
        self.addresses.lock().unwrap().remove(&addr.ip());
        self.rooms.remove_player(&player);
        true
    }

    pub async fn release_by_addr(&self, addr: SocketAddr) -> bool {
        let token = match self.connections.read().await.get(&addr) {
            Some(token) => *token,
            None => return false,
        };
        self.release_player(token).await
    }

    /// Destroys the session and notifies the client why; the release halts
    /// the owning connection handler. A second kick for the same player
    /// finds the session gone and does nothing.
    pub async fn kick(&self, player: &SharedPlayer, reason: &str) {
        let (token, id, addr) = {
            let p = player.lock().unwrap();
            (p.token, p.id, p.addr)
        };
        if !self.release_player(token).await {
            return;
        }
        warn!("kicked player {} at {}: {}", id, addr, reason);
        let bytes = PacketBuilder::new(OutboundPacketType::KickMessage)
            .add_string(reason)
            .build();
        let _ = self.outbound.send(Outbound { bytes, addr });
    }

    /// Whether an active session exists for this source IP. Only meaningful
    /// when the same-IP policy is enabled.
    pub fn has_session_from(&self, ip: IpAddr) -> bool {
        self.addresses.lock().unwrap().contains(&ip)
    }

    pub fn player_count(&self) -> usize {
        self.player_ids.lock().unwrap().len()
    }

    pub async fn players(&self) -> Vec<SharedPlayer> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Releases sessions that have not sent a packet within the idle
    /// window. Returns the number of sessions evicted.
    pub async fn cleanup(&self, now: i64) -> usize {
        let stale: Vec<(Uuid, i32)> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter_map(|player| {
                    let p = player.lock().unwrap();
                    (now - p.last_packet_time > self.idle_timeout_ms).then(|| (p.token, p.id))
                })
                .collect()
        };
        for (token, id) in &stale {
            info!("killed stale session, player {}", id);
            self.release_player(*token).await;
        }
        stale.len()
    }

    /// Kicks every active session with the given reason.
    pub async fn kick_all(&self, reason: &str) {
        for player in self.players().await {
            self.kick(&player, reason).await;
        }
    }
}

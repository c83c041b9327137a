//! UDP socket ownership and task orchestration.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use shared::MAX_PACKET_SIZE;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};

use crate::config::ServerConfig;
use crate::connections::ConnectionManager;
use crate::handler::PacketHandler;
use crate::rooms::RoomTable;
use crate::session::SessionManager;
use crate::utils::now_millis;

/// One datagram queued for sending.
#[derive(Debug)]
pub struct Outbound {
    pub bytes: Vec<u8>,
    pub addr: SocketAddr,
}

/// Every component that sends to clients holds one of these; a dedicated
/// task drains the channel onto the socket, so no lock is ever held across
/// a socket write.
pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

/// Owns the socket and the shared component graph, and runs the receive
/// loop plus the sender and sweep tasks.
pub struct GameServer {
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionManager>,
    connections: Arc<ConnectionManager>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    running: AtomicBool,
    shutdown: Notify,
}

impl GameServer {
    /// Binds the socket and wires up the component graph. The server does
    /// not process packets until [`GameServer::run`] is called.
    pub async fn new(config: ServerConfig) -> io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr()).await?);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let rooms = Arc::new(RoomTable::new(
            config.room_count(),
            config.room_change_cooldown_ms,
            outbound_tx.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            &config,
            rooms.clone(),
            outbound_tx.clone(),
        ));
        let handler = Arc::new(PacketHandler::new(
            &config,
            sessions.clone(),
            rooms,
            outbound_tx.clone(),
        ));
        let connections = Arc::new(ConnectionManager::new(
            handler,
            outbound_tx,
            config.idle_timeout_ms,
        ));

        Ok(Arc::new(GameServer {
            socket,
            sessions,
            connections,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }))
    }

    /// Runs the receive loop until [`GameServer::stop`] is called, spawning
    /// the sender and sweep tasks on entry.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "server already started"))?;
        self.running.store(true, Ordering::Relaxed);
        info!("listening on {}", self.socket.local_addr()?);

        let socket = self.socket.clone();
        tokio::spawn(async move {
            while let Some(Outbound { bytes, addr }) = outbound_rx.recv().await {
                if let Err(e) = socket.send_to(&bytes, addr).await {
                    warn!("failed to send {} byte(s) to {}: {}", bytes.len(), addr, e);
                }
            }
        });

        let sweeper = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            while sweeper.is_running() {
                interval.tick().await;
                let now = now_millis();
                sweeper.sessions.cleanup(now).await;
                sweeper.connections.cleanup(now).await;
            }
        });

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => {
                        self.connections.dispatch(addr, buf[..len].to_vec()).await;
                    }
                    Err(e) => error!("socket receive failed: {}", e),
                },
            }
        }

        self.running.store(false, Ordering::Relaxed);
        info!("server stopped");
        Ok(())
    }

    /// Kicks every player and stops the receive loop. Queued kick messages
    /// are still flushed by the sender task.
    pub async fn stop(&self) {
        info!("shutting down");
        self.running.store(false, Ordering::Relaxed);
        self.sessions.kick_all("Server halted").await;
        self.connections.shutdown().await;
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn player_count(&self) -> usize {
        self.sessions.player_count()
    }
}

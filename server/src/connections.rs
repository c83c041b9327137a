//! Per-address packet queues, rate limiting and idle reaping.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use shared::{OutboundPacketType, PacketBuilder};
use tokio::sync::{mpsc, RwLock};

use crate::handler::PacketHandler;
use crate::server::{Outbound, OutboundSender};
use crate::utils::now_millis;

/// Width of the rate-limit window.
pub const RATE_LIMIT_WINDOW_MS: i64 = 1000;

/// Packets allowed per window before suppression kicks in.
pub const RATE_LIMIT_MAX_PACKETS: usize = 30;

/// Decision for one arriving packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateGate {
    Allow,
    /// Allowed, ending a suppression streak.
    Recovered,
    /// Suppressed, first packet of a new streak; warn the client once.
    Warn,
    /// Suppressed silently.
    Drop,
}

/// Sliding-window packet rate limiter.
///
/// Suppressed packets still occupy the window, so a flooding client must
/// actually slow down before its packets are handled again.
pub struct RateLimiter {
    window_ms: i64,
    max_packets: usize,
    arrivals: VecDeque<i64>,
    suppressing: bool,
}

impl RateLimiter {
    pub fn new(window_ms: i64, max_packets: usize) -> Self {
        RateLimiter {
            window_ms,
            max_packets,
            arrivals: VecDeque::new(),
            suppressing: false,
        }
    }

    pub fn check(&mut self, now: i64) -> RateGate {
        while let Some(&arrival) = self.arrivals.front() {
            if now - arrival >= self.window_ms {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
        self.arrivals.push_back(now);

        if self.arrivals.len() > self.max_packets {
            if self.suppressing {
                RateGate::Drop
            } else {
                self.suppressing = true;
                RateGate::Warn
            }
        } else if self.suppressing {
            self.suppressing = false;
            RateGate::Recovered
        } else {
            RateGate::Allow
        }
    }
}

struct ConnectionEntry {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    last_seen: Arc<AtomicI64>,
}

/// Routes raw datagrams to one queue task per source address.
///
/// Each task drains its queue in order, applies the rate limit and hands
/// packets to the shared [`PacketHandler`]. A stopped task (kick, idle
/// eviction) is replaced lazily on the address's next packet, which also
/// gives a kicked client a fresh rate-limit window to log in again.
pub struct ConnectionManager {
    connections: RwLock<HashMap<SocketAddr, ConnectionEntry>>,
    handler: Arc<PacketHandler>,
    outbound: OutboundSender,
    idle_timeout_ms: i64,
}

impl ConnectionManager {
    pub fn new(handler: Arc<PacketHandler>, outbound: OutboundSender, idle_timeout_ms: i64) -> Self {
        ConnectionManager {
            connections: RwLock::new(HashMap::new()),
            handler,
            outbound,
            idle_timeout_ms,
        }
    }

    /// Enqueues a datagram for its source address, creating the queue task
    /// on first contact.
    pub async fn dispatch(&self, addr: SocketAddr, bytes: Vec<u8>) {
        let mut connections = self.connections.write().await;
        let entry = connections
            .entry(addr)
            .or_insert_with(|| self.spawn(addr));
        if entry.stop.load(Ordering::Relaxed) || entry.tx.is_closed() {
            *entry = self.spawn(addr);
        }
        let _ = entry.tx.send(bytes);
    }

    fn spawn(&self, addr: SocketAddr) -> ConnectionEntry {
        debug!("opening connection queue for {}", addr);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let stop = Arc::new(AtomicBool::new(false));
        let last_seen = Arc::new(AtomicI64::new(now_millis()));

        let handler = self.handler.clone();
        let outbound = self.outbound.clone();
        let task_stop = stop.clone();
        let task_seen = last_seen.clone();
        tokio::spawn(async move {
            let mut limiter = RateLimiter::new(RATE_LIMIT_WINDOW_MS, RATE_LIMIT_MAX_PACKETS);
            while let Some(bytes) = rx.recv().await {
                if task_stop.load(Ordering::Relaxed) {
                    break;
                }
                let now = now_millis();
                task_seen.store(now, Ordering::Relaxed);
                match limiter.check(now) {
                    RateGate::Allow => handler.handle(addr, &bytes, &task_stop).await,
                    RateGate::Recovered => {
                        info!("{} slowed back down, handling packets again", addr);
                        handler.handle(addr, &bytes, &task_stop).await;
                    }
                    RateGate::Warn => {
                        warn!("{} exceeded the packet rate limit, dropping packets", addr);
                        let bytes =
                            PacketBuilder::new(OutboundPacketType::RatelimitWarning).build();
                        let _ = outbound.send(Outbound { bytes, addr });
                    }
                    RateGate::Drop => {}
                }
            }
            debug!("connection queue for {} closed", addr);
        });

        ConnectionEntry {
            tx,
            stop,
            last_seen,
        }
    }

    /// Drops queue tasks that are stopped or idle past the timeout. Session
    /// eviction is separate; a reaped address gets a fresh queue on its next
    /// packet. Returns the number of entries removed.
    pub async fn cleanup(&self, now: i64) -> usize {
        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections.retain(|addr, entry| {
            let idle = now - entry.last_seen.load(Ordering::Relaxed) > self.idle_timeout_ms;
            let dead = entry.stop.load(Ordering::Relaxed) || entry.tx.is_closed();
            if idle || dead {
                debug!("dropping connection queue for {}", addr);
                entry.stop.store(true, Ordering::Relaxed);
                false
            } else {
                true
            }
        });
        before - connections.len()
    }

    /// Stops every queue task. Used on server shutdown.
    pub async fn shutdown(&self) {
        let mut connections = self.connections.write().await;
        for entry in connections.values() {
            entry.stop.store(true, Ordering::Relaxed);
        }
        connections.clear();
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

//! # Relay Server Library
//!
//! Authoritative session/room relay for a 2D multiplayer game client. The
//! server accepts UDP datagrams, assigns each client a session, tracks every
//! player's room and visual state, and relays state changes to the other
//! players sharing the same room. Implausible client input is corrected or
//! rejected, and abusive clients are rate limited and evicted.
//!
//! ## Module Organization
//!
//! - [`config`]: command-line server configuration.
//! - [`player`]: the per-session player record.
//! - [`session`]: session token / public ID bookkeeping and kicks.
//! - [`rooms`]: per-room occupant lists and join/leave notifications.
//! - [`validation`]: sprite/frame/movement anti-cheat checks.
//! - [`handler`]: inbound packet decoding and dispatch.
//! - [`connections`]: one packet queue task per connection, with rate
//!   limiting and idle reaping.
//! - [`server`]: the orchestrator owning the socket and periodic sweeps.
//!
//! ## Concurrency Model
//!
//! One tokio task per connection runs that connection's packet loop, so
//! packets from a single client are handled strictly in arrival order while
//! different clients proceed in parallel. Shared registries use read/write
//! locks around the maps plus one mutex per player and per room; no global
//! lock is held across a whole operation, and broadcasts enqueue datagrams
//! on an outbound channel instead of writing to the socket under a lock.

pub mod config;
pub mod connections;
pub mod handler;
pub mod player;
pub mod rooms;
pub mod server;
pub mod session;
pub mod utils;
pub mod validation;

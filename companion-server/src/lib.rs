//! Companion server library.
//!
//! Exposes the game-side half of the companion link for embedding and
//! tests: the `/ws` message endpoint with its handshake, the client
//! registry, persisted permission grants and the permission-gated REST API.

pub mod api;
pub mod backend;
pub mod config;
pub mod events;
pub mod permissions;
pub mod registry;
pub mod server;

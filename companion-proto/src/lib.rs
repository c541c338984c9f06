//! Shared protocol definitions for the companion link wire format.

pub mod codec;
pub mod handshake;
pub mod message;
pub mod permission;
pub mod rest;
pub mod session;

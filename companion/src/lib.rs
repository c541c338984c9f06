//! Companion client library.
//!
//! The companion-app half of the link: [`client::CompanionClient`] speaks
//! the WebSocket message protocol and [`rest::RestClient`] calls the
//! permission-gated REST API.

pub mod client;
pub mod config;
pub mod rest;

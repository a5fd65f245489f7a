//! `gout_client`
//!
//! Agent-side systems:
//! - Control connection management (register, watch notifications)
//! - Rendezvous dialing and upstream bridging for TCP tunnels
//! - Per-peer UDP session table with a framed reverse path

pub mod client;
pub mod session;

pub use client::ForwardClient;

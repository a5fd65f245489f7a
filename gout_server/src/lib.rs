//! `gout_server`
//!
//! Relay-side systems:
//! - Control dispatcher (accept agents, validate registrations)
//! - TCP tunnel engine (public + rendezvous listeners, `NEW_CONN` signaling)
//! - UDP tunnel engine (public socket framed over the control connection)
//! - Public-port allocation and public-IP discovery
//!
//! Networking model:
//! - One long-lived control connection per tunnel, owned by its handler.
//! - TCP payload travels on dedicated rendezvous connections, never on the
//!   control connection.

pub mod port;
pub mod public_ip;
pub mod server;

mod tcp;
mod udp;

pub use server::ForwardServer;

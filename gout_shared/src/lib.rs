//! `gout_shared`
//!
//! Shared libraries used by both the agent and the relay.
//!
//! Design goals:
//! - One definition of the control-plane wire format.
//! - Clear separation of concerns (proto, pump, config, logging).
//! - No `unsafe`.

pub mod config;
pub mod logging;
pub mod proto;
pub mod pump;

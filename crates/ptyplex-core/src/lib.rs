//! Core types for ptyplex.
//!
//! ptyplex runs many PTY sessions inside one daemon and streams each of them
//! to a UI client over a single TLS-protected, loopback-only connection.
//! This crate holds everything both ends agree on and does no I/O.
//!
//! # Modules
//!
//! - [`wire`]: opcode framing for the per-session streaming connection
//! - [`protocol`]: JSON-line request/response protocol for the control socket
//! - [`error`]: control-plane error type with actionable suggestions

pub mod error;
pub mod protocol;
pub mod wire;

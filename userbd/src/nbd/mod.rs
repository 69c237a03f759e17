//! NBD request handling.
//!
//! This module wraps the `nbd` crate's protocol types with the request loop
//! that serves a [`Device`](crate::device::Device) to the kernel.
//!
//! # Architecture
//!
//! - [`NbdServer`] answers requests on one kernel socket, strictly in order
//! - [`TransmissionExit`] says how a loop ended when it ended cleanly
//!
//! Binding the socket to a `/dev/nbd*` node is the job of
//! [`Session`](crate::session::Session).

mod server;

// Re-export protocol types from the nbd crate
pub use nbd::{NbdCommand, NbdReply, NbdRequest};
pub use server::{NbdServer, TransmissionExit};

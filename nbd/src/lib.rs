//! NBD (Network Block Device) transmission protocol and kernel binding.
//!
//! This crate provides the fixed-size request/reply frames exchanged with the
//! Linux NBD driver once a socket has been handed to a `/dev/nbd*` node, a
//! transmission-phase client, and (behind a feature) the ioctls that claim and
//! release such a node.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! # Features
//!
//! - `device` - Enable Linux kernel NBD device support (requires root)

mod client;
mod protocol;

#[cfg(feature = "device")]
mod device;

pub use client::NbdClient;
pub use protocol::*;

#[cfg(feature = "device")]
pub use device::{DeviceScan, KernelBinding, disconnect_device, negotiate};

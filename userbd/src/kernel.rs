//! Kernel-facing capability used by [`Session`](crate::session::Session).
//!
//! [`Kernel`] claims a device node and hands back a [`Binding`] plus the
//! user-space end of the socket. The production implementation is
//! [`nbd::DeviceScan`], which drives the `/dev/nbd*` ioctls; tests substitute
//! their own to exercise the session lifecycle without root.

use std::os::unix::net::UnixStream;
use std::path::Path;

use nbd::{DeviceScan, KernelBinding, NbdError};

/// Claims device nodes and requests disconnects.
pub trait Kernel: Send + Sync {
    /// Claim a free node sized to `size_bytes`.
    fn negotiate(&self, size_bytes: u64) -> Result<(Box<dyn Binding>, UnixStream), NbdError>;

    /// Ask the kernel to disconnect the node at `device_path`. Must be safe to
    /// call from any thread while [`Binding::run`] is blocked elsewhere.
    fn request_disconnect(&self, device_path: &Path) -> Result<(), NbdError>;
}

/// A claimed node.
///
/// [`run`](Binding::run) and [`release`](Binding::release) are always called
/// from the same OS thread, one after the other.
pub trait Binding: Send {
    fn device_path(&self) -> &Path;

    /// Block until the kernel releases the node.
    fn run(&self) -> Result<(), NbdError>;

    /// Disconnect, then clear the socket.
    fn release(&self) -> Result<(), NbdError>;
}

impl Kernel for DeviceScan {
    fn negotiate(&self, size_bytes: u64) -> Result<(Box<dyn Binding>, UnixStream), NbdError> {
        let (binding, socket) = nbd::negotiate(self, size_bytes)?;
        Ok((Box::new(binding), socket))
    }

    fn request_disconnect(&self, device_path: &Path) -> Result<(), NbdError> {
        nbd::disconnect_device(device_path)
    }
}

impl Binding for KernelBinding {
    fn device_path(&self) -> &Path {
        KernelBinding::device_path(self)
    }

    fn run(&self) -> Result<(), NbdError> {
        KernelBinding::run(self)
    }

    fn release(&self) -> Result<(), NbdError> {
        KernelBinding::release(self)
    }
}

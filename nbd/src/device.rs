//! Linux kernel NBD device binding.
//!
//! Claims a free `/dev/nbd*` node for one end of a Unix socket pair and
//! configures its geometry through ioctls, replacing the need for the
//! `nbd-client` binary. The other end of the pair carries the kernel's
//! transmission-phase requests to a user-space server.
//!
//! # Example
//!
//! ```ignore
//! use nbd::{DeviceScan, negotiate};
//!
//! let (binding, socket) = negotiate(&DeviceScan::default(), 1 << 30)?;
//! // serve `socket` on another thread, then:
//! binding.run()?; // NBD_DO_IT, returns once the device is released
//! binding.release()?;
//! ```
//!
//! # Claim race
//!
//! Finding a free node is check-then-claim: the `pid` marker is read before
//! `NBD_SET_SOCK` is issued, so two processes scanning at once can pick the
//! same node. The kernel lets only one `NBD_SET_SOCK` win (the other gets
//! `EBUSY`) and the loser moves on to the next index.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::libc;
use tracing::{debug, warn};

use crate::protocol::*;

// ioctl numbers from linux/nbd.h and linux/fs.h (architecture-independent)
#[allow(dead_code)]
mod ioctl {
    use nix::libc;
    pub const BLKROSET: libc::c_ulong = 0x125d;
    pub const NBD_SET_SOCK: libc::c_ulong = 0xab00;
    pub const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
    pub const NBD_SET_SIZE: libc::c_ulong = 0xab02;
    pub const NBD_DO_IT: libc::c_ulong = 0xab03;
    pub const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
    pub const NBD_CLEAR_QUE: libc::c_ulong = 0xab05;
    pub const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;
    pub const NBD_DISCONNECT: libc::c_ulong = 0xab08;
    pub const NBD_SET_TIMEOUT: libc::c_ulong = 0xab09;
    pub const NBD_SET_FLAGS: libc::c_ulong = 0xab0a;
}
use ioctl::*;

/// Where to look for NBD nodes and their liveness markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceScan {
    /// Directory holding the `nbd<N>` device nodes.
    pub dev_dir: PathBuf,
    /// Directory holding `nbd<N>/pid`, present while a node is bound.
    pub sys_block_dir: PathBuf,
}

impl Default for DeviceScan {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            sys_block_dir: PathBuf::from("/sys/block"),
        }
    }
}

impl DeviceScan {
    pub fn new(dev_dir: impl Into<PathBuf>, sys_block_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            sys_block_dir: sys_block_dir.into(),
        }
    }

    pub fn node_path(&self, index: usize) -> PathBuf {
        self.dev_dir.join(format!("nbd{index}"))
    }

    fn pid_marker(&self, index: usize) -> PathBuf {
        self.sys_block_dir.join(format!("nbd{index}")).join("pid")
    }

    fn is_busy(&self, index: usize) -> bool {
        !matches!(
            std::fs::metadata(self.pid_marker(index)),
            Err(e) if e.kind() == io::ErrorKind::NotFound
        )
    }
}

/// A `/dev/nbd*` node claimed for this process.
///
/// Holds the device handle and the kernel's end of the socket pair until it
/// is dropped. Dropping does not touch the kernel; call [`release`] first.
///
/// [`release`]: KernelBinding::release
#[derive(Debug)]
pub struct KernelBinding {
    device_path: PathBuf,
    device: File,
    /// Kernel end of the socket pair; closing it lets the server see EOF.
    _kernel_sock: OwnedFd,
}

/// Find a free NBD node, hand it one end of a fresh socket pair and size it.
///
/// Returns the claimed binding and the user-space end of the socket, on which
/// the kernel will send requests once [`KernelBinding::run`] is called.
///
/// # Errors
///
/// - [`NbdError::InvalidSize`] if `size_bytes` is zero or not a multiple of
///   [`NBD_BLOCK_SIZE`]
/// - [`NbdError::NoFreeDevice`] once the scan reaches a node that does not
///   exist without claiming one
/// - [`NbdError::Ioctl`] if a geometry ioctl fails on the claimed node
pub fn negotiate(
    scan: &DeviceScan,
    size_bytes: u64,
) -> Result<(KernelBinding, UnixStream), NbdError> {
    if size_bytes == 0 || size_bytes % NBD_BLOCK_SIZE != 0 {
        return Err(NbdError::InvalidSize {
            size_bytes,
            block_size: NBD_BLOCK_SIZE,
        });
    }

    let (kernel_end, user_end) = UnixStream::pair()?;

    let mut index = 0;
    let (device_path, device) = loop {
        let path = scan.node_path(index);
        if matches!(path.try_exists(), Ok(false)) {
            return Err(NbdError::NoFreeDevice { checked: index });
        }
        if scan.is_busy(index) {
            debug!(device = %path.display(), "nbd device busy, skipping");
            index += 1;
            continue;
        }

        match claim(&path, &kernel_end) {
            Ok(device) => break (path, device),
            Err(e) => {
                debug!(device = %path.display(), error = %e, "nbd device not claimable, skipping");
                index += 1;
            }
        }
    };

    let binding = KernelBinding {
        device_path,
        device,
        _kernel_sock: OwnedFd::from(kernel_end),
    };

    if let Err(e) = binding.configure(size_bytes) {
        if let Err(clear) = binding.control("NBD_CLEAR_SOCK", NBD_CLEAR_SOCK, 0) {
            warn!(error = %clear, "failed to release nbd device after configuration error");
        }
        return Err(e);
    }

    Ok((binding, user_end))
}

/// Open a candidate node and hand it the kernel end of the socket pair.
fn claim(path: &Path, kernel_end: &UnixStream) -> Result<File, NbdError> {
    let device = OpenOptions::new().read(true).write(true).open(path)?;

    // Best effort: a node left read-only by a previous user would reject
    // writes. Block-layer ioctls take a pointer to the flag.
    let read_only: libc::c_int = 0;
    // SAFETY: `device` is an open fd and `read_only` outlives the call.
    let ret = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            BLKROSET,
            &read_only as *const libc::c_int,
        )
    };
    if ret < 0 {
        debug!(device = %path.display(), error = %Errno::last(), "BLKROSET failed, ignoring");
    }

    ioctl_on(
        &device,
        path,
        "NBD_SET_SOCK",
        NBD_SET_SOCK,
        kernel_end.as_raw_fd() as libc::c_ulong,
    )?;
    Ok(device)
}

impl KernelBinding {
    /// Path of the claimed node, e.g. `/dev/nbd0`.
    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    fn configure(&self, size_bytes: u64) -> Result<(), NbdError> {
        self.control("NBD_SET_BLKSIZE", NBD_SET_BLKSIZE, NBD_BLOCK_SIZE as libc::c_ulong)?;
        self.control(
            "NBD_SET_SIZE_BLOCKS",
            NBD_SET_SIZE_BLOCKS,
            (size_bytes / NBD_BLOCK_SIZE) as libc::c_ulong,
        )?;
        self.control(
            "NBD_SET_FLAGS",
            NBD_SET_FLAGS,
            libc::c_ulong::from(NBD_FLAG_HAS_FLAGS),
        )?;
        Ok(())
    }

    /// Hand the device to the kernel (`NBD_DO_IT`).
    ///
    /// Blocks the calling thread until the device is released by a
    /// disconnect, a transport error or an external unbind. Call it from a
    /// dedicated thread and issue [`release`](Self::release) from that same
    /// thread afterwards.
    pub fn run(&self) -> Result<(), NbdError> {
        match self.control("NBD_DO_IT", NBD_DO_IT, 0) {
            // ENOTCONN is what a disconnected device returns
            Err(NbdError::Ioctl { source, .. })
                if source.raw_os_error() == Some(libc::ENOTCONN) =>
            {
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    /// Tear the binding down: `NBD_DISCONNECT`, then `NBD_CLEAR_SOCK`.
    ///
    /// Both ioctls are always attempted. The first failure is returned; a
    /// failing `NBD_CLEAR_SOCK` after a failed disconnect is only logged.
    pub fn release(&self) -> Result<(), NbdError> {
        let disconnect = self.control("NBD_DISCONNECT", NBD_DISCONNECT, 0);
        let clear = self.control("NBD_CLEAR_SOCK", NBD_CLEAR_SOCK, 0);

        match (disconnect, clear) {
            (Err(e), Err(clear)) => {
                warn!(error = %clear, "NBD_CLEAR_SOCK also failed");
                Err(e)
            }
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
            (Ok(_), Ok(_)) => Ok(()),
        }
    }

    fn control(
        &self,
        call: &'static str,
        request: libc::c_ulong,
        arg: libc::c_ulong,
    ) -> Result<libc::c_int, NbdError> {
        ioctl_on(&self.device, &self.device_path, call, request, arg)
    }
}

fn ioctl_on(
    device: &File,
    path: &Path,
    call: &'static str,
    request: libc::c_ulong,
    arg: libc::c_ulong,
) -> Result<libc::c_int, NbdError> {
    // SAFETY: `device` is an open fd; every NBD ioctl takes its argument by
    // value, so no memory is handed to the kernel.
    let ret = unsafe { libc::ioctl(device.as_raw_fd(), request, arg) };
    Errno::result(ret).map_err(|errno| NbdError::Ioctl {
        device: path.to_path_buf(),
        call,
        source: io::Error::from(errno),
    })
}

/// Ask the kernel to disconnect an NBD device by path.
///
/// Opens the node fresh (like `nbd-client -d`) and issues `NBD_DISCONNECT`,
/// which makes the kernel send `NBD_CMD_DISC` to the server and lets a
/// blocked `NBD_DO_IT` return. Safe to call from any thread.
pub fn disconnect_device(device_path: &Path) -> Result<(), NbdError> {
    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device_path)?;

    ioctl_on(&device, device_path, "NBD_DISCONNECT", NBD_DISCONNECT, 0)?;
    Ok(())
}

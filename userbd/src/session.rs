//! Session API: bind a [`Device`] to a `/dev/nbd*` node and serve it.
//!
//! A session goes through three steps:
//!
//! 1. [`Session::connect`] claims a free node, configures its geometry and
//!    starts the request loop on the user-space end of the socket pair.
//! 2. [`Session::wait`] hands the node to the kernel on a dedicated OS thread
//!    and blocks until the kernel lets go of it (disconnect, I/O error or an
//!    external unbind).
//! 3. The same thread tears the binding down, then the request loop is
//!    joined and its outcome reported.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use userbd::{MemoryDevice, Session};
//!
//! let mut session = Session::new(Arc::new(MemoryDevice::new(1 << 20)), 1 << 20);
//! let path = session.connect().await?;
//! println!("serving on {}", path.display());
//!
//! let stop = session.stop_handle().expect("connected");
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     stop.stop().ok();
//! });
//! session.wait().await?;
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread;

use nbd::{DeviceScan, NbdError};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::device::Device;
use crate::error::Error;
use crate::kernel::{Binding, Kernel};
use crate::nbd::{NbdServer, TransmissionExit};

/// Name of the thread that runs `NBD_DO_IT` and the teardown ioctls.
const HAND_OFF_THREAD: &str = "nbd-do-it";

/// A user-space block device session.
///
/// Created inert; [`connect`](Self::connect) binds it at most once per
/// success, and [`wait`](Self::wait) consumes it.
pub struct Session {
    device: Arc<dyn Device>,
    size_bytes: u64,
    kernel: Arc<dyn Kernel>,
    connection: Option<Connection>,
}

struct Connection {
    binding: Box<dyn Binding>,
    device_path: PathBuf,
    transmission: JoinHandle<Result<TransmissionExit, NbdError>>,
}

impl Session {
    /// Create a session serving `device` as a disk of `size_bytes`, bound
    /// through the system's `/dev/nbd*` nodes. Does no I/O.
    pub fn new(device: Arc<dyn Device>, size_bytes: u64) -> Self {
        Self::with_kernel(device, size_bytes, Arc::new(DeviceScan::default()))
    }

    /// Create a session bound through a custom [`Kernel`].
    pub fn with_kernel(device: Arc<dyn Device>, size_bytes: u64, kernel: Arc<dyn Kernel>) -> Self {
        Self {
            device,
            size_bytes,
            kernel,
            connection: None,
        }
    }

    /// Create a session from configuration.
    ///
    /// Opens the backend named by `config.storage` and scans the node
    /// directories from `config.nbd`.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        config.device.validate()?;
        let size_bytes = config.device.size_bytes;
        let device = config.storage.build_device(size_bytes)?;
        let scan = config.nbd.device_scan();
        Ok(Self::with_kernel(device, size_bytes, Arc::new(scan)))
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Path of the claimed node, once connected.
    pub fn device_path(&self) -> Option<&Path> {
        self.connection.as_ref().map(|c| c.device_path.as_path())
    }

    /// A handle that can ask the kernel to disconnect this session from
    /// another task while [`wait`](Self::wait) is running.
    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.connection.as_ref().map(|c| StopHandle {
            kernel: Arc::clone(&self.kernel),
            device_path: c.device_path.clone(),
        })
    }

    /// Claim a device node and start serving it.
    ///
    /// Returns the node path. On error the session stays unconnected and
    /// `connect` may be called again.
    pub async fn connect(&mut self) -> Result<PathBuf, Error> {
        if self.connection.is_some() {
            return Err(Error::AlreadyConnected);
        }

        let kernel = Arc::clone(&self.kernel);
        let size_bytes = self.size_bytes;
        let (binding, socket) = tokio::task::spawn_blocking(move || kernel.negotiate(size_bytes))
            .await
            .map_err(|e| io::Error::other(format!("negotiation task failed: {e}")))??;

        let stream = match into_async(socket) {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(release) = binding.release() {
                    warn!(error = %release, "failed to release nbd device after socket error");
                }
                return Err(e.into());
            }
        };

        let device_path = binding.device_path().to_path_buf();
        let server = NbdServer::new(Arc::clone(&self.device), size_bytes);
        let transmission = tokio::spawn(async move { server.serve(stream).await });

        info!(device = %device_path.display(), size_bytes, "NBD device bound");

        self.connection = Some(Connection {
            binding,
            device_path: device_path.clone(),
            transmission,
        });
        Ok(device_path)
    }

    /// Hand the device to the kernel and block until it is released.
    ///
    /// `NBD_DO_IT` and the teardown ioctls run back to back on one dedicated
    /// OS thread. Errors are reported in this order of precedence:
    ///
    /// 1. [`Error::Teardown`], carrying the hand-off outcome
    /// 2. the hand-off failure itself
    /// 3. a request loop failure (protocol violation or broken transport)
    pub async fn wait(self) -> Result<TransmissionExit, Error> {
        self.wait_with(spawn_hand_off_thread).await
    }

    async fn wait_with<F>(mut self, spawn: F) -> Result<TransmissionExit, Error>
    where
        F: FnOnce(HandOff) -> io::Result<()>,
    {
        let Connection {
            binding,
            device_path,
            transmission,
        } = self.connection.take().ok_or(Error::NotConnected)?;

        let rx = match start_hand_off(binding, spawn) {
            Ok(rx) => rx,
            Err((binding, e)) => {
                // The thread never ran; give the node back from here.
                if let Err(release) = binding.release() {
                    warn!(
                        device = %device_path.display(),
                        error = %release,
                        "failed to release nbd device after hand-off error"
                    );
                }
                transmission.abort();
                return Err(e.into());
            }
        };

        info!(device = %device_path.display(), "device handed to the kernel");

        let (run, teardown) = rx
            .await
            .map_err(|_| io::Error::other("kernel hand-off thread exited without reporting"))?;

        let transmission = transmission.await.unwrap_or_else(|e| {
            Err(NbdError::Io(io::Error::other(format!(
                "transmission task failed: {e}"
            ))))
        });

        if let Err(source) = teardown {
            if let Err(e) = &transmission {
                warn!(error = %e, "transmission also failed");
            }
            return Err(Error::Teardown {
                device: device_path,
                source,
                run: run.err(),
            });
        }

        if let Err(e) = run {
            if let Err(t) = &transmission {
                warn!(error = %t, "transmission also failed");
            }
            return Err(e.into());
        }

        let exit = transmission?;
        info!(device = %device_path.display(), ?exit, "NBD device released");
        Ok(exit)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A session dropped without `wait` must not leave the node claimed.
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.binding.release() {
                warn!(
                    device = %connection.device_path.display(),
                    error = %e,
                    "release on drop failed"
                );
            }
            connection.transmission.abort();
        }
    }
}

type HandOff = Box<dyn FnOnce() + Send>;
type HandOffResult = (Result<(), NbdError>, Result<(), NbdError>);

fn spawn_hand_off_thread(body: HandOff) -> io::Result<()> {
    thread::Builder::new()
        .name(HAND_OFF_THREAD.to_string())
        .spawn(body)
        .map(drop)
}

/// Start the hand-off thread, then pass it the binding.
///
/// The binding only moves once the thread exists, so a failed spawn hands it
/// back to the caller for release.
fn start_hand_off<F>(
    binding: Box<dyn Binding>,
    spawn: F,
) -> Result<oneshot::Receiver<HandOffResult>, (Box<dyn Binding>, io::Error)>
where
    F: FnOnce(HandOff) -> io::Result<()>,
{
    let (binding_tx, binding_rx) = mpsc::channel::<Box<dyn Binding>>();
    let (tx, rx) = oneshot::channel();

    let body = move || {
        let Ok(binding) = binding_rx.recv() else {
            return;
        };
        let run = binding.run();
        let teardown = binding.release();
        drop(binding);
        let _ = tx.send((run, teardown));
    };

    if let Err(e) = spawn(Box::new(body)) {
        return Err((binding, e));
    }
    binding_tx.send(binding).map_err(|mpsc::SendError(binding)| {
        (binding, io::Error::other("kernel hand-off thread exited early"))
    })?;
    Ok(rx)
}

fn into_async(socket: std::os::unix::net::UnixStream) -> io::Result<UnixStream> {
    socket.set_nonblocking(true)?;
    UnixStream::from_std(socket)
}

/// Requests a clean stop of a running session.
#[derive(Clone)]
pub struct StopHandle {
    kernel: Arc<dyn Kernel>,
    device_path: PathBuf,
}

impl StopHandle {
    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    /// Ask the kernel to disconnect the device. The kernel sends
    /// `NBD_CMD_DISC` down the socket and `wait` then returns.
    pub fn stop(&self) -> Result<(), Error> {
        info!(device = %self.device_path.display(), "requesting disconnect");
        self.kernel.request_disconnect(&self.device_path)?;
        Ok(())
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

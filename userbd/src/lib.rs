//! userbd: serve a user-space storage backend as a Linux `/dev/nbd*` device.
//!
//! The kernel's NBD driver forwards block I/O down a Unix socket; userbd
//! answers it from any [`Device`] implementation.
//!
//! # Library Usage
//!
//! The primary API is the [`Session`] struct:
//!
//! ```ignore
//! use std::sync::Arc;
//! use userbd::{MemoryDevice, Session};
//!
//! let mut session = Session::new(Arc::new(MemoryDevice::new(1 << 30)), 1 << 30);
//! let path = session.connect().await?;
//! session.wait().await?;
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod kernel;
pub mod nbd;
pub mod session;

pub use config::{Config, DeviceConfig, NbdConfig, StorageConfig};
pub use device::{Device, DeviceResult, FileDevice, MemoryDevice};
pub use error::{ConfigError, DeviceError, Error, NbdError, Result};
pub use kernel::{Binding, Kernel};
pub use crate::nbd::{NbdServer, TransmissionExit};
pub use session::{Session, StopHandle};

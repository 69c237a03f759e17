//! Storage backends served to the kernel.
//!
//! The request loop only ever talks to a [`Device`]: positional reads and
//! writes plus a durability barrier. What sits behind it (memory, a file, a
//! remote store) is up to the caller.
//!
//! # Example
//!
//! ```ignore
//! let device: Arc<dyn Device> = Arc::new(MemoryDevice::new(1 << 20));
//! let mut session = Session::new(device, 1 << 20);
//! ```

mod file;
mod memory;

use async_trait::async_trait;

use crate::error::DeviceError;

pub use file::FileDevice;
pub use memory::MemoryDevice;

/// Result of a backend operation.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Random-access storage behind an NBD device.
///
/// Calls are issued one at a time by a single request loop, but the trait
/// takes `&self` so backends can be shared with other tasks.
#[async_trait]
pub trait Device: Send + Sync {
    /// Fill `buf` from `offset`. Returns the number of bytes read; anything
    /// short of `buf.len()` is answered as an I/O error.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> DeviceResult<usize>;

    /// Write all of `buf` at `offset`. Returns the number of bytes written.
    async fn write_at(&self, buf: &[u8], offset: u64) -> DeviceResult<usize>;

    /// Make previous writes durable.
    async fn flush(&self) -> DeviceResult<()>;
}

fn check_bounds(offset: u64, length: usize, size_bytes: u64) -> DeviceResult<()> {
    let length = length as u64;
    match offset.checked_add(length) {
        Some(end) if end <= size_bytes => Ok(()),
        _ => Err(DeviceError::OutOfBounds {
            offset,
            length,
            size_bytes,
        }),
    }
}

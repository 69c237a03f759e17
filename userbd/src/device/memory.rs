use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Device, DeviceResult, check_bounds};

/// A zero-initialised in-memory device.
#[derive(Debug)]
pub struct MemoryDevice {
    data: RwLock<Vec<u8>>,
    size_bytes: u64,
}

impl MemoryDevice {
    pub fn new(size_bytes: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size_bytes]),
            size_bytes: size_bytes as u64,
        }
    }

    /// Copy of the current contents, for inspection in tests and tools.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.data.read().await.clone()
    }
}

#[async_trait]
impl Device for MemoryDevice {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> DeviceResult<usize> {
        check_bounds(offset, buf.len(), self.size_bytes)?;
        let data = self.data.read().await;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(buf.len())
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> DeviceResult<usize> {
        check_bounds(offset, buf.len(), self.size_bytes)?;
        let mut data = self.data.write().await;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    async fn flush(&self) -> DeviceResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;

    #[tokio::test]
    async fn fresh_device_reads_zeroes() {
        let device = MemoryDevice::new(8192);
        let mut buf = vec![0xFFu8; 512];
        assert_eq!(device.read_at(&mut buf, 4096).await.unwrap(), 512);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn partial_write_leaves_neighbours() {
        let device = MemoryDevice::new(4096);
        device.write_at(&[0xAB; 100], 50).await.unwrap();

        let mut buf = vec![0u8; 200];
        device.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(&buf[..50], &[0x00; 50]);
        assert_eq!(&buf[50..150], &[0xAB; 100]);
        assert_eq!(&buf[150..200], &[0x00; 50]);
    }

    #[tokio::test]
    async fn access_past_end_is_rejected() {
        let device = MemoryDevice::new(4096);
        let mut buf = vec![0u8; 16];
        let result = device.read_at(&mut buf, 4090).await;
        assert!(matches!(result, Err(DeviceError::OutOfBounds { .. })));

        let result = device.write_at(&buf, u64::MAX).await;
        assert!(matches!(result, Err(DeviceError::OutOfBounds { .. })));
    }
}

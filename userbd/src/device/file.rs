use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Device, DeviceResult};

/// A device backed by a regular file (or an existing block device).
///
/// Positional I/O runs on tokio's blocking pool. Reads past the end of the
/// file return zeroes, so a sparse or short image behaves like a fresh disk.
#[derive(Debug, Clone)]
pub struct FileDevice {
    file: Arc<File>,
    path: PathBuf,
}

impl FileDevice {
    /// Open `path` for reading and writing, creating it if needed and
    /// extending it to `size_bytes` if it is shorter.
    pub fn open(path: impl AsRef<Path>, size_bytes: u64) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let metadata = file.metadata()?;
        if metadata.is_file() && metadata.len() < size_bytes {
            debug!(
                path = %path.display(),
                from = metadata.len(),
                to = size_bytes,
                "extending backing file"
            );
            file.set_len(size_bytes)?;
        }

        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || f(&file))
            .await
            .map_err(|e| io::Error::other(format!("blocking task failed: {e}")))?
    }
}

/// Fill `buf` from `offset`, zero-filling whatever lies past end-of-file.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => {
                buf[filled..].fill(0);
                break;
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[async_trait]
impl Device for FileDevice {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> DeviceResult<usize> {
        let length = buf.len();
        let data = self
            .blocking(move |file| {
                let mut data = vec![0u8; length];
                read_full_at(file, &mut data, offset)?;
                Ok(data)
            })
            .await?;
        buf.copy_from_slice(&data);
        Ok(length)
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> DeviceResult<usize> {
        let data = buf.to_vec();
        let length = data.len();
        self.blocking(move |file| file.write_all_at(&data, offset))
            .await?;
        Ok(length)
    }

    async fn flush(&self) -> DeviceResult<()> {
        self.blocking(|file| file.sync_all()).await?;
        Ok(())
    }
}

//! Transmission-phase NBD client.
//!
//! Speaks to a server the way the kernel does once a socket has been handed
//! over with `NBD_SET_SOCK`: no handshake, just request and reply frames. Used
//! to drive a server from tests and tools without a real `/dev/nbd*` node.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::*;

/// NBD client for an already-negotiated transmission stream.
pub struct NbdClient<S> {
    stream: S,
    next_handle: u64,
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream that is already in the transmission phase.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            next_handle: 1,
        }
    }

    /// Give back the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        handle
    }

    async fn send_request(
        &mut self,
        command: NbdCommand,
        offset: u64,
        length: u32,
    ) -> Result<u64, NbdError> {
        let handle = self.next_handle();
        let req = NbdRequest::new(command, handle, offset, length);
        self.stream.write_all(&req.to_bytes()).await?;
        Ok(handle)
    }

    async fn read_reply(&mut self, handle: u64) -> Result<(), NbdError> {
        let mut buf = [0u8; NbdReply::SIZE_BYTES];
        self.stream.read_exact(&mut buf).await?;
        let reply = NbdReply::from_bytes(&buf)?;

        if reply.handle != handle {
            return Err(NbdError::HandleMismatch {
                expected: handle,
                actual: reply.handle,
            });
        }
        if reply.error != NBD_OK {
            return Err(NbdError::ServerError { code: reply.error });
        }
        Ok(())
    }

    /// Read data from the device.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, NbdError> {
        let handle = self.send_request(NbdCommand::Read, offset, length).await?;
        self.read_reply(handle).await?;

        let mut data = BytesMut::zeroed(length as usize);
        self.stream.read_exact(&mut data).await.map_err(|e| {
            NbdError::Io(io::Error::other(format!(
                "failed to read {length} bytes of response data at offset {offset}: {e}"
            )))
        })?;
        Ok(data.freeze())
    }

    /// Write data to the device.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), NbdError> {
        let length = u32::try_from(data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "write exceeds u32::MAX"))?;
        let handle = self.send_request(NbdCommand::Write, offset, length).await?;
        self.stream.write_all(data).await?;
        self.read_reply(handle).await
    }

    /// Ask the server to flush. The server never answers a flush, so this
    /// only sends the request.
    pub async fn flush(&mut self) -> Result<(), NbdError> {
        self.send_request(NbdCommand::Flush, 0, 0).await?;
        Ok(())
    }

    /// Trim a range. Servers that do not discard answer with
    /// [`NbdError::ServerError`].
    pub async fn trim(&mut self, offset: u64, length: u32) -> Result<(), NbdError> {
        let handle = self.send_request(NbdCommand::Trim, offset, length).await?;
        self.read_reply(handle).await
    }

    /// Tell the server to stop serving this stream.
    pub async fn disconnect(mut self) -> Result<S, NbdError> {
        self.send_request(NbdCommand::Disconnect, 0, 0).await?;
        self.stream.flush().await?;
        Ok(self.stream)
    }
}

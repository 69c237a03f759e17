//! Transmission-phase request loop.
//!
//! The `NbdServer` answers the kernel's requests on the user-space end of the
//! socket pair, one at a time and in order: a request is not read until the
//! previous reply has been written in full. It is transport-agnostic and
//! works with any async stream (the kernel's Unix socket, or an in-memory
//! duplex in tests).

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

// Protocol types from the nbd crate
use nbd::*;

use crate::device::Device;

/// How a transmission loop ended without a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionExit {
    /// The peer sent `NBD_CMD_DISC`.
    Disconnected,
    /// The peer closed the stream between two requests.
    Closed,
}

/// NBD request loop for a single kernel socket.
#[derive(Clone)]
pub struct NbdServer {
    device: Arc<dyn Device>,
    size_bytes: u64,
}

impl NbdServer {
    /// Serve `device` as a disk of `size_bytes`.
    pub fn new(device: Arc<dyn Device>, size_bytes: u64) -> Self {
        Self { device, size_bytes }
    }

    /// Serve requests until the peer disconnects or the stream breaks.
    ///
    /// A bad magic or an unknown command ends the loop with an error and
    /// without a reply: once framing is lost nothing later on the stream can
    /// be trusted. Backend failures are answered with an error code and the
    /// loop carries on.
    pub async fn serve<S>(&self, mut stream: S) -> Result<TransmissionExit, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut req_buf = [0u8; NbdRequest::SIZE_BYTES];
        // Reply header followed by payload, reused across requests.
        let mut buf = Vec::new();

        loop {
            // EOF is only clean between frames; a torn header is a transport error.
            let first = stream.read(&mut req_buf).await?;
            if first == 0 {
                return Ok(TransmissionExit::Closed);
            }
            stream.read_exact(&mut req_buf[first..]).await?;

            let req = NbdRequest::from_bytes(&req_buf)?;
            trace!(
                command = ?req.command,
                handle = req.handle,
                offset = req.offset,
                length = req.length,
                "NBD request"
            );

            match req.command {
                NbdCommand::Read => self.read(&mut stream, &req, &mut buf).await?,
                NbdCommand::Write => self.write(&mut stream, &req, &mut buf).await?,
                NbdCommand::Disconnect => {
                    debug!(handle = req.handle, "NBD disconnect requested");
                    return Ok(TransmissionExit::Disconnected);
                }
                NbdCommand::Flush => {
                    // Flush is not acknowledged on the wire.
                    if let Err(e) = self.device.flush().await {
                        warn!(error = %e, "flush error");
                    }
                }
                NbdCommand::Trim => {
                    stream
                        .write_all(&NbdReply::error(req.handle, NBD_EPERM).to_bytes())
                        .await?;
                }
            }
        }
    }

    /// Reply code for a READ/WRITE that must not reach the device.
    fn reject(&self, req: &NbdRequest) -> Option<u32> {
        if req.length > NBD_MAX_PAYLOAD_SIZE {
            return Some(NBD_EOVERFLOW);
        }
        let end = req.offset.checked_add(u64::from(req.length));
        if end.is_none_or(|end| end > self.size_bytes) {
            return Some(NBD_EINVAL);
        }
        None
    }

    async fn read<S>(
        &self,
        stream: &mut S,
        req: &NbdRequest,
        buf: &mut Vec<u8>,
    ) -> Result<(), NbdError>
    where
        S: AsyncWrite + Unpin,
    {
        if let Some(code) = self.reject(req) {
            warn!(offset = req.offset, length = req.length, code, "rejecting read");
            return send_reply(stream, NbdReply::error(req.handle, code)).await;
        }

        let len = req.length as usize;
        buf.clear();
        buf.resize(NbdReply::SIZE_BYTES + len, 0);
        let (header, data) = buf.split_at_mut(NbdReply::SIZE_BYTES);

        let code = match self.device.read_at(data, req.offset).await {
            Ok(n) if n == len => NBD_OK,
            Ok(n) => {
                warn!(offset = req.offset, expected = len, actual = n, "short read");
                NBD_EIO
            }
            Err(e) => {
                warn!(error = %e, "read error");
                NBD_EIO
            }
        };

        if code != NBD_OK {
            return send_reply(stream, NbdReply::error(req.handle, code)).await;
        }

        // Header and data go out as one frame.
        NbdReply::ok(req.handle).write_to(header);
        stream.write_all(buf).await?;
        Ok(())
    }

    async fn write<S>(
        &self,
        stream: &mut S,
        req: &NbdRequest,
        buf: &mut Vec<u8>,
    ) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let len = req.length as usize;

        if let Some(code) = self.reject(req) {
            warn!(offset = req.offset, length = req.length, code, "rejecting write");
            // The payload is on the wire regardless; skip it to stay framed.
            let mut payload = (&mut *stream).take(u64::from(req.length));
            let drained = tokio::io::copy(&mut payload, &mut tokio::io::sink()).await?;
            if drained != u64::from(req.length) {
                return Err(NbdError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            return send_reply(stream, NbdReply::error(req.handle, code)).await;
        }

        buf.clear();
        buf.resize(len, 0);
        stream.read_exact(buf).await?;

        let code = match self.device.write_at(buf, req.offset).await {
            Ok(n) if n == len => NBD_OK,
            Ok(n) => {
                warn!(offset = req.offset, expected = len, actual = n, "short write");
                NBD_EIO
            }
            Err(e) => {
                warn!(error = %e, "write error");
                NBD_EIO
            }
        };
        send_reply(stream, NbdReply { error: code, handle: req.handle }).await
    }
}

async fn send_reply<S>(stream: &mut S, reply: NbdReply) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&reply.to_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceResult, MemoryDevice};
    use crate::error::DeviceError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{DuplexStream, duplex};

    const SIZE: u64 = 1024 * 1024;

    /// Counts calls and optionally fails them, around a memory device.
    struct CountingDevice {
        inner: MemoryDevice,
        reads: AtomicUsize,
        writes: AtomicUsize,
        flushes: AtomicUsize,
        fail: bool,
    }

    impl CountingDevice {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryDevice::new(SIZE as usize),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                flushes: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
                + self.writes.load(Ordering::SeqCst)
                + self.flushes.load(Ordering::SeqCst)
        }

        fn failure(&self) -> DeviceError {
            DeviceError::Io(std::io::Error::other("injected"))
        }
    }

    #[async_trait]
    impl Device for CountingDevice {
        async fn read_at(&self, buf: &mut [u8], offset: u64) -> DeviceResult<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(self.failure());
            }
            self.inner.read_at(buf, offset).await
        }

        async fn write_at(&self, buf: &[u8], offset: u64) -> DeviceResult<usize> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(self.failure());
            }
            self.inner.write_at(buf, offset).await
        }

        async fn flush(&self) -> DeviceResult<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(self.failure());
            }
            self.inner.flush().await
        }
    }

    /// Always reads back the same byte.
    struct PatternDevice(u8);

    #[async_trait]
    impl Device for PatternDevice {
        async fn read_at(&self, buf: &mut [u8], _offset: u64) -> DeviceResult<usize> {
            buf.fill(self.0);
            Ok(buf.len())
        }

        async fn write_at(&self, buf: &[u8], _offset: u64) -> DeviceResult<usize> {
            Ok(buf.len())
        }

        async fn flush(&self) -> DeviceResult<()> {
            Ok(())
        }
    }

    fn spawn_server(
        device: Arc<dyn Device>,
    ) -> (
        DuplexStream,
        tokio::task::JoinHandle<Result<TransmissionExit, NbdError>>,
    ) {
        let (kernel, server_stream) = duplex(1024 * 1024);
        let server = NbdServer::new(device, SIZE);
        let handle = tokio::spawn(async move { server.serve(server_stream).await });
        (kernel, handle)
    }

    async fn send(
        kernel: &mut DuplexStream,
        command: NbdCommand,
        handle: u64,
        offset: u64,
        length: u32,
    ) {
        let req = NbdRequest::new(command, handle, offset, length);
        kernel.write_all(&req.to_bytes()).await.unwrap();
    }

    async fn recv_reply(kernel: &mut DuplexStream) -> NbdReply {
        let mut buf = [0u8; NbdReply::SIZE_BYTES];
        kernel.read_exact(&mut buf).await.unwrap();
        NbdReply::from_bytes(&buf).unwrap()
    }

    #[tokio::test]
    async fn read_returns_device_pattern() {
        let (mut kernel, server) = spawn_server(Arc::new(PatternDevice(0x5A)));

        send(&mut kernel, NbdCommand::Read, 0xFEED, 8192, 4096).await;
        let mut frame = vec![0u8; NbdReply::SIZE_BYTES + 4096];
        kernel.read_exact(&mut frame).await.unwrap();

        let header: [u8; 16] = frame[..16].try_into().unwrap();
        let reply = NbdReply::from_bytes(&header).unwrap();
        assert_eq!(reply, NbdReply::ok(0xFEED));
        assert!(frame[16..].iter().all(|&b| b == 0x5A));

        drop(kernel);
        assert_eq!(server.await.unwrap().unwrap(), TransmissionExit::Closed);
    }

    #[tokio::test]
    async fn write_payload_split_across_transport_writes() {
        let device = CountingDevice::new(false);
        let (mut kernel, _server) = spawn_server(device.clone());

        let payload: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        send(&mut kernel, NbdCommand::Write, 7, 4096, payload.len() as u32).await;
        kernel.write_all(&payload[..700]).await.unwrap();
        kernel.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        kernel.write_all(&payload[700..]).await.unwrap();

        assert_eq!(recv_reply(&mut kernel).await, NbdReply::ok(7));
        assert_eq!(device.writes.load(Ordering::SeqCst), 1);

        let stored = device.inner.snapshot().await;
        assert_eq!(&stored[4096..4096 + payload.len()], payload.as_slice());
    }

    #[tokio::test]
    async fn header_split_across_transport_writes() {
        let (mut kernel, _server) = spawn_server(Arc::new(PatternDevice(1)));

        let req = NbdRequest::new(NbdCommand::Trim, 11, 0, 4096).to_bytes();
        kernel.write_all(&req[..5]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        kernel.write_all(&req[5..]).await.unwrap();

        assert_eq!(recv_reply(&mut kernel).await, NbdReply::error(11, 1));
    }

    #[tokio::test]
    async fn trim_is_refused_without_touching_device() {
        let device = CountingDevice::new(false);
        let (mut kernel, _server) = spawn_server(device.clone());

        for (handle, offset, length) in [(1, 0, 4096), (2, SIZE * 4, u32::MAX), (3, 17, 0)] {
            send(&mut kernel, NbdCommand::Trim, handle, offset, length).await;
            let reply = recv_reply(&mut kernel).await;
            assert_eq!(reply.handle, handle);
            assert_eq!(reply.error, 1);
        }
        assert_eq!(device.calls(), 0);
    }

    #[tokio::test]
    async fn flush_is_called_once_and_not_answered() {
        let device = CountingDevice::new(false);
        let (mut kernel, _server) = spawn_server(device.clone());

        send(&mut kernel, NbdCommand::Flush, 1, 0, 0).await;
        // The next frame on the wire must be the TRIM reply, not a flush ack.
        send(&mut kernel, NbdCommand::Trim, 2, 0, 0).await;
        assert_eq!(recv_reply(&mut kernel).await, NbdReply::error(2, 1));
        assert_eq!(device.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_stops_reading() {
        let device = CountingDevice::new(false);
        let (mut kernel, server) = spawn_server(device.clone());

        // One transport write, so the trailing READ is already buffered when
        // the server stops.
        let mut frames = NbdRequest::new(NbdCommand::Disconnect, 1, 0, 0).to_bytes().to_vec();
        frames.extend_from_slice(&NbdRequest::new(NbdCommand::Read, 2, 0, 512).to_bytes());
        kernel.write_all(&frames).await.unwrap();

        assert_eq!(server.await.unwrap().unwrap(), TransmissionExit::Disconnected);
        assert_eq!(device.calls(), 0);

        // The server end is gone; nothing was answered.
        let mut rest = Vec::new();
        kernel.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn invalid_magic_is_fatal() {
        let device = CountingDevice::new(false);
        let (mut kernel, server) = spawn_server(device.clone());

        let mut frame = NbdRequest::new(NbdCommand::Read, 1, 0, 512).to_bytes();
        frame[0..4].copy_from_slice(&0x12560953u32.to_be_bytes());
        kernel.write_all(&frame).await.unwrap();

        let result = server.await.unwrap();
        assert!(matches!(result, Err(NbdError::InvalidMagic { .. })));
        assert_eq!(device.calls(), 0);

        let mut rest = Vec::new();
        kernel.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_fatal() {
        let (mut kernel, server) = spawn_server(Arc::new(PatternDevice(0)));

        let mut frame = NbdRequest::new(NbdCommand::Read, 1, 0, 0).to_bytes();
        frame[4..8].copy_from_slice(&6u32.to_be_bytes());
        kernel.write_all(&frame).await.unwrap();

        let result = server.await.unwrap();
        assert!(matches!(
            result,
            Err(NbdError::UnsupportedCommand { command: 6 })
        ));
    }

    #[tokio::test]
    async fn backend_failures_become_eio() {
        let device = CountingDevice::new(true);
        let (mut kernel, _server) = spawn_server(device.clone());

        send(&mut kernel, NbdCommand::Read, 1, 0, 512).await;
        assert_eq!(recv_reply(&mut kernel).await, NbdReply::error(1, NBD_EIO));

        send(&mut kernel, NbdCommand::Write, 2, 0, 4).await;
        kernel.write_all(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(recv_reply(&mut kernel).await, NbdReply::error(2, NBD_EIO));

        // A failed flush is only logged; the stream stays usable.
        send(&mut kernel, NbdCommand::Flush, 3, 0, 0).await;
        send(&mut kernel, NbdCommand::Trim, 4, 0, 0).await;
        assert_eq!(recv_reply(&mut kernel).await, NbdReply::error(4, 1));
    }

    #[tokio::test]
    async fn out_of_range_requests_are_rejected_in_frame() {
        let device = CountingDevice::new(false);
        let (mut kernel, _server) = spawn_server(device.clone());

        send(&mut kernel, NbdCommand::Read, 1, SIZE - 256, 512).await;
        assert_eq!(recv_reply(&mut kernel).await, NbdReply::error(1, NBD_EINVAL));

        // The rejected payload is skipped, so the next request still parses.
        send(&mut kernel, NbdCommand::Write, 2, SIZE, 8).await;
        kernel.write_all(&[0xCC; 8]).await.unwrap();
        assert_eq!(recv_reply(&mut kernel).await, NbdReply::error(2, NBD_EINVAL));

        send(&mut kernel, NbdCommand::Read, 3, u64::MAX, 1).await;
        assert_eq!(recv_reply(&mut kernel).await, NbdReply::error(3, NBD_EINVAL));

        send(&mut kernel, NbdCommand::Read, 4, 0, NBD_MAX_PAYLOAD_SIZE + 1).await;
        assert_eq!(recv_reply(&mut kernel).await, NbdReply::error(4, NBD_EOVERFLOW));

        assert_eq!(device.calls(), 0);
    }

    #[tokio::test]
    async fn eof_mid_payload_is_an_error() {
        let (mut kernel, server) = spawn_server(Arc::new(PatternDevice(0)));

        send(&mut kernel, NbdCommand::Write, 1, 0, 512).await;
        kernel.write_all(&[0u8; 100]).await.unwrap();
        drop(kernel);

        assert!(matches!(server.await.unwrap(), Err(NbdError::Io(_))));
    }

    #[tokio::test]
    async fn eof_mid_header_is_an_error() {
        let (mut kernel, server) = spawn_server(Arc::new(PatternDevice(0)));

        let frame = NbdRequest::new(NbdCommand::Read, 1, 0, 512).to_bytes();
        kernel.write_all(&frame[..10]).await.unwrap();
        drop(kernel);

        match server.await.unwrap() {
            Err(NbdError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected a truncated-frame error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_magic_frames_are_served() {
        let (mut kernel, _server) = spawn_server(Arc::new(PatternDevice(9)));

        let mut frame = NbdRequest::new(NbdCommand::Read, 5, 0, 16).to_bytes();
        frame[0..4].copy_from_slice(&NBD_SIMPLE_REPLY_MAGIC.to_be_bytes());
        kernel.write_all(&frame).await.unwrap();

        assert_eq!(recv_reply(&mut kernel).await, NbdReply::ok(5));
        let mut data = [0u8; 16];
        kernel.read_exact(&mut data).await.unwrap();
        assert_eq!(data, [9u8; 16]);
    }
}

//! NBD transmission-phase constants and frame types.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//! and `linux/nbd.h`. Only the fixed-size request and simple reply frames are
//! modelled; option haggling never happens on a kernel-bound socket.

#![allow(dead_code)]

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// Magic values
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;
pub const NBD_FLAG_ROTATIONAL: u16 = 1 << 4;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;

/// Block size configured on every kernel device.
pub const NBD_BLOCK_SIZE: u64 = 4096;

/// Maximum READ/WRITE payload accepted from the kernel (32 MiB).
///
/// Bounds the per-request buffer. The kernel never comes close with its
/// default `max_sectors`, so anything larger means a confused peer.
pub const NBD_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

// Commands
pub const NBD_CMD_READ: u32 = 0;
pub const NBD_CMD_WRITE: u32 = 1;
pub const NBD_CMD_DISCONNECT: u32 = 2;
pub const NBD_CMD_FLUSH: u32 = 3;
pub const NBD_CMD_TRIM: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdCommand {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
}

impl NbdCommand {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            NBD_CMD_READ => Some(Self::Read),
            NBD_CMD_WRITE => Some(Self::Write),
            NBD_CMD_DISCONNECT => Some(Self::Disconnect),
            NBD_CMD_FLUSH => Some(Self::Flush),
            NBD_CMD_TRIM => Some(Self::Trim),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISCONNECT,
            Self::Flush => NBD_CMD_FLUSH,
            Self::Trim => NBD_CMD_TRIM,
        }
    }
}

// Error codes
pub const NBD_OK: u32 = 0;
/// Also the code TRIM is answered with: this server never discards.
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;
pub const NBD_EOVERFLOW: u32 = 75;

/// NBD protocol and kernel binding errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("invalid magic: expected 0x{expected:08x}, got 0x{actual:08x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("unsupported command: {command}")]
    UnsupportedCommand { command: u32 },

    #[error("server error: {code}")]
    ServerError { code: u32 },

    #[error("handle mismatch: expected {expected}, got {actual}")]
    HandleMismatch { expected: u64, actual: u64 },

    #[error("no free nbd devices ({checked} checked)")]
    NoFreeDevice { checked: usize },

    #[error("invalid device size: {size_bytes} is not a non-zero multiple of {block_size}")]
    InvalidSize { size_bytes: u64, block_size: u64 },

    #[error("ioctl {call} on {}: {source}", .device.display())]
    Ioctl {
        device: PathBuf,
        call: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("transmission error: {0}")]
    Io(#[from] io::Error),
}

/// NBD request (28 bytes on wire).
///
/// The command occupies the full 32-bit word at offset 4; this server never
/// advertises FUA, so the kernel leaves the upper flag bits clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdRequest {
    pub magic: u32,
    pub command: NbdCommand,
    pub handle: u64,
    pub offset: u64,
    /// Payload length for WRITE, requested length for READ, range for TRIM.
    pub length: u32,
}

impl NbdRequest {
    pub const SIZE_BYTES: usize = 28;

    pub fn new(command: NbdCommand, handle: u64, offset: u64, length: u32) -> Self {
        Self {
            magic: NBD_REQUEST_MAGIC,
            command,
            handle,
            offset,
            length,
        }
    }

    /// Serialize an NBD request to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..8].copy_from_slice(&self.command.to_u32().to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse an NBD request header.
    ///
    /// Frames stamped with the reply magic are accepted as requests too.
    /// Anything else means the stream has lost framing.
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = read_u32(buf, 0);
        if magic != NBD_REQUEST_MAGIC && magic != NBD_SIMPLE_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_REQUEST_MAGIC,
                actual: magic,
            });
        }

        let cmd = read_u32(buf, 4);
        let command =
            NbdCommand::from_u32(cmd).ok_or(NbdError::UnsupportedCommand { command: cmd })?;

        Ok(Self {
            magic,
            command,
            handle: read_u64(buf, 8),
            offset: read_u64(buf, 16),
            length: read_u32(buf, 24),
        })
    }
}

/// NBD simple reply header (16 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdReply {
    pub error: u32,
    pub handle: u64,
}

impl NbdReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: u64) -> Self {
        Self {
            error: NBD_OK,
            handle,
        }
    }

    pub fn error(handle: u64, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        self.write_to(&mut buf);
        buf
    }

    /// Encode the header into the front of `buf`, which must hold at least
    /// [`NbdReply::SIZE_BYTES`] bytes. Used to place a READ reply header
    /// directly in front of its payload.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&NBD_SIMPLE_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = read_u32(buf, 0);
        if magic != NBD_SIMPLE_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_SIMPLE_REPLY_MAGIC,
                actual: magic,
            });
        }

        Ok(Self {
            error: read_u32(buf, 4),
            handle: read_u64(buf, 8),
        })
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(word)
}

const _: () = {
    assert!(NbdRequest::SIZE_BYTES == 28);
    assert!(NbdReply::SIZE_BYTES == 16);
    assert!(NBD_BLOCK_SIZE.is_power_of_two());
};

//! Error types for userbd.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// Re-export NbdError from the nbd crate
pub use nbd::NbdError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("nbd error: {0}")]
    Nbd(#[from] NbdError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("session is not connected")]
    NotConnected,

    /// Teardown failed after the kernel returned control. `run` is the
    /// outcome of the hand-off itself, `None` if it returned cleanly.
    #[error(
        "teardown of {} failed: {source} (hand-off {})",
        .device.display(),
        run_status(.run)
    )]
    Teardown {
        device: PathBuf,
        #[source]
        source: NbdError,
        run: Option<NbdError>,
    },
}

fn run_status(run: &Option<NbdError>) -> String {
    match run {
        None => "returned cleanly".to_string(),
        Some(e) => format!("failed: {e}"),
    }
}

/// Storage backend errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(
        "access out of bounds: offset {offset} + length {length} exceeds device size {size_bytes}"
    )]
    OutOfBounds {
        offset: u64,
        length: u64,
        size_bytes: u64,
    },

    #[error("storage backend error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },

    #[error("failed to open backing file {}: {source}", .path.display())]
    Backend {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = DeviceError::OutOfBounds {
            offset: 4096,
            length: 512,
            size_bytes: 4096,
        };
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn teardown_reports_run_status() {
        let err = Error::Teardown {
            device: PathBuf::from("/dev/nbd0"),
            source: NbdError::Ioctl {
                device: PathBuf::from("/dev/nbd0"),
                call: "NBD_CLEAR_SOCK",
                source: io::Error::from_raw_os_error(22),
            },
            run: Some(NbdError::NoFreeDevice { checked: 0 }),
        };
        let msg = err.to_string();
        assert!(msg.contains("/dev/nbd0"));
        assert!(msg.contains("NBD_CLEAR_SOCK"));
        assert!(msg.contains("hand-off failed"));
    }
}

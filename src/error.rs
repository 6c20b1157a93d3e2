//! ==============================================================================
//! error.rs - error taxonomy
//! ==============================================================================
//!
//! purpose:
//!     one error type per layer, so each layer decides what it handles:
//!     - TransportError: the raw bus transaction failed (no data)
//!     - DecodeError: data arrived but is invalid (crc, range, length)
//!     - SensorError: either of the above, plus chip identification
//!     - SamplingError: every retry of a sensor read failed
//!     - PublishError: the http push failed
//!
//! propagation:
//!     transport/decode -> retried by sampling.rs
//!     sampling         -> cache fallback in station.rs
//!     publish          -> retried by publisher.rs, then logged
//!
//! ==============================================================================

use crate::domain::Quantity;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("bus timeout talking to {0}")]
    Timeout(String),

    #[error("no acknowledge from i2c device 0x{0:02X}")]
    Nack(u8),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("bus i/o error: {0}")]
    Io(String),

    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum { expected: u8, actual: u8 },

    #[error("{quantity} out of range: {value:.2}")]
    Range { quantity: Quantity, value: f64 },

    #[error("expected {expected} byte frame, got {actual}")]
    Frame { expected: usize, actual: usize },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SensorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("unexpected chip id 0x{found:02X} (expected 0x{expected:02X})")]
    ChipId { expected: u8, found: u8 },
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("attempts exhausted after {attempts} tries, last error: {last}")]
pub struct SamplingError {
    pub attempts: u32,
    pub last: SensorError,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("server returned HTTP {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("payload could not be encoded: {0}")]
    Encode(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<PublishError> },
}

impl From<reqwest::Error> for PublishError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }
}

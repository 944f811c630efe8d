#![forbid(unsafe_code)]
//! Error types for the dnbd replication proxy.
//!
//! Defines `DnbdError` and a `Result<T>` alias used throughout the
//! workspace. The variants follow the failure taxonomy of the server:
//! transient upstream trouble is handled internally and never reaches
//! this type; what surfaces here is what a caller can act on.

use thiserror::Error;

/// Unified error type for all proxy operations.
#[derive(Debug, Error)]
pub enum DnbdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0}")]
    Protocol(String),

    #[error("remote speaks protocol {got}, need at least {min}")]
    ProtocolVersion { got: u16, min: u16 },

    #[error("image not found: {0}")]
    NotFound(String),

    #[error("image {name}:{rid} is not in working state")]
    NotWorking { name: String, rid: u16 },

    #[error("invalid image name: {0}")]
    InvalidName(String),

    #[error("invalid revision id {0}")]
    InvalidRid(u16),

    #[error("crc mismatch in hash block {hash_block}: stored {expected:#010x}, computed {actual:#010x}")]
    Corruption {
        hash_block: usize,
        expected: u32,
        actual: u32,
    },

    #[error("uplink request queue is full")]
    QueueFull,

    #[error("request beyond virtual image size")]
    OutOfRange,

    #[error("no alt-server reachable")]
    NoUplinkServer,

    #[error("not enough free space on base path")]
    NoSpace,

    #[error("image registry is full")]
    RegistryFull,

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias using `DnbdError`.
pub type Result<T> = std::result::Result<T, DnbdError>;

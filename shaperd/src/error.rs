//! Error types and the stable result codes reported to clients.

use serde::{Deserialize, Serialize};

use crate::backend::BackendError;

/// Stable result codes. The numeric values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ReturnCode {
    Ok = 0,
    InvalidIp = 1,
    InvalidTimeout = 2,
    IdExhaust = 3,
    NetlinkHtbError = 4,
    UnknownHtbError = 5,
    NetlinkNetemError = 6,
    UnknownNetemError = 7,
    NetlinkFwError = 8,
    UnknownFwError = 9,
    UnknownSession = 10,
    UnknownIp = 11,
    AccessDenied = 12,
}

/// A failed orchestrator operation. Every variant maps to one [`ReturnCode`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapingError {
    #[error("invalid IP {0}")]
    InvalidIp(String),
    #[error("invalid timeout {0}")]
    InvalidTimeout(i64),
    #[error("the device {controlling} is not allowed to control {controlled}")]
    AccessDenied { controlling: String, controlled: String },
    #[error("no more sessions available")]
    IdExhaust,
    #[error("no session for IP {0} found")]
    UnknownSession(String),
    #[error("IP {0} is not being shaped")]
    UnknownIp(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ShapingError {
    /// The code reported to clients for this failure.
    pub fn code(&self) -> ReturnCode {
        match self {
            Self::InvalidIp(_) => ReturnCode::InvalidIp,
            Self::InvalidTimeout(_) => ReturnCode::InvalidTimeout,
            Self::AccessDenied { .. } => ReturnCode::AccessDenied,
            Self::IdExhaust => ReturnCode::IdExhaust,
            Self::UnknownSession(_) => ReturnCode::UnknownSession,
            Self::UnknownIp(_) => ReturnCode::UnknownIp,
            Self::Backend(e) => e.code(),
        }
    }
}

impl From<Result<(), ShapingError>> for crate::types::ShapingRc {
    fn from(value: Result<(), ShapingError>) -> Self {
        match value {
            Ok(()) => Self::ok(),
            Err(e) => Self { code: e.code(), message: e.to_string() },
        }
    }
}

/// Failure to validate a one-time code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("invalid IP {0}")]
    InvalidIp(String),
    #[error("grant duration of {0}s is out of range")]
    InvalidDuration(u64),
    #[error("no access code was generated for {0}")]
    NoCode(String),
    #[error("access denied for {controlling} to control {controlled}")]
    Denied { controlling: String, controlled: String },
}

impl AccessError {
    /// The code reported to clients for this failure.
    pub const fn code(&self) -> ReturnCode {
        match self {
            Self::InvalidIp(_) => ReturnCode::InvalidIp,
            Self::InvalidDuration(_) => ReturnCode::InvalidTimeout,
            Self::NoCode(_) | Self::Denied { .. } => ReturnCode::AccessDenied,
        }
    }
}

/// Failure of the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failure to restore persisted sessions at startup.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("reading saved shapings: {0}")]
    Store(#[from] StoreError),
    #[error("restoring shaping for {ip}: {source}")]
    Shaping {
        ip: String,
        #[source]
        source: ShapingError,
    },
}

//! Error types for the RPC endpoint.

use std::io;

use thiserror::Error;

use crate::status::{
    CODE_BAD_MESSAGE, CODE_CONN_CLOSED, CODE_INTERNAL_SERVER_ERROR, CODE_WRITE_FAILED, Status,
};

/// Result type alias for endpoint operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for endpoint internals, registration and configuration.
///
/// Anything that crosses the wire or is returned from `call`/`push`/`dial` is a
/// [`Status`] instead; see the `From<Error> for Status` conversion below.
#[derive(Debug, Error)]
pub enum Error {
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The socket was closed locally before or during the operation.
    #[error("Socket was proactively closed")]
    ProactivelyClosed,

    /// A message exceeded the configured size limit.
    #[error("Message size {size} exceeds limit {limit}")]
    MessageTooLarge {
        /// Size of the message.
        size: u64,
        /// Configured limit.
        limit: u32,
    },

    /// The serialized metadata block does not fit into 65535 bytes.
    #[error("Metadata size {0} exceeds 65535 bytes")]
    MetaTooLarge(usize),

    /// Invalid frame received.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Checksum mismatch.
    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// No codec registered under the given id.
    #[error("Unknown body codec id: {0:#04x}")]
    UnknownCodec(u8),

    /// No codec registered under the given name.
    #[error("Unknown body codec name: {0}")]
    UnknownCodecName(String),

    /// Codec id or name already taken.
    #[error("Codec already registered: {0}")]
    DuplicateCodec(String),

    /// No transfer filter registered under the given id.
    #[error("Unknown transfer filter id: {0:#04x}")]
    UnknownXferFilter(u8),

    /// Transfer filter id already taken.
    #[error("Transfer filter already registered: {0:#04x}")]
    DuplicateXferFilter(u8),

    /// Transfer filter failed to transform a body.
    #[error("Transfer filter {name} failed: {reason}")]
    XferFailed {
        /// Name of the filter.
        name: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// Service-method path registered twice.
    #[error("Route already registered: {0}")]
    DuplicateRoute(String),

    /// Route name or prefix is unusable.
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    /// Two plugins with the same name in one container.
    #[error("Plugin already registered: {0}")]
    DuplicatePlugin(String),

    /// A plugin hook refused the operation.
    #[error("Plugin {plugin} aborted {phase}: {status}")]
    Plugin {
        /// Plugin name.
        plugin: String,
        /// Phase during which the hook failed.
        phase: &'static str,
        /// Status returned by the hook.
        status: Status,
    },

    /// Invalid endpoint configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Returns true if the error stems from a local, intentional shutdown.
    #[must_use]
    pub const fn is_proactively_closed(&self) -> bool {
        matches!(self, Self::ProactivelyClosed)
    }
}

impl From<serde_value::SerializerError> for Error {
    fn from(err: serde_value::SerializerError) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

impl From<serde_value::DeserializerError> for Error {
    fn from(err: serde_value::DeserializerError) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ProactivelyClosed => {
                Self::new(CODE_CONN_CLOSED, "Connection Closed").with_cause(err)
            }
            Error::Io(_) => Self::new(CODE_WRITE_FAILED, "Write Failed").with_cause(err),
            Error::MessageTooLarge { .. }
            | Error::MetaTooLarge(_)
            | Error::InvalidFrame(_)
            | Error::ChecksumMismatch { .. }
            | Error::SerializationFailed(_)
            | Error::DeserializationFailed(_)
            | Error::UnknownCodec(_)
            | Error::UnknownCodecName(_)
            | Error::UnknownXferFilter(_)
            | Error::XferFailed { .. } => {
                Self::new(CODE_BAD_MESSAGE, "Bad Message").with_cause(err)
            }
            Error::Plugin { status, .. } => status,
            Error::DuplicateCodec(_)
            | Error::DuplicateXferFilter(_)
            | Error::DuplicateRoute(_)
            | Error::InvalidRoute(_)
            | Error::DuplicatePlugin(_)
            | Error::Config(_) => {
                Self::new(CODE_INTERNAL_SERVER_ERROR, "Internal Server Error").with_cause(err)
            }
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => Self::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::CODE_DIAL_FAILED;

    #[test]
    fn test_proactive_close_maps_to_conn_closed() {
        let status: Status = Error::ProactivelyClosed.into();
        assert_eq!(status.code(), CODE_CONN_CLOSED);
        assert!(Error::ProactivelyClosed.is_proactively_closed());
        assert!(!Error::InvalidFrame("short".to_string()).is_proactively_closed());
    }

    #[test]
    fn test_plugin_error_keeps_hook_status() {
        let hook = Status::new(CODE_DIAL_FAILED, "refused");
        let err = Error::Plugin {
            plugin: "guard".to_string(),
            phase: "pre_dial",
            status: hook.clone(),
        };
        assert_eq!(Status::from(err), hook);
    }

    #[test]
    fn test_frame_errors_are_bad_message() {
        let status: Status = Error::MessageTooLarge {
            size: 10,
            limit: 5,
        }
        .into();
        assert_eq!(status.code(), CODE_BAD_MESSAGE);
        assert!(status.cause().unwrap().contains("exceeds limit 5"));
    }
}

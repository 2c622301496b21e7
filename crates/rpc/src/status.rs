//! Wire-transmissible result codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unknown error.
pub const CODE_UNKNOWN_ERROR: i32 = -1;
/// The only "no error" code.
pub const CODE_OK: i32 = 0;
/// The connection was closed, locally or by the peer.
pub const CODE_CONN_CLOSED: i32 = 102;
/// A message could not be written to the connection.
pub const CODE_WRITE_FAILED: i32 = 104;
/// Dialing the remote endpoint failed or was refused.
pub const CODE_DIAL_FAILED: i32 = 105;
/// A message could not be decoded or encoded.
pub const CODE_BAD_MESSAGE: i32 = 400;
/// A plugin rejected the caller.
pub const CODE_UNAUTHORIZED: i32 = 401;
/// No handler is registered for the service-method.
pub const CODE_NOT_FOUND: i32 = 404;
/// The message type is not accepted in this position.
pub const CODE_MTYPE_NOT_ALLOWED: i32 = 405;
/// The handler exceeded the context age.
pub const CODE_HANDLE_TIMEOUT: i32 = 408;
/// The handler failed or panicked.
pub const CODE_INTERNAL_SERVER_ERROR: i32 = 500;
/// An upstream peer failed.
pub const CODE_BAD_GATEWAY: i32 = 502;
/// The caller's deadline elapsed before a reply arrived.
pub const CODE_DEADLINE_EXCEEDED: i32 = 504;

/// Structured result of an RPC operation.
///
/// `Status` is the unit of error reporting on both sides of a connection: a
/// handler returns it, it travels in the REPLY header, and the caller gets it
/// back from `call`. [`Status::is_ok`] is the only success signal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    code: i32,
    msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cause: Option<String>,
}

impl Status {
    /// Creates a status with the given code and message.
    pub fn new(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            cause: None,
        }
    }

    /// The success status.
    #[must_use]
    pub fn ok() -> Self {
        Self::new(CODE_OK, "")
    }

    /// Attaches a cause, replacing any previous one.
    #[must_use]
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Shorthand for a [`CODE_NOT_FOUND`] status naming the missing path.
    pub fn not_found(service_method: &str) -> Self {
        Self::new(CODE_NOT_FOUND, "Not Found").with_cause(format!(
            "no handler registered for {service_method}"
        ))
    }

    /// Shorthand for a [`CODE_BAD_MESSAGE`] status.
    pub fn bad_message(cause: impl fmt::Display) -> Self {
        Self::new(CODE_BAD_MESSAGE, "Bad Message").with_cause(cause)
    }

    /// Shorthand for a [`CODE_INTERNAL_SERVER_ERROR`] status.
    pub fn internal(cause: impl fmt::Display) -> Self {
        Self::new(CODE_INTERNAL_SERVER_ERROR, "Internal Server Error").with_cause(cause)
    }

    /// Shorthand for a [`CODE_CONN_CLOSED`] status.
    pub fn conn_closed(cause: impl fmt::Display) -> Self {
        Self::new(CODE_CONN_CLOSED, "Connection Closed").with_cause(cause)
    }

    /// Status code.
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.code
    }

    /// Human-readable message.
    #[must_use]
    pub fn msg(&self) -> &str {
        &self.msg
    }

    /// Optional cause.
    #[must_use]
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    /// True only for [`CODE_OK`].
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    /// Converts into a `Result`, treating every non-OK code as an error.
    ///
    /// # Errors
    ///
    /// Returns `self` if the code is not [`CODE_OK`].
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_ok() { Ok(()) } else { Err(self) }
    }

    /// Encodes the status for a message header.
    pub(crate) fn to_header_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decodes a status from a message header.
    pub(crate) fn from_header_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code={} msg={:?}", self.code, self.msg)?;
        if let Some(cause) = &self.cause {
            write!(f, " cause={cause:?}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

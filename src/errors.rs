//! Error codes and error types for step execution.
//!
//! Errors are carried as short string codes rather than integers so they can
//! cross process boundaries unchanged. A step raises an error by returning
//! [`Error`] from its body (usually through [`crate::AsyncSteps::error`]);
//! the engine's dispatch loop performs the unwind, trying on-error handlers
//! from the erroring step upward.
//!
//! - Errors are explicit and typed; codes are compared as strings
//! - Loop control travels on the same channel as the reserved codes
//!   [`codes::LOOP_BREAK`] and [`codes::LOOP_CONT`], stripped at loop frames
//! - Panics escaping a callback are caught at the dispatch boundary and
//!   re-enter the unwind as [`codes::INTERNAL_ERROR`]

use core::fmt;
use std::borrow::Cow;

/// A short, self-descriptive error code.
///
/// Codes are strings rather than integers so they survive transports and
/// process boundaries unmodified. The canonical set lives in [`codes`];
/// applications may raise any code of their own.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ErrorCode(Cow<'static, str>);

impl ErrorCode {
    /// Creates a code from a static string without allocation.
    #[must_use]
    pub const fn from_static(code: &'static str) -> Self {
        Self(Cow::Borrowed(code))
    }

    /// Returns the code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCode({})", self.0)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for ErrorCode {
    fn from(code: &'static str) -> Self {
        Self(Cow::Borrowed(code))
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        Self(Cow::Owned(code))
    }
}

impl PartialEq<str> for ErrorCode {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ErrorCode {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Self(Cow::Owned(s)))
    }
}

/// Canonical error codes.
pub mod codes {
    use super::ErrorCode;

    /// Connection error before a request is sent.
    pub const CONNECT_ERROR: ErrorCode = ErrorCode::from_static("ConnectError");
    /// Communication error after a request is sent and before a response.
    pub const COMM_ERROR: ErrorCode = ErrorCode::from_static("CommError");
    /// Unknown interface requested.
    pub const UNKNOWN_INTERFACE: ErrorCode = ErrorCode::from_static("UnknownInterface");
    /// Interface version is not supported.
    pub const NOT_SUPPORTED_VERSION: ErrorCode = ErrorCode::from_static("NotSupportedVersion");
    /// The requested function is not implemented.
    pub const NOT_IMPLEMENTED: ErrorCode = ErrorCode::from_static("NotImplemented");
    /// Security policy does not allow the call.
    pub const UNAUTHORIZED: ErrorCode = ErrorCode::from_static("Unauthorized");
    /// Unexpected internal error, including panics escaping callbacks.
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode::from_static("InternalError");
    /// Unexpected error on the caller side.
    pub const INVOKER_ERROR: ErrorCode = ErrorCode::from_static("InvokerError");
    /// Invalid request data.
    pub const INVALID_REQUEST: ErrorCode = ErrorCode::from_static("InvalidRequest");
    /// Defense system has rejected the request (admission control).
    pub const DEFENSE_REJECTED: ErrorCode = ErrorCode::from_static("DefenseRejected");
    /// Re-authorization is requested.
    pub const PLEASE_REAUTH: ErrorCode = ErrorCode::from_static("PleaseReauth");
    /// Security-related error.
    pub const SECURITY_ERROR: ErrorCode = ErrorCode::from_static("SecurityError");
    /// A timeout fired before completion.
    pub const TIMEOUT: ErrorCode = ErrorCode::from_static("Timeout");
    /// Loop break sentinel. Stripped at the matching loop frame; must not be
    /// raised directly.
    pub const LOOP_BREAK: ErrorCode = ErrorCode::from_static("LoopBreak");
    /// Loop continue sentinel. Stripped at the matching loop frame; must not
    /// be raised directly.
    pub const LOOP_CONT: ErrorCode = ErrorCode::from_static("LoopCont");
}

/// The error value propagated through step bodies and on-error handlers.
///
/// Constructed by [`crate::AsyncSteps::error`] and friends; the human
/// readable detail travels in `State::error_info` rather than here, matching
/// the wire model where only the code crosses boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    code: ErrorCode,
}

impl Error {
    /// Creates an error with the given code.
    #[must_use]
    pub fn new(code: impl Into<ErrorCode>) -> Self {
        Self { code: code.into() }
    }

    /// Returns the error code.
    #[must_use]
    pub const fn code(&self) -> &ErrorCode {
        &self.code
    }

    /// Consumes the error, returning its code.
    #[must_use]
    pub fn into_code(self) -> ErrorCode {
        self.code
    }

    /// Returns true if this is one of the loop control sentinels.
    #[must_use]
    pub fn is_loop_control(&self) -> bool {
        self.code == codes::LOOP_BREAK || self.code == codes::LOOP_CONT
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step error: {}", self.code)
    }
}

impl std::error::Error for Error {}

/// The result type returned by step bodies and on-error handlers.
pub type StepResult = Result<(), Error>;

/// Payload of a panic caught at the dispatch boundary.
#[derive(Debug, Clone)]
pub struct PanicPayload {
    message: String,
}

impl PanicPayload {
    /// Creates a payload with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Extracts a message from a boxed panic value.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self { message }
    }

    /// Returns the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// The most recent exception caught by the dispatcher, kept in state.
#[derive(Debug, Clone)]
pub enum CaughtException {
    /// A step error raised through the normal channel.
    Error(Error),
    /// A panic that escaped a user callback.
    Panic(PanicPayload),
}

impl CaughtException {
    /// Returns the error code associated with the exception.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Error(e) => e.code().clone(),
            Self::Panic(_) => codes::INTERNAL_ERROR,
        }
    }
}

impl fmt::Display for CaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(e) => write!(f, "{e}"),
            Self::Panic(p) => write!(f, "{p}"),
        }
    }
}

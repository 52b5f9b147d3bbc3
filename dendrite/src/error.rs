//! Errors used throughout the runtime.

use crate::foreign::ForeignErrorRecord;
use crate::value::ObjectId;

/// Convenient result wrapper, defaulting to our own `Error` type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reason codes attached to marshalling failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MarshalFault {
    #[error("unsupported foreign type '{0}'")]
    UnsupportedForeignType(String),

    #[error("map key is not a string")]
    NonStringMapKey,

    #[error("cycle detected in value graph")]
    CycleInGraph,
}

#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Message not found on the receiver or any ancestor, and no `forward`
    /// slot was available either.
    #[error("object {0} does not understand '{1}'")]
    DoesNotUnderstand(ObjectId, String),

    #[error("object {0} is frozen")]
    Frozen(ObjectId),

    #[error("object {0} is dead")]
    Dead(ObjectId),

    #[error("message dispatch exceeded depth limit of {0}")]
    StackOverflow(usize),

    #[error("marshalling failed: {0}")]
    Marshalling(#[from] MarshalFault),

    #[error("unknown handle '{0}'")]
    UnknownHandle(String),

    #[error("handle '{0}' was already released")]
    DoubleRelease(String),

    #[error("foreign runtime initialization failed: {0}")]
    RuntimeInitFailed(String),

    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    #[error("value is not callable: {0}")]
    NotCallable(String),

    #[error("syntax error at offset {pos}: {message}")]
    Syntax { pos: usize, message: String },

    /// A foreign exception that crossed the gate, converted exactly once
    /// into a structured record.
    #[error("foreign error: {0}")]
    Foreign(ForeignErrorRecord),

    #[error("timed out after {0} ms")]
    TimedOut(u64),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("write-ahead log unavailable: {0}")]
    LogUnavailable(String),

    #[error("malformed log record: {0}")]
    MalformedRecord(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Anything that does not fit the categories above.
    #[error("kernel error: {0}")]
    Kernel(String),
}

impl Error {
    /// The structured record carried by a `Foreign` error, if any.
    pub fn foreign_record(&self) -> Option<&ForeignErrorRecord> {
        match self {
            Error::Foreign(record) => Some(record),
            _ => None,
        }
    }

    /// Stable name of the error's kind, used when errors are reified as
    /// values (for `rescue` handlers) and in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::DoesNotUnderstand(..) => "DoesNotUnderstand",
            Error::Frozen(..) => "Frozen",
            Error::Dead(..) => "Dead",
            Error::StackOverflow(..) => "StackOverflow",
            Error::Marshalling(..) => "MarshallingError",
            Error::UnknownHandle(..) => "UnknownHandle",
            Error::DoubleRelease(..) => "DoubleRelease",
            Error::RuntimeInitFailed(..) => "RuntimeInitFailed",
            Error::ModuleNotFound(..) => "ModuleNotFound",
            Error::NotCallable(..) => "NotCallable",
            Error::Syntax { .. } => "SyntaxError",
            Error::Foreign(..) => "ForeignError",
            Error::TimedOut(..) => "TimedOut",
            Error::Cancelled => "Cancelled",
            Error::LogUnavailable(..) => "LogUnavailable",
            Error::MalformedRecord(..) => "MalformedRecord",
            Error::ShapeMismatch(..) => "ShapeMismatch",
            Error::Kernel(..) => "KernelError",
        }
    }
}

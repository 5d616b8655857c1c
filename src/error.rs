//! Error taxonomy shared by every storage component.
//!
//! The set of kinds is closed: callers classify failures through
//! [`Error::kind`] and never by matching on message text.  Composite
//! operations add context with [`Error::context`], which wraps the message
//! while leaving the kind visible, so a `NotExist` raised three layers down
//! is still a `NotExist` at the surface.

use std::error;
use std::fmt;
use std::io;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an [`Error`], independent of any wrapping context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A blob lookup failed; the blob is not in the store.
    NotExist,
    /// Declared and computed hashes disagree, or a schema blob is
    /// structurally inconsistent.
    CorruptBlob,
    /// A required schema field is absent.
    MissingField,
    /// A caller-supplied argument is out of range or malformed.
    InvalidArgument,
    /// A write was attempted against a read-only surface.
    PermissionDenied,
    /// The underlying store or stream failed.
    Io,
    /// The operation was cooperatively cancelled.
    Canceled,
    /// A claim signature failed to verify.
    SignatureInvalid,
}

/// Error type for all blob, schema, and view operations.
#[derive(Debug)]
pub enum Error {
    /// The named blob (or view path) does not exist.
    NotExist(String),
    /// Hash mismatch or structural inconsistency in a blob.
    CorruptBlob {
        /// String form of the offending blob ref, when known.
        blob: Option<String>,
        /// Human-readable description of the inconsistency.
        reason: String,
    },
    /// A required schema field is missing.
    MissingField(&'static str),
    /// A caller-supplied argument is invalid.
    InvalidArgument(String),
    /// The target surface is read-only.
    PermissionDenied(String),
    /// Underlying I/O failure.
    Io(io::Error),
    /// Cooperative cancellation.
    Canceled,
    /// Signature verification failure.
    SignatureInvalid(String),
    /// A wrapped error carrying a contextual prefix; the kind of the
    /// wrapped error is preserved.
    Context {
        /// Prefix describing the operation that failed.
        prefix: String,
        /// The underlying error.
        source: Box<Error>,
    },
}

impl Error {
    /// Builds a `NotExist` error for the given blob ref string form.
    pub fn not_exist(blob: impl Into<String>) -> Self {
        Self::NotExist(blob.into())
    }

    /// Builds a `CorruptBlob` error with an optional blob ref.
    pub fn corrupt(blob: Option<String>, reason: impl Into<String>) -> Self {
        Self::CorruptBlob {
            blob,
            reason: reason.into(),
        }
    }

    /// Returns the kind of this error, looking through any context layers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotExist(_) => ErrorKind::NotExist,
            Self::CorruptBlob { .. } => ErrorKind::CorruptBlob,
            Self::MissingField(_) => ErrorKind::MissingField,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Io(_) => ErrorKind::Io,
            Self::Canceled => ErrorKind::Canceled,
            Self::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// Wraps the error with a contextual prefix, preserving its kind.
    pub fn context(self, prefix: impl Into<String>) -> Self {
        Self::Context {
            prefix: prefix.into(),
            source: Box::new(self),
        }
    }

    /// Reports whether this error (under any wrapping) is `NotExist`.
    pub fn is_not_exist(&self) -> bool {
        self.kind() == ErrorKind::NotExist
    }

    /// Reports whether this error (under any wrapping) is `Canceled`.
    pub fn is_canceled(&self) -> bool {
        self.kind() == ErrorKind::Canceled
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotExist(what) => write!(f, "{what} does not exist"),
            Self::CorruptBlob { blob, reason } => match blob {
                Some(blob) => write!(f, "corrupt blob {blob}: {reason}"),
                None => write!(f, "corrupt blob: {reason}"),
            },
            Self::MissingField(field) => write!(f, "missing required field {field:?}"),
            Self::InvalidArgument(reason) => write!(f, "invalid argument: {reason}"),
            Self::PermissionDenied(what) => write!(f, "permission denied: {what}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Canceled => write!(f, "operation canceled"),
            Self::SignatureInvalid(reason) => write!(f, "signature invalid: {reason}"),
            Self::Context { prefix, source } => write!(f, "{prefix}: {source}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Context { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

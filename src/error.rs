use std::fmt;

/// Convenience alias for this crate's `Result` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the device-event monitor.
///
/// `Again` collapses every policy/protocol rejection the receive path can hit (wrong sender,
/// bad credentials, corrupt header, truncation, user-space filter mismatch) into a single soft
/// error a caller can retry on. Kernel I/O failures are surfaced unchanged instead.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Bad caller input: unknown group name, empty filter string, filter program overflow.
    InvalidArgument(String),
    /// `socket`/`bind`/`setsockopt`/`recvmsg`/`sendmsg` failed; wraps the OS errno.
    Kernel(String),
    /// A datagram arrived but was dropped by policy. The caller may retry.
    Again(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Kernel(format!("{err}"))
    }
}

impl From<std::array::TryFromSliceError> for Error {
    fn from(err: std::array::TryFromSliceError) -> Self {
        Self::Kernel(format!("{err}"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(err) => write!(f, "invalid argument: {err}"),
            Self::Kernel(err) => write!(f, "kernel error: {err}"),
            Self::Again(err) => write!(f, "again: {err}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Gets whether the error is a soft, retryable rejection.
    pub const fn is_again(&self) -> bool {
        matches!(self, Self::Again(_))
    }
}

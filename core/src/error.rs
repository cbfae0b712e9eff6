use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already locked: {0}")]
    AlreadyLocked(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Seek failure: expected position {expected}, landed at {actual}")]
    SeekFailure { expected: u64, actual: u64 },

    #[error("Short transfer: {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    IoFailure(io::Error),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Resolution unavailable: {0}")]
    ResolutionUnavailable(String),

    #[error("Invalid buffer: expected {expected} bytes, got {actual}")]
    InvalidBuffer { expected: usize, actual: usize },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Payload-free discriminant of [`BlockError`], for callers that only branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyLocked,
    OutOfRange,
    SeekFailure,
    ShortTransfer,
    Unsupported,
    IoFailure,
    UnknownOperation,
    ResolutionUnavailable,
    InvalidBuffer,
    Configuration,
}

impl BlockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlockError::NotFound(_) => ErrorKind::NotFound,
            BlockError::AlreadyLocked(_) => ErrorKind::AlreadyLocked,
            BlockError::OutOfRange(_) => ErrorKind::OutOfRange,
            BlockError::SeekFailure { .. } => ErrorKind::SeekFailure,
            BlockError::ShortTransfer { .. } => ErrorKind::ShortTransfer,
            BlockError::Unsupported(_) => ErrorKind::Unsupported,
            BlockError::IoFailure(_) => ErrorKind::IoFailure,
            BlockError::UnknownOperation(_) => ErrorKind::UnknownOperation,
            BlockError::ResolutionUnavailable(_) => ErrorKind::ResolutionUnavailable,
            BlockError::InvalidBuffer { .. } => ErrorKind::InvalidBuffer,
            BlockError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Build an `IoFailure` that did not originate from the OS
    pub fn io(message: impl Into<String>) -> Self {
        BlockError::IoFailure(io::Error::new(io::ErrorKind::Other, message.into()))
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        BlockError::Unsupported(what.into())
    }
}

impl From<io::Error> for BlockError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => BlockError::NotFound(err.to_string()),
            io::ErrorKind::WouldBlock => BlockError::AlreadyLocked(err.to_string()),
            io::ErrorKind::Unsupported => BlockError::Unsupported(err.to_string()),
            _ => BlockError::IoFailure(err),
        }
    }
}

/// Lets `BlockError` cross `std::io` trait boundaries (e.g. a `Read` impl) without
/// losing its kind; see [`BlockError::from_io_lossless`].
impl From<BlockError> for io::Error {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::IoFailure(inner) => inner,
            other => {
                let kind = match other.kind() {
                    ErrorKind::NotFound => io::ErrorKind::NotFound,
                    ErrorKind::AlreadyLocked => io::ErrorKind::WouldBlock,
                    ErrorKind::Unsupported => io::ErrorKind::Unsupported,
                    ErrorKind::ShortTransfer => io::ErrorKind::UnexpectedEof,
                    ErrorKind::OutOfRange
                    | ErrorKind::SeekFailure
                    | ErrorKind::InvalidBuffer => io::ErrorKind::InvalidInput,
                    _ => io::ErrorKind::Other,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

impl BlockError {
    /// Recover a `BlockError` previously wrapped into an `io::Error`, falling back to the
    /// regular kind mapping for genuine OS errors.
    pub fn from_io_lossless(err: io::Error) -> Self {
        if err.get_ref().map_or(false, |inner| inner.is::<BlockError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(block) = inner.downcast::<BlockError>() {
                    return *block;
                }
            }
            return BlockError::io("wrapped block error lost its payload");
        }
        BlockError::from(err)
    }
}

pub type Result<T> = std::result::Result<T, BlockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err = BlockError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn io_would_block_maps_to_already_locked() {
        let err = BlockError::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert_eq!(err.kind(), ErrorKind::AlreadyLocked);
    }

    #[test]
    fn other_io_errors_are_io_failures() {
        let err = BlockError::from(io::Error::new(io::ErrorKind::BrokenPipe, "usb gone"));
        assert_eq!(err.kind(), ErrorKind::IoFailure);
    }

    #[test]
    fn block_error_survives_io_round_trip() {
        let original = BlockError::SeekFailure { expected: 4096, actual: 0 };
        let wrapped: io::Error = original.into();
        assert_eq!(wrapped.kind(), io::ErrorKind::InvalidInput);

        let recovered = BlockError::from_io_lossless(wrapped);
        match recovered {
            BlockError::SeekFailure { expected, actual } => {
                assert_eq!(expected, 4096);
                assert_eq!(actual, 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

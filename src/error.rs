use thiserror::Error;

/// Failure statuses returned by the predictor. `ERR_NONE` is represented by `Ok(..)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TcaeError {
    #[error("unknown error")]
    Unknown,
    #[error("null pointer")]
    NullPtr,
    #[error("unsupported feature or call")]
    Unsupported,
    #[error("failed to allocate memory")]
    MemoryAlloc,
    #[error("invalid argument")]
    InvalidArg,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("failed to lock the memory block")]
    LockMemory,
    #[error("called before initialization")]
    NotInitialized,
    #[error("undefined behavior")]
    UndefinedBehavior,
    #[error("more data expected at input")]
    MoreData,
    #[error("more surfaces expected at output")]
    MoreSurface,
    #[error("operation aborted")]
    Aborted,
}

impl TcaeError {
    pub const ERR_NONE: i32 = 0;

    /// Numeric status code, as understood by encoder drivers.
    pub fn code(&self) -> i32 {
        match self {
            TcaeError::Unknown => -1,
            TcaeError::NullPtr => -2,
            TcaeError::Unsupported => -3,
            TcaeError::MemoryAlloc => -4,
            TcaeError::InvalidArg => -5,
            TcaeError::InvalidHandle => -6,
            TcaeError::LockMemory => -7,
            TcaeError::NotInitialized => -8,
            TcaeError::UndefinedBehavior => -9,
            TcaeError::MoreData => -10,
            TcaeError::MoreSurface => -11,
            TcaeError::Aborted => -12,
        }
    }

    pub fn from_code(code: i32) -> Option<TcaeError> {
        let err = match code {
            -1 => TcaeError::Unknown,
            -2 => TcaeError::NullPtr,
            -3 => TcaeError::Unsupported,
            -4 => TcaeError::MemoryAlloc,
            -5 => TcaeError::InvalidArg,
            -6 => TcaeError::InvalidHandle,
            -7 => TcaeError::LockMemory,
            -8 => TcaeError::NotInitialized,
            -9 => TcaeError::UndefinedBehavior,
            -10 => TcaeError::MoreData,
            -11 => TcaeError::MoreSurface,
            -12 => TcaeError::Aborted,
            _ => return None,
        };
        Some(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for TcaeError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        TcaeError::UndefinedBehavior
    }
}

pub type Result<T> = std::result::Result<T, TcaeError>;

/// Collapses a result into the integer status convention (0 on success).
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => TcaeError::ERR_NONE,
        Err(err) => err.code(),
    }
}

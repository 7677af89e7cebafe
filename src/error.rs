//! Error types and handling for safer-aio operations.
//!
//! Every fallible operation in the crate returns [`Result`]. Kernel error
//! codes are preserved in [`AioError::Os`] so callers can match on the
//! original errno, while the `Display` rendering carries the same text the
//! C library's `strerror` would produce.

use std::io;

use thiserror::Error;

/// Result type alias for safer-aio operations.
pub type Result<T> = std::result::Result<T, AioError>;

/// Error type for safer-aio operations.
///
/// Submission-time failures are returned only after every resource taken on
/// the way (descriptor, retained completion reference) has been given back.
/// Failures of an individual operation discovered while polling are never
/// reported through this type; they go to that operation's completion sink.
#[derive(Debug, Error)]
pub enum AioError {
    /// The descriptor pool is exhausted.
    ///
    /// Returned synchronously by submission when `capacity` operations are
    /// already in flight. The caller must retry after a completion has been
    /// harvested; the engine never queues internally.
    #[error("Not enough space in aio queue (capacity {capacity})")]
    ResourceExhausted {
        /// Queue depth of the context that rejected the submission
        capacity: usize,
    },

    /// A kernel call failed with the given error code.
    #[error("{context}: {}", strerror(.code))]
    Os {
        /// Positive errno value
        code: i32,
        /// What the engine was doing when the call failed
        context: &'static str,
    },

    /// An allocation failed.
    #[error("Out of memory allocating {size} bytes")]
    OutOfMemory {
        /// Size of the failed request in bytes
        size: usize,
    },

    /// An argument was rejected before reaching the kernel.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The context has been shut down.
    #[error("I/O context is closed")]
    ContextClosed,

    /// A thread panicked while holding one of the engine's mutexes.
    #[error("Descriptor pool mutex is poisoned")]
    PoolPoisoned,

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AioError {
    /// Build an [`AioError::Os`] from an errno value.
    ///
    /// Negative values are accepted as well, since the AIO syscalls and
    /// completion events report failures as `-errno`.
    pub fn os(code: i32, context: &'static str) -> Self {
        AioError::Os {
            code: code.abs(),
            context,
        }
    }

    /// Build an [`AioError::Os`] from the calling thread's current `errno`.
    pub fn last_os_error(context: &'static str) -> Self {
        let code = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        Self::os(code, context)
    }

    /// The kernel error code carried by this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            AioError::Os { code, .. } => Some(*code),
            AioError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Whether this is the backpressure signal from a full pool.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, AioError::ResourceExhausted { .. })
    }
}

/// Render an errno the way `strerror` does, without the "(os error N)" suffix.
pub fn describe_errno(code: i32) -> String {
    let rendered = io::Error::from_raw_os_error(code.abs()).to_string();
    match rendered.find(" (os error") {
        Some(idx) => rendered[..idx].to_string(),
        None => rendered,
    }
}

fn strerror(code: &i32) -> String {
    describe_errno(*code)
}

static_assertions::assert_impl_all!(AioError: Send, Sync);

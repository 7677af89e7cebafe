//! # Safer-AIO: Linux kernel AIO for journals
//!
//! An asynchronous direct-I/O engine over the Linux `io_setup` /
//! `io_submit` / `io_getevents` interface, built for persistence layers such
//! as a message broker's journal that issue many aligned reads and writes and
//! harvest their completions in batches.
//!
//! ## Key Features
//!
//! - **Non-blocking submission**: a fixed pool of request descriptors; a full
//!   pool is reported as [`AioError::ResourceExhausted`] instead of queueing
//! - **Syscall-free harvesting**: completions are read straight out of the
//!   kernel's completion ring when it validates, falling back to
//!   `io_getevents` otherwise
//! - **Group durability**: the blocking loop can `fdatasync` once per run of
//!   same-file completions
//! - **Clean shutdown**: a sentinel write wakes the blocking loop, and every
//!   in-flight operation is drained and delivered before the context reports
//!   itself closed
//! - **Testability**: the kernel sits behind the [`Backend`] trait;
//!   [`SimulatedAio`] injects submit failures, interrupts and delayed
//!   completions
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::os::unix::io::AsRawFd;
//! use std::sync::Arc;
//! use safer_aio::{AlignedBuffer, CompletionSink, Environment, IoContext};
//!
//! struct Logged;
//!
//! impl CompletionSink for Logged {
//!     fn on_error(&self, code: i32, message: &str) {
//!         eprintln!("I/O failed: {message} ({code})");
//!     }
//!     fn done(&self) {}
//! }
//!
//! # fn main() -> safer_aio::Result<()> {
//! let ctx = IoContext::new(64, Environment::new()?)?;
//! let file = safer_aio::file::open("/var/tmp/journal.dat", true)?;
//!
//! let mut buffer = AlignedBuffer::new(4096, 512)?;
//! buffer.as_mut_slice().fill(b'x');
//!
//! // SAFETY: `buffer` is not touched until the completion is harvested.
//! unsafe { ctx.submit_write(file.as_raw_fd(), 0, buffer.as_ptr(), 4096, Arc::new(Logged))? };
//!
//! let mut done = Vec::new();
//! ctx.poll(&mut done, 1, 64)?;
//! for completion in done {
//!     completion.done();
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use safer_aio::{AioConfig, Environment, IoContext};
//!
//! # fn main() -> safer_aio::Result<()> {
//! let ctx = IoContext::from_config(&AioConfig::journal(), Environment::new()?)?;
//! std::thread::spawn(move || ctx.run());
//! # Ok(())
//! # }
//! ```
//!
//! ## Safety
//!
//! Submission takes raw pointers and raw file descriptors. The caller lends
//! the buffer to the kernel until the operation's completion is delivered and
//! must neither free nor touch it before then. File descriptors are not
//! validated; a stale descriptor reaches the kernel as-is.
//!
//! ## Platform Support
//!
//! Linux only. Kernels built without AIO, or sandboxes that block `io_setup`,
//! make [`IoContext::new`] fail with `ENOSYS`/`EPERM`; [`is_aio_available`]
//! probes for that up front.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Kernel ABI and the lock-free pieces built on it
pub mod backend;
pub mod pool;
pub mod ring;
pub mod sys;

// Engine
pub mod completion;
pub mod context;
pub mod poller;

// Primitives and ambient concerns
pub mod buffer;
pub mod config;
pub mod environment;
pub mod error;
pub mod file;
pub mod logging;

pub use backend::{is_aio_available, Backend, LinuxAio, SimulatedAio};
pub use buffer::AlignedBuffer;
pub use completion::{CompletionRef, CompletionSink, DirectDispatch, Dispatcher};
pub use config::{AioConfig, ConfigBuilder, ContextConfig, FileConfig, LoggingConfig};
pub use context::{ContextBuilder, ContextStats, IoContext};
pub use environment::Environment;
pub use error::{AioError, Result};
pub use logging::{init_logger, LogLevel, Logger, PollMetrics};
pub use poller::PollStats;
pub use pool::{DescriptorPool, PoolStats};
pub use ring::{CompletionRing, RingRead};

/// Binary interface version of this crate.
///
/// Callers that load the engine dynamically compare this against the value
/// they were built with.
pub const NATIVE_VERSION: i32 = 1;

/// Returns [`NATIVE_VERSION`].
pub fn native_version() -> i32 {
    NATIVE_VERSION
}

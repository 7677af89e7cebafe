//! Completion sinks and dispatch.
//!
//! A submission carries a [`CompletionRef`]: a shared handle to whatever the
//! surrounding system wants notified when the operation finishes. The engine
//! clones the handle at submission and holds that strong reference until the
//! completion has been delivered, then drops it exactly once. The caller's
//! own clones are unaffected, so nothing about the sink's lifetime depends on
//! when the kernel gets around to finishing the I/O.

use std::fmt;
use std::sync::Arc;

/// Receiver of one operation's outcome.
pub trait CompletionSink: Send + Sync {
    /// Called when the kernel reports the operation failed.
    ///
    /// `code` is the positive errno, `message` its `strerror` rendering.
    /// [`done`](Self::done) is still delivered afterwards.
    fn on_error(&self, code: i32, message: &str);

    /// Called once the operation has reached its terminal state.
    fn done(&self);
}

/// Shared handle the engine retains for an in-flight operation.
pub type CompletionRef = Arc<dyn CompletionSink>;

/// Delivers completed references on behalf of the context's owner.
///
/// The blocking poll loop hands every finished user operation to the
/// dispatcher. The default, [`DirectDispatch`], just calls
/// [`CompletionSink::done`].
pub trait Dispatcher: Send + Sync {
    /// Deliver a completed operation.
    fn dispatch(&self, completion: CompletionRef);
}

/// Dispatcher that calls [`CompletionSink::done`] inline on the poller thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDispatch;

impl Dispatcher for DirectDispatch {
    fn dispatch(&self, completion: CompletionRef) {
        completion.done();
    }
}

/// What the engine holds in a descriptor while it is outside the pool.
pub(crate) enum InFlight {
    /// A caller's operation with its retained completion reference.
    User(CompletionRef),
    /// The zero-length write submitted by shutdown to wake the poller.
    Sentinel,
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InFlight::User(_) => f.write_str("User"),
            InFlight::Sentinel => f.write_str("Sentinel"),
        }
    }
}

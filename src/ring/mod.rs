//! User-space reader for the kernel AIO completion ring.
//!
//! On Linux the AIO context handle returned by `io_setup` is the address of
//! a ring the kernel fills with [`IoEvent`]s. When the ring advertises the
//! expected magic and no incompatible features, completions can be harvested
//! by copying slots out of it and publishing a new `head`, with no syscall at
//! all. Anything else falls back to `io_getevents`.
//!
//! # Memory ordering
//!
//! There is exactly one writer per index:
//!
//! | Field  | Writer          | Reader ordering               |
//! |--------|-----------------|-------------------------------|
//! | `tail` | kernel          | `Acquire` load before slots   |
//! | slots  | kernel          | volatile copy after `tail`    |
//! | `head` | the poller      | `Release` store after copying |
//!
//! The `Acquire` on `tail` pairs with the kernel publishing `tail` after it
//! wrote the slot, so no slot is read before it is published. The `Release`
//! on `head` orders every slot copy before the kernel may observe the slot as
//! free. Only the thread holding the context's poll lock may call
//! [`CompletionRing::reap`].

mod owned;


pub use owned::OwnedRing;

use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

use crate::sys::{IoEvent, RingHeader, AIO_RING_INCOMPAT_FEATURES, AIO_RING_MAGIC, RING_HEADER_LEN};

/// Outcome of one attempt to read completions from the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingRead {
    /// The header did not validate; the syscall path must be used.
    Unusable,
    /// Fewer than the requested minimum were available and the caller asked
    /// to wait, which only the kernel can do.
    Insufficient {
        /// Events published at the time of the check
        available: usize,
    },
    /// This many events were copied out and their slots handed back.
    Copied(usize),
}

/// Borrowed view of a completion ring.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRing {
    header: NonNull<RingHeader>,
}

// SAFETY: the view only performs atomic and volatile accesses; exclusivity of
// the head publication is part of `reap`'s contract.
unsafe impl Send for CompletionRing {}

impl CompletionRing {
    /// Wrap a ring header.
    ///
    /// # Safety
    ///
    /// `header` must point to a mapped ring header followed by `nr` event
    /// slots, and the mapping must outlive the returned view.
    pub unsafe fn from_raw(header: NonNull<RingHeader>) -> Self {
        Self { header }
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: validity is guaranteed by the `from_raw` contract.
        unsafe { self.header.as_ref() }
    }

    /// Whether the header carries the layout this reader understands.
    pub fn is_usable(&self) -> bool {
        let hdr = self.header.as_ptr();
        // SAFETY: the header is mapped; these fields are read volatile since
        // the kernel owns the mapping.
        let (magic, incompat) = unsafe {
            (
                ptr::read_volatile(ptr::addr_of!((*hdr).magic)),
                ptr::read_volatile(ptr::addr_of!((*hdr).incompat_features)),
            )
        };
        magic == AIO_RING_MAGIC && incompat == AIO_RING_INCOMPAT_FEATURES
    }

    /// Number of slots in the ring.
    pub fn slots(&self) -> u32 {
        // SAFETY: see `is_usable`.
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.header.as_ptr()).nr)) }
    }

    /// Events published by the kernel and not yet consumed.
    pub fn available(&self) -> usize {
        let nr = self.slots();
        if nr == 0 {
            return 0;
        }
        let head = self.header().head.load(Ordering::Relaxed);
        let tail = self.header().tail.load(Ordering::Acquire);
        pending(head, tail, nr) as usize
    }

    fn slot_ptr(&self, index: u32) -> *const IoEvent {
        // SAFETY: `index < nr`, and the slot array starts right after the
        // fixed-size header.
        unsafe {
            (self.header.as_ptr() as *const u8)
                .add(RING_HEADER_LEN)
                .cast::<IoEvent>()
                .add(index as usize)
        }
    }

    /// Copy published completions into `events`.
    ///
    /// At most `events.len()` events are copied. When fewer than `min` are
    /// available the ring is left untouched and
    /// [`RingRead::Insufficient`] is returned, unless `immediate` is set, in
    /// which case whatever is there (possibly nothing) is taken. That mirrors
    /// a zero timeout on `io_getevents`, which never waits for `min`.
    ///
    /// Callers must hold the context's poll lock: publishing `head` is only
    /// sound from a single consumer.
    pub fn reap(&self, min: usize, events: &mut [IoEvent], immediate: bool) -> RingRead {
        if !self.is_usable() {
            return RingRead::Unusable;
        }

        let nr = self.slots();
        let header = self.header();
        // Only this consumer stores `head`.
        let mut head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        if nr == 0 || head >= nr || tail >= nr {
            return RingRead::Unusable;
        }

        let available = pending(head, tail, nr) as usize;
        if available < min && !immediate {
            return RingRead::Insufficient { available };
        }
        if available == 0 {
            return RingRead::Copied(0);
        }

        let count = available.min(events.len());
        // The modulo is only needed when this batch crosses the end of the ring.
        let wraps = head as usize + count >= nr as usize;
        for slot in events.iter_mut().take(count) {
            // SAFETY: `head < nr`, and the Acquire load of `tail` ordered the
            // kernel's slot writes before this read.
            *slot = unsafe { ptr::read_volatile(self.slot_ptr(head)) };
            head = if wraps { (head + 1) % nr } else { head + 1 };
        }

        header.head.store(head, Ordering::Release);
        RingRead::Copied(count)
    }
}

/// Published-but-unconsumed slot count, without a branch on wraparound.
#[inline]
fn pending(head: u32, tail: u32, nr: u32) -> u32 {
    tail.wrapping_sub(head).wrapping_add(nr) % nr
}

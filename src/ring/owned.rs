//! Heap-backed completion ring with a producer side.
//!
//! Lays out the same header and slot array the kernel maps for an AIO
//! context, so [`CompletionRing`](super::CompletionRing) reads it exactly as
//! it would a real one. [`SimulatedAio`](crate::backend::SimulatedAio) is the
//! producer; tests use it to race a writer against the reader.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

use crate::error::{AioError, Result};
use crate::sys::{IoEvent, RingHeader, AIO_RING_MAGIC, RING_HEADER_LEN};

/// Owned ring memory: a [`RingHeader`] followed by `nr` [`IoEvent`] slots.
pub struct OwnedRing {
    header: NonNull<RingHeader>,
    layout: Layout,
    nr: u32,
}

// SAFETY: `head` and `tail` are atomics; slot writes are published through
// `tail` and only made by the single producer the caller serializes.
unsafe impl Send for OwnedRing {}
unsafe impl Sync for OwnedRing {}

impl OwnedRing {
    /// Allocate a ring able to hold `capacity` unconsumed events.
    ///
    /// One extra slot is reserved so a full ring is distinguishable from an
    /// empty one, as in the kernel.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity >= u32::MAX as usize {
            return Err(AioError::InvalidArgument(format!(
                "ring capacity {capacity} out of range"
            )));
        }
        let nr = capacity as u32 + 1;
        let size = RING_HEADER_LEN + nr as usize * std::mem::size_of::<IoEvent>();
        let layout = Layout::from_size_align(size, std::mem::align_of::<IoEvent>())
            .map_err(|e| AioError::InvalidArgument(e.to_string()))?;

        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let header = NonNull::new(raw.cast::<RingHeader>()).ok_or(AioError::OutOfMemory { size })?;

        // SAFETY: freshly allocated, zeroed, suitably aligned, not yet shared.
        unsafe {
            let hdr = header.as_ptr();
            (*hdr).nr = nr;
            (*hdr).magic = AIO_RING_MAGIC;
            (*hdr).header_length = RING_HEADER_LEN as u32;
        }

        Ok(Self { header, layout, nr })
    }

    /// Pointer suitable for [`CompletionRing::from_raw`](super::CompletionRing::from_raw).
    pub fn header(&self) -> NonNull<RingHeader> {
        self.header
    }

    /// Maximum number of unconsumed events.
    pub fn capacity(&self) -> usize {
        self.nr as usize - 1
    }

    fn hdr(&self) -> &RingHeader {
        // SAFETY: owned allocation, alive for `self`.
        unsafe { self.header.as_ref() }
    }

    /// Events published and not yet consumed.
    pub fn len(&self) -> usize {
        let head = self.hdr().head.load(Ordering::Acquire);
        let tail = self.hdr().tail.load(Ordering::Relaxed);
        (tail.wrapping_sub(head).wrapping_add(self.nr) % self.nr) as usize
    }

    /// Whether no events are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish one event, as the kernel does on completion.
    ///
    /// Returns `false` if the ring is full. Producers must be serialized by
    /// the caller.
    pub fn push(&self, event: IoEvent) -> bool {
        let hdr = self.hdr();
        let tail = hdr.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % self.nr;
        if next == hdr.head.load(Ordering::Acquire) {
            return false;
        }

        // SAFETY: `tail < nr`; the consumer never reads this slot until the
        // Release store below makes it visible.
        unsafe {
            let slot = (self.header.as_ptr() as *mut u8)
                .add(RING_HEADER_LEN)
                .cast::<IoEvent>()
                .add(tail as usize);
            ptr::write_volatile(slot, event);
        }
        hdr.tail.store(next, Ordering::Release);
        true
    }

    /// Consume published events on the producer's side, as `io_getevents`
    /// does in the kernel. Unlike the user-space reader this ignores the
    /// header's magic and feature bits.
    ///
    /// Must not race with another consumer.
    pub fn pop_into(&self, events: &mut [IoEvent]) -> usize {
        let hdr = self.hdr();
        let mut head = hdr.head.load(Ordering::Relaxed);
        let tail = hdr.tail.load(Ordering::Acquire);
        let count = ((tail.wrapping_sub(head).wrapping_add(self.nr) % self.nr) as usize)
            .min(events.len());

        for slot in events.iter_mut().take(count) {
            // SAFETY: `head < nr` and the slot was published before `tail`.
            *slot = unsafe {
                ptr::read_volatile(
                    (self.header.as_ptr() as *const u8)
                        .add(RING_HEADER_LEN)
                        .cast::<IoEvent>()
                        .add(head as usize),
                )
            };
            head = (head + 1) % self.nr;
        }

        hdr.head.store(head, Ordering::Release);
        count
    }

    /// Overwrite the header's magic, making the ring unusable for readers
    /// that validate it when set to anything but the kernel's value.
    pub fn set_magic(&self, magic: u32) {
        // SAFETY: plain field of the owned header; readers use volatile loads.
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.header.as_ptr()).magic), magic) }
    }

    /// Overwrite the header's incompatible-feature bits.
    pub fn set_incompat_features(&self, bits: u32) {
        // SAFETY: as for `set_magic`.
        unsafe {
            ptr::write_volatile(
                ptr::addr_of_mut!((*self.header.as_ptr()).incompat_features),
                bits,
            )
        }
    }
}

impl Drop for OwnedRing {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { dealloc(self.header.as_ptr().cast::<u8>(), self.layout) }
    }
}

impl std::fmt::Debug for OwnedRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedRing")
            .field("slots", &self.nr)
            .field("len", &self.len())
            .finish()
    }
}

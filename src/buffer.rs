//! Aligned memory for direct I/O.
//!
//! `O_DIRECT` transfers require the buffer address, the length and the file
//! offset to be multiples of the device's logical block size. An
//! [`AlignedBuffer`] guarantees the first two.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::slice;

use crate::error::{AioError, Result};

/// Heap buffer with a caller-chosen power-of-two alignment.
///
/// Memory is zero-filled on allocation and released when the buffer is
/// dropped. While a read or write against this buffer is in flight the
/// caller must keep it alive and must not touch its contents.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer uniquely owns its allocation.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `size` zeroed bytes aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// - [`AioError::InvalidArgument`] if `size` is zero, `alignment` is not
    ///   a power of two, or `size` is not a multiple of `alignment`.
    /// - [`AioError::OutOfMemory`] if the allocator refuses the request.
    pub fn new(size: usize, alignment: usize) -> Result<Self> {
        if size == 0 {
            return Err(AioError::InvalidArgument(
                "buffer size must be greater than zero".to_string(),
            ));
        }
        if !alignment.is_power_of_two() {
            return Err(AioError::InvalidArgument(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        if size % alignment != 0 {
            return Err(AioError::InvalidArgument(format!(
                "buffer size {size} needs to be aligned to {alignment}"
            )));
        }

        let layout = Layout::from_size_align(size, alignment)
            .map_err(|e| AioError::InvalidArgument(e.to_string()))?;
        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(AioError::OutOfMemory { size })?;

        Ok(Self { ptr, layout })
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always `false`; zero-length buffers cannot be created.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Alignment the buffer was allocated with.
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Fill the first `len` bytes with zeroes.
    pub fn zero(&mut self, len: usize) -> Result<()> {
        if len > self.len() {
            return Err(AioError::InvalidArgument(format!(
                "cannot zero {len} bytes of a {} byte buffer",
                self.len()
            )));
        }
        self.as_mut_slice()[..len].fill(0);
        Ok(())
    }

    /// Start of the buffer, for submitting writes.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Start of the buffer, for submitting reads.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Contents as a slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is `len` initialized bytes owned by `self`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    /// Contents as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, with unique access through `&mut self`.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len())
            .field("alignment", &self.alignment())
            .finish()
    }
}

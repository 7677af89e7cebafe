//! Fixed-capacity pool of reusable AIO request descriptors.
//!
//! Every in-flight operation occupies one [`Descriptor`]. Descriptors are
//! allocated once when the pool is built and never freed until the pool is
//! dropped; acquiring and releasing only moves their ids around a circular
//! array guarded by a single mutex.
//!
//! Acquisition never blocks: when `capacity` descriptors are outstanding,
//! [`DescriptorPool::acquire`] returns `Ok(None)` and the caller turns that
//! into backpressure.

mod stats;


pub use stats::PoolStats;

use std::cell::UnsafeCell;

#[cfg(loom)]
use loom::sync::{Mutex, MutexGuard};
#[cfg(not(loom))]
use std::sync::{Mutex, MutexGuard};

use crate::completion::InFlight;
use crate::error::{AioError, Result};
use crate::sys::Iocb;

/// Identifier of a descriptor within its pool.
///
/// The id is written into [`Iocb::aio_data`] at submission, so the kernel
/// hands it back in the completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(usize);

impl DescriptorId {
    /// Position of the descriptor in the pool's storage.
    pub fn index(self) -> usize {
        self.0
    }

    /// Recover an id from the `data` field of a completion event.
    pub fn from_event_data(data: u64) -> Self {
        DescriptorId(data as usize)
    }
}

/// One reusable request slot.
///
/// The control block comes first so a pointer to the descriptor is also a
/// pointer to its [`Iocb`].
#[repr(C)]
#[derive(Debug)]
pub struct Descriptor {
    pub(crate) iocb: Iocb,
    pub(crate) in_flight: Option<InFlight>,
}

impl Descriptor {
    fn new(id: usize) -> Self {
        Descriptor {
            iocb: Iocb {
                aio_data: id as u64,
                ..Iocb::default()
            },
            in_flight: None,
        }
    }

    /// The control block handed to the kernel.
    pub fn iocb(&self) -> &Iocb {
        &self.iocb
    }

    /// Whether this descriptor carries the shutdown sentinel.
    pub fn is_sentinel(&self) -> bool {
        matches!(self.in_flight, Some(InFlight::Sentinel))
    }
}

/// Circular cursor state. Only ever touched under the pool mutex.
struct PoolState {
    ring: Box<[usize]>,
    outstanding: Box<[bool]>,
    get: usize,
    put: usize,
    used: usize,
    total_acquired: u64,
    exhausted: u64,
}

/// Fixed-capacity, thread-safe store of [`Descriptor`]s.
pub struct DescriptorPool {
    descriptors: Box<[UnsafeCell<Descriptor>]>,
    state: Mutex<PoolState>,
    capacity: usize,
}

// SAFETY: a descriptor's contents are only reached through
// `descriptor_mut`, whose contract gives the holder of an acquired id
// exclusive access. Cursor state is behind the mutex.
unsafe impl Send for DescriptorPool {}
unsafe impl Sync for DescriptorPool {}

impl DescriptorPool {
    /// Build a pool of `capacity` descriptors, all initially available.
    ///
    /// # Errors
    ///
    /// Returns [`AioError::InvalidArgument`] if `capacity` is zero, or
    /// [`AioError::OutOfMemory`] if the descriptor storage cannot be
    /// reserved.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(AioError::InvalidArgument(
                "descriptor pool capacity must be greater than zero".to_string(),
            ));
        }

        let mut descriptors = Vec::new();
        descriptors
            .try_reserve_exact(capacity)
            .map_err(|_| AioError::OutOfMemory {
                size: capacity * std::mem::size_of::<Descriptor>(),
            })?;
        descriptors.extend((0..capacity).map(|id| UnsafeCell::new(Descriptor::new(id))));

        let state = PoolState {
            ring: (0..capacity).collect(),
            outstanding: vec![false; capacity].into_boxed_slice(),
            get: 0,
            put: 0,
            used: 0,
            total_acquired: 0,
            exhausted: 0,
        };

        Ok(Self {
            descriptors: descriptors.into_boxed_slice(),
            state: Mutex::new(state),
            capacity,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state.lock().map_err(|_| AioError::PoolPoisoned)
    }

    /// Take the descriptor under the get-cursor.
    ///
    /// Returns `Ok(None)` when every descriptor is outstanding. Never blocks
    /// beyond the mutex hold.
    pub fn acquire(&self) -> Result<Option<DescriptorId>> {
        let mut state = self.lock()?;

        if state.used >= self.capacity {
            state.exhausted += 1;
            return Ok(None);
        }

        let id = state.ring[state.get];
        state.get += 1;
        if state.get >= self.capacity {
            state.get = 0;
        }
        state.used += 1;
        state.outstanding[id] = true;
        state.total_acquired += 1;

        Ok(Some(DescriptorId(id)))
    }

    /// Return a descriptor at the put-cursor.
    ///
    /// # Errors
    ///
    /// Returns [`AioError::InvalidArgument`] for an id this pool never handed
    /// out or one that is not currently outstanding. The pool is left
    /// untouched in that case, so `used` can never go negative.
    pub fn release(&self, id: DescriptorId) -> Result<()> {
        let mut state = self.lock()?;

        if id.0 >= self.capacity || !state.outstanding[id.0] {
            return Err(AioError::InvalidArgument(format!(
                "descriptor {} is not outstanding",
                id.0
            )));
        }

        state.outstanding[id.0] = false;
        state.used -= 1;
        let put = state.put;
        state.ring[put] = id.0;
        state.put += 1;
        if state.put >= self.capacity {
            state.put = 0;
        }

        Ok(())
    }

    /// Exclusive access to an outstanding descriptor.
    ///
    /// # Safety
    ///
    /// The caller must be the current owner of `id`: it acquired the id (or
    /// received it back in a completion event) and has not released it, and
    /// no other reference obtained through this method is alive. While the
    /// kernel holds the request nobody owns the id in this sense.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn descriptor_mut(&self, id: DescriptorId) -> &mut Descriptor {
        // SAFETY: uniqueness is guaranteed by the caller.
        unsafe { &mut *self.descriptors[id.0].get() }
    }

    /// Number of descriptors in the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of descriptors currently outstanding.
    pub fn used(&self) -> Result<usize> {
        Ok(self.lock()?.used)
    }

    /// Number of descriptors available for acquisition.
    pub fn available(&self) -> Result<usize> {
        Ok(self.capacity - self.lock()?.used)
    }

    /// Whether an id falls inside this pool.
    pub fn contains(&self, id: DescriptorId) -> bool {
        id.0 < self.capacity
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> Result<PoolStats> {
        let state = self.lock()?;
        Ok(PoolStats {
            capacity: self.capacity,
            in_use: state.used,
            available: self.capacity - state.used,
            total_acquired: state.total_acquired,
            exhausted: state.exhausted,
        })
    }
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("capacity", &self.capacity)
            .field("used", &self.used().ok())
            .finish()
    }
}

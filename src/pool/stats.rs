//! Pool statistics and monitoring.

/// Snapshot of descriptor pool usage.
///
/// Values are captured under the pool mutex but may be stale as soon as the
/// snapshot is returned.
///
/// # Examples
///
/// ```rust
/// use safer_aio::pool::DescriptorPool;
///
/// let pool = DescriptorPool::new(8).unwrap();
/// let stats = pool.stats().unwrap();
/// assert_eq!(stats.available, 8);
/// assert_eq!(stats.utilization_percent(), 0.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Queue depth of the pool
    pub capacity: usize,
    /// Descriptors currently outstanding
    pub in_use: usize,
    /// Descriptors ready for acquisition
    pub available: usize,
    /// Successful acquisitions since creation
    pub total_acquired: u64,
    /// Acquisitions rejected because the pool was empty
    pub exhausted: u64,
}

impl PoolStats {
    /// Outstanding descriptors as a percentage of capacity.
    pub fn utilization_percent(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.in_use as f64 / self.capacity as f64 * 100.0
    }

    /// Whether any submission has been turned away for lack of capacity.
    pub fn has_backpressure(&self) -> bool {
        self.exhausted > 0
    }

    /// Whether the pool is back to its initial, fully available state.
    pub fn is_idle(&self) -> bool {
        self.in_use == 0
    }
}

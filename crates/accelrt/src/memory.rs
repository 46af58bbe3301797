use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Error;

/// Opaque handle to a block of device memory
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(u64);
impl DevicePtr {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
    pub fn as_raw(self) -> u64 {
        self.0
    }
}
impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.0)
    }
}

/// Snapshot of a [MemoryTracker]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub allocations: u64,
    pub frees: u64,
    pub bytes_in_use: u64,
    pub bytes_limit: u64,
}
impl MemoryStats {
    /// Allocations not yet matched by a free
    pub fn live(&self) -> u64 {
        self.allocations - self.frees
    }
}

/// Tracks device memory usage against a fixed limit
///
/// Updates go through atomics, so a shared reference is enough to allocate.
pub struct MemoryTracker {
    maximum: u64,
    current: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
}
impl MemoryTracker {
    pub fn new(maximum: u64) -> Self {
        Self {
            maximum,
            current: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }

    /// Reserve `size` bytes
    ///
    /// # Errors
    ///
    /// Returns [Error::OutOfMemory] without changing the usage if the limit would be exceeded.
    pub fn allocate(&self, size: u64) -> Result<(), Error> {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(size)
                    .filter(|next| *next <= self.maximum)
            })
            .map_err(|in_use| Error::OutOfMemory {
                requested: size,
                in_use,
                limit: self.maximum,
            })?;
        self.allocations.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    pub fn deallocate(&self, size: u64) {
        self.current.fetch_sub(size, Ordering::AcqRel);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn available(&self) -> u64 {
        self.maximum - self.current()
    }

    pub fn maximum(&self) -> u64 {
        self.maximum
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            bytes_in_use: self.current(),
            bytes_limit: self.maximum,
        }
    }
}

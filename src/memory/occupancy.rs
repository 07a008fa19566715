//! One atomic flag per slot, laid out class after class in the same order as
//! the arena. `false` is free, `true` is taken.

#[cfg(not(loom))]
use super::stats;
use super::vm::VmError;
use crate::sync::atomic::AtomicBool;
#[cfg(not(loom))]
use crate::sync::atomic::Ordering;

/// Flat table of occupancy flags.
///
/// Outside loom the flags live in their own VM mapping: committed pages read
/// as zero, and an all-zero `AtomicBool` is `false`, so the table starts all
/// free without touching every page. loom atomics must be constructed, so the
/// loom build boxes them instead.
pub(crate) struct OccupancyTable {
    #[cfg(not(loom))]
    region: super::vm::VmRegion,
    #[cfg(loom)]
    flags: Box<[AtomicBool]>,
    len: usize,
}

impl OccupancyTable {
    #[cfg(not(loom))]
    pub(crate) fn new(len: usize) -> Result<Self, VmError> {
        let region = super::vm::VmRegion::map(
            len * std::mem::size_of::<AtomicBool>(),
            std::mem::align_of::<AtomicBool>(),
        )?;
        let reserved = region.reserved();
        stats::TOTAL_RESERVED.fetch_add(reserved, Ordering::Relaxed);
        stats::TOTAL_COMMITTED.fetch_add(reserved, Ordering::Relaxed);
        stats::OCCUPANCY_COMMITTED.fetch_add(reserved, Ordering::Relaxed);
        Ok(Self { region, len })
    }

    #[cfg(loom)]
    pub(crate) fn new(len: usize) -> Result<Self, VmError> {
        let flags = (0..len).map(|_| AtomicBool::new(false)).collect();
        Ok(Self { flags, len })
    }

    #[inline]
    pub(crate) fn flags(&self) -> &[AtomicBool] {
        #[cfg(not(loom))]
        {
            // Safety: the region is committed, zero-filled, suitably aligned and
            // `len` flags long; it lives as long as `self`.
            unsafe {
                let base = self.region.base().as_ptr().cast::<AtomicBool>();
                std::slice::from_raw_parts(base, self.len)
            }
        }
        #[cfg(loom)]
        {
            &self.flags
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Bytes held from the OS for the table.
    pub(crate) fn committed(&self) -> usize {
        #[cfg(not(loom))]
        {
            self.region.reserved()
        }
        #[cfg(loom)]
        {
            self.len * std::mem::size_of::<AtomicBool>()
        }
    }
}

#[cfg(not(loom))]
impl Drop for OccupancyTable {
    fn drop(&mut self) {
        // Safety: `&mut self` means no flag reference outlives this point.
        match unsafe { self.region.unmap() } {
            Ok(()) => {
                let reserved = self.region.reserved();
                stats::TOTAL_RESERVED.sub(reserved);
                stats::TOTAL_COMMITTED.sub(reserved);
                stats::OCCUPANCY_COMMITTED.sub(reserved);
            }
            Err(e) => tracing::error!(error = %e, "failed to release occupancy table"),
        }
    }
}

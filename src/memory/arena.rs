use super::stats;
use super::vm::{VmError, VmRegion};
use crate::sync::atomic::{AtomicBool, Ordering};
use std::ptr::NonNull;

/// The single contiguous backing buffer for every slot of every class.
///
/// Length and location never change. The mapping is returned to the OS
/// either by an explicit [`release`](Arena::release) or on drop, whichever
/// comes first.
pub(crate) struct Arena {
    region: VmRegion,
    released: AtomicBool,
}

impl Arena {
    /// Map `len` bytes aligned to `align`.
    pub(crate) fn new(len: usize, align: usize) -> Result<Self, VmError> {
        let region = VmRegion::map(len, align)?;
        stats::TOTAL_RESERVED.fetch_add(region.reserved(), Ordering::Relaxed);
        stats::TOTAL_COMMITTED.fetch_add(region.reserved(), Ordering::Relaxed);
        stats::ARENA_COMMITTED.fetch_add(region.reserved(), Ordering::Relaxed);
        Ok(Self {
            region,
            released: AtomicBool::new(false),
        })
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.region.base()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Byte offset of `ptr` from the arena base, if it points inside the arena.
    #[inline]
    pub(crate) fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.base().as_ptr() as usize)?;
        (offset < self.len()).then_some(offset)
    }

    /// Return the mapping to the OS. Returns `Ok(false)` if already released.
    ///
    /// # Safety
    /// No pointer into the arena may be used afterwards, and no other thread
    /// may be inside an allocate/deallocate call on this arena.
    pub(crate) unsafe fn release(&self) -> Result<bool, VmError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        // Safety: the swap above makes this the only unmap; callers guarantee no live users.
        unsafe { self.region.unmap()? };
        self.untrack();
        Ok(true)
    }

    fn untrack(&self) {
        let reserved = self.region.reserved();
        stats::TOTAL_RESERVED.sub(reserved);
        stats::TOTAL_COMMITTED.sub(reserved);
        stats::ARENA_COMMITTED.sub(reserved);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        // Safety: `&mut self` means no outstanding borrow of the arena remains.
        match unsafe { self.region.unmap() } {
            Ok(()) => self.untrack(),
            Err(e) => tracing::error!(error = %e, "failed to release arena"),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_arena_alignment_and_bounds() {
        let arena = Arena::new(10_000, 1024).unwrap();
        let base = arena.base();
        assert_eq!(base.as_ptr() as usize % 1024, 0);
        assert_eq!(arena.len(), 10_000);

        assert_eq!(arena.offset_of(base), Some(0));
        // Safety: Test code; offsets stay inside or one past the mapping.
        unsafe {
            let last = NonNull::new_unchecked(base.as_ptr().add(9_999));
            assert_eq!(arena.offset_of(last), Some(9_999));
            let past = NonNull::new_unchecked(base.as_ptr().add(10_000));
            assert_eq!(arena.offset_of(past), None);
        }
        let before = NonNull::new((base.as_ptr() as usize - 1) as *mut u8).unwrap();
        assert_eq!(arena.offset_of(before), None);
    }

    #[test]
    fn test_release_is_idempotent() {
        let arena = Arena::new(4096, 8).unwrap();
        assert!(!arena.is_released());
        // Safety: Test code; nothing points into the arena.
        unsafe {
            assert!(arena.release().unwrap());
            assert!(!arena.release().unwrap());
        }
        assert!(arena.is_released());
        // Drop must not unmap a second time.
        drop(arena);
    }
}

use std::ptr::NonNull;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] std::io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] std::io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] std::io::Error),
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (make readable and writable) a range within a reservation.
    /// Freshly committed memory reads as zero.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    // Linux charges commit for private writable mappings unless told not to.
    // The arena is mostly untouched, so skip the up-front accounting.
    #[cfg(target_os = "linux")]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    RESERVE_FLAGS,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // SAFETY/PORTABILITY: this crate supports only 64-bit targets; page size fits in
                // usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed VmOps for loom, Miri and non-unix targets.
//
// Reservations come from the global heap, zero-filled, at page alignment.
// loom and Miri cannot issue real VM syscalls; the synchronization and
// pointer logic of the allocator is identical on top of either backing.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(unix)))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

/// A committed, zero-filled VM range whose usable base is aligned to a
/// caller-chosen power of two.
///
/// The reservation is padded by `align` when `align` exceeds the page size;
/// `original_ptr`/`reserved` describe the full mapping for release.
pub(crate) struct VmRegion {
    base: NonNull<u8>,
    len: usize,
    original_ptr: NonNull<u8>,
    reserved: usize,
}

// Safety: VmRegion owns its mapping; the pointer is never aliased by another owner.
unsafe impl Send for VmRegion {}
// Safety: VmRegion exposes no interior mutability of its own.
unsafe impl Sync for VmRegion {}

impl VmRegion {
    /// Reserve and commit `len` usable bytes starting at an `align`-aligned address.
    pub(crate) fn map(len: usize, align: usize) -> Result<Self, VmError> {
        debug_assert!(align.is_power_of_two());
        let page = PlatformVmOps::page_size();
        let padding = if align > page { align } else { 0 };
        let reserved = len
            .max(1)
            .checked_add(padding)
            .and_then(|n| n.checked_next_multiple_of(page))
            .ok_or_else(|| {
                VmError::ReservationFailed(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("reservation size overflow for {len} bytes"),
                ))
            })?;

        // Safety: FFI call to reserve memory.
        let original_ptr = unsafe { PlatformVmOps::reserve(reserved)? };
        // Safety: committing exactly the range just reserved.
        if let Err(e) = unsafe { PlatformVmOps::commit(original_ptr, reserved) } {
            // Safety: releasing the reservation made above; nothing references it.
            if let Err(release_err) = unsafe { PlatformVmOps::release(original_ptr, reserved) } {
                tracing::error!(
                    error = %release_err,
                    bytes = reserved,
                    "failed to release reservation after commit failure"
                );
            }
            return Err(e);
        }

        let addr = original_ptr.as_ptr() as usize;
        let aligned = (addr + align - 1) & !(align - 1);
        // Safety: aligned lies within [addr, addr + padding], inside the reservation, non-null.
        let base = unsafe { NonNull::new_unchecked(original_ptr.as_ptr().add(aligned - addr)) };

        Ok(Self {
            base,
            len,
            original_ptr,
            reserved,
        })
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Bytes held from the OS, including alignment padding.
    #[inline]
    pub(crate) fn reserved(&self) -> usize {
        self.reserved
    }

    /// Return the mapping to the OS.
    ///
    /// # Safety
    /// Must be called at most once, and no pointer into the region may be used afterwards.
    pub(crate) unsafe fn unmap(&self) -> Result<(), VmError> {
        // Safety: upheld by caller.
        unsafe { PlatformVmOps::release(self.original_ptr, self.reserved) }
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size).expect("Commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size() {
        // mmap with 0 size fails with EINVAL.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::reserve(0) };
        assert!(result.is_err(), "Reserving 0 bytes should fail");
    }

    #[test]
    fn test_region_is_zeroed_and_writable() {
        let region = VmRegion::map(3 * 4096 + 17, 64).unwrap();
        assert_eq!(region.len(), 3 * 4096 + 17);
        // Safety: Test code; the region is committed for `len` bytes.
        unsafe {
            let bytes = std::slice::from_raw_parts_mut(region.base().as_ptr(), region.len());
            assert!(bytes.iter().all(|&b| b == 0));
            bytes[region.len() - 1] = 0xEE;
            assert_eq!(bytes[region.len() - 1], 0xEE);
            region.unmap().unwrap();
        }
    }

    #[test]
    fn test_region_honours_alignment_above_page_size() {
        let align = PlatformVmOps::page_size() * 4;
        let region = VmRegion::map(100, align).unwrap();
        assert_eq!(region.base().as_ptr() as usize % align, 0);
        assert!(region.reserved() >= 100 + align);
        // Safety: Test code.
        unsafe { region.unmap().unwrap() };
    }
}

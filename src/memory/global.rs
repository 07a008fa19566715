use super::error::AllocError;
use super::slots::{MAX_ALIGNMENT, MAX_BLOCK_SIZE, SlotAllocator};
use crate::sync::OnceLock;
use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;

/// The process-wide context. Holds the construction error instead of the
/// allocator if the first initialization failed, so the arena is mapped at
/// most once even when that attempt fails.
static GLOBAL_CONTEXT: OnceLock<Result<SlotAllocator, String>> = OnceLock::new();

/// Process-wide slot allocator with the default configuration.
///
/// The context is built on first use by whichever thread gets there first;
/// racing threads block on that one initialization and then share its result.
/// After that, allocate/deallocate only touch per-slot flags.
///
/// Building the context maps memory straight from the OS and never touches
/// the heap, so the type can serve as `#[global_allocator]`; the first
/// allocation of the process then builds it. A `tracing` subscriber that
/// allocates while recording the init event would re-enter initialization,
/// so call [`init`](Self::init) before installing one.
pub struct GlobalSlotAllocator;

impl GlobalSlotAllocator {
    fn context() -> Result<&'static SlotAllocator, AllocError> {
        GLOBAL_CONTEXT
            .get_or_init(|| match SlotAllocator::new() {
                Ok(allocator) => {
                    tracing::info!(
                        arena_bytes = allocator.class_table().arena_len(),
                        classes = allocator.class_table().len(),
                        slots_per_class = allocator.config().slots_per_class,
                        "global slot allocator initialized"
                    );
                    Ok(allocator)
                }
                Err(e) => {
                    tracing::error!(error = %e, "global slot allocator failed to initialize");
                    Err(e.to_string())
                }
            })
            .as_ref()
            .map_err(|msg| AllocError::Initialization(msg.clone()))
    }

    /// Build the global context now instead of on first allocation.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::Initialization` if the arena cannot be mapped.
    /// The failure is permanent for the process.
    pub fn init() -> Result<(), AllocError> {
        Self::context().map(|_| ())
    }

    /// The global context, if it has been initialized successfully.
    pub fn get() -> Option<&'static SlotAllocator> {
        GLOBAL_CONTEXT.get()?.as_ref().ok()
    }

    /// Largest request any slot can serve.
    #[must_use]
    pub const fn max_size() -> usize {
        MAX_BLOCK_SIZE
    }

    /// Allocate a block of at least `size` bytes from the global context.
    ///
    /// # Errors
    ///
    /// Same as [`SlotAllocator::allocate`], plus `Initialization` if the
    /// context could not be built.
    pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
        Self::context()?.allocate(size)
    }

    /// Free a block obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// - `ptr` must have been returned by [`allocate`](Self::allocate).
    /// - `size` must select the same size class as the allocation did.
    /// - `ptr` must not have been freed already.
    ///
    /// # Panics
    ///
    /// Panics if the global context was never initialized, and in debug
    /// builds on any contract violation.
    pub unsafe fn deallocate(ptr: NonNull<u8>, size: usize) {
        if let Some(allocator) = Self::get() {
            // Safety: upheld by caller.
            unsafe { allocator.deallocate(ptr, size) };
        } else {
            panic!("GlobalSlotAllocator not initialized but deallocate called");
        }
    }

    /// Checked [`deallocate`](Self::deallocate).
    ///
    /// # Errors
    ///
    /// See [`SlotAllocator::try_deallocate`]; also `InvalidDeallocation` if
    /// the context was never initialized.
    ///
    /// # Safety
    /// Same as [`SlotAllocator::try_deallocate`].
    pub unsafe fn try_deallocate(ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        let allocator = Self::get().ok_or(AllocError::InvalidDeallocation {
            reason: "global allocator context was never initialized",
        })?;
        // Safety: upheld by caller.
        unsafe { allocator.try_deallocate(ptr, size) }
    }

    /// Release the global arena at controlled process shutdown.
    ///
    /// Idempotent; a no-op if the context was never built. Afterwards every
    /// allocation fails with `AllocError::Released`.
    ///
    /// # Safety
    /// No block from the global allocator may be in use, and no other thread
    /// may allocate or deallocate concurrently with or after this call.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::Vm` if the OS refuses to unmap the arena.
    pub unsafe fn teardown() -> Result<(), AllocError> {
        let Some(allocator) = Self::get() else {
            return Ok(());
        };
        // Safety: upheld by caller.
        if unsafe { allocator.release()? } {
            tracing::info!("global slot allocator torn down");
        }
        Ok(())
    }

    /// Request size for a layout: a block of `max(size, align)` bytes is
    /// aligned to at least `align` while `align <= MAX_ALIGNMENT`.
    #[inline]
    fn layout_size(layout: Layout) -> usize {
        layout.size().max(layout.align())
    }
}

// Safety: Implementation follows GlobalAlloc contract. Blocks are at least
// `layout.size()` bytes and aligned to `layout.align()`; unsupported layouts
// get null.
unsafe impl GlobalAlloc for GlobalSlotAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_ALIGNMENT {
            return std::ptr::null_mut();
        }
        match GlobalSlotAllocator::allocate(Self::layout_size(layout)) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // Safety: ptr came from `alloc` with the same layout, hence the same size class.
            unsafe { GlobalSlotAllocator::deallocate(ptr, Self::layout_size(layout)) };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::slots::SLOTS_PER_CLASS;

    #[test]
    fn test_global_allocate_deallocate() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let ptr = GlobalSlotAllocator::allocate(100).unwrap();
        let context = GlobalSlotAllocator::get().unwrap();
        assert!(context.contains(ptr));
        assert_eq!(context.class_of(ptr).unwrap().block_size, 128);
        // Safety: Test code.
        unsafe {
            ptr.as_ptr().write_bytes(0x5A, 128);
            GlobalSlotAllocator::try_deallocate(ptr, 100).unwrap();
        }
        assert!(matches!(
            GlobalSlotAllocator::allocate(GlobalSlotAllocator::max_size() + 1),
            Err(AllocError::AllocationTooLarge { .. })
        ));
    }

    #[test]
    fn test_global_exhaustion_scenario() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let held: Vec<_> = (0..SLOTS_PER_CLASS)
            .map(|_| GlobalSlotAllocator::allocate(64).unwrap())
            .collect();

        let exhausted_before = crate::memory::stats::snapshot().exhausted_claims;
        assert!(matches!(
            GlobalSlotAllocator::allocate(64),
            Err(AllocError::SizeClassExhausted { block_size: 64, .. })
        ));
        assert!(crate::memory::stats::snapshot().exhausted_claims > exhausted_before);

        let other = GlobalSlotAllocator::allocate(256).unwrap();

        // Safety: Test code.
        unsafe {
            GlobalSlotAllocator::deallocate(other, 256);
            for ptr in &held {
                GlobalSlotAllocator::deallocate(*ptr, 64);
            }
        }

        // Every flag of the class is free again; a full refill succeeds.
        let refill: Vec<_> = (0..SLOTS_PER_CLASS)
            .map(|_| GlobalSlotAllocator::allocate(64).unwrap())
            .collect();
        // Safety: Test code.
        unsafe {
            for ptr in refill {
                GlobalSlotAllocator::deallocate(ptr, 64);
            }
        }
        let class = GlobalSlotAllocator::get()
            .unwrap()
            .class_table()
            .classify(64)
            .unwrap();
        let taken = GlobalSlotAllocator::get()
            .unwrap()
            .occupancy(class.index)
            .unwrap();
        assert_eq!(taken.count_ones(..), 0);
    }

    #[test]
    fn test_global_alloc_honours_layout() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let layouts = [
            Layout::from_size_align(1, 1).unwrap(),
            Layout::from_size_align(24, 8).unwrap(),
            Layout::from_size_align(10, 256).unwrap(),
            Layout::from_size_align(3000, 1024).unwrap(),
            Layout::new::<[u64; 64]>(),
        ];
        for layout in layouts {
            // Safety: Test code; layouts have non-zero size.
            unsafe {
                let ptr = GlobalSlotAllocator.alloc(layout);
                assert!(!ptr.is_null());
                assert_eq!(ptr as usize % layout.align(), 0, "{layout:?}");
                ptr.write_bytes(0xC3, layout.size());
                GlobalSlotAllocator.dealloc(ptr, layout);
            }
        }
    }

    #[test]
    fn test_global_alloc_rejects_unsupported_layouts() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let over_aligned = Layout::from_size_align(64, MAX_ALIGNMENT * 2).unwrap();
            assert!(GlobalSlotAllocator.alloc(over_aligned).is_null());

            let too_big = Layout::from_size_align(MAX_BLOCK_SIZE + 1, 1).unwrap();
            assert!(GlobalSlotAllocator.alloc(too_big).is_null());
        }
    }

    #[test]
    fn test_global_realloc_moves_between_classes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let layout = Layout::from_size_align(16, 8).unwrap();
        // Safety: Test code.
        unsafe {
            let ptr = GlobalSlotAllocator.alloc(layout);
            assert!(!ptr.is_null());
            for i in 0..16u8 {
                ptr.add(i as usize).write(i);
            }
            let grown = GlobalSlotAllocator.realloc(ptr, layout, 500);
            assert!(!grown.is_null());
            for i in 0..16u8 {
                assert_eq!(grown.add(i as usize).read(), i);
            }
            GlobalSlotAllocator.dealloc(grown, Layout::from_size_align(500, 8).unwrap());
        }
    }
}

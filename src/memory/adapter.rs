use super::error::AllocError;
use super::global::GlobalSlotAllocator;
use super::slots::{MAX_ALIGNMENT, MAX_BLOCK_SIZE};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Storage capability for containers that hold `Value`s in one contiguous
/// block and manage element lifetimes themselves.
///
/// Equal instances are interchangeable: storage obtained from one may be
/// returned through any other that compares equal, so a container can hand
/// its buffer to another container holding an equal allocator.
///
/// # Safety
///
/// Implementors must return storage that is valid for `count` values,
/// aligned for `Value`, and not handed out again until deallocated.
/// Equality must mean the instances share one backing store.
pub unsafe trait ElementAllocator: PartialEq {
    type Value;

    /// Storage for `count` contiguous, uninitialized values.
    ///
    /// # Errors
    ///
    /// Implementation-defined; see the implementor.
    fn allocate(&self, count: usize) -> Result<NonNull<Self::Value>, AllocError>;

    /// Return storage from [`allocate`](Self::allocate) on this or an equal
    /// instance.
    ///
    /// # Safety
    /// - `ptr` must come from `allocate(count)` with this same `count`.
    /// - Any values still in the storage must already have been dropped or moved out.
    unsafe fn deallocate(&self, ptr: NonNull<Self::Value>, count: usize);

    /// Largest allocation in bytes.
    fn max_size(&self) -> usize;
}

/// Typed handle to the global slot allocator, for container code that
/// manages its own storage.
///
/// Stateless: every instance, whatever its element type, delegates to the
/// one global context, so all instances compare equal and storage from one
/// may be returned through any other.
///
/// `count` elements must fit in a single slot, so `count * size_of::<T>()`
/// is capped at [`max_size`](Self::max_size) bytes.
pub struct FixedSizeAllocator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> FixedSizeAllocator<T> {
    const ALIGN_FITS: () = assert!(
        std::mem::align_of::<T>() <= MAX_ALIGNMENT,
        "element alignment exceeds the slot allocator's MAX_ALIGNMENT"
    );

    #[must_use]
    pub const fn new() -> Self {
        let () = Self::ALIGN_FITS;
        Self {
            _marker: PhantomData,
        }
    }

    /// Largest allocation in bytes.
    #[must_use]
    pub const fn max_size() -> usize {
        MAX_BLOCK_SIZE
    }

    /// The same allocator, viewed for another element type.
    #[must_use]
    pub fn rebind<U>(self) -> FixedSizeAllocator<U> {
        FixedSizeAllocator::new()
    }

    fn byte_size(count: usize) -> Result<usize, AllocError> {
        count
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(AllocError::AllocationTooLarge {
                size: usize::MAX,
                max_block_size: MAX_BLOCK_SIZE,
            })
    }

    /// Storage for `count` contiguous, uninitialized `T`s.
    ///
    /// Zero-byte requests (`count == 0` or zero-sized `T`) return a dangling,
    /// well-aligned pointer without touching the arena.
    ///
    /// # Errors
    ///
    /// - `AllocationTooLarge` if `count * size_of::<T>()` exceeds `max_size()`.
    /// - `SizeClassExhausted` if the matching size class is full.
    pub fn allocate(&self, count: usize) -> Result<NonNull<T>, AllocError> {
        match Self::byte_size(count)? {
            0 => Ok(NonNull::dangling()),
            size => GlobalSlotAllocator::allocate(size).map(NonNull::cast),
        }
    }

    /// Return storage obtained from [`allocate`](Self::allocate) on any
    /// `FixedSizeAllocator<T>`.
    ///
    /// # Safety
    /// - `ptr` must come from `allocate(count)` with this same `count`.
    /// - Any `T`s still in the storage must already have been dropped or moved out.
    /// - `ptr` must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize) {
        let Ok(size) = Self::byte_size(count) else {
            debug_assert!(false, "deallocate with a count that could never have been allocated");
            return;
        };
        if size != 0 {
            // Safety: upheld by caller; the size re-derives the allocation's class.
            unsafe { GlobalSlotAllocator::deallocate(ptr.cast(), size) };
        }
    }
}

// Safety: every instance delegates to the one global context, which hands
// out disjoint, suitably aligned slots.
unsafe impl<T> ElementAllocator for FixedSizeAllocator<T> {
    type Value = T;

    #[inline]
    fn allocate(&self, count: usize) -> Result<NonNull<T>, AllocError> {
        FixedSizeAllocator::allocate(self, count)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize) {
        // Safety: upheld by caller.
        unsafe { FixedSizeAllocator::deallocate(self, ptr, count) }
    }

    #[inline]
    fn max_size(&self) -> usize {
        MAX_BLOCK_SIZE
    }
}

impl<T> Default for FixedSizeAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for FixedSizeAllocator<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FixedSizeAllocator<T> {}

impl<T> fmt::Debug for FixedSizeAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedSizeAllocator")
            .field("value_type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T, U> PartialEq<FixedSizeAllocator<U>> for FixedSizeAllocator<T> {
    fn eq(&self, _other: &FixedSizeAllocator<U>) -> bool {
        true
    }
}

impl<T> Eq for FixedSizeAllocator<T> {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[repr(align(64))]
    #[derive(Clone, Copy, Debug, PartialEq)]
    struct CacheLine([u8; 64]);

    #[test]
    fn test_instances_compare_equal_across_types() {
        let a = FixedSizeAllocator::<u32>::new();
        let b = FixedSizeAllocator::<String>::default();
        let c: FixedSizeAllocator<CacheLine> = a.rebind();
        assert!(a == b);
        assert!(b == c);
        assert_eq!(a, a.rebind::<u32>());
        assert_eq!(FixedSizeAllocator::<u8>::max_size(), MAX_BLOCK_SIZE);
        assert!(format!("{a:?}").contains("u32"));
    }

    #[test]
    fn test_allocate_elements_and_read_back() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = FixedSizeAllocator::<u64>::new();
        let count = 100;
        let ptr = alloc.allocate(count).unwrap();
        assert_eq!(ptr.as_ptr() as usize % std::mem::align_of::<u64>(), 0);

        // Safety: Test code; `count` u64s fit in the 1024-byte block.
        unsafe {
            for i in 0..count {
                ptr.as_ptr().add(i).write(i as u64 * 3);
            }
            let values = std::slice::from_raw_parts(ptr.as_ptr(), count);
            assert_eq!(values[99], 297);
            assert_eq!(values.iter().sum::<u64>(), 3 * (0..100).sum::<u64>());
            alloc.deallocate(ptr, count);
        }
    }

    #[test]
    fn test_storage_returned_through_other_instance() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let first = FixedSizeAllocator::<CacheLine>::new();
        let ptr = first.allocate(4).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        // Safety: Test code.
        unsafe { ptr.as_ptr().write(CacheLine([7; 64])) };

        let second = FixedSizeAllocator::<u8>::new().rebind::<CacheLine>();
        assert!(first == second);
        // Safety: Test code; same count, same element type.
        unsafe { second.deallocate(ptr, 4) };
    }

    /// Fill `count` values through any element allocator, reading them back.
    fn fill_through<A: ElementAllocator<Value = u32>>(alloc: &A, count: usize) -> NonNull<u32> {
        let ptr = alloc.allocate(count).unwrap();
        for i in 0..count {
            // Safety: Test code; `ptr` holds `count` u32s.
            unsafe { ptr.as_ptr().add(i).write(i as u32) };
        }
        ptr
    }

    #[test]
    fn test_generic_code_uses_the_capability_trait() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let first = FixedSizeAllocator::<u32>::new();
        assert_eq!(ElementAllocator::max_size(&first), MAX_BLOCK_SIZE);

        let ptr = fill_through(&first, 200);
        // Safety: Test code; 200 values were written above.
        let values = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 200) };
        assert_eq!(values[199], 199);
        let class = GlobalSlotAllocator::get().unwrap().class_of(ptr.cast()).unwrap();
        assert_eq!(class.block_size, 1024);

        // Storage travels to an equal instance reached through another element type.
        let second = FixedSizeAllocator::<String>::new().rebind::<u32>();
        assert!(first == second);
        // Safety: Test code; same count, values are plain data.
        unsafe { ElementAllocator::deallocate(&second, ptr, 200) };
    }

    #[test]
    fn test_zero_sized_requests_skip_the_arena() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = FixedSizeAllocator::<u32>::new();
        let empty = alloc.allocate(0).unwrap();
        assert_eq!(empty, NonNull::dangling());
        // Safety: Test code.
        unsafe { alloc.deallocate(empty, 0) };

        let unit = FixedSizeAllocator::<()>::new();
        let ptr = unit.allocate(1_000_000_000).unwrap();
        // Safety: Test code.
        unsafe { unit.deallocate(ptr, 1_000_000_000) };
    }

    #[test]
    fn test_oversized_counts_fail() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = FixedSizeAllocator::<u32>::new();
        assert!(matches!(
            alloc.allocate(MAX_BLOCK_SIZE / 4 + 1),
            Err(AllocError::AllocationTooLarge { .. })
        ));
        assert!(matches!(
            alloc.allocate(usize::MAX),
            Err(AllocError::AllocationTooLarge { .. })
        ));

        let max = alloc.allocate(MAX_BLOCK_SIZE / 4).unwrap();
        // Safety: Test code.
        unsafe { alloc.deallocate(max, MAX_BLOCK_SIZE / 4) };
    }
}

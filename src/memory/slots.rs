use super::arena::Arena;
use super::error::AllocError;
use super::occupancy::OccupancyTable;
use super::size_class::{SizeClass, SizeClassTable};
use super::stats;
use crate::sync::atomic::{AtomicBool, Ordering};
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Alignment of the arena base, and the ceiling on every slot's alignment.
pub const MAX_ALIGNMENT: usize = 1024;

/// Largest request a single slot can serve.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Slots in every size class.
pub const SLOTS_PER_CLASS: usize = 1024;

/// Configuration for `SlotAllocator`. Defaults are the build-time constants
/// the global context uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotAllocatorConfig {
    /// Arena base alignment. Every slot is aligned to
    /// `min(block_size, max_alignment)`. Default: [`MAX_ALIGNMENT`].
    pub max_alignment: usize,

    /// Largest size class. Power of two. Default: [`MAX_BLOCK_SIZE`].
    pub max_block_size: usize,

    /// Slots per size class. Must be a non-zero multiple of `max_alignment`
    /// so class boundaries keep slot alignment. Default: [`SLOTS_PER_CLASS`].
    pub slots_per_class: usize,
}

impl Default for SlotAllocatorConfig {
    fn default() -> Self {
        Self {
            max_alignment: MAX_ALIGNMENT,
            max_block_size: MAX_BLOCK_SIZE,
            slots_per_class: SLOTS_PER_CLASS,
        }
    }
}

impl SlotAllocatorConfig {
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` describing the first violated rule.
    pub fn validate(&self) -> Result<(), AllocError> {
        if !self.max_alignment.is_power_of_two() {
            return Err(AllocError::InvalidConfig(format!(
                "max_alignment {} is not a power of two",
                self.max_alignment
            )));
        }
        if !self.max_block_size.is_power_of_two() {
            return Err(AllocError::InvalidConfig(format!(
                "max_block_size {} is not a power of two",
                self.max_block_size
            )));
        }
        if self.slots_per_class == 0 || !self.slots_per_class.is_multiple_of(self.max_alignment) {
            return Err(AllocError::InvalidConfig(format!(
                "slots_per_class {} must be a non-zero multiple of max_alignment {}",
                self.slots_per_class, self.max_alignment
            )));
        }
        Ok(())
    }
}

/// Segregated-slot allocator over one arena.
///
/// Each size class owns a fixed run of slots. Allocation claims the first
/// free slot of the smallest fitting class with a single atomic swap;
/// deallocation clears that slot's flag. Classes never lend slots to each
/// other, and nothing is stored per slot besides its flag, so the caller
/// must hand back the same size it allocated with.
pub struct SlotAllocator {
    config: SlotAllocatorConfig,
    classes: SizeClassTable,
    arena: Arena,
    occupancy: OccupancyTable,
}

impl SlotAllocator {
    /// Create an allocator with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` if mapping the arena or occupancy table fails.
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(SlotAllocatorConfig::default())
    }

    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` for a bad configuration and
    /// `AllocError::Vm` if the arena or occupancy table cannot be mapped.
    pub fn with_config(config: SlotAllocatorConfig) -> Result<Self, AllocError> {
        config.validate()?;
        let classes = SizeClassTable::new(config.max_block_size, config.slots_per_class)?;
        let arena = Arena::new(classes.arena_len(), config.max_alignment)?;
        let occupancy = OccupancyTable::new(classes.total_slots())?;

        tracing::debug!(
            arena_bytes = classes.arena_len(),
            occupancy_bytes = occupancy.committed(),
            classes = classes.len(),
            slots = occupancy.len(),
            "mapped slot allocator arena"
        );

        Ok(Self {
            config,
            classes,
            arena,
            occupancy,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SlotAllocatorConfig {
        &self.config
    }

    #[must_use]
    pub fn class_table(&self) -> &SizeClassTable {
        &self.classes
    }

    #[must_use]
    pub fn arena_base(&self) -> NonNull<u8> {
        self.arena.base()
    }

    /// True if `ptr` points anywhere inside the arena.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.arena.offset_of(ptr).is_some()
    }

    /// Size class whose region holds `ptr`.
    #[must_use]
    pub fn class_of(&self, ptr: NonNull<u8>) -> Option<SizeClass> {
        self.classes.class_at_offset(self.arena.offset_of(ptr)?)
    }

    /// Allocate one slot from the smallest class with `block_size >= size`.
    ///
    /// The returned block is `block_size` bytes and aligned to
    /// `min(block_size, max_alignment)`.
    ///
    /// # Errors
    ///
    /// - `AllocationTooLarge` if `size > max_block_size`; no flag is touched.
    /// - `SizeClassExhausted` if every slot of the class is taken.
    /// - `Released` if the arena has been torn down.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let class = self.classes.classify(size)?;
        if self.arena.is_released() {
            return Err(AllocError::Released);
        }

        match self.claim(&class) {
            Some(slot) => Ok(self.slot_ptr(&class, slot)),
            None => {
                stats::EXHAUSTED_CLAIMS.add(1);
                tracing::debug!(
                    block_size = class.block_size,
                    slots = class.slot_count,
                    "size class exhausted"
                );
                Err(AllocError::SizeClassExhausted {
                    block_size: class.block_size,
                    slots: class.slot_count,
                })
            }
        }
    }

    /// Claim the lowest free slot of `class`, returning its index within the class.
    ///
    /// The relaxed load only skips flags that look taken; ownership is
    /// decided by the `AcqRel` swap, which pairs with the `Release` store of
    /// the slot's previous owner.
    #[inline]
    fn claim(&self, class: &SizeClass) -> Option<usize> {
        self.class_flags(class)
            .iter()
            .position(|flag| !flag.load(Ordering::Relaxed) && !flag.swap(true, Ordering::AcqRel))
    }

    #[inline]
    fn class_flags(&self, class: &SizeClass) -> &[AtomicBool] {
        let start = class.taken_displacement;
        &self.occupancy.flags()[start..start + class.slot_count]
    }

    #[inline]
    fn slot_ptr(&self, class: &SizeClass, slot: usize) -> NonNull<u8> {
        let offset = class.buffer_displacement + slot * class.block_size;
        // Safety: slot < slot_count, so offset + block_size <= arena length.
        unsafe { NonNull::new_unchecked(self.arena.base().as_ptr().add(offset)) }
    }

    /// Return a block to its size class.
    ///
    /// Debug builds check the contract and panic on a violation. Release
    /// builds trust the caller.
    ///
    /// # Safety
    /// - `ptr` must have been returned by [`allocate`](Self::allocate) on this allocator.
    /// - `size` must map to the same size class as the size passed to `allocate`.
    /// - `ptr` must not have been deallocated already, and must not be used afterwards.
    ///
    /// # Panics
    ///
    /// With debug assertions enabled, panics if the pointer/size pair does not
    /// name a taken slot.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        #[cfg(debug_assertions)]
        {
            // Safety: upheld by caller.
            if let Err(e) = unsafe { self.try_deallocate(ptr, size) } {
                panic!("{e}");
            }
        }

        #[cfg(not(debug_assertions))]
        {
            let Ok(class) = self.classes.classify(size) else {
                return;
            };
            let offset = (ptr.as_ptr() as usize).wrapping_sub(self.arena.base().as_ptr() as usize);
            let slot = offset.wrapping_sub(class.buffer_displacement) / class.block_size;
            if let Some(flag) = self
                .occupancy
                .flags()
                .get(class.taken_displacement.wrapping_add(slot))
            {
                flag.store(false, Ordering::Release);
            }
        }
    }

    /// Checked [`deallocate`](Self::deallocate): validates the pointer and
    /// size against the arena layout before clearing the flag.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDeallocation` if `ptr` is outside the arena, not at
    /// the start of a slot, in a different class than `size` selects, or
    /// names a slot that is already free. Returns `Released` after teardown.
    /// No flag is modified on error.
    ///
    /// # Safety
    /// Same as [`deallocate`](Self::deallocate): a validated pointer may still
    /// belong to another owner if the caller passes one it does not own.
    pub unsafe fn try_deallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        if self.arena.is_released() {
            return Err(AllocError::Released);
        }
        let flag = self.locate(ptr, size)?;
        // A free flag is never set by this check: `false` is written back over `false`.
        if flag.swap(false, Ordering::Release) {
            Ok(())
        } else {
            Err(AllocError::InvalidDeallocation {
                reason: "slot is not allocated (double free?)",
            })
        }
    }

    fn locate(&self, ptr: NonNull<u8>, size: usize) -> Result<&AtomicBool, AllocError> {
        let class = self
            .classes
            .classify(size)
            .map_err(|_| AllocError::InvalidDeallocation {
                reason: "size exceeds the maximum block size",
            })?;
        let offset = self
            .arena
            .offset_of(ptr)
            .ok_or(AllocError::InvalidDeallocation {
                reason: "pointer is outside the arena",
            })?;
        let within = offset
            .checked_sub(class.buffer_displacement)
            .filter(|&within| within < class.span())
            .ok_or(AllocError::InvalidDeallocation {
                reason: "size does not match the size class holding the pointer",
            })?;
        if !within.is_multiple_of(class.block_size) {
            return Err(AllocError::InvalidDeallocation {
                reason: "pointer is not at the start of a slot",
            });
        }
        Ok(&self.class_flags(&class)[within / class.block_size])
    }

    /// Snapshot of which slots of class `index` are taken.
    ///
    /// Flags are read one by one with `Acquire`; concurrent claims may or may
    /// not be reflected.
    #[must_use]
    pub fn occupancy(&self, index: usize) -> Option<FixedBitSet> {
        let class = self.classes.class(index)?;
        let mut taken = FixedBitSet::with_capacity(class.slot_count);
        for (slot, flag) in self.class_flags(&class).iter().enumerate() {
            taken.set(slot, flag.load(Ordering::Acquire));
        }
        Some(taken)
    }

    /// Number of taken slots across all classes. Diagnostic; O(total slots).
    #[must_use]
    pub fn live_slots(&self) -> usize {
        self.occupancy
            .flags()
            .iter()
            .filter(|flag| flag.load(Ordering::Relaxed))
            .count()
    }

    /// Unmap the arena. Returns `Ok(false)` if it was already released.
    /// Later allocations fail with `AllocError::Released`.
    ///
    /// # Safety
    /// No block from this allocator may be in use, and no other thread may be
    /// inside `allocate`/`deallocate` on it.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::Vm` if the OS refuses to unmap.
    pub unsafe fn release(&self) -> Result<bool, AllocError> {
        // Safety: upheld by caller.
        Ok(unsafe { self.arena.release()? })
    }
}

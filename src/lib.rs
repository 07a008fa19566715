#[cfg(not(target_pointer_width = "64"))]
compile_error!("slotalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocators
pub use memory::adapter::{ElementAllocator, FixedSizeAllocator};
pub use memory::global::GlobalSlotAllocator;
pub use memory::slots::{
    MAX_ALIGNMENT, MAX_BLOCK_SIZE, SLOTS_PER_CLASS, SlotAllocator, SlotAllocatorConfig,
};

// size classes
pub use memory::size_class::{SizeClass, SizeClassTable};

// stats
pub use memory::stats::{MemoryStats, snapshot as memory_stats};

// errors
pub use memory::error::AllocError;
pub use memory::vm::VmError;

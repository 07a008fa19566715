//! Size-class table: maps a byte count onto the smallest power-of-two class
//! that can hold it, together with where that class lives in the occupancy
//! table and the arena.
//!
//! ```text
//!   class:        0     1      2        3           ...   n
//!   block_size:   1     2      4        8           ...   max_block_size
//!   arena:      [ s*1 | s*2  | s*4    | s*8       | ... | s*max ]
//!   occupancy:  [ s   | s    | s      | s         | ... | s     ]
//! ```
//!
//! `s` is `slots_per_class`. Each class's displacements are the running
//! totals of every smaller class.

use super::error::AllocError;

/// One bucket of fixed-size slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SizeClass {
    /// Position of this class in the table (`log2(block_size)`).
    pub index: usize,
    /// Bytes per slot. Always a power of two.
    pub block_size: usize,
    /// Slots in this class.
    pub slot_count: usize,
    /// First occupancy flag belonging to this class.
    pub taken_displacement: usize,
    /// Byte offset of this class's first slot from the arena base.
    pub buffer_displacement: usize,
}

impl SizeClass {
    const EMPTY: Self = Self {
        index: 0,
        block_size: 0,
        slot_count: 0,
        taken_displacement: 0,
        buffer_displacement: 0,
    };

    /// Bytes of arena covered by this class.
    #[inline]
    #[must_use]
    pub fn span(&self) -> usize {
        self.block_size * self.slot_count
    }
}

/// One class per power of two representable in `usize`.
const MAX_CLASSES: usize = usize::BITS as usize;

/// Precomputed list of every size class for one configuration.
///
/// Built once and immutable afterwards, so `classify` is a pure lookup.
/// Stored inline: building a table never touches the heap, which keeps the
/// global context usable from inside a `GlobalAlloc`.
#[derive(Clone, Debug)]
pub struct SizeClassTable {
    classes: [SizeClass; MAX_CLASSES],
    len: usize,
    max_block_size: usize,
    arena_len: usize,
}

impl SizeClassTable {
    /// Build the table for blocks `1, 2, 4, ..., max_block_size`, each with `slots_per_class` slots.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if `max_block_size` is not a power of two,
    /// `slots_per_class` is zero, or the arena size overflows `usize`.
    pub fn new(max_block_size: usize, slots_per_class: usize) -> Result<Self, AllocError> {
        if !max_block_size.is_power_of_two() {
            return Err(AllocError::InvalidConfig(format!(
                "max_block_size {max_block_size} is not a power of two"
            )));
        }
        if slots_per_class == 0 {
            return Err(AllocError::InvalidConfig(
                "slots_per_class must be non-zero".to_string(),
            ));
        }

        let class_count = max_block_size.trailing_zeros() as usize + 1;
        let mut classes = [SizeClass::EMPTY; MAX_CLASSES];
        let mut taken_displacement = 0usize;
        let mut buffer_displacement = 0usize;

        for index in 0..class_count {
            let block_size = 1usize << index;
            let class = SizeClass {
                index,
                block_size,
                slot_count: slots_per_class,
                taken_displacement,
                buffer_displacement,
            };

            let overflow = || {
                AllocError::InvalidConfig(format!(
                    "arena size overflows usize at block size {block_size}"
                ))
            };
            taken_displacement = taken_displacement
                .checked_add(slots_per_class)
                .ok_or_else(overflow)?;
            buffer_displacement = block_size
                .checked_mul(slots_per_class)
                .and_then(|span| buffer_displacement.checked_add(span))
                .ok_or_else(overflow)?;

            classes[index] = class;
        }

        Ok(Self {
            classes,
            len: class_count,
            max_block_size,
            arena_len: buffer_displacement,
        })
    }

    /// Smallest class whose `block_size >= size`. Sizes 0 and 1 both map to class 0.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::AllocationTooLarge` if `size > max_block_size`.
    #[inline]
    pub fn classify(&self, size: usize) -> Result<SizeClass, AllocError> {
        if size > self.max_block_size {
            return Err(AllocError::AllocationTooLarge {
                size,
                max_block_size: self.max_block_size,
            });
        }
        // size <= max_block_size, a power of two, so next_power_of_two cannot overflow.
        let index = size.max(1).next_power_of_two().trailing_zeros() as usize;
        Ok(self.classes[index])
    }

    /// Class by table position.
    #[must_use]
    pub fn class(&self, index: usize) -> Option<SizeClass> {
        self.classes().get(index).copied()
    }

    /// All classes, smallest first.
    #[must_use]
    pub fn classes(&self) -> &[SizeClass] {
        &self.classes[..self.len]
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; a valid table holds at least the 1-byte class.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    /// Length of the occupancy table.
    #[must_use]
    pub fn total_slots(&self) -> usize {
        self.classes().last().map_or(0, |c| c.taken_displacement + c.slot_count)
    }

    /// Length of the arena in bytes.
    #[must_use]
    pub fn arena_len(&self) -> usize {
        self.arena_len
    }

    /// Class whose arena region contains `offset`, if any.
    pub(crate) fn class_at_offset(&self, offset: usize) -> Option<SizeClass> {
        if offset >= self.arena_len {
            return None;
        }
        // Regions are laid out in ascending order; the last region starting at
        // or before `offset` owns it.
        let classes = self.classes();
        let pos = classes.partition_point(|c| c.buffer_displacement <= offset);
        classes.get(pos.checked_sub(1)?).copied()
    }
}

use super::vm::VmError;

/// Failures reported by the slot allocator.
///
/// Every failure is reported once, at the call that detected it. Nothing in
/// the allocation path retries internally.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// The request exceeds the largest size class. Arena and occupancy are untouched.
    #[error("allocation of {size} bytes exceeds the maximum block size {max_block_size}")]
    AllocationTooLarge { size: usize, max_block_size: usize },

    /// Every slot of the matching size class is taken. Other classes are not consulted.
    #[error("size class of {block_size}-byte blocks is exhausted ({slots} slots taken)")]
    SizeClassExhausted { block_size: usize, slots: usize },

    /// A deallocation broke the caller contract (out of bounds, misaligned,
    /// wrong size, or double free).
    #[error("invalid deallocation: {reason}")]
    InvalidDeallocation { reason: &'static str },

    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),

    /// The arena has been torn down.
    #[error("allocator arena has been released")]
    Released,

    /// The global context failed to come up; the original cause is logged once.
    #[error("global allocator context failed to initialize: {0}")]
    Initialization(String),

    #[error(transparent)]
    Vm(#[from] VmError),
}

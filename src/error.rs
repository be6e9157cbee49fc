//! Error types for ringbench

use std::io;
use thiserror::Error;

/// Result type for ringbench operations
pub type Result<T> = std::result::Result<T, RingError>;

/// Errors that can occur while creating, using or tearing down a ring
#[derive(Debug, Error)]
pub enum RingError {
    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Failed to remove a name from the OS namespace
    #[error("Failed to unlink '{name}': {source}")]
    Unlink {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to create a named semaphore
    #[error("Failed to create semaphore '{name}': {source}")]
    SemCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open a named semaphore
    #[error("Failed to open semaphore '{name}': {source}")]
    SemOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// `sem_wait` and friends failed for a reason other than a timeout
    #[error("Failed to wait on semaphore '{name}': {source}")]
    SemWait {
        name: String,
        #[source]
        source: io::Error,
    },

    /// `sem_post` failed
    #[error("Failed to post semaphore '{name}': {source}")]
    SemPost {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A named object does not exist. Never created and already torn down
    /// look the same from here.
    #[error("'{name}' not found")]
    NotFound { name: String },

    /// A named object exists although exclusive creation was requested
    #[error("'{name}' already exists")]
    AlreadyExists { name: String },

    /// The region is still mapped but its owner has marked it closed
    #[error("Region '{name}' has been closed by its owner")]
    Closed { name: String },

    /// A bounded wait expired
    #[error("Timed out after {timeout:?} waiting on '{name}'")]
    Timeout {
        name: String,
        timeout: std::time::Duration,
    },

    /// Invalid region magic number
    #[error("Invalid region magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// The attached region was created with a different shape
    #[error(
        "Region geometry mismatch: expected {expected_capacity}x{expected_slot_size}, \
         found {found_capacity}x{found_slot_size}"
    )]
    GeometryMismatch {
        expected_capacity: u32,
        expected_slot_size: u32,
        found_capacity: u32,
        found_slot_size: u32,
    },

    /// Payload does not fit into one slot
    #[error("Message too large: max {max} bytes per slot, got {got} bytes")]
    MessageTooLarge { max: usize, got: usize },

    /// Slot index outside the ring
    #[error("Slot index {index} out of range for capacity {capacity}")]
    SlotOutOfRange { index: u32, capacity: u32 },

    /// Caller buffer cannot hold the consumed payload
    #[error("Buffer too small: need {needed} bytes, got {got} bytes")]
    BufferTooSmall { needed: usize, got: usize },

    /// Invalid session or ring configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource name component is unusable
    #[error("Invalid resource name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
}

impl RingError {
    /// True when the error means "the named object is not there"
    pub fn is_not_found(&self) -> bool {
        matches!(self, RingError::NotFound { .. })
    }
}

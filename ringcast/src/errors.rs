use std::fmt;

use shared_memory;

#[derive(Debug)]
pub enum QueueError {
    /// Caller broke the queue contract: non-power-of-two capacity, zero-slot
    /// reservation, or a reservation larger than the queue allows.
    InvalidArgument(String),
    /// The backing shared-memory segment could not be created, opened or
    /// mapped.
    SharedMemory(shared_memory::ShmemError),
    /// Another process started initializing the region but never finished.
    InitTimeout { waited_ms: u64 },
    /// The region was created with a different capacity than requested.
    SizeMismatch { expected: u32, actual: u32 },
    /// The region holds elements of a different width than the caller's type.
    ElementSizeMismatch { expected: u32, actual: u32 },
    /// The mapped segment is smaller than the header claims it should be.
    RegionTooSmall { needed: usize, actual: usize },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            QueueError::SharedMemory(e) => write!(f, "shared memory error: {}", e),
            QueueError::InitTimeout { waited_ms } => write!(
                f,
                "timed out after {}ms waiting for region initialization",
                waited_ms
            ),
            QueueError::SizeMismatch { expected, actual } => write!(
                f,
                "region capacity mismatch: expected {} but region has {}",
                expected, actual
            ),
            QueueError::ElementSizeMismatch { expected, actual } => write!(
                f,
                "element size mismatch: expected {} but region has {}",
                expected, actual
            ),
            QueueError::RegionTooSmall { needed, actual } => write!(
                f,
                "mapped region too small: need {} bytes but segment has {}",
                needed, actual
            ),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::SharedMemory(e) => Some(e),
            _ => None,
        }
    }
}

impl From<shared_memory::ShmemError> for QueueError {
    fn from(err: shared_memory::ShmemError) -> Self {
        QueueError::SharedMemory(err)
    }
}

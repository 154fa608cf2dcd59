use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64};

use serde_derive::{Deserialize, Serialize};

use crate::QueueError;

/// `published_index` value of a slot that has never been published.
///
/// A freshly initialized region would otherwise be ambiguous with sequence 0,
/// so every slot is armed with this sentinel during region setup.
pub const INVALID_INDEX: u64 = u64::MAX;

/// Largest single reservation. The reservation word keeps the size of the
/// most recent reservation in a 16-bit field, so anything bigger cannot be
/// represented and is rejected up front.
pub const MAX_RESERVATION: u32 = 0xFFFF;

pub(crate) const RESERVED_INDEX_BITS: u32 = 48;
pub(crate) const RESERVED_SIZE_BITS: u32 = 16;
pub(crate) const RESERVED_INDEX_MASK: u64 = (1 << RESERVED_INDEX_BITS) - 1;
pub(crate) const RESERVED_SIZE_MASK: u64 = (1 << RESERVED_SIZE_BITS) - 1;

/// Pack a 48-bit reservation index and a 16-bit reservation size into the
/// single word producers contend on. 48 bits of index is good for ~2.8e14
/// reservations, effectively unbounded.
#[inline(always)]
pub const fn pack_reserved(index: u64, size: u32) -> u64 {
    ((index & RESERVED_INDEX_MASK) << RESERVED_SIZE_BITS) | (size as u64 & RESERVED_SIZE_MASK)
}

#[inline(always)]
pub const fn reserved_index(word: u64) -> u64 {
    word >> RESERVED_SIZE_BITS
}

#[inline(always)]
pub const fn reserved_size(word: u64) -> u32 {
    (word & RESERVED_SIZE_MASK) as u32
}

/// One architecture pause on a contended retry. Advisory only.
#[inline(always)]
pub(crate) fn cpu_relax() {
    if cfg!(feature = "cpu-pause") {
        std::hint::spin_loop();
    }
}

/// Per-slot control record. `published` carries the sequence number of the
/// reservation whose data currently occupies the slot ([`INVALID_INDEX`]
/// until the first publication); `len` is the number of contiguous slots
/// that reservation covered.
///
/// `len` is stored relaxed before the release store of `published`, so a
/// reader that observes the index with acquire ordering also observes the
/// matching length and cell contents.
#[repr(C)]
pub struct ControlSlot {
    pub published: AtomicU64,
    pub len: AtomicU32,
}

// -- Region header ------------------------------------------------------------
//
// The first 64 bytes of a region (heap or shared) hold the queue header.
// The layout is fixed so independently built processes agree on it:
//
//   [0  ..  8)  reservation word (AtomicU64, packed index:48 / size:16)
//   [8  .. 12)  capacity (u32)
//   [12 .. 16)  element size (u32)
//   [16 .. 24)  last-published watermark (AtomicU64, INVALID_INDEX = none)
//   [24 .. 28)  header magic (AtomicU32)
//   [28 .. 48)  reserved, zero
//   [48 .. 52)  init state (AtomicU32)
//   [52 .. 64)  reserved, zero
//   [64 ..   )  control array, capacity * size_of::<ControlSlot>()
//   [...    )  data array, capacity cells, aligned to the element type

pub(crate) const HEADER_SIZE: usize = 64;
pub(crate) const RESERVED_OFFSET: usize = 0;
pub(crate) const CAPACITY_OFFSET: usize = 8;
pub(crate) const ELEM_SIZE_OFFSET: usize = 12;
pub(crate) const LAST_PUBLISHED_OFFSET: usize = 16;
pub(crate) const HEADER_MAGIC_OFFSET: usize = 24;
pub(crate) const INIT_STATE_OFFSET: usize = 48;

/// 'SLQ1' — marks a region that carries the last-published watermark.
pub(crate) const HEADER_MAGIC: u32 = 0x534C_5131;

pub(crate) const INIT_STATE_UNINITIALIZED: u32 = 0;
pub(crate) const INIT_STATE_LEGACY: u32 = 1;
pub(crate) const INIT_STATE_INITIALIZING: u32 = 2;
pub(crate) const INIT_STATE_READY: u32 = 3;

#[inline]
const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Byte offset of the data array for a queue of `capacity` cells of `T`.
#[inline]
pub(crate) fn data_offset<T>(capacity: u32) -> usize {
    let control_end = HEADER_SIZE + capacity as usize * mem::size_of::<ControlSlot>();
    align_up(control_end, mem::align_of::<T>())
}

/// Total bytes required for the region backing a queue of `capacity` cells.
#[inline]
pub(crate) fn region_bytes<T>(capacity: u32) -> usize {
    data_offset::<T>(capacity) + capacity as usize * mem::size_of::<T>()
}

pub(crate) fn validate_capacity(capacity: u32) -> Result<(), QueueError> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(QueueError::InvalidArgument(format!(
            "capacity must be a power of 2, got {}",
            capacity
        )));
    }
    Ok(())
}

pub static QUEUE_FILE_NAME: &str = "ringcast-queue";

/// Location of the file link that names a shared-memory queue.
///
/// Two processes reach the same queue by using the same `data_dir` and
/// `queue_file_name`. Capacity is not part of the config: the creator passes
/// it to [`RingQueue::new_shared`](crate::RingQueue::new_shared) and
/// attachers learn it from the region header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub data_dir: String,
    pub queue_file_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            data_dir: String::from("."),
            queue_file_name: String::from(QUEUE_FILE_NAME),
        }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder {
            config: QueueConfig::default(),
        }
    }

    pub(crate) fn link_path(&self) -> String {
        format!("{}/{}", self.data_dir, self.queue_file_name)
    }
}

pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    pub fn data_dir(mut self, data_dir: impl Into<String>) -> Self {
        self.config.data_dir = data_dir.into();
        self
    }

    pub fn queue_file_name(mut self, name: impl Into<String>) -> Self {
        self.config.queue_file_name = name.into();
        self
    }

    pub fn build(self) -> QueueConfig {
        self.config
    }
}

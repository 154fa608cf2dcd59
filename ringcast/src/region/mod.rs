use std::alloc::{self, Layout};
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::core::*;
use crate::QueueError;

const REGION_ALIGN: usize = 64;

/// How long an opener waits for another process to finish setting up the
/// region before giving up.
const MAX_WAIT_MS: u64 = 2_000;

/// A legacy region (no init-state machine) gets a short grace period before
/// its capacity and element-size fields alone are trusted.
const LEGACY_GRACE_MS: u64 = 5;

pub(crate) enum Backing {
    Heap { ptr: NonNull<u8>, layout: Layout },
    Shared { shmem: Shmem },
}

/// Backing storage of a queue: a private heap allocation or a mapped
/// shared-memory segment. Either way the queue header sits at the base of
/// the region and the atomics are carved out of it by offset.
pub(crate) struct Region {
    base: *mut u8,
    backing: Backing,
}

pub(crate) struct RegionInit {
    pub region: Region,
    pub capacity: u32,
    /// False when the region was produced by an older layout without the
    /// header magic; the last-published watermark is then unusable.
    pub last_published_valid: bool,
}

impl Region {
    /// Allocate and initialize a private, process-local region.
    pub fn create_private<T>(capacity: u32) -> Result<RegionInit, QueueError> {
        validate_capacity(capacity)?;
        let layout = Layout::from_size_align(
            region_bytes::<T>(capacity),
            mem::align_of::<T>().max(REGION_ALIGN),
        )
        .map_err(|e| QueueError::InvalidArgument(e.to_string()))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }
        unsafe { initialize_region::<T>(ptr, capacity) };
        Ok(RegionInit {
            region: Region {
                base: ptr,
                backing: Backing::Heap {
                    // SAFETY: checked non-null above.
                    ptr: unsafe { NonNull::new_unchecked(ptr) },
                    layout,
                },
            },
            capacity,
            last_published_valid: true,
        })
    }

    /// Create the named segment, or open it if another process got there
    /// first. Exactly one opener wins the init-state handshake and lays out
    /// the header; everyone else waits for READY and validates.
    pub fn create_shared<T>(capacity: u32, cfg: &QueueConfig) -> Result<RegionInit, QueueError> {
        validate_capacity(capacity)?;
        let bytes = region_bytes::<T>(capacity);
        let mut shmem = match ShmemConf::new()
            .size(bytes)
            .flink(cfg.link_path())
            .create()
        {
            Ok(m) => m,
            Err(ShmemError::LinkExists) => ShmemConf::new().flink(cfg.link_path()).open()?,
            Err(e) => return Err(QueueError::SharedMemory(e)),
        };
        let base = shmem.as_ptr();

        // SAFETY: the segment is at least header-sized (we sized it, or the
        // existing segment is validated below) and the init-state word sits
        // at a fixed, aligned offset.
        let init_state = unsafe { &*(base.add(INIT_STATE_OFFSET) as *const AtomicU32) };
        let won = init_state
            .compare_exchange(
                INIT_STATE_UNINITIALIZED,
                INIT_STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        let last_published_valid = if won {
            unsafe { initialize_region::<T>(base, capacity) };
            true
        } else {
            let (_, valid) = unsafe { validate_attached::<T>(base, shmem.len(), Some(capacity))? };
            valid
        };

        // The handshake winner owns the region; losing the race to a plain
        // attacher must not leave the name unlinked on teardown.
        shmem.set_owner(won);

        Ok(RegionInit {
            region: Region {
                base,
                backing: Backing::Shared { shmem },
            },
            capacity,
            last_published_valid,
        })
    }

    /// Open an existing named segment. Capacity and element size come from
    /// the header, not from the caller.
    pub fn attach<T>(cfg: &QueueConfig) -> Result<RegionInit, QueueError> {
        let shmem = ShmemConf::new().flink(cfg.link_path()).open()?;
        let base = shmem.as_ptr();
        let (capacity, last_published_valid) =
            unsafe { validate_attached::<T>(base, shmem.len(), None)? };
        Ok(RegionInit {
            region: Region {
                base,
                backing: Backing::Shared { shmem },
            },
            capacity,
            last_published_valid,
        })
    }

    #[inline(always)]
    pub fn reserved(&self) -> &AtomicU64 {
        // SAFETY: the header outlives the region handle and the word is
        // 8-aligned at a fixed offset.
        unsafe { &*(self.base.add(RESERVED_OFFSET) as *const AtomicU64) }
    }

    #[inline(always)]
    pub fn last_published(&self) -> &AtomicU64 {
        unsafe { &*(self.base.add(LAST_PUBLISHED_OFFSET) as *const AtomicU64) }
    }

    #[inline(always)]
    pub fn control_ptr(&self) -> *mut ControlSlot {
        unsafe { self.base.add(HEADER_SIZE) as *mut ControlSlot }
    }

    #[inline(always)]
    pub fn data_ptr<T>(&self, capacity: u32) -> *mut T {
        unsafe { self.base.add(data_offset::<T>(capacity)) as *mut T }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Shared { .. })
    }

    pub fn owns_backing(&self) -> bool {
        match &self.backing {
            Backing::Heap { .. } => true,
            Backing::Shared { shmem } => shmem.is_owner(),
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // A shared backing unmaps on drop of the Shmem handle, which also
        // unlinks the name when this handle owns it.
        if let Backing::Heap { ptr, layout } = &self.backing {
            unsafe { alloc::dealloc(ptr.as_ptr(), *layout) };
        }
    }
}

/// Lay out the header, arm every control slot with the never-published
/// sentinel and flip the init state to READY.
///
/// # Safety
/// `base` must point at a region of at least `region_bytes::<T>(capacity)`
/// writable bytes that no other thread is touching (fresh allocation, or a
/// segment this process just won the INITIALIZING handshake for).
unsafe fn initialize_region<T>(base: *mut u8, capacity: u32) {
    let magic = &*(base.add(HEADER_MAGIC_OFFSET) as *const AtomicU32);
    magic.store(HEADER_MAGIC, Ordering::Release);

    let capacity_field = &*(base.add(CAPACITY_OFFSET) as *const AtomicU32);
    capacity_field.store(capacity, Ordering::Relaxed);
    let elem_field = &*(base.add(ELEM_SIZE_OFFSET) as *const AtomicU32);
    elem_field.store(mem::size_of::<T>() as u32, Ordering::Relaxed);

    let reserved = &*(base.add(RESERVED_OFFSET) as *const AtomicU64);
    reserved.store(0, Ordering::Relaxed);
    let last_published = &*(base.add(LAST_PUBLISHED_OFFSET) as *const AtomicU64);
    last_published.store(INVALID_INDEX, Ordering::Relaxed);

    let control = base.add(HEADER_SIZE) as *mut ControlSlot;
    for i in 0..capacity as usize {
        let slot = &*control.add(i);
        slot.len.store(1, Ordering::Relaxed);
        slot.published.store(INVALID_INDEX, Ordering::Relaxed);
    }

    let init_state = &*(base.add(INIT_STATE_OFFSET) as *const AtomicU32);
    init_state.store(INIT_STATE_READY, Ordering::Release);
}

/// Spin-wait until the region is usable: READY, or LEGACY with plausible
/// metadata after the grace period.
///
/// # Safety
/// `base` must point at a mapped region of at least header size.
unsafe fn wait_for_ready(base: *mut u8) -> Result<(), QueueError> {
    let init_state = &*(base.add(INIT_STATE_OFFSET) as *const AtomicU32);
    let capacity_field = &*(base.add(CAPACITY_OFFSET) as *const AtomicU32);
    let elem_field = &*(base.add(ELEM_SIZE_OFFSET) as *const AtomicU32);

    for waited in 0..MAX_WAIT_MS {
        match init_state.load(Ordering::Acquire) {
            INIT_STATE_READY => return Ok(()),
            INIT_STATE_LEGACY if waited >= LEGACY_GRACE_MS => {
                if capacity_field.load(Ordering::Relaxed) != 0
                    && elem_field.load(Ordering::Relaxed) != 0
                {
                    return Ok(());
                }
            }
            _ => {}
        }
        thread::sleep(Duration::from_millis(1));
    }
    Err(QueueError::InitTimeout {
        waited_ms: MAX_WAIT_MS,
    })
}

/// Validate a region some other process initialized. Returns the capacity
/// read from the header and whether the last-published watermark is usable.
///
/// # Safety
/// `base` must point at a mapped region of `mapped_len` bytes.
unsafe fn validate_attached<T>(
    base: *mut u8,
    mapped_len: usize,
    expected_capacity: Option<u32>,
) -> Result<(u32, bool), QueueError> {
    wait_for_ready(base)?;

    let init_state = &*(base.add(INIT_STATE_OFFSET) as *const AtomicU32);
    let magic = &*(base.add(HEADER_MAGIC_OFFSET) as *const AtomicU32);
    let last_published_valid = init_state.load(Ordering::Acquire) == INIT_STATE_READY
        && magic.load(Ordering::Acquire) == HEADER_MAGIC;

    let capacity = (*(base.add(CAPACITY_OFFSET) as *const AtomicU32)).load(Ordering::Relaxed);
    let elem_size = (*(base.add(ELEM_SIZE_OFFSET) as *const AtomicU32)).load(Ordering::Relaxed);

    validate_capacity(capacity)?;
    if let Some(expected) = expected_capacity {
        if capacity != expected {
            return Err(QueueError::SizeMismatch {
                expected,
                actual: capacity,
            });
        }
    }
    if elem_size as usize != mem::size_of::<T>() {
        return Err(QueueError::ElementSizeMismatch {
            expected: mem::size_of::<T>() as u32,
            actual: elem_size,
        });
    }
    let needed = region_bytes::<T>(capacity);
    if mapped_len < needed {
        return Err(QueueError::RegionTooSmall {
            needed,
            actual: mapped_len,
        });
    }

    Ok((capacity, last_published_valid))
}

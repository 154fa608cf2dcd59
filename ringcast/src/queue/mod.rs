use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::*;
use crate::region::{Region, RegionInit};
use crate::QueueError;

/// A lock-free, lossy, multi-producer / multi-consumer ring-buffer queue.
///
/// Producers claim slots with [`reserve`](RingQueue::reserve) /
/// [`reserve_many`](RingQueue::reserve_many), write through
/// [`slot_ptr`](RingQueue::slot_ptr) and make the range visible with
/// [`publish`](RingQueue::publish). Producers are never blocked by
/// consumers: once the reservation cursor laps a consumer by a full
/// capacity, that consumer's unread entries are overwritten in place and
/// counted as loss.
///
/// Consumers either hold their own `u64` cursor (broadcast: every consumer
/// sees every published item) or share an `AtomicU64` cursor (work-stealing:
/// every published item is claimed by exactly one consumer).
///
/// The queue lives in a private heap region ([`new`](RingQueue::new)) or in
/// a named shared-memory segment ([`new_shared`](RingQueue::new_shared) /
/// [`attach`](RingQueue::attach)) with an identical layout, so the same
/// protocol runs across threads and across processes.
pub struct RingQueue<T: Copy> {
    region: Region,
    control: *mut ControlSlot,
    data: *mut T,
    mask: u64,
    capacity: u32,
    /// False only when attached to a legacy region without the header magic;
    /// `read_last` then falls back to the packed reservation word.
    last_published_valid: bool,
    /// Entries this handle observed being overwritten before they were read.
    /// Diagnostic; per handle, not part of the shared region.
    loss: AtomicU64,
    _elem: PhantomData<T>,
}

// SAFETY: every mutation of the shared region goes through atomics with the
// orderings the publication protocol requires; the data cells are only
// written by the producer holding the covering reservation and only read
// after an acquire load of the matching published index.
unsafe impl<T: Copy + Send> Send for RingQueue<T> {}
unsafe impl<T: Copy + Send> Sync for RingQueue<T> {}

impl<T: Copy> RingQueue<T> {
    /// Create a private, in-process queue with `capacity` slots.
    ///
    /// `capacity` must be a power of two.
    pub fn new(capacity: u32) -> Result<Self, QueueError> {
        Ok(Self::from_region(Region::create_private::<T>(capacity)?))
    }

    /// Create a queue in a named shared-memory segment, or join the segment
    /// if another process already created it.
    ///
    /// Exactly one caller ends up owning the segment (and unlinks it on
    /// drop); joiners validate that the existing region matches `capacity`
    /// and the element type.
    pub fn new_shared(capacity: u32, cfg: &QueueConfig) -> Result<Self, QueueError> {
        Ok(Self::from_region(Region::create_shared::<T>(capacity, cfg)?))
    }

    /// Attach to an existing shared-memory queue. The capacity is read from
    /// the region header; the element width is validated against `T`.
    pub fn attach(cfg: &QueueConfig) -> Result<Self, QueueError> {
        Ok(Self::from_region(Region::attach::<T>(cfg)?))
    }

    fn from_region(init: RegionInit) -> Self {
        let RegionInit {
            region,
            capacity,
            last_published_valid,
        } = init;
        let control = region.control_ptr();
        let data = region.data_ptr::<T>(capacity);
        RingQueue {
            region,
            control,
            data,
            mask: capacity as u64 - 1,
            capacity,
            last_published_valid,
            loss: AtomicU64::new(0),
            _elem: PhantomData,
        }
    }

    #[inline(always)]
    fn slot(&self, offset: u64) -> &ControlSlot {
        // SAFETY: offset is always masked to capacity bounds.
        unsafe { &*self.control.add(offset as usize) }
    }

    #[inline(always)]
    fn cell(&self, offset: u64) -> *mut T {
        // SAFETY: offset is always masked to capacity bounds.
        unsafe { self.data.add(offset as usize) }
    }

    #[inline(always)]
    fn count_loss(&self, n: u64) {
        if cfg!(any(debug_assertions, feature = "loss-detection")) {
            self.loss.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Claim one slot. Returns the reservation's sequence index.
    ///
    /// Single atomic add on the reservation word; the size field is restored
    /// to 1 with one best-effort CAS when the previous reservation was
    /// multi-slot.
    #[inline]
    pub fn reserve(&self) -> u64 {
        let reserved = self.region.reserved();
        let prev = reserved.fetch_add(1 << RESERVED_SIZE_BITS, Ordering::AcqRel);
        let index = reserved_index(prev);
        let prev_size = reserved_size(prev);
        if prev_size != 1 {
            let expected = pack_reserved(index + 1, prev_size);
            let _ = reserved.compare_exchange(
                expected,
                pack_reserved(index + 1, 1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
        index
    }

    /// Claim `n` contiguous slots. Returns the starting sequence index.
    ///
    /// A reservation never straddles the physical end of the buffer: when
    /// fewer than `n` slots remain before the wrap, the claim is advanced to
    /// slot 0 of the next lap and the abandoned pre-wrap slot is marked so
    /// readers skip the dead range.
    ///
    /// # Errors
    /// `n == 0`, `n > capacity` and `n > `[`MAX_RESERVATION`] are rejected
    /// as invalid arguments.
    pub fn reserve_many(&self, n: u32) -> Result<u64, QueueError> {
        if n == 0 {
            return Err(QueueError::InvalidArgument(String::from(
                "reservation size must be > 0",
            )));
        }
        if n > self.capacity {
            return Err(QueueError::InvalidArgument(format!(
                "reservation size {} > queue capacity {}",
                n, self.capacity
            )));
        }
        if n > MAX_RESERVATION {
            return Err(QueueError::InvalidArgument(format!(
                "reservation size {} > {}",
                n, MAX_RESERVATION
            )));
        }
        if n == 1 {
            return Ok(self.reserve());
        }

        let reserved = self.region.reserved();
        let mut current = reserved.load(Ordering::Relaxed);
        loop {
            let pre_wrap = reserved_index(current);
            let offset = pre_wrap & self.mask;
            let wrapped = offset + n as u64 > self.capacity as u64;
            let index = if wrapped {
                // Not enough room before the physical end; restart the claim
                // at slot 0 of the next lap.
                pre_wrap + (self.capacity as u64 - offset)
            } else {
                pre_wrap
            };
            let next = pack_reserved(index + n as u64, n);
            match reserved.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    if wrapped {
                        // Mark the abandoned slot with the advanced index.
                        // Its offset no longer matches the stored index,
                        // which is the reader's signal to jump the cursor.
                        let slot = self.slot(offset);
                        slot.len.store(n, Ordering::Relaxed);
                        slot.published.store(index, Ordering::Release);
                    }
                    return Ok(index);
                }
                Err(actual) => {
                    current = actual;
                    cpu_relax();
                }
            }
        }
    }

    /// Pointer to the data cell backing `index`. Constant time; the caller
    /// writes the reserved cells through it before publishing.
    #[inline(always)]
    pub fn slot_ptr(&self, index: u64) -> *mut T {
        self.cell(index & self.mask)
    }

    /// Make a single-slot reservation visible to readers.
    #[inline]
    pub fn publish(&self, index: u64) {
        self.publish_many(index, 1);
    }

    /// Make the `n` slots reserved at `index` visible to readers, then
    /// advance the last-published watermark if `index` is ahead of it.
    pub fn publish_many(&self, index: u64, n: u32) {
        debug_assert!(n > 0);
        let slot = self.slot(index & self.mask);
        slot.len.store(n, Ordering::Relaxed);
        slot.published.store(index, Ordering::Release);

        if self.last_published_valid {
            let last_published = self.region.last_published();
            let mut current = last_published.load(Ordering::Relaxed);
            while current == INVALID_INDEX || current < index {
                match last_published.compare_exchange_weak(
                    current,
                    index,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        }
    }

    /// Read the next published item for an independent cursor.
    ///
    /// Returns the cell of the reservation the cursor points at together
    /// with its slot count, and advances the cursor past it. Returns `None`
    /// without moving the cursor when that reservation is not yet published.
    ///
    /// The cursor is silently advanced in two situations that yield no data:
    /// past a wrap-skip marker (the producer abandoned the tail of a lap),
    /// and back to 0 when the queue has been reset. When the producers have
    /// lapped the cursor the read yields the overwriting item and the number
    /// of entries skipped is added to [`loss_count`](RingQueue::loss_count).
    pub fn read(&self, cursor: &mut u64) -> Option<(&T, u32)> {
        loop {
            let offset = *cursor & self.mask;
            let slot = self.slot(offset);
            let published = slot.published.load(Ordering::Acquire);

            if published != INVALID_INDEX
                && reserved_index(self.region.reserved().load(Ordering::Relaxed)) < published
            {
                // The slot outruns the reservation cursor: queue was reset.
                *cursor = 0;
                continue;
            }

            if published == INVALID_INDEX || published < *cursor {
                // Not published yet.
                return None;
            }

            if published > *cursor {
                if published & self.mask != offset {
                    // Wrap-skip marker: the producer restarted the lap at
                    // slot 0 without using this range.
                    *cursor = published;
                    continue;
                }
                // Overwritten in place while the cursor lagged.
                self.count_loss(published - *cursor);
            }

            let len = slot.len.load(Ordering::Relaxed);
            // SAFETY: the acquire load of `published` makes the producer's
            // cell writes visible.
            let cell = unsafe { &*self.cell(offset) };
            *cursor = published + len as u64;
            return Some((cell, len));
        }
    }

    /// Read the next published item through a cursor shared by several
    /// consumers. Each published item is claimed by exactly one of them.
    ///
    /// Identical to [`read`](RingQueue::read) except that every cursor
    /// advancement goes through a CAS on `cursor`; losing the claim race
    /// just retries on the consumer that lost.
    pub fn read_shared(&self, cursor: &AtomicU64) -> Option<(&T, u32)> {
        loop {
            let current = cursor.load(Ordering::Relaxed);
            let offset = current & self.mask;
            let slot = self.slot(offset);
            let published = slot.published.load(Ordering::Acquire);

            if published != INVALID_INDEX
                && reserved_index(self.region.reserved().load(Ordering::Relaxed)) < published
            {
                // Queue was reset. One attempt is enough: any competing
                // consumer observes the same state and converges.
                let _ = cursor.compare_exchange(current, 0, Ordering::Relaxed, Ordering::Relaxed);
                continue;
            }

            if published == INVALID_INDEX || published < current {
                return None;
            }

            if published > current && published & self.mask != offset {
                let _ =
                    cursor.compare_exchange(current, published, Ordering::Relaxed, Ordering::Relaxed);
                continue;
            }

            let overrun = published - current;
            let len = slot.len.load(Ordering::Relaxed);
            let next = published + len as u64;
            match cursor.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => {
                    if overrun != 0 {
                        self.count_loss(overrun);
                    }
                    // SAFETY: acquire load of `published` above.
                    return Some((unsafe { &*self.cell(offset) }, len));
                }
                Err(_) => cpu_relax(),
            }
        }
    }

    /// Most recent fully published item, regardless of any cursor.
    pub fn read_last(&self) -> Option<(&T, u32)> {
        if self.last_published_valid {
            let last = self.region.last_published().load(Ordering::Acquire);
            if last == INVALID_INDEX {
                return None;
            }
            let slot = self.slot(last & self.mask);
            let len = slot.len.load(Ordering::Relaxed);
            return Some((unsafe { &*self.cell(last & self.mask) }, len));
        }

        // Legacy region: derive the last reservation from the packed word.
        let reserved = self.region.reserved().load(Ordering::Relaxed);
        let index = reserved_index(reserved);
        if index == 0 {
            return None;
        }
        let size = reserved_size(reserved);
        let last = index - size as u64;
        Some((unsafe { &*self.cell(last & self.mask) }, size))
    }

    /// Invalidate all published state: every slot back to the
    /// never-published sentinel, reservation word to zero, watermark and
    /// loss counter cleared.
    ///
    /// The exclusive borrow keeps this handle out of concurrent use; callers
    /// are responsible for quiescing producers and consumers on other
    /// handles or in other processes first.
    pub fn reset(&mut self) {
        for offset in 0..self.capacity as u64 {
            let slot = self.slot(offset);
            slot.len.store(1, Ordering::Relaxed);
            slot.published.store(INVALID_INDEX, Ordering::Relaxed);
        }
        self.region.reserved().store(0, Ordering::Release);
        if self.last_published_valid {
            self.region
                .last_published()
                .store(INVALID_INDEX, Ordering::Relaxed);
        }
        self.loss.store(0, Ordering::Relaxed);
    }

    /// Cursor position a fresh consumer should start from: 0 on a new queue,
    /// the current reservation index when joining a live one.
    pub fn initial_reading_index(&self) -> u64 {
        reserved_index(self.region.reserved().load(Ordering::Relaxed))
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Entries this handle observed being overwritten before they were
    /// read. Always 0 in release builds unless the `loss-detection` feature
    /// is enabled.
    pub fn loss_count(&self) -> u64 {
        self.loss.load(Ordering::Relaxed)
    }

    /// Whether this handle owns the backing storage (heap, or the segment
    /// it will unlink on drop).
    pub fn owns_region(&self) -> bool {
        self.region.owns_backing()
    }

    pub fn is_shared(&self) -> bool {
        self.region.is_shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish_value(queue: &RingQueue<u64>, value: u64) -> u64 {
        let index = queue.reserve();
        unsafe { *queue.slot_ptr(index) = value };
        queue.publish(index);
        index
    }

    #[test]
    fn read_empty_queue() {
        let queue = RingQueue::<u64>::new(2).unwrap();
        let mut cursor = 0u64;
        assert!(queue.read(&mut cursor).is_none());
        assert_eq!(cursor, 0);
    }

    #[test]
    fn reserve_returns_consecutive_indices() {
        let queue = RingQueue::<u64>::new(2).unwrap();
        assert_eq!(queue.reserve(), 0);
        assert_eq!(queue.reserve(), 1);
        assert_eq!(queue.reserve(), 2);
    }

    #[test]
    fn read_fails_without_publish() {
        let queue = RingQueue::<u64>::new(2).unwrap();
        let mut cursor = 0u64;
        let _ = queue.reserve();
        assert!(queue.read(&mut cursor).is_none());
        assert_eq!(cursor, 0);
    }

    #[test]
    fn publish_and_read() {
        let queue = RingQueue::<u64>::new(2).unwrap();
        let mut cursor = 0u64;
        publish_value(&queue, 5);
        let (cell, len) = queue.read(&mut cursor).unwrap();
        assert_eq!(*cell, 5);
        assert_eq!(len, 1);
        assert_eq!(cursor, 1);
        assert!(queue.read(&mut cursor).is_none());
        assert_eq!(cursor, 1);
    }

    #[test]
    fn publish_and_read_multiple() {
        let queue = RingQueue::<u64>::new(4).unwrap();
        let mut cursor = 0u64;

        publish_value(&queue, 5);

        let held = queue.reserve();
        unsafe { *queue.slot_ptr(held) = 12 };

        let index = queue.reserve();
        unsafe { *queue.slot_ptr(index) = 23 };
        queue.publish(index);

        let (cell, _) = queue.read(&mut cursor).unwrap();
        assert_eq!(*cell, 5);
        assert_eq!(cursor, 1);

        // Index 1 is reserved but not yet published; the reader must stall.
        assert!(queue.read(&mut cursor).is_none());
        assert_eq!(cursor, 1);

        queue.publish(held);
        let (cell, _) = queue.read(&mut cursor).unwrap();
        assert_eq!(*cell, 12);
        assert_eq!(cursor, 2);

        let (cell, _) = queue.read(&mut cursor).unwrap();
        assert_eq!(*cell, 23);
        assert_eq!(cursor, 3);
    }

    fn publish_bytes(queue: &RingQueue<u8>, bytes: &[u8]) -> u64 {
        let index = queue.reserve_many(bytes.len() as u32).unwrap();
        for (i, b) in bytes.iter().enumerate() {
            unsafe { *queue.slot_ptr(index + i as u64) = *b };
        }
        queue.publish_many(index, bytes.len() as u32);
        index
    }

    fn read_bytes(queue: &RingQueue<u8>, cursor: &mut u64) -> Option<Vec<u8>> {
        queue.read(cursor).map(|(cell, len)| {
            unsafe { std::slice::from_raw_parts(cell as *const u8, len as usize) }.to_vec()
        })
    }

    #[test]
    fn buffer_wrap() {
        let queue = RingQueue::<u8>::new(8).unwrap();
        let mut cursor = 0u64;

        assert_eq!(publish_bytes(&queue, b"123"), 0);
        assert_eq!(read_bytes(&queue, &mut cursor).unwrap(), b"123");
        assert_eq!(cursor, 3);

        assert_eq!(publish_bytes(&queue, b"456"), 3);
        assert_eq!(read_bytes(&queue, &mut cursor).unwrap(), b"456");
        assert_eq!(cursor, 6);

        // 6 + 3 > 8: the claim moves to slot 0 of the next lap.
        assert_eq!(publish_bytes(&queue, b"789"), 8);
        assert_eq!(read_bytes(&queue, &mut cursor).unwrap(), b"789");
        assert_eq!(cursor, 11);
    }

    #[test]
    fn wrap_skip_advances_a_waiting_cursor() {
        let queue = RingQueue::<u8>::new(8).unwrap();
        let mut cursor = 0u64;

        publish_bytes(&queue, b"123");
        publish_bytes(&queue, b"456");
        let _ = read_bytes(&queue, &mut cursor);
        let _ = read_bytes(&queue, &mut cursor);
        assert_eq!(cursor, 6);

        // Reserve across the wrap but do not publish yet: the reader finds
        // no data, but its cursor hops over the abandoned tail.
        let index = queue.reserve_many(3).unwrap();
        assert_eq!(index, 8);
        assert!(queue.read(&mut cursor).is_none());
        assert_eq!(cursor, 8);

        for (i, b) in b"789".iter().enumerate() {
            unsafe { *queue.slot_ptr(index + i as u64) = *b };
        }
        queue.publish_many(index, 3);
        assert_eq!(read_bytes(&queue, &mut cursor).unwrap(), b"789");
        assert_eq!(cursor, 11);
    }

    #[test]
    fn overwrite_is_lossy_and_counted() {
        let queue = RingQueue::<u64>::new(2).unwrap();
        publish_value(&queue, 10);
        publish_value(&queue, 20);
        publish_value(&queue, 30);

        let mut cursor = 0u64;
        let (cell, _) = queue.read(&mut cursor).unwrap();
        assert_eq!(*cell, 30);
        assert_eq!(cursor, 3);
        assert!(queue.read(&mut cursor).is_none());
        assert_eq!(queue.loss_count(), 2);
    }

    #[test]
    fn lapped_consumer_sees_newest_items_in_order() {
        let queue = RingQueue::<u64>::new(4).unwrap();
        for v in 0..10 {
            publish_value(&queue, v);
        }
        let mut cursor = 0u64;
        let mut seen = Vec::new();
        while let Some((cell, _)) = queue.read(&mut cursor) {
            seen.push(*cell);
        }
        assert_eq!(seen, vec![8, 9]);
        assert!(queue.loss_count() >= 6);
    }

    #[test]
    fn broadcast_cursors_observe_identical_sequences() {
        let queue = RingQueue::<u64>::new(8).unwrap();
        for v in [3, 1, 4, 1, 5] {
            publish_value(&queue, v);
        }
        let mut a = 0u64;
        let mut b = 0u64;
        let drain = |cursor: &mut u64| {
            let mut out = Vec::new();
            while let Some((cell, _)) = queue.read(cursor) {
                out.push(*cell);
            }
            out
        };
        let seen_a = drain(&mut a);
        let seen_b = drain(&mut b);
        assert_eq!(seen_a, vec![3, 1, 4, 1, 5]);
        assert_eq!(seen_a, seen_b);
        assert_eq!(a, b);
    }

    #[test]
    fn reserve_many_rejects_bad_sizes() {
        let queue = RingQueue::<u64>::new(8).unwrap();
        assert!(matches!(
            queue.reserve_many(0),
            Err(QueueError::InvalidArgument(_))
        ));
        assert!(matches!(
            queue.reserve_many(9),
            Err(QueueError::InvalidArgument(_))
        ));

        let large = RingQueue::<u64>::new(1 << 17).unwrap();
        assert!(matches!(
            large.reserve_many(0x1_0000),
            Err(QueueError::InvalidArgument(_))
        ));
    }

    #[test]
    fn new_rejects_non_power_of_two_capacity() {
        assert!(RingQueue::<u64>::new(0).is_err());
        assert!(RingQueue::<u64>::new(3).is_err());
        assert!(RingQueue::<u64>::new(12).is_err());
        assert!(RingQueue::<u64>::new(1).is_ok());
        assert!(RingQueue::<u64>::new(1024).is_ok());
    }

    #[test]
    fn single_slot_reserve_restores_size_field() {
        let queue = RingQueue::<u64>::new(8).unwrap();
        let index = queue.reserve_many(3).unwrap();
        queue.publish_many(index, 3);

        // The next single-slot claim must leave the packed size at 1 again,
        // otherwise the legacy read_last fallback would misreport.
        let single = queue.reserve();
        assert_eq!(single, 3);
        unsafe { *queue.slot_ptr(single) = 7 };
        queue.publish(single);

        let (cell, len) = queue.read_last().unwrap();
        assert_eq!(*cell, 7);
        assert_eq!(len, 1);
    }

    #[test]
    fn read_last_returns_latest_published() {
        let queue = RingQueue::<u64>::new(8).unwrap();
        assert!(queue.read_last().is_none());

        let pair = queue.reserve_many(2).unwrap();
        unsafe {
            *queue.slot_ptr(pair) = 40;
            *queue.slot_ptr(pair + 1) = 41;
        }
        queue.publish_many(pair, 2);

        let (cell, len) = queue.read_last().unwrap();
        assert_eq!(*cell, 40);
        assert_eq!(len, 2);

        // A reserved-but-unpublished single slot must not become "last".
        let single = queue.reserve();
        let (cell, len) = queue.read_last().unwrap();
        assert_eq!(*cell, 40);
        assert_eq!(len, 2);

        unsafe { *queue.slot_ptr(single) = 50 };
        queue.publish(single);
        let (cell, len) = queue.read_last().unwrap();
        assert_eq!(*cell, 50);
        assert_eq!(len, 1);
    }

    #[test]
    fn reset_invalidates_everything() {
        let mut queue = RingQueue::<u64>::new(4).unwrap();
        for v in 0..6 {
            publish_value(&queue, v);
        }
        assert!(queue.read_last().is_some());

        queue.reset();
        let mut cursor = 0u64;
        assert!(queue.read(&mut cursor).is_none());
        assert!(queue.read_last().is_none());
        assert_eq!(queue.loss_count(), 0);
        assert_eq!(queue.initial_reading_index(), 0);

        // The queue is fully usable again from sequence 0.
        assert_eq!(publish_value(&queue, 99), 0);
        let (cell, _) = queue.read(&mut cursor).unwrap();
        assert_eq!(*cell, 99);
    }

    #[test]
    fn work_stealing_consumes_each_item_exactly_once() {
        use std::sync::Arc;

        let queue = Arc::new(RingQueue::<u64>::new(1024).unwrap());
        for v in 0..200 {
            publish_value(&queue, v);
        }

        let cursor = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let queue = Arc::clone(&queue);
            let cursor = Arc::clone(&cursor);
            handles.push(std::thread::spawn(move || {
                let mut claimed = Vec::new();
                while let Some((cell, _)) = queue.read_shared(&cursor) {
                    claimed.push(*cell);
                }
                claimed
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<u64>>());
        assert_eq!(cursor.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn concurrent_producers_publish_every_item() {
        use std::collections::HashSet;
        use std::sync::Arc;

        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 100;

        let queue = Arc::new(RingQueue::<u64>::new(1024).unwrap());
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                for m in 0..PER_PRODUCER {
                    let index = queue.reserve();
                    unsafe { *queue.slot_ptr(index) = p * PER_PRODUCER + m };
                    queue.publish(index);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // No wrap happened (400 < 1024), so a fresh cursor drains exactly
        // the full set, in reservation order.
        let mut cursor = 0u64;
        let mut seen = HashSet::new();
        let mut last_index = None;
        while let Some((cell, _)) = queue.read(&mut cursor) {
            assert!(seen.insert(*cell));
            if let Some(prev) = last_index {
                assert!(cursor > prev);
            }
            last_index = Some(cursor);
        }
        assert_eq!(seen.len(), (PRODUCERS * PER_PRODUCER) as usize);
        assert_eq!(queue.loss_count(), 0);
    }

    #[test]
    fn concurrent_producer_consumer_values_are_consistent() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let queue = Arc::new(RingQueue::<u64>::new(64).unwrap());
        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for v in 1..=1000u64 {
                    let index = queue.reserve();
                    unsafe { *queue.slot_ptr(index) = v * 3 };
                    queue.publish(index);
                }
                done.store(true, Ordering::Release);
            })
        };

        // Values may be lost under overwrite, but every observed value must
        // be one the producer actually wrote, and observed in write order.
        let mut cursor = 0u64;
        let mut last = 0u64;
        let mut observed = 0u64;
        loop {
            match queue.read(&mut cursor) {
                Some((cell, _)) => {
                    let value = *cell;
                    assert_eq!(value % 3, 0);
                    assert!(value > last);
                    last = value;
                    observed += 1;
                }
                None => {
                    if done.load(Ordering::Acquire) && queue.read(&mut cursor).is_none() {
                        break;
                    }
                }
            }
        }
        producer.join().unwrap();
        assert!(observed > 0);
        assert_eq!(last, 3000);
    }
}

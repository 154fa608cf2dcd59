//! A lock-free ring-buffer queue (`ringcast`) for inter-process communication
//! (IPC) or intra-process messaging where high throughput matters more than
//! delivery guarantees.
//!
//! # Overview
//! This crate provides a lossy, multi-producer / multi-consumer ring buffer
//! that lives either on the private heap or in a named shared-memory segment
//! with an identical layout, so the same protocol runs across threads and
//! across processes.
//!
//! Key components:
//! - [`RingQueue`](crate::queue::RingQueue): the queue itself — reserve,
//!   publish, read, read-last, reset.
//! - [`QueueConfig`](crate::core::QueueConfig): names the shared-memory
//!   segment (directory plus file-link name). Use
//!   [`QueueConfig::builder()`](crate::core::QueueConfig::builder) to
//!   construct.
//! - [`QueueError`](crate::errors::QueueError): error type for construction
//!   and contract violations.
//!
//! # Concurrency Model
//!
//! - **Producers never block and are never blocked by consumers.** A
//!   producer claims slots by advancing a packed reservation word with one
//!   atomic RMW, writes its cells, then publishes with a release store of
//!   the slot's sequence index. If consumers lag by a full capacity their
//!   unread entries are overwritten in place; the overwrite is observable
//!   (and counted) on the consumer side, never a producer stall.
//!
//! - **Broadcast by default.** Every consumer holds its own `u64` cursor and
//!   observes every published item at most once (exactly once absent
//!   overwrite). Independent cursors see identical sequences.
//!
//! - **Cooperative work-stealing on request.** Consumers that share one
//!   `AtomicU64` cursor claim items with a CAS, so each published item is
//!   delivered to exactly one of them.
//!
//! - **Slot states are inferred, not coordinated.** A reader distinguishes
//!   never-published, stale, wrap-skipped and fresh slots purely from the
//!   slot's published index relative to its cursor; there is no
//!   reader-producer handshake on the hot path.
//!
//! - **Multi-process setup is self-contained.** Any number of processes may
//!   race to create-or-open the same segment; a four-state init word in the
//!   region header elects exactly one initializer and everyone else waits
//!   (bounded) for READY. No OS lock is involved.
//!
//! # Safety
//!
//! Reads hand out references into the shared region. A reference stays
//! valid memory for the lifetime of the queue handle, but a producer that
//! laps the buffer may overwrite the referenced cell while it is held;
//! treat the data as stale the moment the cursor falls a capacity behind.
//! Copy out of the cell (`T: Copy`) when in doubt. Writers must only write
//! through [`slot_ptr`](crate::queue::RingQueue::slot_ptr) between a
//! successful reserve and the matching publish.

pub mod core;
pub mod errors;
pub mod queue;
mod region;

pub use self::core::{QueueConfig, INVALID_INDEX, MAX_RESERVATION};
pub use self::errors::QueueError;
pub use self::queue::RingQueue;

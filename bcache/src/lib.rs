//! Block buffer cache.
//!
//! Sits between the filesystem layer and the disk layer, keeping copies of
//! recently used disk blocks in a fixed pool of in-memory slots. Repeated
//! reads of a block are served from memory, and every thread touching a
//! block goes through that block's single slot, so the cache doubles as the
//! serialization point for block data.
//!
//! Interface:
//! - [`BufferCache::read`] returns an exclusively locked, loaded buffer for
//!   a `(dev, blockno)` pair.
//! - [`BufGuard::write_back`] pushes changed contents to the disk.
//! - Dropping the guard releases the buffer; do not hold guards longer than
//!   necessary, other threads wanting the block wait on them.
//! - [`BufGuard::pin`] keeps the block resident without holding its lock.
//!
//! Locking is two-tier: per-bucket spin locks cover the hash chains and
//! reference counts, a sleep-capable lock per slot covers the block data.
//! A single further spin lock serializes replacement; see `cache` for the
//! ordering rules.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod buf;
mod cache;

pub use buf::BlockData;
pub use cache::{BufGuard, BufPin, BufferCache};

use alloc::sync::Arc;

use driver::Disk;
use spin::Once;

static BUFFER_CACHE: Once<BufferCache> = Once::new();

/// Build the process-wide cache over `disk`. Called once at boot, before
/// the filesystem layer starts issuing reads.
pub fn init(disk: Arc<dyn Disk>) {
    BUFFER_CACHE.call_once(|| BufferCache::new(disk));
}

pub fn cache() -> &'static BufferCache {
    BUFFER_CACHE.get().expect("buffer cache not initialized")
}

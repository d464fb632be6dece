use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, Ordering},
};

use config::device::BLOCK_SIZE;
use mutex::SleepLock;
use timer::Tick;

/// Content area of one slot: exactly one disk block.
pub type BlockData = [u8; BLOCK_SIZE];

/// Bookkeeping half of a slot.
pub(crate) struct BufMeta {
    pub dev: u32,
    pub blockno: u32,
    /// Active holders (guards plus pins). Nonzero forbids eviction.
    pub refcnt: u32,
    /// Tick recorded when `refcnt` last dropped to zero. Meaningless while
    /// `refcnt > 0`.
    pub last_free: Tick,
    /// Arena index of the next slot in the owning bucket's chain.
    pub next: Option<u32>,
}

/// One slot of the buffer pool.
///
/// The two halves are guarded by different locks. `meta` belongs to the
/// spin tier: it may only be touched under the lock of the bucket the slot
/// is chained under (a detached victim belongs to the eviction-token
/// holder). `data` is the sleep tier and may be held across device I/O.
pub(crate) struct Buf {
    meta: UnsafeCell<BufMeta>,
    /// Whether `data` holds the block's true content. Cleared by the
    /// eviction path before a slot is handed out under a new key, set by
    /// the lock holder that loads it. The refcnt protocol keeps the two
    /// writers apart; the atomic makes the handoff between them explicit.
    valid: AtomicBool,
    pub(crate) data: SleepLock<BlockData>,
}

// Sound because of the lock discipline documented on `meta`.
unsafe impl Send for Buf {}
unsafe impl Sync for Buf {}

impl Buf {
    pub(crate) fn new() -> Self {
        Self {
            meta: UnsafeCell::new(BufMeta {
                dev: 0,
                blockno: 0,
                refcnt: 0,
                last_free: 0,
                next: None,
            }),
            valid: AtomicBool::new(false),
            data: SleepLock::new([0; BLOCK_SIZE]),
        }
    }

    /// # Safety
    ///
    /// The caller must hold the lock of the bucket this slot is chained
    /// under, or the eviction token if the slot is detached.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn meta(&self) -> &mut BufMeta {
        unsafe { &mut *self.meta.get() }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }
}

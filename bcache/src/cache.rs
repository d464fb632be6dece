//! Lookup, replacement and the public buffer API.
//!
//! Lock order, per call: one bucket lock first; on a miss the eviction
//! token; then bucket locks one at a time during the victim scan; the
//! slot's content lock last. Spin-tier locks are never held across the
//! content-lock await or across device I/O, and no two bucket locks are
//! ever held at once. The token serializes the whole replacement path, so
//! two harts can never pick the same victim.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

use config::cache::{BUCKET_COUNT, BUF_COUNT};
use driver::{DevId, Disk};
use mutex::{SleepLockGuard, SpinNoIrqLock};
use timer::Tick;

use crate::buf::{BlockData, Buf};

/// Head of one hash chain. Indices point into the slot arena; the bucket's
/// lock owns every link reachable from here, plus the bookkeeping of the
/// chained slots.
struct Bucket {
    head: Option<u32>,
}

/// Best replacement candidate seen so far during a victim scan.
struct Victim {
    bucket: usize,
    prev: Option<u32>,
    idx: u32,
    last_free: Tick,
}

pub struct BufferCache {
    disk: Arc<dyn Disk>,
    bufs: Box<[Buf]>,
    buckets: Box<[SpinNoIrqLock<Bucket>]>,
    /// The eviction token. Held for the duration of a victim scan and the
    /// relocation that follows, never across anything that can block.
    evict_lock: SpinNoIrqLock<()>,
}

impl BufferCache {
    pub fn new(disk: Arc<dyn Disk>) -> Self {
        Self::with_capacity(disk, BUF_COUNT, BUCKET_COUNT)
    }

    /// Capacity is fixed here for the cache's lifetime; there is no
    /// resizing and no teardown.
    pub fn with_capacity(disk: Arc<dyn Disk>, slots: usize, buckets: usize) -> Self {
        assert!(slots > 0, "buffer pool cannot be empty");
        assert!(buckets > 0, "bucket table cannot be empty");
        let bufs: Vec<Buf> = (0..slots).map(|_| Buf::new()).collect();
        let table: Vec<SpinNoIrqLock<Bucket>> = (0..buckets)
            .map(|_| SpinNoIrqLock::new(Bucket { head: None }))
            .collect();
        let cache = Self {
            disk,
            bufs: bufs.into_boxed_slice(),
            buckets: table.into_boxed_slice(),
            evict_lock: SpinNoIrqLock::new(()),
        };
        // Chain the whole pool into bucket 0. First use moves each slot
        // to its key's bucket through the normal victim path.
        {
            let mut bucket = cache.buckets[0].lock();
            for (i, buf) in cache.bufs.iter().enumerate() {
                let meta = unsafe { buf.meta() };
                meta.next = bucket.head;
                bucket.head = Some(i as u32);
            }
        }
        cache
    }

    /// Both halves of the key feed the hash: block numbers repeat across
    /// devices, and two devices' blocks must never share a slot.
    fn bucket_of(&self, dev: DevId, blockno: u32) -> usize {
        ((dev as usize) << 27 | blockno as usize) % self.buckets.len()
    }

    /// Walk one bucket's chain for the key. The caller holds the bucket's
    /// lock and passes the guarded value as proof.
    fn scan_chain(&self, bucket: &Bucket, dev: DevId, blockno: u32) -> Option<usize> {
        let mut cursor = bucket.head;
        while let Some(idx) = cursor {
            let meta = unsafe { self.bufs[idx as usize].meta() };
            if meta.dev == dev && meta.blockno == blockno {
                return Some(idx as usize);
            }
            cursor = meta.next;
        }
        None
    }

    /// Resolve the key to a slot with its reference count already raised,
    /// creating a slot through eviction if nothing matches. Every spin
    /// lock has been dropped by the time this returns.
    fn lookup(&self, dev: DevId, blockno: u32) -> usize {
        let key = self.bucket_of(dev, blockno);

        // Fast path: only this bucket's lock, no I/O, no other lock.
        {
            let bucket = self.buckets[key].lock();
            if let Some(idx) = self.scan_chain(&bucket, dev, blockno) {
                unsafe { self.bufs[idx].meta() }.refcnt += 1;
                log::trace!("bcache: hit dev={} blockno={}", dev, blockno);
                return idx;
            }
        }

        // Miss. The bucket lock is dropped before the token is requested:
        // the token holder takes bucket locks itself.
        let _token = self.evict_lock.lock();

        // Another hart may have installed the key while this one held no
        // lock at all.
        {
            let bucket = self.buckets[key].lock();
            if let Some(idx) = self.scan_chain(&bucket, dev, blockno) {
                unsafe { self.bufs[idx].meta() }.refcnt += 1;
                log::trace!("bcache: late hit dev={} blockno={}", dev, blockno);
                return idx;
            }
        }

        let idx = self.evict(dev, blockno, key);
        log::debug!("bcache: dev={} blockno={} takes slot {}", dev, blockno, idx);
        idx
    }

    /// Recycle the free slot with the smallest release tick for
    /// `(dev, blockno)`. Caller holds the eviction token.
    fn evict(&self, dev: DevId, blockno: u32, key: usize) -> usize {
        loop {
            // One bucket lock at a time, comparing against a running
            // snapshot. Chains cannot change under us while the token is
            // held (only the token holder relinks), so the recorded
            // predecessor stays usable after the lock is dropped.
            let mut best: Option<Victim> = None;
            for b in 0..self.buckets.len() {
                let bucket = self.buckets[b].lock();
                let mut prev = None;
                let mut cursor = bucket.head;
                while let Some(idx) = cursor {
                    let meta = unsafe { self.bufs[idx as usize].meta() };
                    if meta.refcnt == 0
                        && best.as_ref().is_none_or(|v| meta.last_free < v.last_free)
                    {
                        best = Some(Victim {
                            bucket: b,
                            prev,
                            idx,
                            last_free: meta.last_free,
                        });
                    }
                    prev = Some(idx);
                    cursor = meta.next;
                }
            }

            let Some(victim) = best else {
                // Every slot is referenced. Callers are not built to
                // retry; this exceeds design capacity.
                log::error!(
                    "bcache: all {} slots referenced, none evictable",
                    self.bufs.len()
                );
                panic!("bcache: out of buffers");
            };

            if victim.bucket == key {
                // Already in the right chain; re-key in place.
                let _bucket = self.buckets[key].lock();
                let meta = unsafe { self.bufs[victim.idx as usize].meta() };
                if meta.refcnt != 0 {
                    // A fast-path get raised it since the scan looked.
                    continue;
                }
                meta.dev = dev;
                meta.blockno = blockno;
                meta.refcnt = 1;
                self.bufs[victim.idx as usize].set_valid(false);
                return victim.idx as usize;
            }

            {
                let mut bucket = self.buckets[victim.bucket].lock();
                let meta = unsafe { self.bufs[victim.idx as usize].meta() };
                if meta.refcnt != 0 {
                    continue;
                }
                match victim.prev {
                    None => bucket.head = meta.next,
                    Some(prev) => unsafe { self.bufs[prev as usize].meta() }.next = meta.next,
                }
                meta.next = None;
            }

            // Detached: between the unlink above and the relink below the
            // slot is reachable only by the token holder.
            let mut bucket = self.buckets[key].lock();
            let meta = unsafe { self.bufs[victim.idx as usize].meta() };
            meta.dev = dev;
            meta.blockno = blockno;
            meta.refcnt = 1;
            meta.next = bucket.head;
            bucket.head = Some(victim.idx);
            self.bufs[victim.idx as usize].set_valid(false);
            return victim.idx as usize;
        }
    }

    /// Look up the key and take the slot's content lock. The await sits
    /// after every spin lock has been dropped.
    async fn get(&self, dev: DevId, blockno: u32) -> BufGuard<'_> {
        let idx = self.lookup(dev, blockno);
        let data = self.bufs[idx].data.lock().await;
        BufGuard {
            cache: self,
            idx,
            dev,
            blockno,
            data: ManuallyDrop::new(data),
        }
    }

    /// Return a locked buffer holding the current contents of
    /// `(dev, blockno)`. The device is read only on the first access since
    /// the slot was assigned to this key; racing first accesses serialize
    /// on the content lock, so the block is transferred exactly once.
    pub async fn read(&self, dev: DevId, blockno: u32) -> BufGuard<'_> {
        let mut buf = self.get(dev, blockno).await;
        if !self.bufs[buf.idx].is_valid() {
            self.disk.read_block(dev, blockno, &mut buf[..]);
            self.bufs[buf.idx].set_valid(true);
            log::trace!("bcache: loaded dev={} blockno={}", dev, blockno);
        }
        buf
    }

    fn raise_ref(&self, idx: usize, dev: DevId, blockno: u32) {
        let _bucket = self.buckets[self.bucket_of(dev, blockno)].lock();
        let meta = unsafe { self.bufs[idx].meta() };
        debug_assert!(meta.dev == dev && meta.blockno == blockno);
        meta.refcnt += 1;
    }

    fn release_ref(&self, idx: usize, dev: DevId, blockno: u32) {
        let _bucket = self.buckets[self.bucket_of(dev, blockno)].lock();
        let meta = unsafe { self.bufs[idx].meta() };
        debug_assert!(meta.dev == dev && meta.blockno == blockno);
        debug_assert!(meta.refcnt > 0);
        meta.refcnt -= 1;
        if meta.refcnt == 0 {
            meta.last_free = timer::tick_now();
        }
    }
}

/// Exclusively locked, reference-counted handle to one cached block.
/// Holding the guard *is* holding the slot's content lock, so the
/// lock-required operations live here and cannot be called without it.
/// Dropping the guard releases the lock first, then the reference.
pub struct BufGuard<'a> {
    cache: &'a BufferCache,
    idx: usize,
    dev: DevId,
    blockno: u32,
    data: ManuallyDrop<SleepLockGuard<'a, BlockData>>,
}

impl<'a> BufGuard<'a> {
    pub fn dev(&self) -> DevId {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// Push the buffer's contents to the device. Synchronous; returns
    /// once the transfer is done. Leaves references, validity and cache
    /// membership alone.
    pub fn write_back(&self) {
        self.cache.disk.write_block(self.dev, self.blockno, &self[..]);
    }

    /// Keep the block resident without keeping its lock: the slot cannot
    /// become a victim while the pin lives. Dropping the pin gives the
    /// reference back.
    pub fn pin(&self) -> BufPin<'a> {
        self.cache.raise_ref(self.idx, self.dev, self.blockno);
        BufPin {
            cache: self.cache,
            idx: self.idx,
            dev: self.dev,
            blockno: self.blockno,
        }
    }
}

impl Deref for BufGuard<'_> {
    type Target = BlockData;
    fn deref(&self) -> &BlockData {
        &self.data
    }
}

impl DerefMut for BufGuard<'_> {
    fn deref_mut(&mut self) -> &mut BlockData {
        &mut self.data
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        // Content lock first, so waiters stop blocking; then the
        // reference, under the bucket lock, stamping the release tick
        // when the slot becomes free.
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.release_ref(self.idx, self.dev, self.blockno);
    }
}

/// A reference held without the content lock. Keeps the slot resident
/// across intervals where the holder is not touching the data.
pub struct BufPin<'a> {
    cache: &'a BufferCache,
    idx: usize,
    dev: DevId,
    blockno: u32,
}

impl Drop for BufPin<'_> {
    fn drop(&mut self) {
        self.cache.release_ref(self.idx, self.dev, self.blockno);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use config::device::{BLOCK_SIZE, MAX_HARTS};
    use driver::{DeviceManager, RamDisk};
    use logger::LogSink;
    use mutex::SpinLock;
    use osfuture::block_on;
    use timer::tick_advance;

    struct StdoutSink;

    #[crate_interface::impl_interface]
    impl LogSink for StdoutSink {
        fn write_record(record: &log::Record) {
            println!("[{}] {}", record.level(), record.args());
        }
    }

    /// Disk double: counts transfers, remembers writes, and serves a
    /// deterministic per-key pattern for never-written blocks.
    struct CountingDisk {
        reads: AtomicUsize,
        writes: AtomicUsize,
        store: SpinLock<BTreeMap<(DevId, u32), BlockData>>,
    }

    impl CountingDisk {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                store: SpinLock::new(BTreeMap::new()),
            })
        }

        fn pattern(dev: DevId, blockno: u32) -> BlockData {
            [(dev as u8).wrapping_mul(31).wrapping_add(blockno as u8); BLOCK_SIZE]
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    impl Disk for CountingDisk {
        fn read_block(&self, dev: DevId, blockno: u32, buf: &mut [u8]) {
            self.reads.fetch_add(1, Ordering::SeqCst);
            match self.store.lock().get(&(dev, blockno)) {
                Some(data) => buf.copy_from_slice(data),
                None => buf.copy_from_slice(&Self::pattern(dev, blockno)),
            }
        }

        fn write_block(&self, dev: DevId, blockno: u32, buf: &[u8]) {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut data = [0u8; BLOCK_SIZE];
            data.copy_from_slice(buf);
            self.store.lock().insert((dev, blockno), data);
        }
    }

    #[test]
    fn repeated_reads_load_once() {
        let disk = CountingDisk::new();
        let cache = BufferCache::new(disk.clone());
        block_on(async {
            let buf = cache.read(1, 10).await;
            assert_eq!(&buf[..], &CountingDisk::pattern(1, 10)[..]);
            drop(buf);
            let buf = cache.read(1, 10).await;
            assert_eq!(&buf[..], &CountingDisk::pattern(1, 10)[..]);
            assert_eq!(buf.dev(), 1);
            assert_eq!(buf.blockno(), 10);
        });
        assert_eq!(disk.reads(), 1);
    }

    #[test]
    fn replacement_takes_least_recently_released() {
        let disk = CountingDisk::new();
        let cache = BufferCache::with_capacity(disk.clone(), 3, 2);
        block_on(async {
            for blockno in [10, 20, 30] {
                drop(cache.read(1, blockno).await);
                tick_advance();
            }
            assert_eq!(disk.reads(), 3);

            // All three fit, so a second round stays in memory.
            for blockno in [10, 20, 30] {
                drop(cache.read(1, blockno).await);
                tick_advance();
            }
            assert_eq!(disk.reads(), 3);

            // A fourth key recycles exactly the slot whose release is
            // oldest: block 10's.
            drop(cache.read(1, 40).await);
            tick_advance();
            assert_eq!(disk.reads(), 4);

            drop(cache.read(1, 20).await);
            tick_advance();
            drop(cache.read(1, 30).await);
            tick_advance();
            assert_eq!(disk.reads(), 4);

            drop(cache.read(1, 10).await);
            assert_eq!(disk.reads(), 5);
        });
    }

    #[test]
    fn devices_sharing_block_numbers_do_not_collide() {
        let disk = CountingDisk::new();
        let cache = BufferCache::with_capacity(disk.clone(), 4, 2);
        block_on(async {
            let a = cache.read(1, 5).await;
            let b = cache.read(2, 5).await;
            assert_eq!(disk.reads(), 2);
            assert_ne!(a.as_ptr(), b.as_ptr());
            assert_eq!(&a[..], &CountingDisk::pattern(1, 5)[..]);
            assert_eq!(&b[..], &CountingDisk::pattern(2, 5)[..]);
        });
    }

    #[test]
    fn concurrent_first_reads_load_once() {
        let disk = CountingDisk::new();
        let cache = BufferCache::new(disk.clone());
        std::thread::scope(|s| {
            for _ in 0..MAX_HARTS {
                s.spawn(|| {
                    block_on(async {
                        let buf = cache.read(7, 42).await;
                        assert_eq!(&buf[..], &CountingDisk::pattern(7, 42)[..]);
                    });
                });
            }
        });
        assert_eq!(disk.reads(), 1);
    }

    #[test]
    fn pin_keeps_block_resident_without_its_lock() {
        let disk = CountingDisk::new();
        let cache = BufferCache::with_capacity(disk.clone(), 1, 1);
        block_on(async {
            let buf = cache.read(1, 9).await;
            let pin = buf.pin();
            drop(buf);
            tick_advance();

            // Still resident: a re-read hits even though no guard exists.
            drop(cache.read(1, 9).await);
            tick_advance();
            assert_eq!(disk.reads(), 1);

            drop(pin);
            tick_advance();

            // Unpinned, the only slot can be recycled...
            drop(cache.read(1, 11).await);
            tick_advance();
            assert_eq!(disk.reads(), 2);

            // ...and block 9 has to come back from the device.
            drop(cache.read(1, 9).await);
            assert_eq!(disk.reads(), 3);
        });
    }

    #[test]
    #[should_panic(expected = "out of buffers")]
    fn exhaustion_is_fatal() {
        let disk = CountingDisk::new();
        let cache = BufferCache::with_capacity(disk.clone(), 2, 2);
        block_on(async {
            let a = cache.read(1, 1).await;
            let _pin_a = a.pin();
            drop(a);
            let b = cache.read(1, 2).await;
            let _pin_b = b.pin();
            drop(b);
            // Every slot is pinned; no victim exists anywhere.
            let _ = cache.read(1, 3).await;
        });
    }

    #[test]
    fn write_back_survives_eviction() {
        let disk = CountingDisk::new();
        let cache = BufferCache::with_capacity(disk.clone(), 3, 2);
        block_on(async {
            let mut buf = cache.read(1, 100).await;
            buf.fill(0xAB);
            buf.write_back();
            drop(buf);
            tick_advance();
            assert_eq!(disk.writes(), 1);

            // Not yet evicted: served from memory, the exact prior bytes.
            let buf = cache.read(1, 100).await;
            assert_eq!(&buf[..], &[0xAB; BLOCK_SIZE][..]);
            drop(buf);
            tick_advance();
            assert_eq!(disk.reads(), 1);

            // Push it out by filling the pool with younger blocks.
            for blockno in [101, 102, 103] {
                drop(cache.read(1, blockno).await);
                tick_advance();
            }

            // Loaded fresh from the device, with the written-back bytes.
            let buf = cache.read(1, 100).await;
            assert_eq!(&buf[..], &[0xAB; BLOCK_SIZE][..]);
        });
        assert_eq!(disk.reads(), 5);
    }

    #[test]
    fn harts_hammering_shared_blocks_stay_coherent() {
        let disk = CountingDisk::new();
        let cache = BufferCache::with_capacity(disk.clone(), 8, 3);
        std::thread::scope(|s| {
            for hart in 0..MAX_HARTS as u32 {
                let cache = &cache;
                s.spawn(move || {
                    block_on(async {
                        for i in 0..50u32 {
                            // Shared read-only blocks, churned through a
                            // pool smaller than the key set.
                            let blockno = i % 6;
                            let buf = cache.read(3, blockno).await;
                            assert_eq!(&buf[..], &CountingDisk::pattern(3, blockno)[..]);
                            drop(buf);
                            tick_advance();

                            // One private block per hart, written once and
                            // expected to survive any number of evictions.
                            let mut buf = cache.read(4, hart).await;
                            if i == 0 {
                                buf.fill(hart as u8 + 1);
                                buf.write_back();
                            } else {
                                assert_eq!(buf[0], hart as u8 + 1);
                            }
                            drop(buf);
                            tick_advance();
                        }
                    });
                });
            }
        });
    }

    #[test]
    fn global_cache_serves_registered_devices() {
        logger::init();
        let manager = Arc::new(DeviceManager::new());
        manager.register(0, Arc::new(RamDisk::new(16)));
        crate::init(manager);
        let cache = crate::cache();
        block_on(async {
            let mut buf = cache.read(0, 3).await;
            buf.fill(0x33);
            buf.write_back();
            drop(buf);
            let buf = cache.read(0, 3).await;
            assert_eq!(&buf[..], &[0x33; BLOCK_SIZE][..]);
        });
    }
}

use alloc::vec;
use alloc::vec::Vec;

use config::device::BLOCK_SIZE;
use mutex::SpinNoIrqLock;

use crate::BlockDevice;

/// Memory-backed block device for bring-up and tests. One lock over the
/// whole store, the same shape a real controller wrapper has.
pub struct RamDisk {
    store: SpinNoIrqLock<Vec<u8>>,
    num_blocks: usize,
}

impl RamDisk {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            store: SpinNoIrqLock::new(vec![0; num_blocks * BLOCK_SIZE]),
            num_blocks,
        }
    }

    fn range(&self, block_id: usize, len: usize) -> core::ops::Range<usize> {
        assert_eq!(len, BLOCK_SIZE, "transfer must be exactly one block");
        if block_id >= self.num_blocks {
            panic!(
                "ramdisk: block_id {} past end of device ({} blocks)",
                block_id, self.num_blocks
            );
        }
        let start = block_id * BLOCK_SIZE;
        start..start + BLOCK_SIZE
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let range = self.range(block_id, buf.len());
        buf.copy_from_slice(&self.store.lock()[range]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let range = self.range(block_id, buf.len());
        self.store.lock()[range].copy_from_slice(buf);
    }

    fn num_blocks(&self) -> usize {
        self.num_blocks
    }
}

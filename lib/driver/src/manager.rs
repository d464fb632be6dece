use alloc::{collections::btree_map::BTreeMap, sync::Arc};

use mutex::SpinNoIrqLock;

use crate::{BlockDevice, DevId, Disk};

/// Owns every registered block device and routes `(dev, blockno)`
/// transfers to the right one.
pub struct DeviceManager {
    devices: SpinNoIrqLock<BTreeMap<DevId, Arc<dyn BlockDevice>>>,
}

impl DeviceManager {
    pub const fn new() -> Self {
        Self {
            devices: SpinNoIrqLock::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, dev: DevId, device: Arc<dyn BlockDevice>) {
        log::info!(
            "registered block device dev={} with {} blocks",
            dev,
            device.num_blocks()
        );
        self.devices.lock().insert(dev, device);
    }

    /// A transfer aimed at a device nobody registered is a wiring bug of
    /// the embedder, not a runtime condition.
    fn device(&self, dev: DevId) -> Arc<dyn BlockDevice> {
        match self.devices.lock().get(&dev) {
            Some(device) => device.clone(),
            None => panic!("no block device registered for dev {}", dev),
        }
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Disk for DeviceManager {
    fn read_block(&self, dev: DevId, blockno: u32, buf: &mut [u8]) {
        self.device(dev).read_block(blockno as usize, buf);
    }

    fn write_block(&self, dev: DevId, blockno: u32, buf: &[u8]) {
        self.device(dev).write_block(blockno as usize, buf);
    }
}

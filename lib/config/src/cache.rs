/// Slots in the buffer pool. Sized for three outstanding filesystem
/// operations worth of blocks.
pub const BUF_COUNT: usize = 30;

/// Hash buckets over the pool. Prime, to spread keys evenly.
pub const BUCKET_COUNT: usize = 13;

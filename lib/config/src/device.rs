pub const MAX_HARTS: usize = 4;

pub const BLOCK_SIZE: usize = 512;

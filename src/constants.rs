// page geometry: 256-byte pages on a 22-bit CPU bus
pub const OFFSET_BITS: u32 = 8;
pub const BUS_WIDTH: u32 = 22;

pub const PAGE_SIZE: usize = 1 << OFFSET_BITS;
pub const OFFSET_MASK: usize = PAGE_SIZE - 1;

pub const MAX_VADDR: usize = 1 << BUS_WIDTH;
pub const MAX_PAGES: usize = 1 << (BUS_WIDTH - OFFSET_BITS);

pub const MAX_SYMTBL_SIZE: usize = 30;
pub const MAX_PID: u32 = 1024;
pub const MAX_QUEUE_SIZE: usize = 10;
pub const MAX_SWAP_DEVICES: usize = 4;

pub const DEFAULT_RAM_SIZE: usize = 0x10_0000;
pub const DEFAULT_SWAP_SIZE: usize = 0x100_0000;
pub const DEFAULT_TIME_SLICE: usize = 2;

/// Round a byte count up to the next page boundary
#[inline]
pub const fn align_up(size: usize) -> usize {
    (size + OFFSET_MASK) & !OFFSET_MASK
}

/// Number of whole pages covering `size` bytes
#[inline]
pub const fn pages_for(size: usize) -> usize {
    align_up(size) >> OFFSET_BITS
}

use std::collections::VecDeque;
use std::fmt::Write as _;

use serde::Deserialize;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::vm_manager::Pid;

/// How a device reaches a byte: directly, or by walking a cursor from 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Random,
    Sequential,
}

/// A used frame together with the process that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedFrame {
    pub fpn: usize,
    pub owner: Pid,
}

/// Free and used frame bookkeeping for one device.
///
/// A frame number lives in at most one of the two lists. Frames handed out by
/// `acquire` sit in neither until the caller records an owner with `mark_used`.
#[derive(Debug, Default)]
struct FrameLists {
    free: VecDeque<usize>,
    used: VecDeque<UsedFrame>,
}

impl FrameLists {
    fn reset(&mut self, num_frames: usize) {
        self.free = (0..num_frames).collect();
        self.used.clear();
    }

    fn acquire(&mut self) -> Option<usize> {
        self.free.pop_front()
    }

    // LIFO reuse: released frames go back to the head
    fn release(&mut self, fpn: usize) {
        self.free.push_front(fpn);
    }

    fn used_position(&self, fpn: usize) -> Option<usize> {
        self.used.iter().position(|used| used.fpn == fpn)
    }

    fn is_free(&self, fpn: usize) -> bool {
        self.free.contains(&fpn)
    }

    fn push_used(&mut self, fpn: usize, owner: Pid) {
        self.used.push_back(UsedFrame { fpn, owner });
    }

    fn remove_used(&mut self, fpn: usize) -> Option<UsedFrame> {
        let pos = self.used_position(fpn)?;
        self.used.remove(pos)
    }
}

/// Physical storage device. Used for both RAM and swap.
pub struct MemPhy {
    storage: Vec<u8>,
    mode: AccessMode,
    cursor: usize,
    /// total cursor steps taken by sequential accesses
    steps: u64,
    frames: FrameLists,
}

impl MemPhy {
    /// Create a zeroed device of `size` bytes and format it into pages
    pub fn new(size: usize, mode: AccessMode) -> Result<Self> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(Error::InvalidSize(size));
        }
        let mut mp = MemPhy {
            storage: vec![0u8; size],
            mode,
            cursor: 0,
            steps: 0,
            frames: FrameLists::default(),
        };
        mp.format(PAGE_SIZE)?;
        Ok(mp)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    #[inline]
    pub fn num_frames(&self) -> usize {
        self.capacity() / PAGE_SIZE
    }

    #[inline]
    fn check_addr(&self, addr: usize) -> Result<()> {
        if addr >= self.capacity() {
            return Err(Error::BadAddress {
                addr,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    /// Read a byte using whatever access mode the device was created with
    pub fn read(&mut self, addr: usize) -> Result<u8> {
        match self.mode {
            AccessMode::Random => self.read_direct(addr),
            AccessMode::Sequential => self.seq_read(addr),
        }
    }

    /// Write a byte using whatever access mode the device was created with
    pub fn write(&mut self, addr: usize, value: u8) -> Result<()> {
        match self.mode {
            AccessMode::Random => self.write_direct(addr, value),
            AccessMode::Sequential => self.seq_write(addr, value),
        }
    }

    /// Random access read. Rejected on sequential devices.
    pub fn read_direct(&self, addr: usize) -> Result<u8> {
        if self.mode != AccessMode::Random {
            return Err(Error::UnsupportedAccess { addr });
        }
        self.check_addr(addr)?;
        Ok(self.storage[addr])
    }

    /// Random access write. Rejected on sequential devices.
    pub fn write_direct(&mut self, addr: usize, value: u8) -> Result<()> {
        if self.mode != AccessMode::Random {
            return Err(Error::UnsupportedAccess { addr });
        }
        self.check_addr(addr)?;
        self.storage[addr] = value;
        Ok(())
    }

    /// Rewind the cursor and walk it one byte at a time up to `offset`
    fn move_cursor(&mut self, offset: usize) {
        let capacity = self.capacity();
        self.cursor = 0;
        let mut numstep = 0;
        while numstep < offset && numstep < capacity {
            self.cursor = (self.cursor + 1) % capacity;
            numstep += 1;
        }
        self.steps += numstep as u64;
    }

    pub fn seq_read(&mut self, addr: usize) -> Result<u8> {
        self.check_addr(addr)?;
        self.move_cursor(addr);
        Ok(self.storage[self.cursor])
    }

    pub fn seq_write(&mut self, addr: usize, value: u8) -> Result<()> {
        self.check_addr(addr)?;
        self.move_cursor(addr);
        self.storage[self.cursor] = value;
        Ok(())
    }

    /// Copy a whole frame out of the device
    pub fn read_frame(&mut self, fpn: usize) -> Result<Vec<u8>> {
        let base = frame_to_address(fpn);
        self.check_addr(base + PAGE_SIZE - 1)?;
        (base..base + PAGE_SIZE).map(|addr| self.read(addr)).collect()
    }

    /// Overwrite a whole frame. `data` must be exactly one page.
    pub fn write_frame(&mut self, fpn: usize, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            return Err(Error::InvalidSize(data.len()));
        }
        let base = frame_to_address(fpn);
        self.check_addr(base + PAGE_SIZE - 1)?;
        for (i, &byte) in data.iter().enumerate() {
            self.write(base + i, byte)?;
        }
        Ok(())
    }

    /// Re-seed the free list with every frame in ascending order.
    /// Any used-frame records are dropped.
    pub fn format(&mut self, page_size: usize) -> Result<()> {
        if page_size == 0 {
            return Err(Error::InvalidSize(page_size));
        }
        let num_frames = self.capacity() / page_size;
        if num_frames == 0 {
            return Err(Error::InvalidSize(self.capacity()));
        }
        self.frames.reset(num_frames);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Frame allocator
    // ------------------------------------------------------------------

    /// Pop the head of the free list
    pub fn acquire_free_frame(&mut self) -> Option<usize> {
        self.frames.acquire()
    }

    /// Return a frame to the free list, dropping any owner record
    pub fn release_frame(&mut self, fpn: usize) -> Result<()> {
        if fpn >= self.num_frames() || self.frames.is_free(fpn) {
            return Err(Error::InvalidFrame(fpn));
        }
        self.frames.remove_used(fpn);
        self.frames.release(fpn);
        Ok(())
    }

    /// Record `owner` for an acquired frame, at the tail of the used list
    pub fn mark_used(&mut self, fpn: usize, owner: Pid) -> Result<()> {
        if fpn >= self.num_frames()
            || self.frames.is_free(fpn)
            || self.frames.used_position(fpn).is_some()
        {
            return Err(Error::InvalidFrame(fpn));
        }
        self.frames.push_used(fpn, owner);
        Ok(())
    }

    /// Drop the used record of `fpn`, wherever it sits in the list
    pub fn remove_used(&mut self, fpn: usize) -> Option<UsedFrame> {
        self.frames.remove_used(fpn)
    }

    /// The longest-used frame, without removing it
    pub fn oldest_used(&self) -> Option<UsedFrame> {
        self.frames.used.front().copied()
    }

    pub fn take_oldest_used(&mut self) -> Option<UsedFrame> {
        self.frames.used.pop_front()
    }

    pub fn owner_of(&self, fpn: usize) -> Option<Pid> {
        self.frames
            .used
            .iter()
            .find(|used| used.fpn == fpn)
            .map(|used| used.owner)
    }

    pub fn is_free(&self, fpn: usize) -> bool {
        self.frames.is_free(fpn)
    }

    pub fn free_count(&self) -> usize {
        self.frames.free.len()
    }

    pub fn used_count(&self) -> usize {
        self.frames.used.len()
    }

    /// Hex dump, one line per 16 bytes. All-zero lines are skipped.
    pub fn dump(&self) -> String {
        let mut out = String::from("----- MEMORY CONTENT -----\n");
        for (line, chunk) in self.storage.chunks(16).enumerate() {
            if chunk.iter().all(|&b| b == 0) {
                continue;
            }
            let _ = write!(out, "{:08x}:", line * 16);
            for byte in chunk {
                let _ = write!(out, " {:02x}", byte);
            }
            out.push('\n');
        }
        out
    }
}

/// Calculate the starting address of a frame
#[inline]
pub fn frame_to_address(fpn: usize) -> usize {
    fpn << OFFSET_BITS
}

/// Copy one page from `src[src_fpn]` into `dst[dst_fpn]`
pub fn copy_page(src: &mut MemPhy, src_fpn: usize, dst: &mut MemPhy, dst_fpn: usize) -> Result<()> {
    let data = src.read_frame(src_fpn)?;
    dst.write_frame(dst_fpn, &data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram(pages: usize) -> MemPhy {
        MemPhy::new(pages * PAGE_SIZE, AccessMode::Random).unwrap()
    }

    #[test]
    fn test_device_initialization() {
        let mut mp = ram(4);
        assert_eq!(mp.capacity(), 1024);
        assert_eq!(mp.num_frames(), 4);
        assert_eq!(mp.free_count(), 4);
        assert_eq!(mp.read(0).unwrap(), 0);
        assert_eq!(mp.read(1023).unwrap(), 0);
    }

    #[test]
    fn test_size_must_be_page_multiple() {
        assert!(matches!(
            MemPhy::new(300, AccessMode::Random),
            Err(Error::InvalidSize(300))
        ));
        assert!(MemPhy::new(0, AccessMode::Random).is_err());
    }

    #[test]
    fn test_read_write() {
        let mut mp = ram(2);
        mp.write(100, 42).unwrap();
        assert_eq!(mp.read(100).unwrap(), 42);
        assert!(matches!(mp.read(512), Err(Error::BadAddress { addr: 512, .. })));
        assert!(mp.write(512, 1).is_err());
    }

    #[test]
    fn test_sequential_matches_random() {
        let mut seq = MemPhy::new(2 * PAGE_SIZE, AccessMode::Sequential).unwrap();
        seq.write(300, 0xAB).unwrap();
        assert_eq!(seq.cursor(), 300);
        assert_eq!(seq.read(300).unwrap(), 0xAB);
        assert_eq!(seq.read(0).unwrap(), 0);
        assert_eq!(seq.cursor(), 0);
        // two walks to 300, one to 0
        assert_eq!(seq.steps(), 600);
    }

    #[test]
    fn test_direct_access_rejected_on_sequential_device() {
        let mut seq = MemPhy::new(PAGE_SIZE, AccessMode::Sequential).unwrap();
        assert!(matches!(
            seq.read_direct(5),
            Err(Error::UnsupportedAccess { addr: 5 })
        ));
        assert!(seq.write_direct(5, 1).is_err());
    }

    #[test]
    fn test_format_seeds_ascending() {
        let mut mp = ram(4);
        let order: Vec<usize> = std::iter::from_fn(|| mp.acquire_free_frame()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(mp.acquire_free_frame().is_none());

        mp.format(PAGE_SIZE).unwrap();
        assert_eq!(mp.free_count(), 4);
        assert!(mp.format(0).is_err());
    }

    #[test]
    fn test_release_is_lifo_and_single() {
        let mut mp = ram(4);
        let a = mp.acquire_free_frame().unwrap();
        let b = mp.acquire_free_frame().unwrap();
        mp.release_frame(a).unwrap();
        mp.release_frame(b).unwrap();
        assert_eq!(mp.acquire_free_frame(), Some(b));

        // a is free already
        assert!(matches!(mp.release_frame(a), Err(Error::InvalidFrame(_))));
        assert!(mp.release_frame(99).is_err());
    }

    #[test]
    fn test_used_list_is_fifo() {
        let mut mp = ram(4);
        for pid in 1..=3 {
            let fpn = mp.acquire_free_frame().unwrap();
            mp.mark_used(fpn, Pid(pid)).unwrap();
        }
        assert_eq!(mp.used_count(), 3);
        assert_eq!(mp.oldest_used(), Some(UsedFrame { fpn: 0, owner: Pid(1) }));

        // interior removal
        assert_eq!(mp.remove_used(1).map(|u| u.owner), Some(Pid(2)));
        assert_eq!(mp.take_oldest_used().map(|u| u.fpn), Some(0));
        assert_eq!(mp.take_oldest_used().map(|u| u.fpn), Some(2));
        assert!(mp.take_oldest_used().is_none());
    }

    #[test]
    fn test_mark_used_rejects_free_or_duplicate() {
        let mut mp = ram(2);
        assert!(mp.mark_used(0, Pid(1)).is_err());
        let fpn = mp.acquire_free_frame().unwrap();
        mp.mark_used(fpn, Pid(1)).unwrap();
        assert!(mp.mark_used(fpn, Pid(2)).is_err());
        assert_eq!(mp.owner_of(fpn), Some(Pid(1)));
    }

    #[test]
    fn test_release_drops_owner() {
        let mut mp = ram(2);
        let fpn = mp.acquire_free_frame().unwrap();
        mp.mark_used(fpn, Pid(7)).unwrap();
        mp.release_frame(fpn).unwrap();
        assert_eq!(mp.owner_of(fpn), None);
        assert!(mp.is_free(fpn));
        assert_eq!(mp.used_count(), 0);
    }

    #[test]
    fn test_frame_to_address() {
        assert_eq!(frame_to_address(0), 0);
        assert_eq!(frame_to_address(1), 256);
        assert_eq!(frame_to_address(4), 1024);
    }

    #[test]
    fn test_copy_page() {
        let mut ram = ram(2);
        let mut swap = MemPhy::new(4 * PAGE_SIZE, AccessMode::Random).unwrap();
        ram.write(PAGE_SIZE, 13).unwrap();
        ram.write(PAGE_SIZE + 255, 25).unwrap();

        copy_page(&mut ram, 1, &mut swap, 3).unwrap();
        assert_eq!(swap.read(3 * PAGE_SIZE).unwrap(), 13);
        assert_eq!(swap.read(3 * PAGE_SIZE + 255).unwrap(), 25);

        assert!(copy_page(&mut ram, 2, &mut swap, 0).is_err());
    }

    #[test]
    fn test_dump() {
        let mut mp = ram(1);
        mp.write(0x11, 0xAB).unwrap();
        let dump = mp.dump();
        assert!(dump.contains("00000010: 00 ab"));
        assert_eq!(dump.lines().count(), 2);
    }
}

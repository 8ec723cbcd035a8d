//! Per-process write-through cache in front of the RAM device.
//!
//! Lines are keyed by physical address and allocated on first use. Whoever
//! remaps a frame must call `invalidate_frame` for the processes affected.

use log::trace;

use crate::constants::*;
use crate::error::{Error, Identity, Result};
use crate::memory::{frame_to_address, MemPhy};
use crate::vm_manager::Pid;

pub struct TlbCache {
    pid: Pid,
    capacity: usize,
    /// `None` in a slot means nothing cached, independent of the byte value
    lines: Option<Vec<Option<u8>>>,
    hits: u64,
    misses: u64,
}

impl TlbCache {
    pub fn new(pid: Pid, capacity: usize) -> Result<Self> {
        if pid.0 >= MAX_PID {
            return Err(Error::InvalidIdentity {
                kind: Identity::Process,
                id: pid.0 as usize,
            });
        }
        Ok(TlbCache {
            pid,
            capacity,
            lines: None,
            hits: 0,
            misses: 0,
        })
    }

    #[inline]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    #[inline]
    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn is_allocated(&self) -> bool {
        self.lines.is_some()
    }

    fn lines_mut(&mut self, addr: usize) -> Result<&mut Vec<Option<u8>>> {
        if addr >= self.capacity {
            return Err(Error::BadAddress {
                addr,
                capacity: self.capacity,
            });
        }
        let capacity = self.capacity;
        Ok(self.lines.get_or_insert_with(|| vec![None; capacity]))
    }

    /// Cached byte at `addr`, if any
    pub fn lookup(&self, addr: usize) -> Option<u8> {
        self.lines.as_ref()?.get(addr).copied().flatten()
    }

    /// Read through the cache. A miss fetches from `mp` and fills the line.
    pub fn read(&mut self, mp: &mut MemPhy, addr: usize) -> Result<u8> {
        if let Some(value) = self.lookup(addr) {
            self.hits += 1;
            trace!("tlb pid {}: hit {:#x} -> {:#04x}", self.pid, addr, value);
            return Ok(value);
        }
        self.lines_mut(addr)?;
        let value = mp.read(addr)?;
        self.lines_mut(addr)?[addr] = Some(value);
        self.misses += 1;
        trace!("tlb pid {}: miss {:#x} -> {:#04x}", self.pid, addr, value);
        Ok(value)
    }

    /// Write through to `mp` and refresh the line
    pub fn write(&mut self, mp: &mut MemPhy, addr: usize, value: u8) -> Result<()> {
        self.lines_mut(addr)?;
        mp.write(addr, value)?;
        self.lines_mut(addr)?[addr] = Some(value);
        Ok(())
    }

    /// Forget every line belonging to RAM frame `fpn`
    pub fn invalidate_frame(&mut self, fpn: usize) {
        if let Some(lines) = self.lines.as_mut() {
            let base = frame_to_address(fpn);
            let end = (base + PAGE_SIZE).min(lines.len());
            if base < end {
                lines[base..end].fill(None);
            }
        }
    }

    /// Drop the backing buffer entirely
    pub fn invalidate_all(&mut self) {
        self.lines = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AccessMode;

    fn ram() -> MemPhy {
        MemPhy::new(4 * PAGE_SIZE, AccessMode::Random).unwrap()
    }

    #[test]
    fn test_pid_bound() {
        assert!(TlbCache::new(Pid(MAX_PID - 1), 1024).is_ok());
        assert!(matches!(
            TlbCache::new(Pid(MAX_PID), 1024),
            Err(Error::InvalidIdentity { kind: Identity::Process, .. })
        ));
    }

    #[test]
    fn test_lazy_allocation() {
        let mut mp = ram();
        let mut tlb = TlbCache::new(Pid(1), mp.capacity()).unwrap();
        assert!(!tlb.is_allocated());
        tlb.read(&mut mp, 10).unwrap();
        assert!(tlb.is_allocated());
    }

    #[test]
    fn test_read_miss_then_hit() {
        let mut mp = ram();
        mp.write(40, 7).unwrap();
        let mut tlb = TlbCache::new(Pid(1), mp.capacity()).unwrap();

        assert_eq!(tlb.read(&mut mp, 40).unwrap(), 7);
        assert_eq!(tlb.misses(), 1);

        // device changes behind the cache's back are not seen
        mp.write(40, 9).unwrap();
        assert_eq!(tlb.read(&mut mp, 40).unwrap(), 7);
        assert_eq!(tlb.hits(), 1);
    }

    #[test]
    fn test_write_through_zero_is_cached() {
        let mut mp = ram();
        let mut tlb = TlbCache::new(Pid(2), mp.capacity()).unwrap();
        mp.write(5, 0xFF).unwrap();

        tlb.write(&mut mp, 5, 0).unwrap();
        assert_eq!(mp.read(5).unwrap(), 0);
        assert_eq!(tlb.lookup(5), Some(0));
        assert_eq!(tlb.read(&mut mp, 5).unwrap(), 0);
        assert_eq!(tlb.hits(), 1);
        assert_eq!(tlb.misses(), 0);
    }

    #[test]
    fn test_hit_does_not_touch_device() {
        let mut mp = MemPhy::new(4 * PAGE_SIZE, AccessMode::Sequential).unwrap();
        let mut tlb = TlbCache::new(Pid(3), mp.capacity()).unwrap();
        tlb.write(&mut mp, 600, 0x42).unwrap();
        let steps = mp.steps();

        assert_eq!(tlb.read(&mut mp, 600).unwrap(), 0x42);
        assert_eq!(mp.steps(), steps);
    }

    #[test]
    fn test_invalidate_frame() {
        let mut mp = ram();
        let mut tlb = TlbCache::new(Pid(1), mp.capacity()).unwrap();
        tlb.write(&mut mp, PAGE_SIZE + 3, 1).unwrap();
        tlb.write(&mut mp, 3, 2).unwrap();

        tlb.invalidate_frame(1);
        assert_eq!(tlb.lookup(PAGE_SIZE + 3), None);
        assert_eq!(tlb.lookup(3), Some(2));

        tlb.invalidate_all();
        assert!(!tlb.is_allocated());
    }

    #[test]
    fn test_out_of_range_address() {
        let mut mp = ram();
        let mut tlb = TlbCache::new(Pid(1), mp.capacity()).unwrap();
        assert!(matches!(tlb.read(&mut mp, 4096), Err(Error::BadAddress { .. })));
        assert!(tlb.write(&mut mp, 4096, 1).is_err());
    }
}

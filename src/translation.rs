use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;

use log::{debug, warn};

use crate::constants::*;
use crate::error::{Error, Result};
use crate::memory::MemPhy;
use crate::vm_manager::Pid;

/// Represents the decomposed components of a virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualAddress {
    pub addr: usize,
    pub pgn: usize,
    pub off: usize,
}

impl VirtualAddress {
    /// Decompose a raw address into page number and offset
    pub fn from_raw(addr: usize) -> Self {
        VirtualAddress {
            addr,
            pgn: addr >> OFFSET_BITS,
            off: addr & OFFSET_MASK,
        }
    }

    /// Like `from_raw`, but rejects addresses past the CPU bus width
    pub fn checked(addr: usize) -> Result<Self> {
        if addr >= MAX_VADDR {
            return Err(Error::BadAddress {
                addr,
                capacity: MAX_VADDR,
            });
        }
        Ok(Self::from_raw(addr))
    }

    /// Physical address of this offset inside frame `fpn`
    #[inline]
    pub fn physical(&self, fpn: usize) -> usize {
        (fpn << OFFSET_BITS) | self.off
    }
}

impl std::fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VA({:#x}) = (pgn={}, off={})", self.addr, self.pgn, self.off)
    }
}

/// Page table entry. A page with no entry at all is unmapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pte {
    Present { fpn: usize },
    Swapped { swp_fpn: usize },
}

/// Result of resolving a page number to a RAM frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Hit(usize),
    /// `victim` was pushed out to swap and its frame reused
    PageIn { fpn: usize, victim: usize },
}

impl Resolution {
    #[inline]
    pub fn fpn(&self) -> usize {
        match *self {
            Resolution::Hit(fpn) | Resolution::PageIn { fpn, .. } => fpn,
        }
    }
}

/// Per-process page table plus the FIFO of resident pages.
///
/// The FIFO only ever holds pages that are currently `Present`, in the order
/// they became present. A page leaves the queue the moment it stops being
/// present, so the victim is always the front element.
#[derive(Debug, Default)]
pub struct PageDirectory {
    entries: BTreeMap<usize, Pte>,
    fifo: VecDeque<usize>,
    faults: u64,
    evictions: u64,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn entry(&self, pgn: usize) -> Option<Pte> {
        self.entries.get(&pgn).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, Pte)> + '_ {
        self.entries.iter().map(|(&pgn, &pte)| (pgn, pte))
    }

    /// Resident pages, oldest first
    pub fn fifo(&self) -> impl Iterator<Item = usize> + '_ {
        self.fifo.iter().copied()
    }

    #[inline]
    pub fn faults(&self) -> u64 {
        self.faults
    }

    /// Faults that pushed a resident page out to swap
    #[inline]
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn present_count(&self) -> usize {
        self.fifo.len()
    }

    fn forget(&mut self, pgn: usize) {
        self.fifo.retain(|&p| p != pgn);
    }

    /// Mark `pgn` resident in `fpn` and queue it as the newest page
    pub fn map_present(&mut self, pgn: usize, fpn: usize) {
        self.forget(pgn);
        self.entries.insert(pgn, Pte::Present { fpn });
        self.fifo.push_back(pgn);
    }

    pub fn set_swapped(&mut self, pgn: usize, swp_fpn: usize) {
        self.forget(pgn);
        self.entries.insert(pgn, Pte::Swapped { swp_fpn });
    }

    /// Page `pgn` was loaded from swap into `fpn` without evicting anything
    pub fn page_in(&mut self, pgn: usize, fpn: usize) {
        self.map_present(pgn, fpn);
        self.faults += 1;
    }

    pub fn unmap(&mut self, pgn: usize) -> Option<Pte> {
        self.forget(pgn);
        self.entries.remove(&pgn)
    }

    /// Drop every entry, handing back what each page held
    pub fn drain(&mut self) -> Vec<(usize, Pte)> {
        self.fifo.clear();
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    /// Oldest page that is still present
    #[inline]
    pub fn find_victim(&self) -> Option<usize> {
        self.fifo.front().copied()
    }

    /// Reverse lookup: which page is resident in RAM frame `fpn`
    pub fn page_of_frame(&self, fpn: usize) -> Option<usize> {
        self.fifo
            .iter()
            .copied()
            .find(|&pgn| self.entry(pgn) == Some(Pte::Present { fpn }))
    }

    /// Resolve `pgn` to a RAM frame, paging it in from `swap` if needed.
    ///
    /// On a fault the oldest resident page of this directory is written to a
    /// fresh swap slot and the faulting page is loaded into the frame it
    /// vacated. Nothing is modified unless every step can complete.
    pub fn resolve(&mut self, pgn: usize, owner: Pid, ram: &mut MemPhy, swap: &mut MemPhy) -> Result<Resolution> {
        let tgt_swp = match self.entry(pgn) {
            None => return Err(Error::UnmappedPage(pgn)),
            Some(Pte::Present { fpn }) => return Ok(Resolution::Hit(fpn)),
            Some(Pte::Swapped { swp_fpn }) => swp_fpn,
        };

        let victim = self
            .find_victim()
            .ok_or(Error::OutOfMemory("no resident page to evict"))?;
        let vicfpn = match self.entry(victim) {
            Some(Pte::Present { fpn }) => fpn,
            _ => return Err(Error::UnmappedPage(victim)),
        };
        if ram.is_free(vicfpn) {
            return Err(Error::InvalidFrame(vicfpn));
        }

        // read both sides before anything is overwritten
        let victim_data = ram.read_frame(vicfpn)?;
        let target_data = swap.read_frame(tgt_swp)?;

        let swpfpn = swap
            .acquire_free_frame()
            .ok_or(Error::OutOfMemory("no free swap frame"))?;
        if let Err(err) = swap.write_frame(swpfpn, &victim_data) {
            swap.release_frame(swpfpn)?;
            return Err(err);
        }
        ram.write_frame(vicfpn, &target_data)?;

        swap.mark_used(swpfpn, owner)?;
        if let Err(err) = swap.release_frame(tgt_swp) {
            warn!("pid {}: stale swap slot {} for page {}: {}", owner, tgt_swp, pgn, err);
        }
        ram.remove_used(vicfpn);
        ram.mark_used(vicfpn, owner)?;

        self.set_swapped(victim, swpfpn);
        self.map_present(pgn, vicfpn);
        self.faults += 1;
        self.evictions += 1;

        debug!(
            "pid {}: page fault on {}, evicted page {} to swap {}, frame {}",
            owner, pgn, victim, swpfpn, vicfpn
        );
        Ok(Resolution::PageIn { fpn: vicfpn, victim })
    }

    /// Read one byte at a virtual address
    pub fn read_byte(&mut self, addr: usize, owner: Pid, ram: &mut MemPhy, swap: &mut MemPhy) -> Result<u8> {
        let va = VirtualAddress::checked(addr)?;
        let fpn = self.resolve(va.pgn, owner, ram, swap)?.fpn();
        ram.read(va.physical(fpn))
    }

    /// Write one byte at a virtual address
    pub fn write_byte(
        &mut self,
        addr: usize,
        value: u8,
        owner: Pid,
        ram: &mut MemPhy,
        swap: &mut MemPhy,
    ) -> Result<()> {
        let va = VirtualAddress::checked(addr)?;
        let fpn = self.resolve(va.pgn, owner, ram, swap)?.fpn();
        ram.write(va.physical(fpn), value)
    }

    /// One line per mapped page
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (pgn, pte) in self.entries() {
            let _ = match pte {
                Pte::Present { fpn } => writeln!(out, "{:05}: present fpn {}", pgn, fpn),
                Pte::Swapped { swp_fpn } => writeln!(out, "{:05}: swapped slot {}", pgn, swp_fpn),
            };
        }
        out
    }
}

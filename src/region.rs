//! Virtual memory areas and the byte-range allocator that lives inside them.
//!
//! Each VMA keeps a break pointer (`sbrk`) and a list of free ranges below it.
//! Requests are served first-fit from the free list; when nothing fits the
//! caller extends the VMA by whole pages and carves the request at the break.

use crate::constants::*;
use crate::error::{Error, Result};

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub start: usize,
    pub end: usize,
}

impl Region {
    #[inline]
    pub const fn new(start: usize, end: usize) -> Self {
        Region { start, end }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// `(0, 0)` marks an unallocated symbol slot and terminates free lists
    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    #[inline]
    pub fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// How a freed range was folded into the free list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesce {
    Inserted,
    MergedBelow,
    MergedAbove,
    Bridged,
}

#[derive(Debug, Clone)]
pub struct Vma {
    pub id: usize,
    pub vm_start: usize,
    pub vm_end: usize,
    pub sbrk: usize,
    /// head of the list is index 0
    free_list: Vec<Region>,
}

impl Vma {
    pub fn new(id: usize, vm_start: usize) -> Self {
        Vma {
            id,
            vm_start,
            vm_end: vm_start,
            sbrk: vm_start,
            free_list: Vec::new(),
        }
    }

    #[inline]
    pub fn span(&self) -> Region {
        Region::new(self.vm_start, self.vm_end)
    }

    pub fn free_regions(&self) -> &[Region] {
        &self.free_list
    }

    /// First-fit search of the free list. The request is carved from the
    /// start of the first range that is large enough.
    pub fn get_free_region(&mut self, size: usize) -> Option<Region> {
        let idx = self.free_list.iter().position(|rg| rg.len() >= size)?;
        let rg = &mut self.free_list[idx];
        let carved = Region::new(rg.start, rg.start + size);
        rg.start += size;
        if rg.is_empty() {
            self.free_list.remove(idx);
        }
        Some(carved)
    }

    /// Return a range to the free list, merging with neighbours that touch it
    pub fn enlist_free_region(&mut self, rg: Region) -> Result<Coalesce> {
        if rg.is_empty() {
            return Err(Error::InvalidSize(rg.len()));
        }

        let mut below = None;
        let mut above = None;
        for (idx, node) in self.free_list.iter().enumerate() {
            if node.is_sentinel() {
                break;
            }
            if node.end == rg.start {
                below = Some(idx);
            }
            if node.start == rg.end {
                above = Some(idx);
            }
        }

        let outcome = match (below, above) {
            (Some(lo), None) => {
                self.free_list[lo].end = rg.end;
                Coalesce::MergedBelow
            }
            (None, Some(hi)) => {
                self.free_list[hi].start = rg.start;
                Coalesce::MergedAbove
            }
            (Some(lo), Some(hi)) => {
                let bridged = Region::new(self.free_list[lo].start, self.free_list[hi].end);
                // remove the higher index first so the lower stays valid
                let (first, second) = if lo > hi { (lo, hi) } else { (hi, lo) };
                self.free_list.remove(first);
                self.free_list.remove(second);
                self.free_list.insert(0, bridged);
                Coalesce::Bridged
            }
            (None, None) => {
                self.free_list.insert(0, rg);
                Coalesce::Inserted
            }
        };
        Ok(outcome)
    }

    /// Bytes the VMA must grow by (page aligned) before `size` more bytes fit
    /// at the break. Zero when the request fits below `vm_end`.
    pub fn extension_for(&self, size: usize) -> usize {
        let want = self.sbrk + size;
        if want <= self.vm_end {
            0
        } else {
            align_up(want) - self.vm_end
        }
    }

    /// Carve `size` bytes at the break
    pub fn take_at_brk(&mut self, size: usize) -> Region {
        let rg = Region::new(self.sbrk, self.sbrk + size);
        self.sbrk += size;
        rg
    }

    #[inline]
    pub fn grow(&mut self, inc: usize) {
        self.vm_end += inc;
    }
}

/// Reject a planned `[start, end)` for `vmaid` that runs into another VMA
pub fn validate_overlap(vmas: &[Vma], vmaid: usize, start: usize, end: usize) -> Result<()> {
    let planned = Region::new(start, end);
    for vma in vmas.iter().filter(|vma| vma.id != vmaid) {
        // an empty VMA still claims its start address
        let claimed = Region::new(vma.vm_start, vma.vm_end.max(vma.vm_start + 1));
        if planned.overlaps(&claimed) {
            return Err(Error::AllocationOverlap {
                vma: vmaid,
                start,
                end,
                other: vma.id,
            });
        }
    }
    Ok(())
}

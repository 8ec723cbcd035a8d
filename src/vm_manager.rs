use std::collections::BTreeMap;
use std::fmt;

use log::{debug, trace, warn};

use crate::config::SimConfig;
use crate::constants::*;
use crate::error::{Error, Identity, Result};
use crate::memory::{copy_page, MemPhy};
use crate::region::{validate_overlap, Region, Vma};
use crate::tlb::TlbCache;
use crate::translation::{PageDirectory, Pte, Resolution, VirtualAddress};

/// Process identity, also used to tag frame ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn invalid(kind: Identity, id: usize) -> Error {
    Error::InvalidIdentity { kind, id }
}

/// Address-space state of one process
pub struct MmStruct {
    vmas: Vec<Vma>,
    symrgtbl: [Region; MAX_SYMTBL_SIZE],
    pub pgd: PageDirectory,
}

impl MmStruct {
    /// Fresh address space with VMA 0 starting at address 0
    pub fn new() -> Self {
        MmStruct {
            vmas: vec![Vma::new(0, 0)],
            symrgtbl: [Region::default(); MAX_SYMTBL_SIZE],
            pgd: PageDirectory::new(),
        }
    }

    pub fn vmas(&self) -> &[Vma] {
        &self.vmas
    }

    pub fn vma(&self, vmaid: usize) -> Result<&Vma> {
        self.vmas.get(vmaid).ok_or(invalid(Identity::Vma, vmaid))
    }

    pub fn vma_mut(&mut self, vmaid: usize) -> Result<&mut Vma> {
        self.vmas.get_mut(vmaid).ok_or(invalid(Identity::Vma, vmaid))
    }

    /// Add an empty VMA at `vm_start`; returns its id
    pub fn create_vma(&mut self, vm_start: usize) -> Result<usize> {
        let id = self.vmas.len();
        if vm_start >= MAX_VADDR || vm_start % PAGE_SIZE != 0 {
            return Err(Error::BadAddress {
                addr: vm_start,
                capacity: MAX_VADDR,
            });
        }
        validate_overlap(&self.vmas, id, vm_start, vm_start + 1)?;
        self.vmas.push(Vma::new(id, vm_start));
        Ok(id)
    }

    /// Region currently bound to `rgid`; `(0, 0)` when unallocated
    pub fn symbol(&self, rgid: usize) -> Result<Region> {
        self.symrgtbl
            .get(rgid)
            .copied()
            .ok_or(invalid(Identity::Region, rgid))
    }

    fn set_symbol(&mut self, rgid: usize, rg: Region) -> Result<()> {
        let slot = self
            .symrgtbl
            .get_mut(rgid)
            .ok_or(invalid(Identity::Region, rgid))?;
        *slot = rg;
        Ok(())
    }

    /// The VMA whose span contains `addr`
    fn vma_containing(&self, addr: usize) -> Option<usize> {
        self.vmas
            .iter()
            .find(|vma| vma.vm_start <= addr && addr < vma.vm_end)
            .map(|vma| vma.id)
    }
}

impl Default for MmStruct {
    fn default() -> Self {
        Self::new()
    }
}

/// Process descriptor as seen by the memory subsystem
pub struct Process {
    pub pid: Pid,
    pub mm: MmStruct,
    /// index into the manager's swap devices
    pub active_swap: usize,
    pub tlb: Option<TlbCache>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub page_faults: u64,
    /// pages pushed out to swap, by faults and by reclaims
    pub evictions: u64,
    pub reclaims: u64,
    pub tlb_hits: u64,
    pub tlb_misses: u64,
}

impl Stats {
    fn absorb(&mut self, proc: &Process) {
        self.page_faults += proc.mm.pgd.faults();
        self.evictions += proc.mm.pgd.evictions();
        if let Some(tlb) = proc.tlb.as_ref() {
            self.tlb_hits += tlb.hits();
            self.tlb_misses += tlb.misses();
        }
    }
}

/// Owns the RAM device, the swap devices and every live process
pub struct VmManager {
    ram: MemPhy,
    swaps: Vec<MemPhy>,
    procs: BTreeMap<Pid, Process>,
    tlb_enabled: bool,
    dump: bool,
    reclaims: u64,
    /// counters of processes that already terminated
    retired: Stats,
}

impl VmManager {
    pub fn new(ram: MemPhy, swaps: Vec<MemPhy>) -> Self {
        VmManager {
            ram,
            swaps,
            procs: BTreeMap::new(),
            tlb_enabled: false,
            dump: false,
            reclaims: 0,
            retired: Stats::default(),
        }
    }

    pub fn from_config(config: &SimConfig) -> Result<Self> {
        let (ram, swaps) = config.build_devices()?;
        Ok(Self::new(ram, swaps)
            .with_tlb(config.tlb)
            .with_dump(config.dump))
    }

    pub fn with_tlb(mut self, enabled: bool) -> Self {
        self.tlb_enabled = enabled;
        self
    }

    /// Log page tables and RAM contents after every access
    pub fn with_dump(mut self, enabled: bool) -> Self {
        self.dump = enabled;
        self
    }

    pub fn ram(&self) -> &MemPhy {
        &self.ram
    }

    pub fn swap(&self, idx: usize) -> Option<&MemPhy> {
        self.swaps.get(idx)
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid)
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.procs.keys().copied()
    }

    fn proc_mut(&mut self, pid: Pid) -> Result<&mut Process> {
        self.procs
            .get_mut(&pid)
            .ok_or(invalid(Identity::Process, pid.0 as usize))
    }

    fn proc_ref(&self, pid: Pid) -> Result<&Process> {
        self.procs
            .get(&pid)
            .ok_or(invalid(Identity::Process, pid.0 as usize))
    }

    pub fn stats(&self) -> Stats {
        let mut stats = self.retired;
        stats.reclaims = self.reclaims;
        for proc in self.procs.values() {
            stats.absorb(proc);
        }
        stats.evictions += self.reclaims;
        stats
    }

    /// Create an empty address space for `pid`
    pub fn spawn(&mut self, pid: Pid, active_swap: usize) -> Result<()> {
        if pid.0 >= MAX_PID || self.procs.contains_key(&pid) {
            return Err(invalid(Identity::Process, pid.0 as usize));
        }
        let tlb = if self.tlb_enabled {
            Some(TlbCache::new(pid, self.ram.capacity())?)
        } else {
            None
        };
        self.procs.insert(
            pid,
            Process {
                pid,
                mm: MmStruct::new(),
                active_swap,
                tlb,
            },
        );
        debug!("pid {}: spawned, swap device {}", pid, active_swap);
        Ok(())
    }

    pub fn create_vma(&mut self, pid: Pid, vm_start: usize) -> Result<usize> {
        self.proc_mut(pid)?.mm.create_vma(vm_start)
    }

    /// Allocate `size` bytes in VMA 0 and bind them to region `rgid`
    pub fn allocate(&mut self, pid: Pid, size: usize, rgid: usize) -> Result<usize> {
        self.alloc_in(pid, 0, size, rgid)
    }

    /// Allocate `size` bytes in `vmaid` and bind them to region `rgid`.
    /// Returns the start address of the region.
    pub fn alloc_in(&mut self, pid: Pid, vmaid: usize, size: usize, rgid: usize) -> Result<usize> {
        if size == 0 || size > MAX_VADDR {
            return Err(Error::InvalidSize(size));
        }
        let proc = self.proc_mut(pid)?;
        if !proc.mm.symbol(rgid)?.is_sentinel() {
            return Err(Error::RegionInUse(rgid));
        }

        if let Some(rg) = proc.mm.vma_mut(vmaid)?.get_free_region(size) {
            proc.mm.set_symbol(rgid, rg)?;
            debug!("pid {}: region {} reuses [{}, {})", pid, rgid, rg.start, rg.end);
            return Ok(rg.start);
        }

        let vma = proc.mm.vma(vmaid)?;
        let inc = vma.extension_for(size);
        let old_end = vma.vm_end;
        if inc > 0 {
            if old_end + inc > MAX_VADDR {
                return Err(Error::OutOfMemory("virtual address space exhausted"));
            }
            validate_overlap(proc.mm.vmas(), vmaid, old_end, old_end + inc)?;
            self.map_pages(pid, old_end, pages_for(inc))?;
        }

        let proc = self.proc_mut(pid)?;
        let vma = proc.mm.vma_mut(vmaid)?;
        vma.grow(inc);
        let rg = vma.take_at_brk(size);
        proc.mm.set_symbol(rgid, rg)?;
        debug!(
            "pid {}: region {} at [{}, {}), vma {} end {:#x} -> {:#x}",
            pid, rgid, rg.start, rg.end, vmaid, old_end, old_end + inc
        );
        Ok(rg.start)
    }

    /// Return region `rgid` to its VMA's free list. Frames stay mapped.
    pub fn free(&mut self, pid: Pid, rgid: usize) -> Result<()> {
        let proc = self.proc_mut(pid)?;
        let rg = proc.mm.symbol(rgid)?;
        if rg.is_empty() {
            return Err(invalid(Identity::Region, rgid));
        }
        let vmaid = proc
            .mm
            .vma_containing(rg.start)
            .ok_or(invalid(Identity::Vma, rg.start))?;
        let outcome = proc.mm.vma_mut(vmaid)?.enlist_free_region(rg)?;
        proc.mm.set_symbol(rgid, Region::default())?;
        debug!("pid {}: freed region {} [{}, {}) ({:?})", pid, rgid, rg.start, rg.end, outcome);
        Ok(())
    }

    /// Virtual address of `offset` inside region `rgid`, bounds checked
    fn region_addr(&self, pid: Pid, rgid: usize, offset: usize) -> Result<usize> {
        let rg = self.proc_ref(pid)?.mm.symbol(rgid)?;
        if offset >= rg.len() {
            return Err(Error::OutOfBounds {
                region: rgid,
                start: rg.start,
                end: rg.end,
                offset,
            });
        }
        Ok(rg.start + offset)
    }

    /// Read one byte of region `rgid`
    pub fn read(&mut self, pid: Pid, rgid: usize, offset: usize) -> Result<u8> {
        let addr = self.region_addr(pid, rgid, offset)?;
        self.load_without_victim(pid, VirtualAddress::checked(addr)?.pgn)?;
        let VmManager {
            ram, swaps, procs, ..
        } = &mut *self;
        let proc = procs
            .get_mut(&pid)
            .ok_or(invalid(Identity::Process, pid.0 as usize))?;
        let swap = swaps
            .get_mut(proc.active_swap)
            .ok_or(Error::DeviceUnavailable(proc.active_swap))?;

        let value = match proc.tlb.as_mut() {
            None => proc.mm.pgd.read_byte(addr, pid, ram, swap)?,
            Some(tlb) => {
                let va = VirtualAddress::checked(addr)?;
                let res = proc.mm.pgd.resolve(va.pgn, pid, ram, swap)?;
                if let Resolution::PageIn { fpn, .. } = res {
                    tlb.invalidate_frame(fpn);
                }
                tlb.read(ram, va.physical(res.fpn()))?
            }
        };
        trace!("pid {}: read region={} offset={} value={:#04x}", pid, rgid, offset, value);
        self.dump_state(pid);
        Ok(value)
    }

    /// Write one byte of region `rgid`
    pub fn write(&mut self, pid: Pid, rgid: usize, offset: usize, value: u8) -> Result<()> {
        let addr = self.region_addr(pid, rgid, offset)?;
        self.load_without_victim(pid, VirtualAddress::checked(addr)?.pgn)?;
        let VmManager {
            ram, swaps, procs, ..
        } = &mut *self;
        let proc = procs
            .get_mut(&pid)
            .ok_or(invalid(Identity::Process, pid.0 as usize))?;
        let swap = swaps
            .get_mut(proc.active_swap)
            .ok_or(Error::DeviceUnavailable(proc.active_swap))?;

        match proc.tlb.as_mut() {
            None => proc.mm.pgd.write_byte(addr, value, pid, ram, swap)?,
            Some(tlb) => {
                let va = VirtualAddress::checked(addr)?;
                let res = proc.mm.pgd.resolve(va.pgn, pid, ram, swap)?;
                if let Resolution::PageIn { fpn, .. } = res {
                    tlb.invalidate_frame(fpn);
                }
                tlb.write(ram, va.physical(res.fpn()), value)?;
            }
        }
        trace!("pid {}: write region={} offset={} value={:#04x}", pid, rgid, offset, value);
        self.dump_state(pid);
        Ok(())
    }

    /// A swapped page of a process with nothing resident has no victim to
    /// trade frames with. Load it into a frame from the RAM allocator.
    fn load_without_victim(&mut self, pid: Pid, pgn: usize) -> Result<()> {
        let proc = self.proc_ref(pid)?;
        let swp_fpn = match proc.mm.pgd.entry(pgn) {
            Some(Pte::Swapped { swp_fpn }) if proc.mm.pgd.find_victim().is_none() => swp_fpn,
            _ => return Ok(()),
        };
        let active = proc.active_swap;
        if active >= self.swaps.len() {
            return Err(Error::DeviceUnavailable(active));
        }

        let fpn = self.obtain_frame()?;
        let VmManager {
            ram, swaps, procs, ..
        } = &mut *self;
        let swap = swaps.get_mut(active).ok_or(Error::DeviceUnavailable(active))?;
        if let Err(err) = copy_page(swap, swp_fpn, ram, fpn) {
            ram.release_frame(fpn)?;
            return Err(err);
        }
        ram.mark_used(fpn, pid)?;
        if let Err(err) = swap.release_frame(swp_fpn) {
            warn!("pid {}: stale swap slot {} for page {}: {}", pid, swp_fpn, pgn, err);
        }

        let proc = procs
            .get_mut(&pid)
            .ok_or(invalid(Identity::Process, pid.0 as usize))?;
        proc.mm.pgd.page_in(pgn, fpn);
        if let Some(tlb) = proc.tlb.as_mut() {
            tlb.invalidate_frame(fpn);
        }
        debug!("pid {}: page fault on {} with nothing resident, loaded into frame {}", pid, pgn, fpn);
        Ok(())
    }

    fn dump_state(&self, pid: Pid) {
        if !self.dump {
            return;
        }
        if let Ok(table) = self.page_table_dump(pid) {
            trace!("pid {} page table:\n{}", pid, table);
        }
        trace!("{}", self.ram.dump());
    }

    /// Tear down `pid`, returning every RAM frame and swap slot it holds
    pub fn terminate(&mut self, pid: Pid) -> Result<()> {
        let mut proc = self
            .procs
            .remove(&pid)
            .ok_or(invalid(Identity::Process, pid.0 as usize))?;
        self.retired.absorb(&proc);
        if let Some(tlb) = proc.tlb.as_mut() {
            tlb.invalidate_all();
        }

        let mut swap = self.swaps.get_mut(proc.active_swap);
        for (pgn, pte) in proc.mm.pgd.drain() {
            let released = match pte {
                Pte::Present { fpn } => self.ram.release_frame(fpn),
                Pte::Swapped { swp_fpn } => match swap.as_deref_mut() {
                    Some(dev) => dev.release_frame(swp_fpn),
                    None => Err(Error::DeviceUnavailable(proc.active_swap)),
                },
            };
            if let Err(err) = released {
                warn!("pid {}: page {} not released: {}", pid, pgn, err);
            }
        }
        debug!("pid {}: terminated", pid);
        Ok(())
    }

    pub fn page_table_dump(&self, pid: Pid) -> Result<String> {
        Ok(self.proc_ref(pid)?.mm.pgd.dump())
    }

    pub fn ram_dump(&self) -> String {
        self.ram.dump()
    }

    /// Back `npages` pages starting at `start` with RAM frames. On failure
    /// every page mapped by this call is released again.
    fn map_pages(&mut self, pid: Pid, start: usize, npages: usize) -> Result<()> {
        let first = start >> OFFSET_BITS;
        let mut mapped = Vec::with_capacity(npages);
        for pgn in first..first + npages {
            if let Err(err) = self.map_page(pid, pgn) {
                self.unmap_pages(pid, &mapped);
                return Err(err);
            }
            mapped.push(pgn);
        }
        Ok(())
    }

    fn map_page(&mut self, pid: Pid, pgn: usize) -> Result<()> {
        let fpn = self.obtain_frame()?;
        if let Err(err) = self.ram.mark_used(fpn, pid) {
            self.ram.release_frame(fpn)?;
            return Err(err);
        }
        let proc = self.proc_mut(pid)?;
        proc.mm.pgd.map_present(pgn, fpn);
        if let Some(tlb) = proc.tlb.as_mut() {
            tlb.invalidate_frame(fpn);
        }
        trace!("pid {}: page {} -> frame {}", pid, pgn, fpn);
        Ok(())
    }

    fn unmap_pages(&mut self, pid: Pid, pages: &[usize]) {
        let Some(proc) = self.procs.get_mut(&pid) else {
            return;
        };
        for &pgn in pages {
            let released = match proc.mm.pgd.unmap(pgn) {
                Some(Pte::Present { fpn }) => self.ram.release_frame(fpn),
                Some(Pte::Swapped { swp_fpn }) => match self.swaps.get_mut(proc.active_swap) {
                    Some(dev) => dev.release_frame(swp_fpn),
                    None => Err(Error::DeviceUnavailable(proc.active_swap)),
                },
                None => Ok(()),
            };
            if let Err(err) = released {
                warn!("pid {}: rollback of page {} failed: {}", pid, pgn, err);
            }
        }
    }

    /// A RAM frame with no owner: from the free list, or reclaimed from the
    /// oldest used frame
    fn obtain_frame(&mut self) -> Result<usize> {
        match self.ram.acquire_free_frame() {
            Some(fpn) => Ok(fpn),
            None => self.reclaim_frame(),
        }
    }

    /// Push the page in the oldest used RAM frame out to its owner's swap
    /// device and hand the frame back unowned
    fn reclaim_frame(&mut self) -> Result<usize> {
        let oldest = self
            .ram
            .oldest_used()
            .ok_or(Error::OutOfMemory("no RAM frame to reclaim"))?;
        let fpn = oldest.fpn;

        let resident = self
            .procs
            .get_mut(&oldest.owner)
            .and_then(|proc| proc.mm.pgd.page_of_frame(fpn).map(|pgn| (proc, pgn)));
        let Some((proc, pgn)) = resident else {
            warn!("frame {} has no resident page, reclaiming as is", fpn);
            self.ram.remove_used(fpn);
            return Ok(fpn);
        };

        let swap = self
            .swaps
            .get_mut(proc.active_swap)
            .ok_or(Error::DeviceUnavailable(proc.active_swap))?;
        let slot = swap
            .acquire_free_frame()
            .ok_or(Error::OutOfMemory("no free swap frame"))?;
        if let Err(err) = copy_page(&mut self.ram, fpn, swap, slot) {
            swap.release_frame(slot)?;
            return Err(err);
        }
        swap.mark_used(slot, oldest.owner)?;

        proc.mm.pgd.set_swapped(pgn, slot);
        if let Some(tlb) = proc.tlb.as_mut() {
            tlb.invalidate_frame(fpn);
        }
        self.ram.remove_used(fpn);
        self.reclaims += 1;
        debug!(
            "reclaimed frame {} from pid {} page {} -> swap slot {}",
            fpn, oldest.owner, pgn, slot
        );
        Ok(fpn)
    }
}

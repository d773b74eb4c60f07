//! Disk swap: slot management and page eviction / restoration.
//!
//! The swap area is a fixed array of page-sized slots on block storage, one
//! slot per `SECTORS_PER_PAGE` sectors. Evicting a frame moves its whole
//! reverse-mapping list onto the slot; bringing it back re-installs the
//! mapping at every recorded `(process, va, perm)` and rebuilds the frame's
//! reverse index from scratch.

pub mod oom;
pub mod reclaim;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::arch::x86_64::apic;
use crate::err::{KResult, KernelError};
use crate::kinfo;
use crate::memory::frame::{AllocFlags, FrameState};
use crate::memory::layout::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::memory::phys::PhysState;
use crate::process::{ProcId, ProcStatus, ProcessTable};
use crate::traps::IPI_TLB_FLUSH;

/// Synchronous block-device contract (the IDE PIO driver on bare metal, a
/// RAM disk under test).
pub trait BlockDevice: Send {
    fn num_sectors(&self) -> u32;
    fn is_ready(&self) -> bool;
    fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]);
    fn write_sector(&mut self, lba: u32, buf: &[u8; SECTOR_SIZE]);
}

#[derive(Debug, Clone)]
pub struct SwapSlot {
    pub used: bool,
    /// Reverse-mapping list of the evicted frame (index into the pools).
    pub rmap: Option<u32>,
    next: Option<u32>,
}

pub struct SwapState {
    slots: Vec<SwapSlot>,
    free_head: Option<u32>,
    disk: Box<dyn BlockDevice>,
}

impl SwapState {
    pub fn new(disk: Box<dyn BlockDevice>) -> Self {
        let nslots = disk.num_sectors() as usize / SECTORS_PER_PAGE;
        kinfo!("swap: {} page slots on disk", nslots);
        let mut slots = Vec::with_capacity(nslots);
        for i in 0..nslots {
            slots.push(SwapSlot {
                used: false,
                rmap: None,
                next: if i + 1 < nslots {
                    Some(i as u32 + 1)
                } else {
                    None
                },
            });
        }
        SwapState {
            slots,
            free_head: if nslots > 0 { Some(0) } else { None },
            disk,
        }
    }

    pub fn nslots(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slots(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free_head;
        while let Some(i) = cur {
            n += 1;
            cur = self.slots[i as usize].next;
        }
        n
    }

    pub fn slot(&self, idx: u32) -> &SwapSlot {
        &self.slots[idx as usize]
    }

    pub fn slot_mut(&mut self, idx: u32) -> &mut SwapSlot {
        &mut self.slots[idx as usize]
    }

    fn alloc_slot(&mut self) -> Option<u32> {
        let idx = self.free_head?;
        self.free_head = self.slots[idx as usize].next;
        let s = &mut self.slots[idx as usize];
        s.used = true;
        s.rmap = None;
        s.next = None;
        Some(idx)
    }

    fn free_slot(&mut self, idx: u32) {
        let s = &mut self.slots[idx as usize];
        debug_assert!(s.used);
        s.used = false;
        s.rmap = None;
        s.next = self.free_head;
        self.free_head = Some(idx);
    }

    fn first_lba(&self, slot: u32) -> u32 {
        slot * SECTORS_PER_PAGE as u32
    }

    fn write_page(&mut self, slot: u32, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let lba0 = self.first_lba(slot);
        let mut buf = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            while !self.disk.is_ready() {
                core::hint::spin_loop();
            }
            buf.copy_from_slice(&data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            self.disk.write_sector(lba0 + i as u32, &buf);
        }
    }

    fn read_page(&mut self, slot: u32, out: &mut [u8]) {
        debug_assert_eq!(out.len(), PAGE_SIZE);
        let lba0 = self.first_lba(slot);
        let mut buf = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            while !self.disk.is_ready() {
                core::hint::spin_loop();
            }
            self.disk.read_sector(lba0 + i as u32, &mut buf);
            out[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
        }
    }
}

/// Evict a resident frame to disk.
///
/// The frame's contents go to a fresh slot, its reverse-mapping list moves
/// onto that slot, and every `(process, va)` that mapped it is unmapped,
/// which drives the reference count to zero and returns the frame to the
/// allocator. Processes running elsewhere get a TLB-flush IPI.
pub fn swap_out(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    pfn: u32,
    this_cpu: usize,
) -> KResult<()> {
    let slot = swap.alloc_slot().ok_or(KernelError::NoMem)?;

    let bytes = unsafe { phys.frame_bytes(pfn, PAGE_SIZE) };
    swap.write_page(slot, bytes);

    // Move the reverse list onto the slot before touching page tables, so
    // the unmap path below doesn't prune it entry by entry.
    let head = phys.frames.frame_mut(pfn).rmap.take();
    swap.slot_mut(slot).rmap = head;

    let entries = phys.rmap.collect(head);
    for &(proc, va, _perm) in &entries {
        let flush_cpu = {
            let Ok(p) = envs.get_mut(proc) else {
                continue;
            };
            let space = p.space.as_mut().expect("live process has a space");
            space.remove(phys, proc, va);
            space.stats.swapped += 1;
            if let Some(vma) = p.vmas.lookup_mut(va) {
                vma.swapped.insert(va, slot);
            }
            if p.status == ProcStatus::Running && p.cpu != this_cpu {
                Some(p.cpu)
            } else {
                None
            }
        };
        if let Some(cpu) = flush_cpu {
            apic::raise_ipi(envs.cpus[cpu].apic_id, IPI_TLB_FLUSH);
        }
    }

    debug_assert_eq!(
        phys.frames.frame(pfn).state,
        FrameState::Free,
        "swapped-out frame still referenced"
    );
    Ok(())
}

/// Bring a slot's page back into memory and re-install every mapping the
/// slot recorded, with the original permissions.
pub fn swap_in(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    slot: u32,
) -> KResult<u32> {
    let pfn = phys.page_alloc(AllocFlags::empty())?;
    {
        let bytes = unsafe { phys.frame_bytes(pfn, PAGE_SIZE) };
        swap.read_page(slot, bytes);
    }

    let mut head = swap.slot_mut(slot).rmap.take();
    swap.free_slot(slot);

    let entries = phys.rmap.collect(head);
    // The recorded nodes are rebuilt by `insert`; recycle the old chain.
    phys.rmap.release_chain(&mut head);

    for &(proc, va, perm) in &entries {
        let Ok(p) = envs.get_mut(proc) else {
            continue;
        };
        let space = p.space.as_mut().expect("live process has a space");
        space.insert(phys, proc, pfn, va, perm)?;
        space.stats.swapped -= 1;
        if let Some(vma) = p.vmas.lookup_mut(va) {
            vma.swapped.remove(&va);
        }
    }

    phys.lru_push(pfn);
    Ok(pfn)
}

/// Drop one `(process, va)` reference from a slot (VMA destruction or
/// process teardown); the slot is freed once nothing references it.
pub fn slot_forget(phys: &mut PhysState, swap: &mut SwapState, slot: u32, proc: ProcId, va: u64) {
    let mut head = swap.slot_mut(slot).rmap.take();
    phys.rmap.remove(&mut head, proc, va);
    swap.slot_mut(slot).rmap = head;
    if head.is_none() {
        swap.free_slot(slot);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub struct MemDisk {
        sectors: Vec<[u8; SECTOR_SIZE]>,
    }

    impl MemDisk {
        pub fn new(nsectors: usize) -> Self {
            MemDisk {
                sectors: alloc::vec![[0u8; SECTOR_SIZE]; nsectors],
            }
        }
    }

    impl BlockDevice for MemDisk {
        fn num_sectors(&self) -> u32 {
            self.sectors.len() as u32
        }
        fn is_ready(&self) -> bool {
            true
        }
        fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) {
            buf.copy_from_slice(&self.sectors[lba as usize]);
        }
        fn write_sector(&mut self, lba: u32, buf: &[u8; SECTOR_SIZE]) {
            self.sectors[lba as usize].copy_from_slice(buf);
        }
    }

    pub fn swap_with_slots(nslots: usize) -> SwapState {
        SwapState::new(Box::new(MemDisk::new(nslots * SECTORS_PER_PAGE)))
    }
}

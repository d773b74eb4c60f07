//! Per-process four-level address spaces.
//!
//! The bottom half (below `USER_TOP`) differs per process; the top half is
//! copied from the kernel template root at creation time and shared. All
//! table frames come from the frame allocator and are reference counted like
//! any other frame; per-space counters track mapped pages, table pages and
//! swapped pages for the OOM killer.
//!
//! Page-table entries are reached through the physical direct map, so every
//! operation here also runs unchanged against the test arena.

use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags as PtF};
use x86_64::PhysAddr;

use bitflags::bitflags;
use spin::Once;

use crate::arch::x86_64 as arch;
use crate::err::KResult;
use crate::memory::frame::AllocFlags;
use crate::memory::layout::{HUGE_PAGE_SIZE, KERNEL_BASE, PAGE_SIZE, SMALL_PER_HUGE, USER_TOP};
use crate::memory::phys::PhysState;
use crate::process::ProcId;

bitflags! {
    /// Mapping permissions, bit-compatible with the hardware encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagePerm: u64 {
        const WRITE   = 1 << 1;
        const USER    = 1 << 2;
        /// 2 MiB mapping.
        const HUGE    = 1 << 7;
        const NO_EXEC = 1 << 63;
    }
}

impl PagePerm {
    pub fn to_flags(self) -> PtF {
        let mut f = PtF::PRESENT;
        if self.contains(PagePerm::WRITE) {
            f |= PtF::WRITABLE;
        }
        if self.contains(PagePerm::USER) {
            f |= PtF::USER_ACCESSIBLE;
        }
        if self.contains(PagePerm::HUGE) {
            f |= PtF::HUGE_PAGE;
        }
        if self.contains(PagePerm::NO_EXEC) {
            f |= PtF::NO_EXECUTE;
        }
        f
    }

    pub fn from_flags(f: PtF) -> Self {
        let mut p = PagePerm::empty();
        if f.contains(PtF::WRITABLE) {
            p |= PagePerm::WRITE;
        }
        if f.contains(PtF::USER_ACCESSIBLE) {
            p |= PagePerm::USER;
        }
        if f.contains(PtF::HUGE_PAGE) {
            p |= PagePerm::HUGE;
        }
        if f.contains(PtF::NO_EXECUTE) {
            p |= PagePerm::NO_EXEC;
        }
        p
    }
}

/// Flags for interior (non-leaf) table entries: leaves decide the effective
/// permission.
fn table_flags() -> PtF {
    PtF::PRESENT | PtF::WRITABLE | PtF::USER_ACCESSIBLE
}

#[inline]
fn l4_index(va: u64) -> usize {
    ((va >> 39) & 0x1ff) as usize
}
#[inline]
fn l3_index(va: u64) -> usize {
    ((va >> 30) & 0x1ff) as usize
}
#[inline]
fn l2_index(va: u64) -> usize {
    ((va >> 21) & 0x1ff) as usize
}
#[inline]
fn l1_index(va: u64) -> usize {
    ((va >> 12) & 0x1ff) as usize
}

/// Entry span at prune depth: 3 = PML4 entry, 0 = PT entry.
#[inline]
fn span(level: u8) -> u64 {
    1u64 << (12 + 9 * level as u64)
}

unsafe fn table_mut(phys: &PhysState, pa: u64) -> &'static mut PageTable {
    &mut *(phys.kva(pa) as *mut PageTable)
}

/// Kernel root used as the template for the shared top half of every new
/// address space; set once during bring-up.
static KERNEL_ROOT: Once<u64> = Once::new();

pub fn set_kernel_root(root_pa: u64) {
    KERNEL_ROOT.call_once(|| root_pa);
}

pub fn kernel_root() -> Option<u64> {
    KERNEL_ROOT.get().copied()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SpaceStats {
    /// Mapped user pages, in 4 KiB units.
    pub mapped: usize,
    /// Page-table pages, including the root.
    pub tables: usize,
    /// Pages currently out on swap.
    pub swapped: usize,
}

pub struct AddressSpace {
    root_pa: u64,
    pub stats: SpaceStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkCreate {
    Normal,
    Huge,
}

impl AddressSpace {
    /// Allocate a zeroed root and share the kernel half into it.
    pub fn new(phys: &mut PhysState) -> KResult<Self> {
        let root = phys.page_alloc(AllocFlags::ZERO)?;
        phys.page_incref(root);
        let root_pa = PhysState::pa_of(root);
        if let Some(kroot) = kernel_root() {
            let src = unsafe { table_mut(phys, kroot) };
            let dst = unsafe { table_mut(phys, root_pa) };
            for i in l4_index(KERNEL_BASE)..512 {
                dst[i].set_addr(src[i].addr(), src[i].flags());
            }
        }
        Ok(AddressSpace {
            root_pa,
            stats: SpaceStats {
                mapped: 0,
                tables: 1,
                swapped: 0,
            },
        })
    }

    pub fn root_pa(&self) -> u64 {
        self.root_pa
    }

    /// Invalidate `va` on the executing CPU if this space is active there.
    /// Remote CPUs are handled by the callers that know where the owning
    /// process runs (swap-out, OOM) via the flush IPI.
    fn invalidate(&self, va: u64) {
        if arch::current_root() == self.root_pa {
            arch::invlpg(va);
        }
    }

    /// Descend to the entry mapping `va`. With `create`, missing interior
    /// tables are allocated (and counted); `WalkCreate::Huge` stops at the
    /// page-directory level.
    ///
    /// Without `create`, returns the present leaf entry: the L2 entry for a
    /// huge mapping, the L1 entry otherwise.
    pub fn walk(
        &mut self,
        phys: &mut PhysState,
        va: u64,
        create: Option<WalkCreate>,
    ) -> KResult<Option<&'static mut PageTableEntry>> {
        let l4 = unsafe { table_mut(phys, self.root_pa) };
        let Some(l3_pa) = self.step(phys, &mut l4[l4_index(va)], create.is_some())? else {
            return Ok(None);
        };
        let l3 = unsafe { table_mut(phys, l3_pa) };
        let Some(l2_pa) = self.step(phys, &mut l3[l3_index(va)], create.is_some())? else {
            return Ok(None);
        };
        let l2 = unsafe { table_mut(phys, l2_pa) };
        let l2e = &mut l2[l2_index(va)];

        if create == Some(WalkCreate::Huge) || l2e.flags().contains(PtF::HUGE_PAGE) {
            let l2e = unsafe { &mut *(l2e as *mut PageTableEntry) };
            return Ok(Some(l2e));
        }

        let Some(l1_pa) = self.step(phys, l2e, create.is_some())? else {
            return Ok(None);
        };
        let l1 = unsafe { table_mut(phys, l1_pa) };
        let l1e = unsafe { &mut *(&mut l1[l1_index(va)] as *mut PageTableEntry) };
        Ok(Some(l1e))
    }

    /// Follow one interior entry, allocating a zeroed table when asked.
    fn step(
        &mut self,
        phys: &mut PhysState,
        entry: &mut PageTableEntry,
        create: bool,
    ) -> KResult<Option<u64>> {
        if entry.is_unused() {
            if !create {
                return Ok(None);
            }
            let pfn = phys.page_alloc(AllocFlags::ZERO)?;
            phys.page_incref(pfn);
            self.stats.tables += 1;
            entry.set_addr(PhysAddr::new(PhysState::pa_of(pfn)), table_flags());
            return Ok(Some(PhysState::pa_of(pfn)));
        }
        debug_assert!(!entry.flags().contains(PtF::HUGE_PAGE));
        Ok(Some(entry.addr().as_u64()))
    }

    /// Present leaf at `va`: `(pfn, entry, huge)`.
    pub fn lookup(
        &mut self,
        phys: &mut PhysState,
        va: u64,
    ) -> Option<(u32, &'static mut PageTableEntry, bool)> {
        let entry = self.walk(phys, va, None).ok().flatten()?;
        if !entry.flags().contains(PtF::PRESENT) {
            return None;
        }
        let huge = entry.flags().contains(PtF::HUGE_PAGE);
        let pfn = PhysState::pfn_of(entry.addr().as_u64());
        Some((pfn, entry, huge))
    }

    /// Map `pfn` at `va`. Increments the frame's reference count, maintains
    /// the reverse index, and replaces whatever was mapped there before,
    /// including the whole set of small mappings under a new huge entry.
    pub fn insert(
        &mut self,
        phys: &mut PhysState,
        proc: ProcId,
        pfn: u32,
        va: u64,
        perm: PagePerm,
    ) -> KResult<()> {
        let huge = perm.contains(PagePerm::HUGE);
        let units = if huge { SMALL_PER_HUGE } else { 1 };
        let align: u64 = if huge {
            HUGE_PAGE_SIZE as u64
        } else {
            PAGE_SIZE as u64
        };
        debug_assert_eq!(va % align, 0);

        let create = if huge {
            WalkCreate::Huge
        } else {
            WalkCreate::Normal
        };
        let mut entry: &mut PageTableEntry =
            self.walk(phys, va, Some(create))?.expect("created walk");

        // A huge insert swallows an existing page table covering the window.
        if huge && !entry.is_unused() && !entry.flags().contains(PtF::HUGE_PAGE) {
            let pt_pa = entry.addr().as_u64();
            self.clear_leaf_table(phys, proc, pt_pa, va);
            entry.set_unused();
        }

        // The inverse: a small insert under an existing huge leaf drops the
        // whole 2 MiB mapping first, then builds the missing L1 level.
        if !huge && entry.flags().contains(PtF::HUGE_PAGE) {
            let old = PhysState::pfn_of(entry.addr().as_u64());
            let hbase = va & !(HUGE_PAGE_SIZE as u64 - 1);
            entry.set_unused();
            self.drop_leaf(phys, proc, old, hbase, SMALL_PER_HUGE);
            self.invalidate(hbase);
            entry = self
                .walk(phys, va, Some(WalkCreate::Normal))?
                .expect("created walk");
        }

        if !entry.is_unused() {
            let old_pfn = PhysState::pfn_of(entry.addr().as_u64());
            if old_pfn == pfn {
                // Same frame: permission change only.
                entry.set_addr(entry.addr(), perm.to_flags());
                let head = phys.frames.frame(pfn).rmap;
                phys.rmap.update_perm(head, proc, va, perm);
                self.invalidate(va);
                return Ok(());
            }
            self.drop_leaf(phys, proc, old_pfn, va, units);
        }

        phys.page_incref(pfn);
        let mut head = phys.frames.frame(pfn).rmap;
        phys.rmap.add(&mut head, proc, va, perm)?;
        phys.frames.frame_mut(pfn).rmap = head;
        entry.set_addr(PhysAddr::new(PhysState::pa_of(pfn)), perm.to_flags());
        self.stats.mapped += units;
        self.invalidate(va);
        Ok(())
    }

    /// Unmap the leaf covering `va` if present.
    pub fn remove(&mut self, phys: &mut PhysState, proc: ProcId, va: u64) {
        let Some((pfn, entry, huge)) = self.lookup(phys, va) else {
            return;
        };
        let (units, leaf_va) = if huge {
            (SMALL_PER_HUGE, va & !(HUGE_PAGE_SIZE as u64 - 1))
        } else {
            (1, va & !(PAGE_SIZE as u64 - 1))
        };
        entry.set_unused();
        self.drop_leaf(phys, proc, pfn, leaf_va, units);
        self.invalidate(leaf_va);
    }

    /// Bookkeeping common to unmapping: reverse index, counters, refcount.
    fn drop_leaf(&mut self, phys: &mut PhysState, proc: ProcId, pfn: u32, va: u64, units: usize) {
        let mut head = phys.frames.frame(pfn).rmap;
        phys.rmap.remove(&mut head, proc, va);
        phys.frames.frame_mut(pfn).rmap = head;
        self.stats.mapped -= units;
        phys.page_decref(pfn);
    }

    /// Check-and-clear the accessed bit of the leaf covering `va` (CLOCK
    /// second chance). True when the bit was set.
    pub fn clear_accessed(&mut self, phys: &mut PhysState, va: u64) -> bool {
        if let Some((_, entry, _)) = self.lookup(phys, va) {
            let flags = entry.flags();
            if flags.contains(PtF::ACCESSED) {
                entry.set_flags(flags - PtF::ACCESSED);
                self.invalidate(va);
                return true;
            }
        }
        false
    }

    /// Rewrite the permission bits of a present leaf.
    pub fn protect(&mut self, phys: &mut PhysState, proc: ProcId, va: u64, perm: PagePerm) {
        if let Some((pfn, entry, huge)) = self.lookup(phys, va) {
            let mut p = perm;
            if huge {
                p |= PagePerm::HUGE;
            }
            entry.set_addr(entry.addr(), p.to_flags());
            let head = phys.frames.frame(pfn).rmap;
            phys.rmap.update_perm(head, proc, va, p);
            self.invalidate(va);
        }
    }

    /// Unmap every small leaf under one L1 table and free the table itself
    /// (huge-insert replacement path).
    fn clear_leaf_table(&mut self, phys: &mut PhysState, proc: ProcId, pt_pa: u64, base_va: u64) {
        let pt = unsafe { table_mut(phys, pt_pa) };
        for i in 0..512 {
            let e = &mut pt[i];
            if e.is_unused() {
                continue;
            }
            let pfn = PhysState::pfn_of(e.addr().as_u64());
            let va = (base_va & !(HUGE_PAGE_SIZE as u64 - 1)) + (i as u64 * PAGE_SIZE as u64);
            e.set_unused();
            self.drop_leaf(phys, proc, pfn, va, 1);
            self.invalidate(va);
        }
        self.stats.tables -= 1;
        phys.page_decref(PhysState::pfn_of(pt_pa));
    }

    /// Unmap `[va, va + len)` and collapse interior tables that emptied.
    pub fn unmap_range(&mut self, phys: &mut PhysState, proc: ProcId, va: u64, len: usize) {
        let lo = va;
        let hi = va + len as u64;
        let root_pa = self.root_pa;
        self.prune(phys, proc, root_pa, 3, 0, lo, hi);
    }

    /// Tear the whole user half down; the root itself survives until
    /// `release_root`.
    pub fn free_tree(&mut self, phys: &mut PhysState, proc: ProcId) {
        let root_pa = self.root_pa;
        self.prune(phys, proc, root_pa, 3, 0, 0, USER_TOP);
    }

    /// Give the root frame back. The space must not be used afterwards.
    pub fn release_root(mut self, phys: &mut PhysState) {
        self.stats.tables -= 1;
        phys.page_decref(PhysState::pfn_of(self.root_pa));
        self.root_pa = 0;
    }

    /// Recursive walk removing leaves inside `[lo, hi)` and freeing interior
    /// tables that become empty. Returns whether `table_pa` is empty now.
    /// Only the user half is ever visited: `hi` is capped at `USER_TOP`.
    #[allow(clippy::too_many_arguments)]
    fn prune(
        &mut self,
        phys: &mut PhysState,
        proc: ProcId,
        table_pa: u64,
        level: u8,
        base_va: u64,
        lo: u64,
        hi: u64,
    ) -> bool {
        let hi = hi.min(USER_TOP);
        let table = unsafe { table_mut(phys, table_pa) };
        let mut empty = true;
        for i in 0..512usize {
            let entry_va = base_va + i as u64 * span(level);
            let entry_end = entry_va + span(level);
            let e = unsafe { &mut *(&mut table[i] as *mut PageTableEntry) };
            if e.is_unused() {
                continue;
            }
            if entry_end <= lo || entry_va >= hi {
                empty = false;
                continue;
            }
            let is_leaf = level == 0 || (level == 1 && e.flags().contains(PtF::HUGE_PAGE));
            if is_leaf {
                if entry_va >= lo && entry_end <= hi {
                    let pfn = PhysState::pfn_of(e.addr().as_u64());
                    let units = if level == 1 { SMALL_PER_HUGE } else { 1 };
                    e.set_unused();
                    self.drop_leaf(phys, proc, pfn, entry_va, units);
                    self.invalidate(entry_va);
                } else {
                    // Partially covered huge leaf: kept (callers align
                    // ranges to the mapping size).
                    empty = false;
                }
                continue;
            }
            let child_pa = e.addr().as_u64();
            if self.prune(phys, proc, child_pa, level - 1, entry_va, lo, hi) {
                e.set_unused();
                self.stats.tables -= 1;
                phys.page_decref(PhysState::pfn_of(child_pa));
            } else {
                empty = false;
            }
        }
        empty
    }
}

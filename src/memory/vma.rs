//! Per-process virtual memory areas.
//!
//! A fixed-capacity table of up to `NVMA` areas kept strictly ascending by
//! base address with no overlaps; the vector's spare capacity is the pool of
//! unused slots. Anonymous areas are zero-filled on demand; binary areas
//! carry a source extent in kernel memory so a faulting page copies the
//! intersection and leaves the rest zero (bss semantics).
//!
//! Each area also tracks which of its pages currently live on swap.

use alloc::vec::Vec;
use arrayvec::ArrayVec;
use hashbrown::HashMap;

use crate::err::{KResult, KernelError};
use crate::memory::addrspace::{AddressSpace, PagePerm};
use crate::memory::frame::AllocFlags;
use crate::memory::layout::{
    align_down, align_up, HUGE_PAGE_SIZE, NVMA, PAGE_SIZE, USER_TOP,
};
use crate::memory::phys::PhysState;
use crate::process::ProcId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    Anon,
    /// Backed by a range of kernel memory (an ELF segment image).
    Binary {
        /// Kernel virtual address of the segment bytes.
        src: u64,
        /// Bytes present in the image; the tail up to `dst_len` is bss.
        src_len: usize,
        /// Unaligned user destination of the segment.
        dst: u64,
        dst_len: usize,
    },
}

#[derive(Debug, Clone)]
pub struct Vma {
    pub kind: VmaKind,
    /// Page-aligned base.
    pub va: u64,
    /// Page-aligned length.
    pub len: usize,
    pub perm: PagePerm,
    /// Pages of this area currently out on swap: page va → slot index.
    pub swapped: HashMap<u64, u32>,
}

impl Vma {
    pub fn end(&self) -> u64 {
        self.va + self.len as u64
    }

    pub fn contains(&self, va: u64) -> bool {
        va >= self.va && va < self.end()
    }
}

/// Range handed back by `destroy` so the caller can unmap pages and release
/// swap slots.
#[derive(Debug, PartialEq)]
pub struct DestroyedRange {
    pub va: u64,
    pub len: usize,
    /// Swapped pages that fell inside the destroyed range.
    pub swapped: Vec<(u64, u32)>,
}

#[derive(Clone)]
pub struct VmaTable {
    vmas: ArrayVec<Vma, NVMA>,
}

impl VmaTable {
    pub fn new() -> Self {
        VmaTable {
            vmas: ArrayVec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Vma> {
        self.vmas.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.vmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    /// Insert a new area. `va` is rounded down and `va + len` up to page
    /// granularity; the rounded range must not overlap any used area and a
    /// free slot must remain.
    pub fn insert(
        &mut self,
        kind: VmaKind,
        va: u64,
        len: usize,
        perm: PagePerm,
    ) -> KResult<usize> {
        if len == 0 {
            return Err(KernelError::Invalid);
        }
        let start = align_down(va, PAGE_SIZE as u64);
        let end = align_up(va + len as u64, PAGE_SIZE as u64);
        if end > USER_TOP {
            return Err(KernelError::Invalid);
        }
        if self.vmas.is_full() {
            return Err(KernelError::NoMem);
        }
        let idx = self.vmas.partition_point(|v| v.end() <= start);
        if let Some(next) = self.vmas.get(idx) {
            if next.va < end {
                return Err(KernelError::Invalid);
            }
        }
        self.vmas.insert(
            idx,
            Vma {
                kind,
                va: start,
                len: (end - start) as usize,
                perm,
                swapped: HashMap::new(),
            },
        );
        Ok(idx)
    }

    /// The used area covering `va`, if any. `NVMA` is small; a linear scan
    /// is fine.
    pub fn lookup(&self, va: u64) -> Option<&Vma> {
        self.vmas.iter().find(|v| v.contains(va))
    }

    pub fn lookup_mut(&mut self, va: u64) -> Option<&mut Vma> {
        self.vmas.iter_mut().find(|v| v.contains(va))
    }

    /// Remove `[va, va + size)` from the single area containing it. The
    /// start is rounded up and the end down, so only whole pages inside the
    /// request disappear. Shrinks from either end or splits in two.
    pub fn destroy(&mut self, va: u64, size: usize) -> KResult<DestroyedRange> {
        let start = align_up(va, PAGE_SIZE as u64);
        let end = align_down(va + size as u64, PAGE_SIZE as u64);
        if start >= end {
            return Err(KernelError::Invalid);
        }
        let idx = self
            .vmas
            .iter()
            .position(|v| v.contains(start))
            .ok_or(KernelError::Invalid)?;
        if end > self.vmas[idx].end() {
            return Err(KernelError::Invalid);
        }

        let len = (end - start) as usize;
        let mut gone = Vec::new();
        {
            let vma = &mut self.vmas[idx];
            let keys: Vec<u64> = vma.swapped.keys().copied().collect();
            for k in keys {
                if k >= start && k < end {
                    let slot = vma.swapped.remove(&k).expect("key just listed");
                    gone.push((k, slot));
                }
            }
        }

        let (vma_va, vma_end) = (self.vmas[idx].va, self.vmas[idx].end());
        if start == vma_va && end == vma_end {
            self.vmas.remove(idx);
        } else if start == vma_va {
            let vma = &mut self.vmas[idx];
            vma.va = end;
            vma.len -= len;
        } else if end == vma_end {
            self.vmas[idx].len -= len;
        } else {
            // Middle cut: keep the head in place, grow a tail area.
            if self.vmas.is_full() {
                return Err(KernelError::NoMem);
            }
            let tail = {
                let vma = &mut self.vmas[idx];
                let tail_va = end;
                let tail_len = (vma.end() - end) as usize;
                let keys: Vec<u64> = vma
                    .swapped
                    .keys()
                    .copied()
                    .filter(|k| *k >= tail_va)
                    .collect();
                let tail_swapped: HashMap<u64, u32> = keys
                    .iter()
                    .map(|k| (*k, vma.swapped.remove(k).expect("key just listed")))
                    .collect();
                vma.len = (start - vma.va) as usize;
                Vma {
                    kind: vma.kind,
                    va: tail_va,
                    len: tail_len,
                    perm: vma.perm,
                    swapped: tail_swapped,
                }
            };
            self.vmas.insert(idx + 1, tail);
        }

        Ok(DestroyedRange {
            va: start,
            len,
            swapped: gone,
        })
    }

    /// First gap of `len` bytes below `USER_TOP`: before the first area,
    /// between consecutive areas, or after the last. Page 0 stays unmapped.
    pub fn find_gap(&self, len: usize) -> Option<u64> {
        let len = align_up(len as u64, PAGE_SIZE as u64);
        let mut prev_end = PAGE_SIZE as u64;
        for v in &self.vmas {
            if v.va >= prev_end && v.va - prev_end >= len {
                return Some(prev_end);
            }
            prev_end = prev_end.max(v.end());
        }
        if USER_TOP > prev_end && USER_TOP - prev_end >= len {
            return Some(prev_end);
        }
        None
    }

    /// Ordering invariant: strictly ascending, non-overlapping.
    pub fn check(&self) {
        for w in self.vmas.windows(2) {
            assert!(w[0].end() <= w[1].va);
        }
    }
}

/// Eagerly allocate and install frames for `[va, va + len)` in `space`.
/// Huge-page areas step in 2 MiB strides.
pub fn map_populate(
    phys: &mut PhysState,
    space: &mut AddressSpace,
    proc: ProcId,
    va: u64,
    len: usize,
    perm: PagePerm,
) -> KResult<()> {
    let huge = perm.contains(PagePerm::HUGE);
    let step = if huge { HUGE_PAGE_SIZE } else { PAGE_SIZE };
    let mut flags = AllocFlags::ZERO;
    if huge {
        flags |= AllocFlags::HUGE;
    }
    let mut cur = va;
    while cur < va + len as u64 {
        let pfn = phys.page_alloc(flags)?;
        space.insert(phys, proc, pfn, cur, perm)?;
        phys.lru_push(pfn);
        cur += step as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw() -> PagePerm {
        PagePerm::USER | PagePerm::WRITE
    }

    fn table_with(ranges: &[(u64, usize)]) -> VmaTable {
        let mut t = VmaTable::new();
        for (va, len) in ranges {
            t.insert(VmaKind::Anon, *va, *len, rw()).unwrap();
        }
        t
    }

    #[test]
    fn insert_keeps_strict_order() {
        let t = table_with(&[(0x8000, 0x1000), (0x2000, 0x1000), (0x5000, 0x2000)]);
        let bases: Vec<u64> = t.iter().map(|v| v.va).collect();
        assert_eq!(bases, alloc::vec![0x2000, 0x5000, 0x8000]);
        t.check();
    }

    #[test]
    fn insert_rounds_and_refuses_overlap() {
        let mut t = VmaTable::new();
        t.insert(VmaKind::Anon, 0x2100, 0x800, rw()).unwrap();
        let v = t.lookup(0x2000).unwrap();
        assert_eq!(v.va, 0x2000);
        assert_eq!(v.len, 0x1000);
        // Overlapping the rounded range is refused.
        assert_eq!(
            t.insert(VmaKind::Anon, 0x2800, 0x1000, rw()),
            Err(KernelError::Invalid)
        );
    }

    #[test]
    fn lookup_misses_outside() {
        let t = table_with(&[(0x2000, 0x2000)]);
        assert!(t.lookup(0x1fff).is_none());
        assert!(t.lookup(0x4000).is_none());
        assert!(t.lookup(0x3fff).is_some());
    }

    #[test]
    fn destroy_whole_and_shrink_edges() {
        let mut t = table_with(&[(0x2000, 0x3000), (0x8000, 0x3000), (0x10000, 0x3000)]);
        // Whole area.
        let r = t.destroy(0x8000, 0x3000).unwrap();
        assert_eq!((r.va, r.len), (0x8000, 0x3000));
        assert_eq!(t.len(), 2);
        // Shrink front.
        t.destroy(0x2000, 0x1000).unwrap();
        assert_eq!(t.lookup(0x3000).unwrap().va, 0x3000);
        assert!(t.lookup(0x2000).is_none());
        // Shrink back.
        t.destroy(0x12000, 0x1000).unwrap();
        assert_eq!(t.lookup(0x10000).unwrap().len, 0x2000);
        t.check();
    }

    #[test]
    fn destroy_middle_splits() {
        let mut t = table_with(&[(0x10000, 0x6000)]);
        let r = t.destroy(0x12000, 0x2000).unwrap();
        assert_eq!((r.va, r.len), (0x12000, 0x2000));
        assert_eq!(t.len(), 2);
        assert_eq!(t.lookup(0x10000).unwrap().len, 0x2000);
        assert_eq!(t.lookup(0x14000).unwrap().len, 0x2000);
        assert!(t.lookup(0x12000).is_none());
        t.check();
    }

    #[test]
    fn destroy_across_areas_is_invalid() {
        let mut t = table_with(&[(0x2000, 0x2000), (0x4000, 0x2000)]);
        assert_eq!(t.destroy(0x3000, 0x2000), Err(KernelError::Invalid));
        assert_eq!(t.destroy(0x7000, 0x1000), Err(KernelError::Invalid));
    }

    #[test]
    fn destroy_moves_swapped_entries() {
        let mut t = table_with(&[(0x10000, 0x6000)]);
        let v = t.lookup_mut(0x10000).unwrap();
        v.swapped.insert(0x10000, 1);
        v.swapped.insert(0x12000, 2);
        v.swapped.insert(0x14000, 3);
        let r = t.destroy(0x12000, 0x2000).unwrap();
        assert_eq!(r.swapped, alloc::vec![(0x12000, 2)]);
        assert_eq!(t.lookup(0x10000).unwrap().swapped.get(&0x10000), Some(&1));
        assert_eq!(t.lookup(0x14000).unwrap().swapped.get(&0x14000), Some(&3));
    }

    #[test]
    fn find_gap_scans_all_positions() {
        let mut t = VmaTable::new();
        // Empty table: lowest usable page.
        assert_eq!(t.find_gap(0x2000), Some(PAGE_SIZE as u64));
        t.insert(VmaKind::Anon, PAGE_SIZE as u64, 0x2000, rw()).unwrap();
        t.insert(VmaKind::Anon, 0x6000, 0x1000, rw()).unwrap();
        // Gap between the two areas.
        assert_eq!(t.find_gap(0x3000), Some(0x3000));
        // Too large for that hole: lands after the last area.
        assert_eq!(t.find_gap(0x10000), Some(0x7000));
    }
}

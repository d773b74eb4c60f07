//! Copy-on-write fork.
//!
//! The child gets a copy of the caller's VMA list and page-table tree: new
//! root and interior tables, identical leaf entries. Every writable leaf
//! loses its write bit in both address spaces, so the first write on either
//! side traps into the COW path. Reference counts are taken leaf by leaf
//! while traversing, nothing is bumped wholesale.
//!
//! Pages of the parent that sit on swap are brought back in first; the swap
//! slot's reverse list knows nothing about the child, so sharing a slot
//! would lose the child's mapping on swap-in.

use alloc::vec::Vec;

use crate::err::KResult;
use crate::memory::addrspace::PagePerm;
use crate::memory::layout::{HUGE_PAGE_SIZE, PAGE_SIZE};
use crate::memory::phys::PhysState;
use crate::process::{ProcId, ProcessTable};
use crate::swap::{self, SwapState};

pub fn fork(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    parent: ProcId,
) -> KResult<ProcId> {
    // Resident-only parent: swap everything of ours back in.
    loop {
        let slot = envs
            .get(parent)?
            .vmas
            .iter()
            .flat_map(|v| v.swapped.values().copied())
            .next();
        match slot {
            Some(slot) => {
                swap::swap_in(envs, phys, swap, slot)?;
            }
            None => break,
        }
    }

    let child = envs.alloc(phys, parent)?;

    {
        let parent_frame = envs.get(parent)?.frame;
        let parent_vmas = envs.get(parent)?.vmas.clone();
        let parent_cpu = envs.get(parent)?.cpu;
        let c = envs.get_mut(child)?;
        c.frame = parent_frame;
        c.frame.rax = 0; // the child sees 0 from fork()
        c.vmas = parent_vmas;
        c.cpu = parent_cpu;
    }

    let ranges: Vec<(u64, u64)> = envs
        .get(parent)?
        .vmas
        .iter()
        .map(|v| (v.va, v.end()))
        .collect();

    let (pp, cp) = envs.pair_mut(parent.index(), child.index());
    let pspace = pp.space.as_mut().expect("parent space");
    let cspace = cp.space.as_mut().expect("child space");

    for (start, end) in ranges {
        let mut va = start;
        while va < end {
            let Some((pfn, entry, huge)) = pspace.lookup(phys, va) else {
                va += PAGE_SIZE as u64;
                continue;
            };
            let perm = PagePerm::from_flags(entry.flags());
            if huge {
                let hbase = va & !(HUGE_PAGE_SIZE as u64 - 1);
                cspace.insert(phys, child, pfn, hbase, perm - PagePerm::WRITE)?;
                if perm.contains(PagePerm::WRITE) {
                    pspace.protect(phys, parent, hbase, perm - PagePerm::WRITE);
                }
                va = hbase + HUGE_PAGE_SIZE as u64;
            } else {
                cspace.insert(phys, child, pfn, va, perm - PagePerm::WRITE)?;
                if perm.contains(PagePerm::WRITE) {
                    pspace.protect(phys, parent, va, perm - PagePerm::WRITE);
                }
                va += PAGE_SIZE as u64;
            }
        }
    }

    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::addrspace::PagePerm;
    use crate::memory::frame::AllocFlags;
    use crate::memory::phys::testing::phys_with_pages;
    use crate::memory::vma::VmaKind;
    use crate::swap::testing::swap_with_slots;
    use x86_64::structures::paging::PageTableFlags as PtF;

    const VA: u64 = 0x40_0000;

    #[test]
    fn fork_shares_frames_and_strips_write() {
        let mut phys = phys_with_pages(256);
        let mut swap = swap_with_slots(8);
        let mut envs = ProcessTable::new(1);
        let parent = envs.alloc(&mut phys, ProcId(0)).unwrap();

        // Parent maps two writable pages and one read-only page.
        {
            let p = envs.get_mut(parent).unwrap();
            p.vmas
                .insert(VmaKind::Anon, VA, 3 * PAGE_SIZE, PagePerm::USER | PagePerm::WRITE)
                .unwrap();
            let space = p.space.as_mut().unwrap();
            for i in 0..3u64 {
                let pfn = phys.page_alloc(AllocFlags::ZERO).unwrap();
                let perm = if i == 2 {
                    PagePerm::USER
                } else {
                    PagePerm::USER | PagePerm::WRITE
                };
                space
                    .insert(&mut phys, parent, pfn, VA + i * PAGE_SIZE as u64, perm)
                    .unwrap();
            }
        }

        let child = fork(&mut envs, &mut phys, &mut swap, parent).unwrap();
        assert_eq!(envs.get(child).unwrap().frame.rax, 0);
        assert_eq!(envs.get(child).unwrap().vmas.len(), 1);

        let (pp, cp) = envs.pair_mut(parent.index(), child.index());
        let pspace = pp.space.as_mut().unwrap();
        let cspace = cp.space.as_mut().unwrap();
        for i in 0..3u64 {
            let va = VA + i * PAGE_SIZE as u64;
            let (ppfn, pentry, _) = pspace.lookup(&mut phys, va).unwrap();
            let (cpfn, centry, _) = cspace.lookup(&mut phys, va).unwrap();
            // Same physical frame on both sides, no write bit anywhere.
            assert_eq!(ppfn, cpfn);
            assert!(!pentry.flags().contains(PtF::WRITABLE));
            assert!(!centry.flags().contains(PtF::WRITABLE));
            assert_eq!(phys.frames.frame(ppfn).refs, 2);
            assert_eq!(phys.rmap.count(phys.frames.frame(ppfn).rmap), 2);
        }
    }

    #[test]
    fn interleaved_forks_from_two_cpus_keep_ids_unique() {
        use hashbrown::HashSet;

        let mut phys = phys_with_pages(1024);
        let mut swap = swap_with_slots(16);
        let mut envs = ProcessTable::new(2);
        let a = envs.alloc(&mut phys, ProcId(0)).unwrap();
        let b = envs.alloc(&mut phys, ProcId(0)).unwrap();

        // The table lock serializes forks; model the two CPUs as
        // interleaved turns, each spawning and immediately reaping leaves.
        let mut seen = HashSet::new();
        assert!(seen.insert(a.0));
        assert!(seen.insert(b.0));
        for round in 0..100 {
            let (parent, cpu) = if round % 2 == 0 { (a, 0) } else { (b, 1) };
            let child = fork(&mut envs, &mut phys, &mut swap, parent).unwrap();
            assert!(seen.insert(child.0), "duplicate id {:#x}", child.0);
            envs.destroy(&mut phys, &mut swap, child, cpu).unwrap();
        }
        phys.check();
    }

    #[test]
    fn fork_preserves_huge_leaves_verbatim() {
        let mut phys = phys_with_pages(4 * 512);
        let mut swap = swap_with_slots(8);
        let mut envs = ProcessTable::new(1);
        let parent = envs.alloc(&mut phys, ProcId(0)).unwrap();
        {
            let p = envs.get_mut(parent).unwrap();
            p.vmas
                .insert(
                    VmaKind::Anon,
                    VA,
                    HUGE_PAGE_SIZE,
                    PagePerm::USER | PagePerm::WRITE | PagePerm::HUGE,
                )
                .unwrap();
            let space = p.space.as_mut().unwrap();
            let pfn = phys
                .page_alloc(AllocFlags::ZERO | AllocFlags::HUGE)
                .unwrap();
            space
                .insert(
                    &mut phys,
                    parent,
                    pfn,
                    VA,
                    PagePerm::USER | PagePerm::WRITE | PagePerm::HUGE,
                )
                .unwrap();
        }

        let child = fork(&mut envs, &mut phys, &mut swap, parent).unwrap();
        let (pp, cp) = envs.pair_mut(parent.index(), child.index());
        let (ppfn, pentry, phuge) = pp
            .space
            .as_mut()
            .unwrap()
            .lookup(&mut phys, VA)
            .unwrap();
        let (cpfn, centry, chuge) = cp
            .space
            .as_mut()
            .unwrap()
            .lookup(&mut phys, VA)
            .unwrap();
        assert!(phuge && chuge);
        assert_eq!(ppfn, cpfn);
        assert!(!pentry.flags().contains(PtF::WRITABLE));
        assert!(!centry.flags().contains(PtF::WRITABLE));
        assert_eq!(phys.frames.frame(ppfn).refs, 2);
    }
}

//! Out-of-memory killer.
//!
//! Runs when reclaim cannot free enough frames. Every live process is
//! scored from its memory-accounting counters; the highest scorer dies. A
//! victim executing on another CPU is killed through the kill IPI; the
//! process-table lock plus the IPI guarantee it either observes `Dying` at
//! its next kernel entry or is interrupted into the kill handler.

use crate::err::KResult;
use crate::kwarn;
use crate::memory::layout::PAGE_SIZE;
use crate::memory::phys::PhysState;
use crate::process::{DestroyOutcome, ProcStatus, Process, ProcessTable};
use crate::swap::SwapState;

/// RSS-style score: resident, swapped and table pages, in bytes over the
/// page size, plus a machine-size bias.
pub fn score(p: &Process, npages: usize) -> usize {
    let stats = match &p.space {
        Some(space) => space.stats,
        None => return 0,
    };
    let bytes = (stats.mapped + stats.swapped + stats.tables) * PAGE_SIZE;
    bytes / PAGE_SIZE + npages / 1000
}

/// Kill the highest-scoring process. Panics when there is nothing left to
/// kill; at that point the kernel itself leaked the memory.
pub fn kill(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    this_cpu: usize,
) -> KResult<DestroyOutcome> {
    let npages = phys.npages();
    let mut victim = None;
    let mut highest = 0;
    for idx in 0..crate::memory::layout::NENV {
        let p = envs.by_index(idx);
        if matches!(p.status, ProcStatus::Free | ProcStatus::Dying) {
            continue;
        }
        let s = score(p, npages);
        if s > highest || victim.is_none() {
            highest = s;
            victim = Some(p.id);
        }
    }

    let Some(victim) = victim else {
        panic!("OOM killer found no process to kill");
    };
    kwarn!("oom: killing env {:#x} (score {})", victim.0, highest);
    envs.destroy(phys, swap, victim, this_cpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::addrspace::PagePerm;
    use crate::memory::frame::AllocFlags;
    use crate::memory::phys::testing::phys_with_pages;
    use crate::memory::vma::VmaKind;
    use crate::process::ProcId;
    use crate::swap::testing::swap_with_slots;

    fn give_pages(envs: &mut ProcessTable, phys: &mut PhysState, id: ProcId, n: u64) {
        let p = envs.get_mut(id).unwrap();
        p.vmas
            .insert(
                VmaKind::Anon,
                0x40_0000,
                n as usize * PAGE_SIZE,
                PagePerm::USER | PagePerm::WRITE,
            )
            .unwrap();
        let space = p.space.as_mut().unwrap();
        for i in 0..n {
            let pfn = phys.page_alloc(AllocFlags::ZERO).unwrap();
            space
                .insert(
                    phys,
                    id,
                    pfn,
                    0x40_0000 + i * PAGE_SIZE as u64,
                    PagePerm::USER | PagePerm::WRITE,
                )
                .unwrap();
            phys.lru_push(pfn);
        }
    }

    #[test]
    fn score_tracks_footprint() {
        let mut envs = ProcessTable::new(1);
        let mut phys = phys_with_pages(128);
        let small = envs.alloc(&mut phys, ProcId(0)).unwrap();
        let large = envs.alloc(&mut phys, ProcId(0)).unwrap();
        give_pages(&mut envs, &mut phys, small, 2);
        give_pages(&mut envs, &mut phys, large, 10);
        let n = phys.npages();
        assert!(score(envs.get(large).unwrap(), n) > score(envs.get(small).unwrap(), n));
    }

    #[test]
    fn kill_picks_the_heaviest() {
        let mut envs = ProcessTable::new(1);
        let mut phys = phys_with_pages(128);
        let mut swap = swap_with_slots(4);
        let small = envs.alloc(&mut phys, ProcId(0)).unwrap();
        let large = envs.alloc(&mut phys, ProcId(0)).unwrap();
        give_pages(&mut envs, &mut phys, small, 2);
        give_pages(&mut envs, &mut phys, large, 10);

        assert_eq!(
            kill(&mut envs, &mut phys, &mut swap, 0).unwrap(),
            DestroyOutcome::Done
        );
        assert!(envs.get(large).is_err());
        assert!(envs.get(small).is_ok());
    }

    #[test]
    #[should_panic(expected = "no process to kill")]
    fn kill_with_empty_table_panics() {
        let mut envs = ProcessTable::new(1);
        let mut phys = phys_with_pages(32);
        let mut swap = swap_with_slots(2);
        let _ = kill(&mut envs, &mut phys, &mut swap, 0);
    }
}

//! Page reclaim: the CLOCK second-chance scan over resident frames.
//!
//! The fault handler seeds the queue with every page it makes resident.
//! Reclaim pops from the head; a frame whose mappings carry a set accessed
//! bit gets the bit cleared and rotates to the tail, anything else is
//! swapped out. Direct reclaim runs inline when an allocation would fail;
//! the periodic kernel thread keeps the free count above the threshold in
//! the background.

use crate::err::{KResult, KernelError};
use crate::kwarn;
use crate::memory::frame::AllocFlags;
use crate::memory::layout::{FREEPAGE_OVERSHOOT, FREEPAGE_THRESHOLD};
use crate::memory::phys::PhysState;
use crate::process::ProcessTable;
use crate::swap::{self, oom, SwapState};

/// Check-and-clear the accessed bits of every mapping of `pfn`. True when
/// any mapping was recently used.
fn referenced(envs: &mut ProcessTable, phys: &mut PhysState, pfn: u32) -> bool {
    let head = phys.frames.frame(pfn).rmap;
    let entries = phys.rmap.collect(head);
    let mut any = false;
    for &(proc, va, _) in &entries {
        let Ok(p) = envs.get_mut(proc) else {
            continue;
        };
        let space = p.space.as_mut().expect("live process has a space");
        if space.clear_accessed(phys, va) {
            any = true;
        }
    }
    any
}

/// Pop cold frames and push them to disk until the free count reaches
/// `target`. False when the queue ran dry or the swap area filled up.
pub fn reclaim_until(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    target: usize,
    this_cpu: usize,
) -> bool {
    let mut budget = 4 * phys.npages();
    while phys.frames.counter().get() < target {
        if budget == 0 {
            return false;
        }
        budget -= 1;
        let Some(pfn) = phys.lru_pop() else {
            return false;
        };
        if referenced(envs, phys, pfn) {
            // Second chance.
            phys.lru_push(pfn);
            continue;
        }
        if swap::swap_out(envs, phys, swap, pfn, this_cpu).is_err() {
            phys.lru_push(pfn);
            kwarn!("reclaim: swap area exhausted");
            return false;
        }
    }
    true
}

/// Refill to threshold + overshoot, the hysteresis both reclaim paths use.
pub fn balance(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    this_cpu: usize,
) -> bool {
    reclaim_until(
        envs,
        phys,
        swap,
        FREEPAGE_THRESHOLD + FREEPAGE_OVERSHOOT,
        this_cpu,
    )
}

/// One round of the periodic reclaim thread: nothing to do while the free
/// count sits above the threshold.
pub fn periodic_tick(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    this_cpu: usize,
) {
    if !phys.frames.counter().available(FREEPAGE_THRESHOLD) {
        balance(envs, phys, swap, this_cpu);
    }
}

/// Body of the periodic reclaim kernel thread: poll the free-frame counter
/// (no lock needed for the check), refill under the ordered lock chain when
/// it dropped too low, then give the CPU back until the next wait elapses.
pub extern "C" fn reclaim_thread_main() -> ! {
    loop {
        // Counter check without any lock; the lock chain is only taken when
        // there is work.
        if !crate::memory::frame::NFREE_PAGES.available(crate::memory::layout::FREEPAGE_THRESHOLD)
        {
            let cpu = crate::arch::x86_64::apic::this_cpu_id();
            crate::locks::with_mm(|envs, phys, swap| periodic_tick(envs, phys, swap, cpu));
        }
        crate::sched::kthread_yield();
    }
}

/// Allocate, falling back to direct reclaim and then the OOM killer.
///
/// An allocation that still fails after both is a kernel bug by assumption
/// (the swap area is sized for the workload), except for huge frames,
/// where fragmentation is a legal outcome reported as `NoMem`.
pub fn alloc_or_reclaim(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    flags: AllocFlags,
    this_cpu: usize,
) -> KResult<u32> {
    if let Ok(pfn) = phys.page_alloc(flags) {
        return Ok(pfn);
    }
    if !balance(envs, phys, swap, this_cpu) && !flags.contains(AllocFlags::HUGE) {
        oom::kill(envs, phys, swap, this_cpu)?;
    }
    match phys.page_alloc(flags) {
        Ok(pfn) => Ok(pfn),
        Err(_) if flags.contains(AllocFlags::HUGE) => Err(KernelError::NoMem),
        Err(_) => panic!("out of memory after direct reclaim and OOM kill"),
    }
}

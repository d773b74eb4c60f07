//! Numbered system calls.
//!
//! Invoked by software interrupt with the number and arguments in
//! registers; the result lands in the first register. Handlers take the
//! locked state domains as explicit parameters; the dispatcher in the trap
//! path acquires them in lock order and passes them down.

use crate::err::{KResult, KernelError};
use crate::memory::addrspace::PagePerm;
use crate::memory::layout::{HUGE_PAGE_SIZE, PAGE_SIZE};
use crate::memory::phys::PhysState;
use crate::memory::vma::{self, VmaKind};
use crate::process::{fork, DestroyOutcome, ProcId, ProcessTable};
use crate::swap::{self, reclaim, SwapState};

pub const SYS_CPUTS: u64 = 0;
pub const SYS_CGETC: u64 = 1;
pub const SYS_GETENVID: u64 = 2;
pub const SYS_ENV_DESTROY: u64 = 3;
pub const SYS_VMA_CREATE: u64 = 4;
pub const SYS_VMA_DESTROY: u64 = 5;
pub const SYS_YIELD: u64 = 6;
pub const SYS_WAIT: u64 = 7;
pub const SYS_FORK: u64 = 8;

/// `vma_create` flag: eagerly allocate and map the whole area.
pub const MAP_POPULATE: u64 = 1;

/// What the trap path does after a call: hand a value back and resume, or
/// hand a value back and enter the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Return(i64),
    Reschedule(i64),
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
        fn console_write(s: &[u8]) {
            if let Ok(s) = core::str::from_utf8(s) {
                crate::arch::x86_64::serial::write_str(s);
            }
        }

        fn console_getc() -> u8 {
            crate::arch::x86_64::serial::getc()
        }
    } else {
        fn console_write(_s: &[u8]) {}

        fn console_getc() -> u8 {
            0
        }
    }
}

/// Write `len` bytes at user address `va` to the console. Fails (and the
/// dispatcher destroys the caller) when any page of the range is not mapped
/// user-readable.
pub fn sys_cputs(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    caller: ProcId,
    va: u64,
    len: u64,
) -> KResult<()> {
    if len == 0 {
        return Ok(());
    }
    let p = envs.get_mut(caller)?;
    let space = p.space.as_mut().expect("live process has a space");

    // Permission sweep first, then the copy.
    let mut page = va & !(PAGE_SIZE as u64 - 1);
    while page < va + len {
        let (_, entry, _) = space.lookup(phys, page).ok_or(KernelError::Invalid)?;
        if !entry
            .flags()
            .contains(x86_64::structures::paging::PageTableFlags::USER_ACCESSIBLE)
        {
            return Err(KernelError::Invalid);
        }
        page += PAGE_SIZE as u64;
    }

    let mut cur = va;
    let end = va + len;
    while cur < end {
        let (pfn, _, _) = space.lookup(phys, cur).ok_or(KernelError::Invalid)?;
        let off = (cur & (PAGE_SIZE as u64 - 1)) as usize;
        let chunk = core::cmp::min(PAGE_SIZE - off, (end - cur) as usize);
        let bytes =
            unsafe { core::slice::from_raw_parts(phys.kva(PhysState::pa_of(pfn)).add(off), chunk) };
        console_write(bytes);
        cur += chunk as u64;
    }
    Ok(())
}

/// Allocate an anonymous area at a kernel-chosen address.
pub fn sys_vma_create(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    cpu: usize,
    caller: ProcId,
    size: u64,
    perm_bits: u64,
    flags: u64,
) -> KResult<u64> {
    if size == 0 {
        return Err(KernelError::Invalid);
    }
    let perm = (PagePerm::from_bits_truncate(perm_bits)
        & (PagePerm::WRITE | PagePerm::HUGE | PagePerm::NO_EXEC))
        | PagePerm::USER;

    if flags & MAP_POPULATE != 0 {
        // Populate allocates inline; make sure the frames are there.
        let need = (size as usize).div_ceil(PAGE_SIZE);
        if !phys.frames.counter().available(need) {
            let target = phys.frames.counter().get() + need;
            reclaim::reclaim_until(envs, phys, swap, target, cpu);
        }
    }

    let p = envs.get_mut(caller)?;
    // Huge-page areas need a 2 MiB-aligned base; search with slack and
    // round up inside the gap.
    let (va, size) = if perm.contains(PagePerm::HUGE) {
        let size = crate::memory::layout::align_up(size, HUGE_PAGE_SIZE as u64);
        let gap = p
            .vmas
            .find_gap((size + HUGE_PAGE_SIZE as u64) as usize)
            .ok_or(KernelError::Invalid)?;
        (
            crate::memory::layout::align_up(gap, HUGE_PAGE_SIZE as u64),
            size,
        )
    } else {
        let gap = p.vmas.find_gap(size as usize).ok_or(KernelError::Invalid)?;
        (gap, size)
    };
    p.vmas.insert(VmaKind::Anon, va, size as usize, perm)?;

    if flags & MAP_POPULATE != 0 {
        let len = p.vmas.lookup(va).expect("just inserted").len;
        let space = p.space.as_mut().expect("live process has a space");
        if let Err(e) = vma::map_populate(phys, space, caller, va, len, perm) {
            // Partial mappings roll back with the area.
            let r = p.vmas.destroy(va, len)?;
            let space = p.space.as_mut().expect("live process has a space");
            space.unmap_range(phys, caller, r.va, r.len);
            return Err(e);
        }
    }
    Ok(va)
}

/// Tear down a subrange of a single area.
pub fn sys_vma_destroy(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    caller: ProcId,
    va: u64,
    size: u64,
) -> KResult<()> {
    let p = envs.get_mut(caller)?;
    let r = p.vmas.destroy(va, size as usize)?;
    let space = p.space.as_mut().expect("live process has a space");
    space.unmap_range(phys, caller, r.va, r.len);
    space.stats.swapped -= r.swapped.len();
    for &(sva, slot) in &r.swapped {
        swap::slot_forget(phys, swap, slot, caller, sva);
    }
    Ok(())
}

/// The single dispatch point. Unknown numbers report `no-sys`.
#[allow(clippy::too_many_arguments)]
pub fn dispatch(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    cpu: usize,
    caller: ProcId,
    no: u64,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
) -> Flow {
    let _ = (a4, a5);
    match no {
        SYS_CPUTS => match sys_cputs(envs, phys, caller, a1, a2) {
            Ok(()) => Flow::Return(0),
            Err(_) => {
                // Bad memory from user space kills the caller.
                let _ = envs.destroy(phys, swap, caller, cpu);
                Flow::Reschedule(KernelError::Invalid.code())
            }
        },
        SYS_CGETC => Flow::Return(console_getc() as i64),
        SYS_GETENVID => Flow::Return(caller.0 as i64),
        SYS_ENV_DESTROY => {
            let target = match envs.resolve(caller, a1 as u32, true) {
                Ok(t) => t,
                Err(e) => return Flow::Return(e.code()),
            };
            match envs.destroy(phys, swap, target, cpu) {
                Ok(DestroyOutcome::WasCurrent) => Flow::Reschedule(0),
                Ok(_) => Flow::Return(0),
                Err(e) => Flow::Return(e.code()),
            }
        }
        SYS_VMA_CREATE => match sys_vma_create(envs, phys, swap, cpu, caller, a1, a2, a3) {
            Ok(base) => Flow::Return(base as i64),
            Err(_) => Flow::Return(-1),
        },
        SYS_VMA_DESTROY => match sys_vma_destroy(envs, phys, swap, caller, a1, a2) {
            Ok(()) => Flow::Return(0),
            Err(_) => Flow::Return(-1),
        },
        SYS_YIELD => Flow::Reschedule(0),
        SYS_WAIT => {
            let target = match envs.resolve(caller, a1 as u32, false) {
                Ok(t) => t,
                Err(e) => return Flow::Return(e.code()),
            };
            match envs.wait(caller, target) {
                Ok(()) => Flow::Reschedule(0),
                Err(e) => Flow::Return(e.code()),
            }
        }
        SYS_FORK => match fork::fork(envs, phys, swap, caller) {
            Ok(child) => Flow::Return(child.0 as i64),
            Err(_) => Flow::Return(-1),
        },
        _ => Flow::Return(KernelError::NoSys.code()),
    }
}

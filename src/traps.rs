//! Kernel entry: trap frame, interrupt numbers, the page-fault service
//! path, and the re-dispatch that decides between resuming the current
//! process and entering the scheduler.
//!
//! The low-level ISR stubs, IDT programming and the TSS belong to the
//! GDT/IDT layer outside this core; their contract is `kernel_entry` plus
//! the frame layout below (the entry stub pushes registers in exactly this
//! order and calls in with the frame pointer).

use bitflags::bitflags;

use crate::arch::x86_64 as arch;
use crate::arch::x86_64::apic;
use crate::err::KResult;
use crate::kerror;
use crate::locks;
use crate::memory::addrspace::PagePerm;
use crate::memory::frame::AllocFlags;
use crate::memory::layout::{align_down, HUGE_PAGE_SIZE, PAGE_SIZE, USER_TOP};
use crate::memory::phys::PhysState;
use crate::memory::vma::VmaKind;
use crate::process::{ProcId, ProcessTable};
use crate::sched;
use crate::swap::{self, reclaim, SwapState};
use crate::syscall::{self, Flow};

// Segment selectors laid down by the GDT layer.
pub const KERNEL_CODE_SEL: u64 = 0x08;
pub const KERNEL_DATA_SEL: u64 = 0x10;
pub const USER_CODE_SEL: u64 = 0x18 | 3;
pub const USER_DATA_SEL: u64 = 0x20 | 3;

// Exception and interrupt vectors.
pub const INT_PAGE_FAULT: u64 = 14;
pub const INT_SYSCALL: u64 = 128;
pub const IRQ_TIMER: u64 = 32;
/// Remote TLB invalidation.
pub const IPI_TLB_FLUSH: u8 = 50;
/// Remote destroy of the currently-running process.
pub const IPI_KILL: u8 = 51;

/// Saved register state, in push order of the entry stub.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub ds: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub int_no: u64,
    pub err_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

bitflags! {
    /// Page-fault error code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PfError: u64 {
        const PRESENT = 1 << 0;
        const WRITE   = 1 << 1;
        const USER    = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Serviced; the faulting process resumes.
    Handled,
    /// Unrecoverable for this process; it was destroyed (or marked dying).
    Destroyed,
}

/// Service a page fault for `proc`.
///
/// Classification: a protection fault on a write to a writable area is
/// copy-on-write; a miss inside an area is either a swap-in or an
/// on-demand mapping (zero-filled, with the binary source copied over where
/// the page intersects it); a kernel-mode fault above the user half
/// panics; everything else destroys the process.
pub fn handle_page_fault(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    cpu: usize,
    proc: ProcId,
    fault_va: u64,
    err: PfError,
) -> FaultOutcome {
    if !err.contains(PfError::USER) && fault_va >= USER_TOP {
        panic!(
            "kernel page fault at {:#x} (err {:?})",
            fault_va, err
        );
    }

    #[cfg(feature = "karst-trace-vm")]
    crate::kinfo!(
        "env {:#x}: page fault at {:#x} (err {:?})",
        proc.0,
        fault_va,
        err
    );

    let page_va = align_down(fault_va, PAGE_SIZE as u64);

    let Some((vma_perm, vma_kind, swapped_slot)) = envs
        .get(proc)
        .ok()
        .and_then(|p| p.vmas.lookup(fault_va))
        .map(|v| (v.perm, v.kind, v.swapped.get(&page_va).copied()))
    else {
        kerror!("env {:#x}: fault at unmapped {:#x}", proc.0, fault_va);
        return destroy(envs, phys, swap, cpu, proc);
    };

    if err.contains(PfError::PRESENT) {
        // Protection fault: only a write to a writable area is COW.
        if !err.contains(PfError::WRITE) || !vma_perm.contains(PagePerm::WRITE) {
            kerror!(
                "env {:#x}: protection fault at {:#x} (err {:?})",
                proc.0,
                fault_va,
                err
            );
            return destroy(envs, phys, swap, cpu, proc);
        }
        match service_cow(envs, phys, swap, cpu, proc, page_va, vma_perm) {
            Ok(()) => FaultOutcome::Handled,
            Err(_) => destroy(envs, phys, swap, cpu, proc),
        }
    } else if let Some(slot) = swapped_slot {
        match swap::swap_in(envs, phys, swap, slot) {
            Ok(_) => FaultOutcome::Handled,
            Err(_) => destroy(envs, phys, swap, cpu, proc),
        }
    } else {
        match service_demand(envs, phys, swap, cpu, proc, page_va, vma_perm, vma_kind) {
            Ok(()) => FaultOutcome::Handled,
            Err(_) => destroy(envs, phys, swap, cpu, proc),
        }
    }
}

fn destroy(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    cpu: usize,
    proc: ProcId,
) -> FaultOutcome {
    let _ = envs.destroy(phys, swap, proc, cpu);
    FaultOutcome::Destroyed
}

/// Copy-on-write: sole owner upgrades in place, shared frames get copied.
fn service_cow(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    cpu: usize,
    proc: ProcId,
    page_va: u64,
    vma_perm: PagePerm,
) -> KResult<()> {
    let (old_pfn, huge, leaf_va) = {
        let p = envs.get_mut(proc)?;
        let space = p.space.as_mut().expect("live process has a space");
        let (pfn, _entry, huge) = space
            .lookup(phys, page_va)
            .ok_or(crate::err::KernelError::Invalid)?;
        let leaf_va = if huge {
            align_down(page_va, HUGE_PAGE_SIZE as u64)
        } else {
            page_va
        };
        (pfn, huge, leaf_va)
    };

    let mut want = vma_perm | PagePerm::WRITE;
    if huge {
        want |= PagePerm::HUGE;
    }

    if phys.frames.frame(old_pfn).refs == 1 {
        // Sole reference: flip the write bit and flush.
        let p = envs.get_mut(proc)?;
        let space = p.space.as_mut().expect("live process has a space");
        space.protect(phys, proc, leaf_va, want);
        return Ok(());
    }

    // Shared: copy into a fresh frame and install it writable. A huge
    // mapping copies the full 2 MiB without demotion.
    let mut flags = AllocFlags::empty();
    if huge {
        flags |= AllocFlags::HUGE;
    }
    let new_pfn = reclaim::alloc_or_reclaim(envs, phys, swap, flags, cpu)?;
    let len = if huge { HUGE_PAGE_SIZE } else { PAGE_SIZE };
    unsafe {
        core::ptr::copy_nonoverlapping(
            phys.kva(PhysState::pa_of(old_pfn)),
            phys.kva(PhysState::pa_of(new_pfn)),
            len,
        );
    }
    let p = envs.get_mut(proc)?;
    let space = p.space.as_mut().expect("live process has a space");
    space.insert(phys, proc, new_pfn, leaf_va, want)?;
    phys.lru_push(new_pfn);
    Ok(())
}

/// On-demand mapping: a zeroed frame with the area's permissions; binary
/// areas copy the intersection with their source extent.
#[allow(clippy::too_many_arguments)]
fn service_demand(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    swap: &mut SwapState,
    cpu: usize,
    proc: ProcId,
    page_va: u64,
    vma_perm: PagePerm,
    vma_kind: VmaKind,
) -> KResult<()> {
    let huge = vma_perm.contains(PagePerm::HUGE);
    let (leaf_va, len, flags) = if huge {
        (
            align_down(page_va, HUGE_PAGE_SIZE as u64),
            HUGE_PAGE_SIZE,
            AllocFlags::ZERO | AllocFlags::HUGE,
        )
    } else {
        (page_va, PAGE_SIZE, AllocFlags::ZERO)
    };

    let pfn = reclaim::alloc_or_reclaim(envs, phys, swap, flags, cpu)?;

    if let VmaKind::Binary {
        src,
        src_len,
        dst,
        dst_len: _,
    } = vma_kind
    {
        // Copy the part of this page the image actually provides; the rest
        // stays zero (bss).
        let file_end = dst + src_len as u64;
        let lo = leaf_va.max(dst);
        let hi = (leaf_va + len as u64).min(file_end);
        if lo < hi {
            let src_off = lo - dst;
            let dst_off = lo - leaf_va;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    (src + src_off) as *const u8,
                    phys.kva(PhysState::pa_of(pfn)).add(dst_off as usize),
                    (hi - lo) as usize,
                );
            }
        }
    }

    let p = envs.get_mut(proc)?;
    let space = p.space.as_mut().expect("live process has a space");
    space.insert(phys, proc, pfn, leaf_va, vma_perm)?;
    phys.lru_push(pfn);
    Ok(())
}

/// Full kernel entry from an ISR stub: save the frame into the control
/// block, finish any deferred destruction, dispatch, and either resume the
/// interrupted process or reschedule.
pub extern "C" fn kernel_entry(frame: &mut TrapFrame) -> ! {
    let cpu = apic::this_cpu_id();
    let from_user = frame.cs & 3 == 3;

    let reaped = locks::with_mm(|envs, phys, swap| {
        if from_user {
            if let Some(cur) = envs.current(cpu) {
                if let Ok(p) = envs.get_mut(cur) {
                    p.frame = *frame;
                }
            }
        }
        envs.reap_if_dying(phys, swap, cpu)
    });
    if reaped {
        sched::sched_yield();
    }

    match frame.int_no {
        INT_PAGE_FAULT => {
            let fault_va = arch::fault_address();
            let err = PfError::from_bits_truncate(frame.err_code);
            let outcome = locks::with_mm(|envs, phys, swap| {
                let cur = envs.current(cpu).expect("page fault without a process");
                handle_page_fault(envs, phys, swap, cpu, cur, fault_va, err)
            });
            match outcome {
                FaultOutcome::Handled => resume_current(cpu),
                FaultOutcome::Destroyed => sched::sched_yield(),
            }
        }
        INT_SYSCALL => {
            let flow = locks::with_mm(|envs, phys, swap| {
                let cur = envs.current(cpu).expect("syscall without a process");
                syscall::dispatch(
                    envs,
                    phys,
                    swap,
                    cpu,
                    cur,
                    frame.rdi,
                    frame.rsi,
                    frame.rdx,
                    frame.rcx,
                    frame.r8,
                    frame.r9,
                )
            });
            match flow {
                Flow::Return(v) => {
                    let mut envs = locks::env();
                    if let Some(cur) = envs.current(cpu) {
                        if let Ok(p) = envs.get_mut(cur) {
                            p.frame.rax = v as u64;
                        }
                    }
                    drop(envs);
                    resume_current(cpu)
                }
                Flow::Reschedule(v) => {
                    let mut envs = locks::env();
                    if let Some(cur) = envs.current(cpu) {
                        if let Ok(p) = envs.get_mut(cur) {
                            p.frame.rax = v as u64;
                        }
                    }
                    drop(envs);
                    sched::sched_yield()
                }
            }
        }
        IRQ_TIMER => {
            apic::eoi();
            if !from_user && locks::env().cpus[cpu].cur_kthread.is_some() {
                // Kernel threads are cooperative; the tick does not preempt
                // them mid-body.
                resume_frame(frame);
            }
            sched::sched_yield()
        }
        n if n == IPI_KILL as u64 => {
            apic::eoi();
            locks::with_mm(|envs, phys, swap| {
                if let Some(cur) = envs.current(cpu) {
                    let _ = envs.destroy(phys, swap, cur, cpu);
                }
            });
            sched::sched_yield()
        }
        n if n == IPI_TLB_FLUSH as u64 => {
            apic::eoi();
            arch::flush_all();
            if from_user {
                resume_current(cpu)
            } else {
                resume_frame(frame)
            }
        }
        other => {
            if !from_user {
                panic!("unhandled interrupt {} in kernel mode", other);
            }
            kerror!("env: unexpected trap {} from user mode", other);
            locks::with_mm(|envs, phys, swap| {
                if let Some(cur) = envs.current(cpu) {
                    let _ = envs.destroy(phys, swap, cur, cpu);
                }
            });
            sched::sched_yield()
        }
    }
}

/// Return into an interrupted kernel context (a kernel thread or a kernel
/// code path) exactly as the entry stub saved it.
fn resume_frame(frame: &TrapFrame) -> ! {
    let copy = *frame;
    unsafe { arch::enter_user(&copy as *const TrapFrame) }
}

/// Fast return path: back into the frame saved in the control block.
fn resume_current(cpu: usize) -> ! {
    let dispatch = {
        let envs = locks::env();
        envs.current(cpu).and_then(|id| {
            envs.get(id)
                .ok()
                .map(|p| (p.space.as_ref().expect("user space").root_pa(), p.frame))
        })
    };
    match dispatch {
        Some((root, frame)) => unsafe {
            arch::load_root(root);
            arch::enter_user(&frame as *const TrapFrame);
        },
        // The current process died under us (OOM during its own fault).
        None => sched::sched_yield(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::phys::testing::phys_with_pages;
    use crate::swap::testing::swap_with_slots;
    use x86_64::structures::paging::PageTableFlags as PtF;

    const VA: u64 = 0x40_0000;

    fn setup() -> (ProcessTable, PhysState, SwapState, ProcId) {
        let mut envs = ProcessTable::new(1);
        let mut phys = phys_with_pages(512);
        let swap = swap_with_slots(8);
        let id = envs.alloc(&mut phys, ProcId(0)).unwrap();
        envs.cpus[0].cur = Some(id);
        (envs, phys, swap, id)
    }

    fn anon_vma(envs: &mut ProcessTable, id: ProcId, va: u64, pages: usize) {
        envs.get_mut(id)
            .unwrap()
            .vmas
            .insert(
                VmaKind::Anon,
                va,
                pages * PAGE_SIZE,
                PagePerm::USER | PagePerm::WRITE,
            )
            .unwrap();
    }

    #[test]
    fn demand_fault_installs_zeroed_page() {
        let (mut envs, mut phys, mut swap, id) = setup();
        anon_vma(&mut envs, id, VA, 3);

        let out = handle_page_fault(
            &mut envs,
            &mut phys,
            &mut swap,
            0,
            id,
            VA + 0x123,
            PfError::USER,
        );
        assert_eq!(out, FaultOutcome::Handled);

        let p = envs.get_mut(id).unwrap();
        let space = p.space.as_mut().unwrap();
        let (pfn, entry, _) = space.lookup(&mut phys, VA).unwrap();
        assert!(entry.flags().contains(PtF::WRITABLE));
        assert!(phys.frames.frame(pfn).in_lru);
        let bytes = unsafe { phys.frame_bytes(pfn, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn fault_outside_any_vma_destroys() {
        let (mut envs, mut phys, mut swap, id) = setup();
        let out = handle_page_fault(
            &mut envs,
            &mut phys,
            &mut swap,
            0,
            id,
            0xdead_000,
            PfError::USER | PfError::WRITE,
        );
        assert_eq!(out, FaultOutcome::Destroyed);
        assert!(envs.get(id).is_err());
    }

    #[test]
    fn write_to_readonly_vma_destroys() {
        let (mut envs, mut phys, mut swap, id) = setup();
        envs.get_mut(id)
            .unwrap()
            .vmas
            .insert(VmaKind::Anon, VA, PAGE_SIZE, PagePerm::USER)
            .unwrap();
        // Fault the page in first (read).
        assert_eq!(
            handle_page_fault(&mut envs, &mut phys, &mut swap, 0, id, VA, PfError::USER),
            FaultOutcome::Handled
        );
        // Now a write protection fault on the read-only area.
        let out = handle_page_fault(
            &mut envs,
            &mut phys,
            &mut swap,
            0,
            id,
            VA,
            PfError::USER | PfError::WRITE | PfError::PRESENT,
        );
        assert_eq!(out, FaultOutcome::Destroyed);
    }

    #[test]
    fn cow_sole_owner_upgrades_in_place() {
        let (mut envs, mut phys, mut swap, id) = setup();
        anon_vma(&mut envs, id, VA, 1);
        // Resident read-only page with a single reference.
        {
            let p = envs.get_mut(id).unwrap();
            let space = p.space.as_mut().unwrap();
            let pfn = phys.page_alloc(AllocFlags::ZERO).unwrap();
            space.insert(&mut phys, id, pfn, VA, PagePerm::USER).unwrap();
            phys.lru_push(pfn);
        }
        let out = handle_page_fault(
            &mut envs,
            &mut phys,
            &mut swap,
            0,
            id,
            VA,
            PfError::USER | PfError::WRITE | PfError::PRESENT,
        );
        assert_eq!(out, FaultOutcome::Handled);
        let p = envs.get_mut(id).unwrap();
        let space = p.space.as_mut().unwrap();
        let (_, entry, _) = space.lookup(&mut phys, VA).unwrap();
        assert!(entry.flags().contains(PtF::WRITABLE));
    }

    #[test]
    fn cow_shared_frame_copies() {
        let (mut envs, mut phys, mut swap, parent) = setup();
        anon_vma(&mut envs, parent, VA, 1);
        // Make the page resident and dirty it.
        handle_page_fault(&mut envs, &mut phys, &mut swap, 0, parent, VA, PfError::USER);
        let parent_pfn = {
            let p = envs.get_mut(parent).unwrap();
            let space = p.space.as_mut().unwrap();
            let (pfn, _, _) = space.lookup(&mut phys, VA).unwrap();
            unsafe { phys.frame_bytes(pfn, PAGE_SIZE)[0] = 0x42 };
            pfn
        };

        let child = crate::process::fork::fork(&mut envs, &mut phys, &mut swap, parent).unwrap();

        // Child writes: gets its own copy with the parent's bytes.
        let out = handle_page_fault(
            &mut envs,
            &mut phys,
            &mut swap,
            0,
            child,
            VA,
            PfError::USER | PfError::WRITE | PfError::PRESENT,
        );
        assert_eq!(out, FaultOutcome::Handled);

        let child_pfn = {
            let p = envs.get_mut(child).unwrap();
            let space = p.space.as_mut().unwrap();
            let (pfn, entry, _) = space.lookup(&mut phys, VA).unwrap();
            assert!(entry.flags().contains(PtF::WRITABLE));
            pfn
        };
        assert_ne!(child_pfn, parent_pfn);
        assert_eq!(unsafe { phys.frame_bytes(child_pfn, PAGE_SIZE)[0] }, 0x42);
        // Parent still maps the original, now solely owned.
        assert_eq!(phys.frames.frame(parent_pfn).refs, 1);

        // Parent's write then upgrades in place.
        let out = handle_page_fault(
            &mut envs,
            &mut phys,
            &mut swap,
            0,
            parent,
            VA,
            PfError::USER | PfError::WRITE | PfError::PRESENT,
        );
        assert_eq!(out, FaultOutcome::Handled);
        let p = envs.get_mut(parent).unwrap();
        let space = p.space.as_mut().unwrap();
        let (pfn, entry, _) = space.lookup(&mut phys, VA).unwrap();
        assert_eq!(pfn, parent_pfn);
        assert!(entry.flags().contains(PtF::WRITABLE));
    }

    #[test]
    fn binary_vma_copies_intersection_and_zero_fills() {
        let (mut envs, mut phys, mut swap, id) = setup();
        // A 100-byte image that lands 0x80 bytes into the page.
        let image: alloc::vec::Vec<u8> = (0..100u8).collect();
        let dst = VA + 0x80;
        envs.get_mut(id)
            .unwrap()
            .vmas
            .insert(
                VmaKind::Binary {
                    src: image.as_ptr() as u64,
                    src_len: image.len(),
                    dst,
                    dst_len: 0x1000,
                },
                dst,
                0x1000,
                PagePerm::USER | PagePerm::WRITE,
            )
            .unwrap();

        let out = handle_page_fault(&mut envs, &mut phys, &mut swap, 0, id, dst, PfError::USER);
        assert_eq!(out, FaultOutcome::Handled);

        let p = envs.get_mut(id).unwrap();
        let space = p.space.as_mut().unwrap();
        let (pfn, _, _) = space.lookup(&mut phys, VA).unwrap();
        let bytes = unsafe { phys.frame_bytes(pfn, PAGE_SIZE) };
        // Before the image: zero. The image bytes. After: zero (bss).
        assert!(bytes[..0x80].iter().all(|&b| b == 0));
        assert_eq!(&bytes[0x80..0x80 + 100], &image[..]);
        assert!(bytes[0x80 + 100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn swapped_page_faults_back_in() {
        let (mut envs, mut phys, mut swap, id) = setup();
        anon_vma(&mut envs, id, VA, 1);
        handle_page_fault(&mut envs, &mut phys, &mut swap, 0, id, VA, PfError::USER);
        let pfn = {
            let p = envs.get_mut(id).unwrap();
            let space = p.space.as_mut().unwrap();
            let (pfn, _, _) = space.lookup(&mut phys, VA).unwrap();
            unsafe { phys.frame_bytes(pfn, PAGE_SIZE)[7] = 0x99 };
            pfn
        };
        swap::swap_out(&mut envs, &mut phys, &mut swap, pfn, 0).unwrap();

        // Touch it again: the fault pulls it back from disk.
        let out = handle_page_fault(&mut envs, &mut phys, &mut swap, 0, id, VA, PfError::USER);
        assert_eq!(out, FaultOutcome::Handled);
        let p = envs.get_mut(id).unwrap();
        let space = p.space.as_mut().unwrap();
        let (new_pfn, _, _) = space.lookup(&mut phys, VA).unwrap();
        assert_eq!(unsafe { phys.frame_bytes(new_pfn, PAGE_SIZE)[7] }, 0x99);
        assert!(p.vmas.lookup(VA).unwrap().swapped.is_empty());
    }

    #[test]
    fn kernel_touching_user_page_maps_on_demand() {
        let (mut envs, mut phys, mut swap, id) = setup();
        anon_vma(&mut envs, id, VA, 1);
        // Kernel-mode miss below USER_TOP: serviced as if the user faulted.
        let out = handle_page_fault(
            &mut envs,
            &mut phys,
            &mut swap,
            0,
            id,
            VA,
            PfError::empty(),
        );
        assert_eq!(out, FaultOutcome::Handled);
    }

    #[test]
    #[should_panic(expected = "kernel page fault")]
    fn kernel_fault_above_user_half_panics() {
        let (mut envs, mut phys, mut swap, id) = setup();
        handle_page_fault(
            &mut envs,
            &mut phys,
            &mut swap,
            0,
            id,
            0xFFFF_8000_0000_1000,
            PfError::empty(),
        );
    }
}

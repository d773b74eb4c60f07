//! The process table.
//!
//! A fixed table of `NENV` control blocks indexed by the low bits of the
//! process id; the high bits are a generation counter so a stale id never
//! resolves to a recycled slot. The table, the free list, all status
//! transitions, the per-CPU current pointers and the kernel-thread records
//! live under the single process-table lock; scheduler decisions are made
//! while holding it.

pub mod fork;

use alloc::vec::Vec;

use crate::arch::x86_64::apic;
use crate::err::{KResult, KernelError};
use crate::memory::addrspace::AddressSpace;
use crate::memory::layout::{
    ID_GENERATION_SHIFT, KSTACK_GAP, KSTACK_SIZE, KSTACK_TOP, NENV, TIME_SLICE,
};
use crate::memory::phys::PhysState;
use crate::memory::vma::VmaTable;
use crate::sched::kthread::KThread;
use crate::swap::SwapState;
use crate::traps::{TrapFrame, IPI_KILL, USER_CODE_SEL, USER_DATA_SEL};
use crate::{kinfo, kwarn};

/// Low bits index the table, high bits are the generation. Id 0 is reserved
/// to mean "the calling process" at the syscall surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcId(pub u32);

impl ProcId {
    #[inline]
    pub fn index(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcStatus {
    Free,
    /// Marked for destruction while executing on another CPU; reaped at
    /// that CPU's next kernel entry.
    Dying,
    Runnable,
    Running,
    NotRunnable,
}

pub struct Process {
    pub id: ProcId,
    pub parent: ProcId,
    pub status: ProcStatus,
    pub frame: TrapFrame,
    pub space: Option<AddressSpace>,
    pub vmas: VmaTable,
    /// Process this one blocks on, cleared when that process is freed.
    pub waiting_for: Option<ProcId>,
    /// CPU that last ran this process.
    pub cpu: usize,
    /// Remaining slice in TSC ticks.
    pub time_left: i64,
    pub last_tsc: u64,
    pub runs: u32,
    free_link: Option<u16>,
}

impl Process {
    fn empty(index: usize, free_link: Option<u16>) -> Self {
        Process {
            id: ProcId(index as u32),
            parent: ProcId(0),
            status: ProcStatus::Free,
            frame: TrapFrame::default(),
            space: None,
            vmas: VmaTable::new(),
            waiting_for: None,
            cpu: 0,
            time_left: 0,
            last_tsc: 0,
            runs: 0,
            free_link,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStatus {
    Unused,
    Started,
    Halted,
}

pub struct CpuRecord {
    pub apic_id: usize,
    pub status: CpuStatus,
    pub cur: Option<ProcId>,
    pub cur_kthread: Option<usize>,
    pub kstack_top: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// Fully torn down.
    Done,
    /// The victim runs on another CPU; it is now `Dying` and that CPU will
    /// finish the job on its next kernel entry.
    Deferred,
    /// The victim was the caller's current process; the caller must not
    /// return to it and has to enter the scheduler.
    WasCurrent,
}

pub struct ProcessTable {
    procs: Vec<Process>,
    free_head: Option<u16>,
    pub cpus: Vec<CpuRecord>,
    pub kthreads: Vec<KThread>,
}

impl ProcessTable {
    pub fn new(ncpu: usize) -> Self {
        let mut procs = Vec::with_capacity(NENV);
        for i in 0..NENV {
            let next = if i + 1 < NENV {
                Some((i + 1) as u16)
            } else {
                None
            };
            procs.push(Process::empty(i, next));
        }
        let cpus = (0..ncpu)
            .map(|i| CpuRecord {
                apic_id: i,
                status: if i == 0 {
                    CpuStatus::Started
                } else {
                    CpuStatus::Unused
                },
                cur: None,
                cur_kthread: None,
                kstack_top: KSTACK_TOP - ((KSTACK_SIZE + KSTACK_GAP) * i) as u64,
            })
            .collect();
        ProcessTable {
            procs,
            free_head: Some(0),
            cpus,
            kthreads: Vec::new(),
        }
    }

    pub fn get(&self, id: ProcId) -> KResult<&Process> {
        let p = &self.procs[id.index()];
        if p.status == ProcStatus::Free || p.id != id {
            return Err(KernelError::BadEnv);
        }
        Ok(p)
    }

    pub fn get_mut(&mut self, id: ProcId) -> KResult<&mut Process> {
        let p = &mut self.procs[id.index()];
        if p.status == ProcStatus::Free || p.id != id {
            return Err(KernelError::BadEnv);
        }
        Ok(p)
    }

    pub fn by_index(&self, index: usize) -> &Process {
        &self.procs[index]
    }

    pub fn by_index_mut(&mut self, index: usize) -> &mut Process {
        &mut self.procs[index]
    }

    /// Distinct mutable borrows of two table slots.
    pub fn pair_mut(&mut self, a: usize, b: usize) -> (&mut Process, &mut Process) {
        assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.procs.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.procs.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    /// Resolve a raw id from the syscall surface. 0 names the caller; with
    /// `checkperm` the target must be the caller or its immediate child.
    pub fn resolve(&self, caller: ProcId, raw: u32, checkperm: bool) -> KResult<ProcId> {
        if raw == 0 {
            return Ok(caller);
        }
        let id = ProcId(raw);
        let p = self.get(id)?;
        if checkperm && id != caller && p.parent != caller {
            return Err(KernelError::BadEnv);
        }
        Ok(id)
    }

    /// Allocate a control block and a fresh address space.
    pub fn alloc(&mut self, phys: &mut PhysState, parent: ProcId) -> KResult<ProcId> {
        let idx = self.free_head.ok_or(KernelError::NoFreeEnv)? as usize;
        let space = AddressSpace::new(phys)?;

        let next_free = self.procs[idx].free_link;
        let p = &mut self.procs[idx];

        // Bump the generation; never produce id 0.
        let mut generation = p.id.0.wrapping_add(1 << ID_GENERATION_SHIFT) & !(NENV as u32 - 1);
        if generation == 0 {
            generation = 1 << ID_GENERATION_SHIFT;
        }
        p.id = ProcId(generation | idx as u32);
        p.parent = parent;
        p.status = ProcStatus::Runnable;
        p.space = Some(space);
        p.vmas = VmaTable::new();
        p.waiting_for = None;
        p.runs = 0;
        p.time_left = TIME_SLICE;
        p.last_tsc = 0;
        p.frame = TrapFrame::default();
        p.frame.cs = USER_CODE_SEL;
        p.frame.ss = USER_DATA_SEL;
        p.frame.ds = USER_DATA_SEL;
        p.free_link = None;

        self.free_head = next_free;
        let id = p.id;
        kinfo!("new env {:#x} (parent {:#x})", id.0, parent.0);
        Ok(id)
    }

    pub fn current(&self, cpu: usize) -> Option<ProcId> {
        self.cpus[cpu].cur
    }

    /// Destroy `victim`. Either completes here, or (when the victim is
    /// executing on a different CPU) marks it `Dying` and kicks that CPU
    /// with the kill IPI.
    pub fn destroy(
        &mut self,
        phys: &mut PhysState,
        swap: &mut SwapState,
        victim: ProcId,
        this_cpu: usize,
    ) -> KResult<DestroyOutcome> {
        let (status, vcpu) = {
            let p = self.get(victim)?;
            (p.status, p.cpu)
        };
        if status == ProcStatus::Running && vcpu != this_cpu {
            self.get_mut(victim)?.status = ProcStatus::Dying;
            apic::raise_ipi(self.cpus[vcpu].apic_id, IPI_KILL);
            kwarn!("env {:#x} marked dying on cpu {}", victim.0, vcpu);
            return Ok(DestroyOutcome::Deferred);
        }
        let was_current = self.cpus[this_cpu].cur == Some(victim);
        self.teardown(phys, swap, victim);
        if was_current {
            self.cpus[this_cpu].cur = None;
            Ok(DestroyOutcome::WasCurrent)
        } else {
            Ok(DestroyOutcome::Done)
        }
    }

    /// Finish destruction of a `Dying` current process on kernel entry.
    pub fn reap_if_dying(
        &mut self,
        phys: &mut PhysState,
        swap: &mut SwapState,
        cpu: usize,
    ) -> bool {
        let Some(cur) = self.cpus[cpu].cur else {
            return false;
        };
        let dying = self
            .get(cur)
            .map(|p| p.status == ProcStatus::Dying)
            .unwrap_or(false);
        if dying {
            self.teardown(phys, swap, cur);
            self.cpus[cpu].cur = None;
        }
        dying
    }

    /// Release everything the process owns: swap slots through the reverse
    /// index, reverse-map entries on every frame, the page-table tree below
    /// `USER_TOP`, and finally the control block itself. Waiters on this
    /// process wake up.
    fn teardown(&mut self, phys: &mut PhysState, swap: &mut SwapState, victim: ProcId) {
        kinfo!("free env {:#x}", victim.0);
        let idx = victim.index();
        let vmas = core::mem::replace(&mut self.procs[idx].vmas, VmaTable::new());
        let space = self.procs[idx].space.take();

        // Swap slots referenced by this process's VMAs.
        for vma in vmas.iter() {
            for (&va, &slot) in vma.swapped.iter() {
                crate::swap::slot_forget(phys, swap, slot, victim, va);
            }
        }

        // Reverse-map entries on every resident frame.
        for pfn in 0..phys.npages() as u32 {
            let head = phys.frames.frame(pfn).rmap;
            if head.is_some() && phys.rmap.contains_proc(head, victim) {
                let mut h = head;
                phys.rmap.remove_proc(&mut h, victim);
                phys.frames.frame_mut(pfn).rmap = h;
            }
        }

        // The page-table tree, leaves first.
        if let Some(mut space) = space {
            space.free_tree(phys, victim);
            space.release_root(phys);
        }

        // Anyone blocked on us resumes.
        for p in self.procs.iter_mut() {
            if p.waiting_for == Some(victim) {
                p.waiting_for = None;
            }
        }

        for c in self.cpus.iter_mut() {
            if c.cur == Some(victim) {
                c.cur = None;
            }
        }

        let p = &mut self.procs[idx];
        p.status = ProcStatus::Free;
        p.waiting_for = None;
        p.free_link = self.free_head;
        self.free_head = Some(idx as u16);
    }

    /// Block the caller until `target` is freed. Waiting on yourself would
    /// never wake up, so it is refused.
    pub fn wait(&mut self, caller: ProcId, target: ProcId) -> KResult<()> {
        if caller == target {
            return Err(KernelError::Invalid);
        }
        self.get(target)?;
        self.get_mut(caller)?.waiting_for = Some(target);
        Ok(())
    }

    pub fn runnable_exists(&self) -> bool {
        self.procs.iter().any(|p| {
            matches!(
                p.status,
                ProcStatus::Runnable | ProcStatus::Running | ProcStatus::Dying
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::phys::testing::phys_with_pages;
    use crate::swap::testing::swap_with_slots;

    fn table() -> ProcessTable {
        ProcessTable::new(2)
    }

    #[test]
    fn alloc_in_array_order_and_generation_uniqueness() {
        let mut phys = phys_with_pages(256);
        let mut swap = swap_with_slots(8);
        let mut t = table();
        let a = t.alloc(&mut phys, ProcId(0)).unwrap();
        let b = t.alloc(&mut phys, ProcId(0)).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_ne!(a.0, 0);

        t.destroy(&mut phys, &mut swap, a, 0).unwrap();
        let c = t.alloc(&mut phys, ProcId(0)).unwrap();
        // Slot reused, id not.
        assert_eq!(c.index(), 0);
        assert_ne!(c, a);
        // The stale id no longer resolves.
        assert_eq!(t.get(a).err(), Some(KernelError::BadEnv));
    }

    #[test]
    fn resolve_checks_permission() {
        let mut phys = phys_with_pages(256);
        let mut t = table();
        let parent = t.alloc(&mut phys, ProcId(0)).unwrap();
        let child = t.alloc(&mut phys, parent).unwrap();
        let stranger = t.alloc(&mut phys, ProcId(0)).unwrap();

        assert_eq!(t.resolve(parent, 0, true).unwrap(), parent);
        assert_eq!(t.resolve(parent, child.0, true).unwrap(), child);
        assert_eq!(
            t.resolve(parent, stranger.0, true).err(),
            Some(KernelError::BadEnv)
        );
        // Without the permission check a live id resolves.
        assert_eq!(t.resolve(parent, stranger.0, false).unwrap(), stranger);
    }

    #[test]
    fn teardown_releases_all_memory() {
        let mut phys = phys_with_pages(256);
        let mut swap = swap_with_slots(8);
        let mut t = table();
        let free_before = phys.frames.free_pages();
        let id = t.alloc(&mut phys, ProcId(0)).unwrap();
        {
            use crate::memory::addrspace::PagePerm;
            use crate::memory::frame::AllocFlags;
            let p = t.get_mut(id).unwrap();
            let space = p.space.as_mut().unwrap();
            for i in 0..4u64 {
                let pfn = phys.page_alloc(AllocFlags::ZERO).unwrap();
                space
                    .insert(
                        &mut phys,
                        id,
                        pfn,
                        0x40_0000 + i * 4096,
                        PagePerm::USER | PagePerm::WRITE,
                    )
                    .unwrap();
                phys.lru_push(pfn);
            }
        }
        assert_eq!(t.destroy(&mut phys, &mut swap, id, 0).unwrap(), DestroyOutcome::Done);
        assert_eq!(phys.frames.free_pages(), free_before);
        phys.check();
    }

    #[test]
    fn destroy_running_elsewhere_defers() {
        let mut phys = phys_with_pages(256);
        let mut swap = swap_with_slots(8);
        let mut t = table();
        let id = t.alloc(&mut phys, ProcId(0)).unwrap();
        {
            let p = t.get_mut(id).unwrap();
            p.status = ProcStatus::Running;
            p.cpu = 1;
        }
        t.cpus[1].cur = Some(id);
        assert_eq!(
            t.destroy(&mut phys, &mut swap, id, 0).unwrap(),
            DestroyOutcome::Deferred
        );
        assert_eq!(t.get(id).unwrap().status, ProcStatus::Dying);
        // CPU 1 reaps on its next kernel entry.
        assert!(t.reap_if_dying(&mut phys, &mut swap, 1));
        assert_eq!(t.get(id).err(), Some(KernelError::BadEnv));
    }

    #[test]
    fn wait_semantics() {
        let mut phys = phys_with_pages(256);
        let mut swap = swap_with_slots(8);
        let mut t = table();
        let a = t.alloc(&mut phys, ProcId(0)).unwrap();
        let b = t.alloc(&mut phys, a).unwrap();

        assert_eq!(t.wait(a, a).err(), Some(KernelError::Invalid));
        t.wait(a, b).unwrap();
        assert_eq!(t.get(a).unwrap().waiting_for, Some(b));

        t.destroy(&mut phys, &mut swap, b, 0).unwrap();
        // At the instant b is freed no waiter still names it.
        assert_eq!(t.get(a).unwrap().waiting_for, None);
    }
}

//! Per-CPU round-robin scheduling.
//!
//! `pick` is a pure decision over the process table, the caller's CPU and a
//! timestamp: resume the current process while its slice lasts, otherwise
//! scan for the next runnable starting at the successor slot, then consider
//! kernel threads whose wait elapsed, then halt. `commit` applies the
//! status transitions; the bare-metal `sched_yield` wraps both and
//! dispatches.

pub mod kthread;

use crate::arch::x86_64 as arch;
use crate::arch::x86_64::apic;
use crate::locks;
use crate::memory::layout::{MAX_KTHREADS, NENV, TIME_SLICE};
use crate::process::{CpuStatus, ProcId, ProcStatus, ProcessTable};
use crate::traps::TrapFrame;
use kthread::{KThread, KthreadStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The current process keeps its remaining slice.
    Resume(ProcId),
    /// Dispatch with a fresh slice.
    Run(ProcId),
    RunKthread(usize),
    Halt,
}

/// Decide what this CPU runs next. Updates slice accounting for the
/// current process and for runnable kernel threads as a side effect.
pub fn pick(table: &mut ProcessTable, cpu: usize, now: u64) -> Decision {
    // Charge the caller's process for the time it just used.
    if let Some(cur) = table.cpus[cpu].cur {
        if let Ok(p) = table.get_mut(cur) {
            if p.status == ProcStatus::Running && p.cpu == cpu {
                let elapsed = now.wrapping_sub(p.last_tsc) as i64;
                p.time_left -= elapsed;
                p.last_tsc = now;
                if p.time_left > 0 && p.waiting_for.is_none() {
                    return Decision::Resume(cur);
                }
                p.time_left = p.time_left.max(0);
            }
        }
    }

    // Kernel-thread waits tick down whenever the scheduler runs.
    for kt in table.kthreads.iter_mut() {
        if kt.status == KthreadStatus::Runnable {
            let elapsed = now.wrapping_sub(kt.last_tsc) as i64;
            kt.wait_left -= elapsed;
            kt.last_tsc = now;
        }
    }

    // Round robin from the successor of the last-run slot.
    let start = table.cpus[cpu].cur.map(|c| c.index()).unwrap_or(NENV - 1);
    for off in 1..=NENV {
        let idx = (start + off) % NENV;
        let p = table.by_index(idx);
        if p.status == ProcStatus::Runnable && p.waiting_for.is_none() {
            return Decision::Run(p.id);
        }
    }

    // No runnable process: a kernel thread whose wait elapsed may run.
    if let Some(j) = table
        .kthreads
        .iter()
        .position(|kt| kt.status == KthreadStatus::Runnable && kt.wait_left <= 0)
    {
        return Decision::RunKthread(j);
    }

    // Nothing else: the expired current process gets a fresh slice rather
    // than leaving the CPU idle.
    if let Some(cur) = table.cpus[cpu].cur {
        if let Ok(p) = table.get(cur) {
            if matches!(p.status, ProcStatus::Running | ProcStatus::Runnable)
                && p.waiting_for.is_none()
                && p.cpu == cpu
            {
                return Decision::Run(cur);
            }
        }
    }

    Decision::Halt
}

/// Apply the status transitions a decision implies.
pub fn commit(table: &mut ProcessTable, cpu: usize, decision: Decision, now: u64) {
    match decision {
        Decision::Resume(id) => {
            let p = table.get_mut(id).expect("resumed process is live");
            p.runs += 1;
        }
        Decision::Run(id) => {
            if let Some(prev) = table.cpus[cpu].cur {
                if prev != id {
                    if let Ok(p) = table.get_mut(prev) {
                        if p.status == ProcStatus::Running && p.cpu == cpu {
                            p.status = ProcStatus::Runnable;
                        }
                    }
                }
            }
            let p = table.get_mut(id).expect("picked process is live");
            p.status = ProcStatus::Running;
            p.cpu = cpu;
            p.time_left = TIME_SLICE;
            p.last_tsc = now;
            p.runs += 1;
            table.cpus[cpu].cur = Some(id);
            table.cpus[cpu].status = CpuStatus::Started;
        }
        Decision::RunKthread(j) => {
            if let Some(prev) = table.cpus[cpu].cur {
                if let Ok(p) = table.get_mut(prev) {
                    if p.status == ProcStatus::Running && p.cpu == cpu {
                        p.status = ProcStatus::Runnable;
                    }
                }
            }
            let kt = &mut table.kthreads[j];
            kt.status = KthreadStatus::Running;
            kt.cpu = cpu;
            table.cpus[cpu].cur_kthread = Some(j);
            table.cpus[cpu].status = CpuStatus::Started;
        }
        Decision::Halt => {
            if let Some(prev) = table.cpus[cpu].cur {
                if let Ok(p) = table.get_mut(prev) {
                    if p.status == ProcStatus::Running && p.cpu == cpu {
                        p.status = ProcStatus::Runnable;
                    }
                }
            }
            table.cpus[cpu].cur = None;
            table.cpus[cpu].status = CpuStatus::Halted;
        }
    }
}

enum Dispatch {
    User(u64, TrapFrame),
    Kthread(u64),
    Halt,
}

/// Choose and run. Never returns; the halt path releases the process-table
/// lock, halts until an interrupt, and retries.
pub fn sched_yield() -> ! {
    let cpu = apic::this_cpu_id();
    loop {
        let now = arch::read_tsc();
        let action = {
            let mut envs = locks::env();
            let decision = pick(&mut envs, cpu, now);
            commit(&mut envs, cpu, decision, now);
            match decision {
                Decision::Resume(id) | Decision::Run(id) => {
                    let p = envs.get(id).expect("dispatched process is live");
                    Dispatch::User(p.space.as_ref().expect("user space").root_pa(), p.frame)
                }
                Decision::RunKthread(j) => Dispatch::Kthread(envs.kthreads[j].rsp),
                Decision::Halt => {
                    if !envs.runnable_exists() && envs.kthreads.is_empty() {
                        panic!("no runnable processes left");
                    }
                    Dispatch::Halt
                }
            }
        };
        match action {
            Dispatch::User(root, frame) => unsafe {
                arch::load_root(root);
                arch::enter_user(&frame as *const TrapFrame);
            },
            Dispatch::Kthread(rsp) => unsafe { arch::kthread_restore(rsp) },
            Dispatch::Halt => {
                arch::enable_and_halt();
                arch::disable_interrupts();
            }
        }
    }
}

/// Register a kernel thread on its fixed stack.
///
/// # Safety
/// The kernel-thread stack window must be mapped (bare metal, after the
/// memory map is up).
pub unsafe fn kthread_create(table: &mut ProcessTable, entry: extern "C" fn() -> !) -> usize {
    let id = table.kthreads.len();
    assert!(id < MAX_KTHREADS, "kernel-thread table exhausted");
    let mut kt = KThread::new(id, entry as usize as u64, KThread::stack_top_for(id));
    kt.init_context();
    table.kthreads.push(kt);
    id
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
        // Save the caller's context in kthread-frame layout on its own
        // stack, then hand the stack pointer to the scheduler glue.
        core::arch::global_asm!(
            ".global karst_kthread_yield",
            "karst_kthread_yield:",
            "pushfq",
            "push rax",
            "push rcx",
            "push rdx",
            "push rbx",
            "push rbp",
            "push rsi",
            "push rdi",
            "push r8",
            "push r9",
            "push r10",
            "push r11",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov ax, ds",
            "push rax",
            "mov rdi, rsp",
            "call karst_kthread_park",
        );

        extern "C" {
            fn karst_kthread_yield();
        }

        /// Voluntary context-switch point for kernel-thread routines.
        pub fn kthread_yield() {
            unsafe { karst_kthread_yield() }
        }
    } else {
        /// Host stand-in: kernel threads never actually switch in tests.
        pub fn kthread_yield() {}
    }
}

/// Called from the save stub with the thread's saved stack pointer; parks
/// the thread and enters the scheduler.
#[no_mangle]
pub extern "C" fn karst_kthread_park(rsp: u64) -> ! {
    {
        let mut envs = locks::env();
        let cpu = apic::this_cpu_id();
        let j = envs.cpus[cpu]
            .cur_kthread
            .take()
            .expect("park outside a kernel thread");
        let now = arch::read_tsc();
        let kt = &mut envs.kthreads[j];
        kt.rsp = rsp;
        kt.note_yield(now);
    }
    sched_yield()
}

/// A kernel-thread routine ran to completion: reset it to its entry state
/// and give the CPU back.
pub fn kthread_finish() -> ! {
    {
        let mut envs = locks::env();
        let cpu = apic::this_cpu_id();
        let j = envs.cpus[cpu]
            .cur_kthread
            .take()
            .expect("finish outside a kernel thread");
        let now = arch::read_tsc();
        let kt = &mut envs.kthreads[j];
        unsafe { kt.note_finish(now) };
    }
    sched_yield()
}

//! Cooperative in-kernel threads.
//!
//! A kernel thread owns a small fixed stack in the kernel-thread window and
//! a saved context frame on that stack. Unlike a user process, its slice
//! counts the wait *between* runs: the scheduler dispatches a thread once
//! its wait has elapsed and no user process is runnable. A thread yields
//! back voluntarily; `finish` resets it to its entry state so the next
//! dispatch starts the routine from the top.

use crate::memory::layout::{
    KTHREAD_STACK_GAP, KTHREAD_STACK_SIZE, KTHREAD_STACK_TOP, KTHREAD_WAIT, MAX_KTHREADS,
};
use crate::traps::KERNEL_DATA_SEL;

/// Context saved on the thread's own stack, restored by `kthread_restore`.
/// Lowest address first.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KthreadFrame {
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
    pub rflags: u64,
    pub rip: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KthreadStatus {
    Runnable,
    Running,
}

pub struct KThread {
    pub id: usize,
    pub status: KthreadStatus,
    /// Address of the thread routine.
    pub entry: u64,
    pub stack_top: u64,
    /// Saved stack pointer; the context frame lives at this address.
    pub rsp: u64,
    /// Remaining wait before the next run, in TSC ticks.
    pub wait_left: i64,
    pub last_tsc: u64,
    pub cpu: usize,
}

impl KThread {
    pub fn new(id: usize, entry: u64, stack_top: u64) -> Self {
        KThread {
            id,
            status: KthreadStatus::Runnable,
            entry,
            stack_top,
            rsp: 0,
            wait_left: KTHREAD_WAIT,
            last_tsc: 0,
            cpu: 0,
        }
    }

    /// Stack top for kthread slot `id` in the fixed window.
    pub fn stack_top_for(id: usize) -> u64 {
        assert!(id < MAX_KTHREADS);
        KTHREAD_STACK_TOP - ((KTHREAD_STACK_SIZE + KTHREAD_STACK_GAP) * id) as u64
    }

    /// Write the initial context frame onto the thread stack: entry point
    /// in `rip`, frame pointer at the stack top, kernel data segment.
    ///
    /// # Safety
    /// `stack_top` must point past writable memory of at least
    /// `size_of::<KthreadFrame>()` bytes.
    pub unsafe fn init_context(&mut self) {
        let mut frame = KthreadFrame::default();
        frame.rip = self.entry;
        frame.rbp = self.stack_top;
        frame.ds = KERNEL_DATA_SEL;
        frame.rflags = 0x2;
        let at = self.stack_top - core::mem::size_of::<KthreadFrame>() as u64;
        core::ptr::write(at as *mut KthreadFrame, frame);
        self.rsp = at;
    }

    /// Accounting when the thread gives the CPU back: the wait restarts and
    /// the thread becomes dispatchable again once it elapses.
    pub fn note_yield(&mut self, now: u64) {
        self.wait_left = KTHREAD_WAIT;
        self.last_tsc = now;
        self.status = KthreadStatus::Runnable;
    }

    /// Thread routine ran to completion: rebuild the entry-state context so
    /// the next dispatch starts from the beginning.
    ///
    /// # Safety
    /// See `init_context`.
    pub unsafe fn note_finish(&mut self, now: u64) {
        self.init_context();
        self.note_yield(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread_on_buffer(buf: &mut [u8]) -> KThread {
        let top = buf.as_mut_ptr() as u64 + buf.len() as u64;
        let mut kt = KThread::new(0, 0xDEAD_B000, top);
        unsafe { kt.init_context() };
        kt
    }

    #[test]
    fn init_context_builds_entry_frame() {
        let mut buf = alloc::vec![0u8; 4096];
        let kt = thread_on_buffer(&mut buf);
        assert_eq!(
            kt.rsp,
            kt.stack_top - core::mem::size_of::<KthreadFrame>() as u64
        );
        let frame = unsafe { *(kt.rsp as *const KthreadFrame) };
        assert_eq!(frame.rip, 0xDEAD_B000);
        assert_eq!(frame.rbp, kt.stack_top);
        assert_eq!(frame.ds, KERNEL_DATA_SEL);
    }

    #[test]
    fn yield_restarts_the_wait() {
        let mut buf = alloc::vec![0u8; 4096];
        let mut kt = thread_on_buffer(&mut buf);
        kt.wait_left = -5;
        kt.status = KthreadStatus::Running;
        kt.note_yield(1000);
        assert_eq!(kt.wait_left, KTHREAD_WAIT);
        assert_eq!(kt.last_tsc, 1000);
        assert_eq!(kt.status, KthreadStatus::Runnable);
    }

    #[test]
    fn finish_resets_to_entry_state() {
        let mut buf = alloc::vec![0u8; 4096];
        let mut kt = thread_on_buffer(&mut buf);
        let initial_rsp = kt.rsp;
        // Pretend the thread ran and clobbered its saved context position.
        kt.rsp = initial_rsp - 256;
        kt.status = KthreadStatus::Running;
        unsafe { kt.note_finish(7) };
        assert_eq!(kt.rsp, initial_rsp);
        let frame = unsafe { *(kt.rsp as *const KthreadFrame) };
        assert_eq!(frame.rip, 0xDEAD_B000);
        assert_eq!(kt.status, KthreadStatus::Runnable);
    }

    #[test]
    fn stack_tops_do_not_collide() {
        let a = KThread::stack_top_for(0);
        let b = KThread::stack_top_for(1);
        assert!(a - b >= KTHREAD_STACK_SIZE as u64);
    }
}

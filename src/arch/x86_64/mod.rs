//! x86-64 glue: CPU intrinsics and the contracts of the external
//! collaborators (boot loader, APIC layer, GDT/IDT/TSS programming).
//!
//! Everything privileged is compiled for bare metal only; on the host the
//! same entry points exist as inert stubs so the memory, swap and scheduling
//! logic links and runs under the test harness.

pub mod apic;
pub mod boot;
pub mod ide;
pub mod serial;

use crate::traps::TrapFrame;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
        use x86_64::instructions::tlb;
        use x86_64::registers::control::{Cr2, Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        use x86_64::{PhysAddr, VirtAddr};

        /// Invalidate one TLB entry on the executing CPU.
        #[inline]
        pub fn invlpg(va: u64) {
            tlb::flush(VirtAddr::new(va));
        }

        /// Flush the whole non-global TLB.
        #[inline]
        pub fn flush_all() {
            tlb::flush_all();
        }

        /// Faulting address of the last page fault.
        #[inline]
        pub fn fault_address() -> u64 {
            Cr2::read().as_u64()
        }

        /// Switch to the address space rooted at `root_pa`.
        ///
        /// The root must be a live PML4; the kernel half must be mapped.
        #[inline]
        pub unsafe fn load_root(root_pa: u64) {
            let frame = PhysFrame::containing_address(PhysAddr::new(root_pa));
            Cr3::write(frame, Cr3Flags::empty());
        }

        /// Physical address of the active PML4.
        #[inline]
        pub fn current_root() -> u64 {
            Cr3::read().0.start_address().as_u64()
        }

        #[inline]
        pub fn read_tsc() -> u64 {
            unsafe { core::arch::x86_64::_rdtsc() }
        }

        /// Enable interrupts and halt until the next one.
        #[inline]
        pub fn enable_and_halt() {
            x86_64::instructions::interrupts::enable_and_hlt();
        }

        #[inline]
        pub fn disable_interrupts() {
            x86_64::instructions::interrupts::disable();
        }

        /// Drop to user mode by restoring a trap frame with `iretq`.
        ///
        /// Contract of the GDT/IDT/TSS layer: segment selectors in `frame`
        /// are valid user selectors and the kernel stack for the next entry
        /// is programmed into the TSS.
        pub unsafe fn enter_user(frame: *const TrapFrame) -> ! {
            core::arch::asm!(
                "mov rsp, {0}",
                "pop rax",          // ds
                "mov ds, ax",
                "mov es, ax",
                "pop r15", "pop r14", "pop r13", "pop r12",
                "pop r11", "pop r10", "pop r9", "pop r8",
                "pop rdi", "pop rsi", "pop rbp", "pop rbx",
                "pop rdx", "pop rcx", "pop rax",
                "add rsp, 16",      // int_no, err_code
                "iretq",
                in(reg) frame,
                options(noreturn)
            );
        }

        /// Resume a kernel thread whose context frame sits at `rsp`.
        pub unsafe fn kthread_restore(rsp: u64) -> ! {
            core::arch::asm!(
                "mov rsp, {0}",
                "pop rax",          // ds
                "mov ds, ax",
                "pop r15", "pop r14", "pop r13", "pop r12",
                "pop r11", "pop r10", "pop r9", "pop r8",
                "pop rdi", "pop rsi", "pop rbp", "pop rbx",
                "pop rdx", "pop rcx", "pop rax",
                "popfq",
                "ret",
                in(reg) rsp,
                options(noreturn)
            );
        }
    } else {
        // Host build: the logic above the arch layer runs in tests; nothing
        // here may touch privileged state.

        #[inline]
        pub fn invlpg(_va: u64) {}

        #[inline]
        pub fn flush_all() {}

        #[inline]
        pub fn fault_address() -> u64 {
            0
        }

        #[inline]
        pub unsafe fn load_root(_root_pa: u64) {}

        #[inline]
        pub fn current_root() -> u64 {
            0
        }

        #[inline]
        pub fn read_tsc() -> u64 {
            0
        }

        #[inline]
        pub fn enable_and_halt() {}

        #[inline]
        pub fn disable_interrupts() {}

        pub unsafe fn enter_user(_frame: *const TrapFrame) -> ! {
            unreachable!("enter_user outside a bare-metal build")
        }

        pub unsafe fn kthread_restore(_rsp: u64) -> ! {
            unreachable!("kthread_restore outside a bare-metal build")
        }
    }
}

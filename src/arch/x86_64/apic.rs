//! Local-APIC contract.
//!
//! ACPI discovery is an external collaborator: it hands the kernel the CPU
//! count and starts the secondary processors at `MPENTRY_PADDR`. This module
//! carries the minimal register interface the core needs: the executing
//! CPU's id, `raise_ipi`, and `eoi`.

use core::sync::atomic::{AtomicUsize, Ordering};

const LAPIC_PHYS: u64 = 0xFEE0_0000;

const REG_ID: u64 = 0x020;
const REG_EOI: u64 = 0x0B0;
const REG_ICR_LO: u64 = 0x300;
const REG_ICR_HI: u64 = 0x310;

/// ICR delivery: fixed vector, physical destination, assert.
const ICR_FIXED_ASSERT: u32 = 0x0000_4000;

static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

/// Recorded by the ACPI layer during bring-up.
pub fn set_cpu_count(n: usize) {
    CPU_COUNT.store(n.max(1), Ordering::Release);
}

pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire)
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
        #[inline]
        unsafe fn reg(offset: u64) -> *mut u32 {
            (crate::memory::layout::KERNEL_BASE + LAPIC_PHYS + offset) as *mut u32
        }

        /// Local APIC id of the executing CPU.
        pub fn this_cpu_id() -> usize {
            unsafe { (reg(REG_ID).read_volatile() >> 24) as usize }
        }

        pub fn eoi() {
            unsafe { reg(REG_EOI).write_volatile(0) }
        }

        /// Send `vector` to the CPU with APIC id `cpu`.
        pub fn raise_ipi(cpu: usize, vector: u8) {
            unsafe {
                reg(REG_ICR_HI).write_volatile((cpu as u32) << 24);
                reg(REG_ICR_LO).write_volatile(ICR_FIXED_ASSERT | vector as u32);
                // Wait for delivery to settle.
                while reg(REG_ICR_LO).read_volatile() & 0x1000 != 0 {
                    core::hint::spin_loop();
                }
            }
        }
    } else {
        pub fn this_cpu_id() -> usize {
            0
        }

        pub fn eoi() {}

        pub fn raise_ipi(_cpu: usize, _vector: u8) {}
    }
}

//! Sealed memory-map constants and kernel tunables.
//!
//! The high half is fixed by convention: user mappings live strictly below
//! `USER_TOP`, read-only views of the process table and the page array sit
//! just under the user limit, and the kernel stacks, kernel-thread stacks and
//! the swap/reverse-map pool windows occupy dedicated aligned regions below
//! the kernel stack top.

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Small frames per 2 MiB huge frame.
pub const SMALL_PER_HUGE: usize = 512;
pub const HUGE_PAGE_SIZE: usize = PAGE_SIZE * SMALL_PER_HUGE;

pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

const GIB: u64 = 1 << 30;

/// Kernel virtual base: all of physical memory is mapped here.
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// End of the canonical lower half.
pub const USER_LIM: u64 = 0x0000_8000_0000_0000;
/// User-visible read-only view of the page array.
pub const USER_PAGES: u64 = USER_LIM - GIB;
/// User-visible read-only view of the process table.
pub const USER_ENVS: u64 = USER_PAGES - GIB;
/// User-visible read-only view of the VMA tables.
pub const USER_VMAS: u64 = USER_ENVS - GIB;
/// Upper bound of user mappings.
pub const USER_TOP: u64 = USER_ENVS;

pub const UXSTACK_TOP: u64 = USER_TOP;
pub const USTACK_TOP: u64 = UXSTACK_TOP - 2 * PAGE_SIZE as u64;
/// Demand-paged user stack reservation.
pub const USTACK_PAGES: usize = 8;

/// Physical I/O hole: `[640 KiB, 1 MiB)` must never reach the free list.
pub const IO_HOLE_START: u64 = 0x000A_0000;
pub const IO_HOLE_END: u64 = 0x0010_0000;

/// Physical address where secondary processors start executing.
pub const MPENTRY_PADDR: u64 = 0x7000;

/// Per-CPU kernel stacks, top down from the MMIO window.
pub const KSTACK_TOP: u64 = USER_VMAS - GIB;
pub const KSTACK_SIZE: usize = 8 * PAGE_SIZE;
pub const KSTACK_GAP: usize = 8 * PAGE_SIZE;

/// Kernel-thread stacks below the per-CPU stacks.
pub const KTHREAD_STACK_TOP: u64 =
    KSTACK_TOP - ((KSTACK_SIZE + KSTACK_GAP) * NCPU_MAX) as u64;
pub const KTHREAD_STACK_SIZE: usize = 2 * PAGE_SIZE;
pub const KTHREAD_STACK_GAP: usize = PAGE_SIZE;

/// Fixed early-heap size, carved out right after the kernel image.
pub const KHEAP_SIZE: usize = 4 * 1024 * 1024;

pub const NENV: usize = 128;
pub const NVMA: usize = 128;
pub const MAX_KTHREADS: usize = 32;
pub const NCPU_MAX: usize = 8;

/// Bits above this in a process id form the generation counter.
pub const ID_GENERATION_SHIFT: u32 = 12;

/// Time-slice quantum for user processes, in TSC ticks.
pub const TIME_SLICE: i64 = 100_000_000;
/// Wait-between-runs quantum for kernel threads, in TSC ticks.
pub const KTHREAD_WAIT: i64 = 500_000_000;

/// Reclaim starts when the free-frame count drops below this.
pub const FREEPAGE_THRESHOLD: usize = 512;
/// Reclaim frees this many frames beyond the threshold.
pub const FREEPAGE_OVERSHOOT: usize = 512;

/// Reverse-map pools may grow to this many backing pages each.
pub const RMAP_POOL_MAX_PAGES: usize = 256;

#[inline]
pub const fn align_down(x: u64, align: u64) -> u64 {
    x & !(align - 1)
}

#[inline]
pub const fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) & !(align - 1)
}

#[inline]
pub const fn page_index(pa: u64) -> usize {
    (pa >> PAGE_SHIFT) as usize
}

//! karst: the memory-management and scheduling core of a small x86-64
//! teaching kernel.
//!
//! The library hosts the hard parts: the physical frame allocator (4 KiB and
//! 2 MiB frames), four-level address translation, per-process VMAs with
//! demand paging and copy-on-write fork, page reclaim with disk swap and an
//! OOM killer, and a preemptive per-CPU round-robin scheduler with kernel
//! threads. The boot loader, interrupt controller programming and the
//! GDT/IDT/TSS layer are external collaborators; their contracts live in
//! `arch::x86_64`.
//!
//! Everything above the arch layer is testable on a host: unit tests run the
//! real page-table walks and the real swap path against an in-memory
//! physical arena and a RAM-backed disk.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod arch;
pub mod err;
pub mod loader;
pub mod locks;
pub mod log;
pub mod memory;
pub mod process;
pub mod sched;
pub mod swap;
pub mod syscall;
pub mod traps;

pub use err::{KernelError, KResult};

//! The kernel lock set.
//!
//! Three data-bearing locks guard the three state domains, in a fixed
//! acquisition order with no cycles:
//!
//!   process table (env) → page allocator (phys) → swap
//!
//! Entry points acquire what their path needs in this order and pass `&mut`
//! references down; inner code never re-locks, so a legal order is checked
//! at compile time instead of at runtime. The console lock lives inside the
//! logger, the free-frame counter is its own atomic domain
//! (`memory::frame::NFREE_PAGES`), and a master gate serializes bring-up.

use lazy_static::lazy_static;
use spin::{Mutex, MutexGuard};

use crate::memory::phys::PhysState;
use crate::process::ProcessTable;
use crate::swap::SwapState;

lazy_static! {
    /// Process table, free list, status transitions, per-CPU current
    /// pointers, kernel threads, scheduler decisions.
    pub static ref ENV: Mutex<ProcessTable> = Mutex::new(ProcessTable::new(1));

    /// Frame table, reverse-mapping pools, CLOCK queue.
    pub static ref PHYS: Mutex<Option<PhysState>> = Mutex::new(None);

    /// Swap-slot array, free-slot list, the disk itself.
    pub static ref SWAP: Mutex<Option<SwapState>> = Mutex::new(None);
}

/// Bring-up gate: held while the boot CPU initializes the world and starts
/// the secondary processors.
pub static MASTER: Mutex<()> = Mutex::new(());

pub fn env() -> MutexGuard<'static, ProcessTable> {
    ENV.lock()
}

/// Acquire the full ordered lock chain and run `f` with all three domains.
pub fn with_mm<R>(f: impl FnOnce(&mut ProcessTable, &mut PhysState, &mut SwapState) -> R) -> R {
    let mut envs = ENV.lock();
    let mut phys = PHYS.lock();
    let mut swap = SWAP.lock();
    f(
        &mut envs,
        phys.as_mut().expect("physical memory initialized"),
        swap.as_mut().expect("swap initialized"),
    )
}

/// env → phys, for paths that never touch the disk.
pub fn with_env_phys<R>(f: impl FnOnce(&mut ProcessTable, &mut PhysState) -> R) -> R {
    let mut envs = ENV.lock();
    let mut phys = PHYS.lock();
    f(&mut envs, phys.as_mut().expect("physical memory initialized"))
}

/// Install the boot-discovered state. Called once, under the master gate,
/// before interrupts are enabled.
pub fn init(envs: ProcessTable, phys: PhysState, swap: SwapState) {
    *ENV.lock() = envs;
    *PHYS.lock() = Some(phys);
    *SWAP.lock() = Some(swap);
}

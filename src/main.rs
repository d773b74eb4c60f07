//! Bare-metal entry for the karst kernel.
//!
//! The boot loader drops us here with a `BootInfo` pointer; bring-up runs
//! under the master gate with the process-table lock held until the first
//! schedulable work exists, then the scheduler takes over.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    extern crate alloc;

    use core::panic::PanicInfo;

    use karst_kernel::arch::x86_64 as arch;
    use karst_kernel::arch::x86_64::boot::BootInfo;
    use karst_kernel::arch::x86_64::{apic, ide::IdeDisk, serial};
    use karst_kernel::memory::addrspace;
    use karst_kernel::memory::frame::NFREE_PAGES;
    use karst_kernel::memory::layout::{align_up, KERNEL_BASE, KHEAP_SIZE, PAGE_SIZE};
    use karst_kernel::memory::{heap, phys::PhysState};
    use karst_kernel::process::ProcessTable;
    use karst_kernel::swap::{reclaim, SwapState};
    use karst_kernel::{kinfo, locks, sched};
    use karst_kernel::log as klog;

    /// Init image handed over by the boot loader, if any.
    static INIT_IMAGE: spin::Once<&'static [u8]> = spin::Once::new();

    /// Boot-layer hook: register the embedded init ELF before `_start`
    /// reaches process creation.
    #[no_mangle]
    pub extern "C" fn karst_set_init_image(ptr: *const u8, len: usize) {
        let image = unsafe { core::slice::from_raw_parts(ptr, len) };
        INIT_IMAGE.call_once(|| image);
    }

    #[no_mangle]
    pub extern "C" fn _start(boot_info: &'static BootInfo) -> ! {
        serial::init();
        klog::init_logger(serial::write_str, klog::Level::Info);
        kinfo!("karst booting");

        let master = locks::MASTER.lock();

        // The loader's page tables already direct-map physical memory at
        // KERNEL_BASE; reuse its root as the shared kernel half.
        addrspace::set_kernel_root(arch::current_root());

        // Heap first: the frame table and pools allocate from it. The same
        // region is withheld from the free list below.
        let heap_start = align_up(boot_info.kernel_end, PAGE_SIZE as u64) + KERNEL_BASE;
        unsafe { heap::init(heap_start as *mut u8, KHEAP_SIZE) };
        let phys = unsafe { PhysState::init_from_boot(boot_info, &NFREE_PAGES) };

        let disk = IdeDisk::probe().expect("swap disk (primary slave) missing");
        let swap = SwapState::new(alloc::boxed::Box::new(disk));

        let mut envs = ProcessTable::new(apic::cpu_count());
        unsafe {
            sched::kthread_create(&mut envs, reclaim::reclaim_thread_main);
        }
        locks::init(envs, phys, swap);

        if let Some(image) = INIT_IMAGE.get().copied() {
            locks::with_env_phys(|envs, phys| {
                karst_kernel::loader::spawn(envs, phys, image).expect("load init image");
            });
        } else {
            kinfo!("no init image; idling");
        }

        drop(master);
        sched::sched_yield()
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        karst_kernel::kerror!("kernel panic: {}", info);
        loop {
            arch::enable_and_halt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("karst is a kernel image; build it for a bare-metal x86_64 target");
}

//! Physical-memory state: everything the page-allocator lock protects.
//!
//! One `PhysState` owns the frame table, the reverse-mapping pools and the
//! CLOCK reclaim queue, plus the translation between physical addresses and
//! kernel virtual addresses. On bare metal the translation is the fixed
//! `KERNEL_BASE` direct map built at boot; under the test harness it is a
//! page-aligned host arena, so page-table walks and swap copies exercise the
//! same code either way.

use crate::arch::x86_64::boot::{BootInfo, MMAP_FREE};
use crate::err::{KResult, KernelError};
use crate::memory::frame::{AllocFlags, FrameState, FrameTable, FreeCounter};
use crate::memory::layout::{
    align_up, page_index, HUGE_PAGE_SIZE, IO_HOLE_END, IO_HOLE_START, KERNEL_BASE, KHEAP_SIZE,
    MPENTRY_PADDR, PAGE_SHIFT, PAGE_SIZE,
};
use crate::memory::rmap::RmapPools;

pub struct PhysState {
    /// Kernel virtual address of physical address 0.
    base: *mut u8,
    npages: usize,
    pub frames: FrameTable,
    pub rmap: RmapPools,
    /// CLOCK reclaim queue: head is the next eviction candidate, new
    /// residents join at the tail.
    pub lru_head: Option<u32>,
    pub lru_tail: Option<u32>,
}

// The raw base pointer aliases nothing outside this struct's domain; the
// page-allocator lock serializes all access.
unsafe impl Send for PhysState {}

impl PhysState {
    /// Build the state from the boot memory map. Frame 0 (real-mode
    /// structures and the AP entry trampoline), the I/O hole, the kernel
    /// image and the early heap never reach the free list.
    ///
    /// # Safety
    /// The direct map at `KERNEL_BASE` must already cover all of physical
    /// memory, and the map entries must describe actual RAM.
    pub unsafe fn init_from_boot(boot: &BootInfo, counter: &'static FreeCounter) -> PhysState {
        let mut highest = 0u64;
        for e in boot.entries() {
            if e.kind == MMAP_FREE {
                highest = highest.max(e.addr + e.len);
            }
        }
        let npages = page_index(highest);

        let heap_start = align_up(boot.kernel_end, PAGE_SIZE as u64);
        let heap_end = heap_start + KHEAP_SIZE as u64;

        let mut state = PhysState {
            base: KERNEL_BASE as *mut u8,
            npages,
            frames: FrameTable::new(npages, counter),
            rmap: RmapPools::new(),
            lru_head: None,
            lru_tail: None,
        };

        let reserved = |pa: u64| {
            pa < PAGE_SIZE as u64
                || pa == MPENTRY_PADDR
                || (pa >= IO_HOLE_START && pa < IO_HOLE_END)
                || (pa >= IO_HOLE_END && pa < heap_end)
        };

        for e in boot.entries() {
            if e.kind != MMAP_FREE {
                continue;
            }
            let mut pa = align_up(e.addr, PAGE_SIZE as u64);
            while pa + PAGE_SIZE as u64 <= e.addr + e.len {
                if !reserved(pa) {
                    state.frames.release(page_index(pa) as u32);
                }
                pa += PAGE_SIZE as u64;
            }
        }
        state
    }

    /// State over an arbitrary arena; the test harness hands in leaked,
    /// page-aligned host memory.
    pub fn with_arena(base: *mut u8, npages: usize, counter: &'static FreeCounter) -> PhysState {
        let mut state = PhysState {
            base,
            npages,
            frames: FrameTable::new(npages, counter),
            rmap: RmapPools::new(),
            lru_head: None,
            lru_tail: None,
        };
        for pfn in 0..npages as u32 {
            state.frames.release(pfn);
        }
        state
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    #[inline]
    pub fn pa_of(pfn: u32) -> u64 {
        (pfn as u64) << PAGE_SHIFT
    }

    #[inline]
    pub fn pfn_of(pa: u64) -> u32 {
        (pa >> PAGE_SHIFT) as u32
    }

    /// Kernel virtual address of a physical address.
    #[inline]
    pub fn kva(&self, pa: u64) -> *mut u8 {
        debug_assert!(page_index(pa) < self.npages);
        unsafe { self.base.add(pa as usize) }
    }

    /// Contents of a frame as a byte slice.
    ///
    /// # Safety
    /// The frame must be allocated and not concurrently remapped.
    pub unsafe fn frame_bytes(&self, pfn: u32, len: usize) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.kva(Self::pa_of(pfn)), len)
    }

    fn zero(&mut self, pfn: u32, huge: bool) {
        let len = if huge { HUGE_PAGE_SIZE } else { PAGE_SIZE };
        unsafe {
            core::ptr::write_bytes(self.kva(Self::pa_of(pfn)), 0, len);
        }
    }

    /// Allocate a frame. Fails with `NoMem` when the free list is empty;
    /// the caller is responsible for running reclaim and retrying (see
    /// `swap::reclaim::alloc_or_reclaim`).
    pub fn page_alloc(&mut self, flags: AllocFlags) -> KResult<u32> {
        let pfn = self.frames.alloc(flags).ok_or(KernelError::NoMem)?;
        if flags.contains(AllocFlags::ZERO) {
            self.zero(pfn, flags.contains(AllocFlags::HUGE));
        }
        Ok(pfn)
    }

    pub fn page_free(&mut self, pfn: u32) {
        if self.frames.frame(pfn).in_lru {
            self.lru_remove(pfn);
        }
        debug_assert!(self.frames.frame(pfn).rmap.is_none());
        self.frames.free(pfn);
    }

    pub fn page_incref(&mut self, pfn: u32) {
        self.frames.frame_mut(pfn).refs += 1;
    }

    /// Drop one reference; the last one returns the frame to the allocator.
    pub fn page_decref(&mut self, pfn: u32) {
        let refs = {
            let f = self.frames.frame_mut(pfn);
            debug_assert!(f.refs > 0);
            f.refs -= 1;
            f.refs
        };
        if refs == 0 {
            self.page_free(pfn);
        }
    }

    // ── CLOCK queue ────────────────────────────────────────────────────

    pub fn lru_push(&mut self, pfn: u32) {
        if self.frames.frame(pfn).in_lru {
            return;
        }
        let old_tail = self.lru_tail;
        {
            let f = self.frames.frame_mut(pfn);
            f.in_lru = true;
            f.lru.prev = old_tail;
            f.lru.next = None;
        }
        match old_tail {
            Some(t) => self.frames.frame_mut(t).lru.next = Some(pfn),
            None => self.lru_head = Some(pfn),
        }
        self.lru_tail = Some(pfn);
    }

    pub fn lru_remove(&mut self, pfn: u32) {
        if !self.frames.frame(pfn).in_lru {
            return;
        }
        let (prev, next) = {
            let f = self.frames.frame(pfn);
            (f.lru.prev, f.lru.next)
        };
        match prev {
            Some(p) => self.frames.frame_mut(p).lru.next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.frames.frame_mut(n).lru.prev = prev,
            None => self.lru_tail = prev,
        }
        let f = self.frames.frame_mut(pfn);
        f.in_lru = false;
        f.lru = Default::default();
    }

    pub fn lru_pop(&mut self) -> Option<u32> {
        let head = self.lru_head?;
        self.lru_remove(head);
        Some(head)
    }

    /// Second chance: back to the tail.
    pub fn lru_rotate(&mut self, pfn: u32) {
        self.lru_remove(pfn);
        self.lru_push(pfn);
    }

    /// Structural invariants across the whole state; test aid.
    pub fn check(&self) {
        self.frames.check();
        for pfn in 0..self.npages as u32 {
            let f = self.frames.frame(pfn);
            if f.state == FrameState::Free {
                assert_eq!(f.refs, 0);
                assert!(!f.in_lru);
                assert!(f.rmap.is_none());
            }
        }
    }
}

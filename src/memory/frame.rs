//! Physical frame bookkeeping: one record per page, a doubly linked free
//! list spanning both 4 KiB and 2 MiB nodes, and the global free-frame
//! counter.
//!
//! A free huge node is a single list entry covering an aligned run of
//! `SMALL_PER_HUGE` frames: the head carries the `huge` flag, the members are
//! tagged `HugeMember` and never appear on the list themselves. `alloc`
//! splits a huge node when no small node is left; `free` re-merges an
//! aligned, entirely free neighborhood back into one huge node.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::memory::layout::SMALL_PER_HUGE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Zero the frame (or the whole 2 MiB run) before returning it.
        const ZERO = 1 << 0;
        /// Allocate a 2 MiB huge frame.
        const HUGE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Free,
    Allocated,
    HugeHead,
    HugeMember,
}

/// Free-list / reclaim-queue linkage. A frame is on at most one of the two.
#[derive(Debug, Clone, Copy, Default)]
pub struct Link {
    pub prev: Option<u32>,
    pub next: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub state: FrameState,
    /// Set on a free-list node that spans `SMALL_PER_HUGE` frames.
    pub huge: bool,
    /// Page-table references; 0 while free.
    pub refs: u16,
    /// On the CLOCK reclaim queue.
    pub in_lru: bool,
    /// Free-list linkage.
    pub link: Link,
    /// CLOCK-queue linkage.
    pub lru: Link,
    /// Head of this frame's reverse-mapping list (index into the pools).
    pub rmap: Option<u32>,
}

impl FrameInfo {
    fn reserved() -> Self {
        FrameInfo {
            state: FrameState::Allocated,
            huge: false,
            refs: 0,
            in_lru: false,
            link: Link::default(),
            lru: Link::default(),
            rmap: None,
        }
    }
}

/// Global free-frame counter: its own synchronization domain, readable
/// without taking the page-allocator lock (the periodic reclaim thread polls
/// it).
pub struct FreeCounter(AtomicUsize);

impl FreeCounter {
    pub const fn new() -> Self {
        FreeCounter(AtomicUsize::new(0))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn available(&self, n: usize) -> bool {
        self.get() >= n
    }

    fn add(&self, huge: bool) {
        let n = if huge { SMALL_PER_HUGE } else { 1 };
        self.0.fetch_add(n, Ordering::AcqRel);
    }

    fn sub(&self, huge: bool) {
        let n = if huge { SMALL_PER_HUGE } else { 1 };
        self.0.fetch_sub(n, Ordering::AcqRel);
    }
}

/// Kernel-wide instance; tests build their own so they stay independent.
pub static NFREE_PAGES: FreeCounter = FreeCounter::new();

pub struct FrameTable {
    frames: Vec<FrameInfo>,
    free_head: Option<u32>,
    counter: &'static FreeCounter,
}

impl FrameTable {
    /// All frames start reserved; `release` hands usable ranges over.
    pub fn new(npages: usize, counter: &'static FreeCounter) -> Self {
        let mut frames = Vec::with_capacity(npages);
        frames.resize(npages, FrameInfo::reserved());
        FrameTable {
            frames,
            free_head: None,
            counter,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, pfn: u32) -> &FrameInfo {
        &self.frames[pfn as usize]
    }

    pub fn frame_mut(&mut self, pfn: u32) -> &mut FrameInfo {
        &mut self.frames[pfn as usize]
    }

    pub fn counter(&self) -> &'static FreeCounter {
        self.counter
    }

    /// Put a reserved frame on the free list (boot init and `page_free`).
    pub fn release(&mut self, pfn: u32) {
        debug_assert_eq!(self.frames[pfn as usize].refs, 0);
        self.push_free(pfn, false);
        self.counter.add(false);
        self.try_merge(pfn);
    }

    fn push_free(&mut self, pfn: u32, huge: bool) {
        let old_head = self.free_head;
        {
            let f = &mut self.frames[pfn as usize];
            debug_assert!(f.state != FrameState::Free);
            f.state = FrameState::Free;
            f.huge = huge;
            f.link = Link {
                prev: None,
                next: old_head,
            };
        }
        if let Some(h) = old_head {
            self.frames[h as usize].link.prev = Some(pfn);
        }
        self.free_head = Some(pfn);
    }

    fn unlink_free(&mut self, pfn: u32) {
        let Link { prev, next } = self.frames[pfn as usize].link;
        match prev {
            Some(p) => self.frames[p as usize].link.next = next,
            None => self.free_head = next,
        }
        if let Some(n) = next {
            self.frames[n as usize].link.prev = prev;
        }
        self.frames[pfn as usize].link = Link::default();
    }

    fn find_free(&self, huge: bool) -> Option<u32> {
        let mut cur = self.free_head;
        while let Some(pfn) = cur {
            let f = &self.frames[pfn as usize];
            if f.huge == huge {
                return Some(pfn);
            }
            cur = f.link.next;
        }
        None
    }

    /// Take a frame off the free list. Returns the page frame number; the
    /// caller zeroes memory if requested (this layer never touches page
    /// contents). `None` means depleted; the caller runs reclaim.
    pub fn alloc(&mut self, flags: AllocFlags) -> Option<u32> {
        if flags.contains(AllocFlags::HUGE) {
            let head = self.find_free(true)?;
            self.unlink_free(head);
            self.take_huge(head);
            self.counter.sub(true);
            return Some(head);
        }

        if let Some(pfn) = self.find_free(false) {
            self.unlink_free(pfn);
            self.frames[pfn as usize].state = FrameState::Allocated;
            self.frames[pfn as usize].huge = false;
            self.counter.sub(false);
            return Some(pfn);
        }

        // No small node left: split one huge node into SMALL_PER_HUGE
        // consecutive frames, keep one, give the rest back.
        let head = self.find_free(true)?;
        self.unlink_free(head);
        for i in 0..SMALL_PER_HUGE as u32 {
            let f = &mut self.frames[(head + i) as usize];
            f.state = FrameState::Allocated;
            f.huge = false;
        }
        for i in 1..SMALL_PER_HUGE as u32 {
            self.push_free(head + i, false);
        }
        self.counter.sub(false);
        Some(head)
    }

    fn take_huge(&mut self, head: u32) {
        self.frames[head as usize].state = FrameState::HugeHead;
        self.frames[head as usize].huge = false;
        for i in 1..SMALL_PER_HUGE as u32 {
            self.frames[(head + i) as usize].state = FrameState::HugeMember;
        }
    }

    /// Return an allocated frame to the free list. For a huge head the whole
    /// 2 MiB node comes back in one piece.
    pub fn free(&mut self, pfn: u32) {
        let f = &self.frames[pfn as usize];
        debug_assert_eq!(f.refs, 0, "freeing a referenced frame");
        debug_assert!(!f.in_lru, "freeing a frame still on the reclaim queue");
        match f.state {
            FrameState::HugeHead => {
                self.push_free(pfn, true);
                self.counter.add(true);
            }
            FrameState::Allocated => {
                self.push_free(pfn, false);
                self.counter.add(false);
                self.try_merge(pfn);
            }
            FrameState::Free => panic!("double free of frame {pfn}"),
            FrameState::HugeMember => panic!("freeing interior of a huge frame"),
        }
    }

    /// Collapse the aligned neighborhood of `pfn` into one huge node when
    /// all of it is free as individual 4 KiB nodes.
    fn try_merge(&mut self, pfn: u32) {
        let base = pfn - (pfn % SMALL_PER_HUGE as u32);
        if base as usize + SMALL_PER_HUGE > self.frames.len() {
            return;
        }
        for i in 0..SMALL_PER_HUGE as u32 {
            let f = &self.frames[(base + i) as usize];
            if f.state != FrameState::Free || f.huge {
                return;
            }
        }
        for i in 0..SMALL_PER_HUGE as u32 {
            self.unlink_free(base + i);
            // Temporarily off-list so push_free's state assertion holds.
            self.frames[(base + i) as usize].state = FrameState::HugeMember;
        }
        self.push_free(base, true);
    }

    /// Number of free 4 KiB-equivalents currently on the list.
    pub fn free_pages(&self) -> usize {
        let mut total = 0;
        let mut cur = self.free_head;
        while let Some(pfn) = cur {
            let f = &self.frames[pfn as usize];
            total += if f.huge { SMALL_PER_HUGE } else { 1 };
            cur = f.link.next;
        }
        total
    }

    /// Walk the free list and check the structural invariants. Test aid and
    /// bring-up diagnostic.
    pub fn check(&self) {
        let mut cur = self.free_head;
        let mut prev: Option<u32> = None;
        while let Some(pfn) = cur {
            let f = &self.frames[pfn as usize];
            assert_eq!(f.state, FrameState::Free);
            assert_eq!(f.refs, 0);
            assert_eq!(f.link.prev, prev);
            if f.huge {
                assert_eq!(pfn % SMALL_PER_HUGE as u32, 0);
                for i in 1..SMALL_PER_HUGE as u32 {
                    assert_eq!(
                        self.frames[(pfn + i) as usize].state,
                        FrameState::HugeMember
                    );
                }
            }
            prev = cur;
            cur = f.link.next;
        }
        assert_eq!(self.counter.get(), self.free_pages());
    }
}

#[cfg(test)]
pub(crate) fn test_counter() -> &'static FreeCounter {
    alloc::boxed::Box::leak(alloc::boxed::Box::new(FreeCounter::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(npages: usize) -> FrameTable {
        let mut t = FrameTable::new(npages, test_counter());
        for pfn in 0..npages as u32 {
            t.release(pfn);
        }
        t
    }

    #[test]
    fn alloc_free_roundtrip_restores_state() {
        let mut t = table(3 * SMALL_PER_HUGE);
        let before = t.free_pages();
        let a = t.alloc(AllocFlags::empty()).unwrap();
        let b = t.alloc(AllocFlags::empty()).unwrap();
        assert_ne!(a, b);
        t.free(a);
        t.free(b);
        assert_eq!(t.free_pages(), before);
        t.check();
    }

    #[test]
    fn huge_alloc_is_aligned_and_weighted() {
        let mut t = table(4 * SMALL_PER_HUGE);
        let before = t.free_pages();
        let h = t.alloc(AllocFlags::HUGE).unwrap();
        assert_eq!(h % SMALL_PER_HUGE as u32, 0);
        assert_eq!(t.free_pages(), before - SMALL_PER_HUGE);
        assert_eq!(t.frame(h).state, FrameState::HugeHead);
        assert_eq!(t.frame(h + 1).state, FrameState::HugeMember);
        t.free(h);
        assert_eq!(t.free_pages(), before);
        t.check();
    }

    #[test]
    fn split_when_no_small_left() {
        // One huge region, nothing else: a small alloc must split it.
        let mut t = FrameTable::new(SMALL_PER_HUGE, test_counter());
        for pfn in 0..SMALL_PER_HUGE as u32 {
            t.release(pfn);
        }
        // release() merges the full neighborhood into one huge node
        assert_eq!(t.free_pages(), SMALL_PER_HUGE);
        let pfn = t.alloc(AllocFlags::empty()).unwrap();
        assert_eq!(t.free_pages(), SMALL_PER_HUGE - 1);
        t.check();
        t.free(pfn);
        // Everything free again: merged back to a single huge node.
        assert_eq!(t.free_pages(), SMALL_PER_HUGE);
        let h = t.alloc(AllocFlags::HUGE).expect("post-merge huge alloc");
        assert_eq!(h, 0);
    }

    #[test]
    fn merge_requires_full_neighborhood() {
        let mut t = table(2 * SMALL_PER_HUGE);
        let h = t.alloc(AllocFlags::HUGE).unwrap();
        let small = t.alloc(AllocFlags::empty()).unwrap();
        t.free(h);
        // The small frame is still out: its neighborhood must not merge.
        assert!(t.alloc(AllocFlags::HUGE).is_some());
        t.free(small);
        t.check();
    }

    #[test]
    fn distinct_huge_allocations_do_not_overlap() {
        let mut t = table(4 * SMALL_PER_HUGE);
        let a = t.alloc(AllocFlags::HUGE).unwrap();
        let b = t.alloc(AllocFlags::HUGE).unwrap();
        let d = a.abs_diff(b) as usize;
        assert!(d >= SMALL_PER_HUGE);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut t = table(SMALL_PER_HUGE);
        let a = t.alloc(AllocFlags::empty()).unwrap();
        t.free(a);
        // Force the frame back off the huge node merge so the second free
        // sees a plain free frame.
        let b = t.alloc(AllocFlags::empty()).unwrap();
        assert_eq!(a, b);
        t.free(b);
        t.free(b);
    }
}

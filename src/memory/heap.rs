//! Kernel heap.
//!
//! A fixed region right after the kernel image, withheld from the frame
//! allocator at boot and handed to `linked_list_allocator`. The heap backs
//! the frame table, the reverse-map pools and the boxed disk driver; all of
//! those are sized at boot and recycle internally, so heap pressure stays
//! flat after bring-up.

#[cfg(all(not(test), target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(not(test), target_os = "none"))]
#[global_allocator]
static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

/// Hand the early-heap region over. Called exactly once, before the first
/// allocation.
///
/// # Safety
/// `start..start + size` must be mapped, unused, and never given to the
/// frame allocator.
#[cfg(all(not(test), target_os = "none"))]
pub unsafe fn init(start: *mut u8, size: usize) {
    KERNEL_HEAP.lock().init(start, size);
}

#[cfg(not(all(not(test), target_os = "none")))]
pub unsafe fn init(_start: *mut u8, _size: usize) {}

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicIsize, Ordering};

pub const GIB: f64 = (1u64 << 30) as f64;

/// Number of separately accounted devices.
pub const MAX_DEVICES: usize = 64;

struct Slot {
    current: AtomicIsize,
    peak: AtomicIsize,
}

const EMPTY: Slot = Slot { current: AtomicIsize::new(0), peak: AtomicIsize::new(0) };
static SLOTS: [Slot; MAX_DEVICES] = [EMPTY; MAX_DEVICES];

thread_local! {
    static CURRENT_DEVICE: Cell<usize> = const { Cell::new(0) };
}

/// Charges allocations made by the calling thread to device `index` from now on.
pub fn set_current_device(index: usize) {
    CURRENT_DEVICE.with(|d| d.set(index % MAX_DEVICES));
}

pub fn current_device() -> usize {
    // the slot is gone during thread teardown
    CURRENT_DEVICE.try_with(|d| d.get()).unwrap_or(0)
}

fn slot(index: usize) -> &'static Slot {
    &SLOTS[index % MAX_DEVICES]
}

fn grow(bytes: usize) {
    let s = slot(current_device());
    let now = s.current.fetch_add(bytes as isize, Ordering::Relaxed) + bytes as isize;
    s.peak.fetch_max(now, Ordering::Relaxed);
}

fn shrink(bytes: usize) {
    slot(current_device()).current.fetch_sub(bytes as isize, Ordering::Relaxed);
}

/// System allocator that keeps live bytes and a high watermark per device.
/// Each allocation is charged to the device of the thread that makes it, and
/// each free is credited to the device of the thread that frees it. Counters
/// only move once a binary installs it:
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: TrackingAllocator = TrackingAllocator;
/// ```
pub struct TrackingAllocator;

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            grow(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            grow(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        shrink(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new = System.realloc(ptr, layout, new_size);
        if !new.is_null() {
            let old = layout.size();
            if new_size > old {
                grow(new_size - old);
            } else {
                shrink(old - new_size);
            }
        }
        new
    }
}

/// Handle to the memory of one rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Device {
    pub index: usize,
}

impl Device {
    pub fn new(index: usize) -> Self {
        Self { index }
    }

    /// Bytes currently live on this device. Memory handed to another
    /// device's thread and freed there can leave it briefly off by that amount.
    pub fn memory_allocated(&self) -> usize {
        slot(self.index).current.load(Ordering::Relaxed).max(0) as usize
    }

    /// Highest value of `memory_allocated` since the last reset.
    pub fn max_memory_allocated(&self) -> usize {
        slot(self.index).peak.load(Ordering::Relaxed).max(0) as usize
    }

    pub fn reset_peak_memory_stats(&self) {
        let s = slot(self.index);
        s.peak.store(s.current.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Work on the host is complete when the call returns.
    pub fn synchronize(&self) {}
}

pub fn to_gib(bytes: usize) -> f64 {
    bytes as f64 / GIB
}

//! Allocation accounting.
//!
//! `CountingAlloc` forwards to the system allocator and keeps a running
//! count of bytes currently outstanding. The server binary installs it as
//! the global allocator; the status report reads the counter.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

static OUTSTANDING: AtomicUsize = AtomicUsize::new(0);

pub struct CountingAlloc;

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            OUTSTANDING.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            OUTSTANDING.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        OUTSTANDING.fetch_sub(layout.size(), Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            OUTSTANDING.fetch_sub(layout.size(), Ordering::Relaxed);
            OUTSTANDING.fetch_add(new_size, Ordering::Relaxed);
        }
        new_ptr
    }
}

/// Bytes allocated through `CountingAlloc` and not yet freed.
///
/// Always zero when another global allocator is in use.
pub fn outstanding_bytes() -> usize {
    OUTSTANDING.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_through_direct_use() {
        let alloc = CountingAlloc;
        let layout = Layout::from_size_align(4096, 8).unwrap();
        let before = outstanding_bytes();

        unsafe {
            let ptr = alloc.alloc(layout);
            assert!(!ptr.is_null());
            assert!(outstanding_bytes() >= before + 4096);

            let ptr = alloc.realloc(ptr, layout, 8192);
            assert!(!ptr.is_null());

            alloc.dealloc(ptr, Layout::from_size_align(8192, 8).unwrap());
        }
        assert_eq!(outstanding_bytes(), before);
    }
}

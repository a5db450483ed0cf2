//! Executable memory allocation
//!
//! Hands out small blocks of read-write-execute memory carved from whole
//! pages. Blocks for detours are placed within ±2GB of their target so
//! relative jumps and RIP-relative operands can reach; call thunks may go
//! anywhere. Blocks are never freed: a thread may still be executing them.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// Page size (4KB on most systems)
pub const PAGE_SIZE: usize = 4096;

/// Blocks are handed out on this alignment
const BLOCK_ALIGN: usize = 16;

/// Maximum search range for near allocation (2GB)
const MAX_RANGE: usize = 0x7FFF_0000;

/// Distance between the page search hints
const HINT_STEP: usize = PAGE_SIZE * 64;

/// Global executable allocator
static ALLOCATOR: Mutex<ExecAllocator> = Mutex::new(ExecAllocator::new());

struct ExecAllocator {
    /// Pages allocated, keyed by base address
    pages: BTreeMap<usize, PageInfo>,
}

struct PageInfo {
    base: *mut u8,
    used: usize,
}

// SAFETY: pages are only touched while holding the allocator mutex
unsafe impl Send for PageInfo {}

fn distance(a: usize, b: usize) -> usize {
    a.abs_diff(b)
}

impl ExecAllocator {
    const fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    fn carve(page: &mut PageInfo, size: usize) -> Option<NonNull<u8>> {
        if page.used + size > PAGE_SIZE {
            return None;
        }
        // SAFETY: used + size stays inside the page
        let ptr = unsafe { page.base.add(page.used) };
        page.used += size;
        NonNull::new(ptr)
    }

    fn alloc(&mut self, near: Option<usize>, size: usize) -> Option<NonNull<u8>> {
        let size = size.next_multiple_of(BLOCK_ALIGN);
        if size == 0 || size > PAGE_SIZE {
            return None;
        }

        // Reuse an existing page with room, in range when it matters
        for (&base, page) in &mut self.pages {
            let in_range = near.map_or(true, |target| distance(base, target) < MAX_RANGE);
            if in_range {
                if let Some(ptr) = Self::carve(page, size) {
                    return Some(ptr);
                }
            }
        }

        let base = match near {
            Some(target) => self.map_page_near(target)?,
            None => self.map_page(None)?,
        };
        let page = self.pages.get_mut(&(base as usize))?;
        Self::carve(page, size)
    }

    fn map_page_near(&mut self, target: usize) -> Option<*mut u8> {
        let search_start = target.saturating_sub(MAX_RANGE).max(HINT_STEP);
        let search_end = target.saturating_add(MAX_RANGE);

        for hint in (search_start..search_end).step_by(HINT_STEP) {
            let Some(base) = self.map_page(Some(hint)) else {
                continue;
            };
            if distance(base as usize, target) < MAX_RANGE {
                return Some(base);
            }
            // Allocation landed too far away, give it back
            self.pages.remove(&(base as usize));
            unmap_page(base);
        }

        // Out of range pages still work through absolute jumps
        let base = self.map_page(None)?;
        tracing::warn!(
            "Executable allocation fallback: page at {:x} for target {:x}",
            base as usize,
            target
        );
        Some(base)
    }

    fn map_page(&mut self, hint: Option<usize>) -> Option<*mut u8> {
        let base = map_page(hint)?;
        self.pages.insert(base as usize, PageInfo { base, used: 0 });
        Some(base)
    }
}

#[cfg(unix)]
fn map_page(hint: Option<usize>) -> Option<*mut u8> {
    use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};
    use std::num::NonZeroUsize;

    let length = NonZeroUsize::new(PAGE_SIZE)?;
    // SAFETY: anonymous private mapping, no existing memory is touched
    let result = unsafe {
        mmap_anonymous(
            hint.and_then(NonZeroUsize::new),
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        )
    };
    match result {
        Ok(ptr) => Some(ptr.as_ptr() as *mut u8),
        Err(e) => {
            if hint.is_none() {
                tracing::error!("Failed to map executable page: {}", e);
            }
            None
        }
    }
}

#[cfg(unix)]
fn unmap_page(base: *mut u8) {
    if let Some(ptr) = NonNull::new(base as *mut std::ffi::c_void) {
        // SAFETY: base came from map_page and is no longer referenced
        unsafe {
            let _ = nix::sys::mman::munmap(ptr, PAGE_SIZE);
        }
    }
}

#[cfg(windows)]
fn map_page(hint: Option<usize>) -> Option<*mut u8> {
    use windows::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };

    // SAFETY: fresh reservation, no existing memory is touched
    let result = unsafe {
        VirtualAlloc(
            hint.map(|h| h as *const std::ffi::c_void),
            PAGE_SIZE,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };
    if result.is_null() {
        if hint.is_none() {
            tracing::error!("Failed to allocate executable page");
        }
        None
    } else {
        Some(result as *mut u8)
    }
}

#[cfg(windows)]
fn unmap_page(base: *mut u8) {
    use windows::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

    // SAFETY: base came from map_page and is no longer referenced
    unsafe {
        let _ = VirtualFree(base as *mut std::ffi::c_void, 0, MEM_RELEASE);
    }
}

/// Allocate `size` executable bytes within ±2GB of `target` when possible
pub fn alloc_near(target: usize, size: usize) -> Option<NonNull<u8>> {
    ALLOCATOR.lock().alloc(Some(target), size)
}

/// Allocate `size` executable bytes anywhere
pub fn alloc(size: usize) -> Option<NonNull<u8>> {
    ALLOCATOR.lock().alloc(None, size)
}

/// Whether a `rel32` displacement from `from` can reach `to`
pub fn within_rel32(from: usize, to: usize) -> bool {
    let delta = (to as i128) - (from as i128);
    delta >= i32::MIN as i128 && delta <= i32::MAX as i128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_near_target() {
        let target = alloc_near as usize;
        let block = alloc_near(target, 640).unwrap();
        assert!(distance(block.as_ptr() as usize, target) < MAX_RANGE);
        assert_eq!(block.as_ptr() as usize % BLOCK_ALIGN, 0);
    }

    #[test]
    fn test_distinct_blocks() {
        let a = alloc(100).unwrap().as_ptr();
        let b = alloc(100).unwrap().as_ptr();
        assert_ne!(a, b);
        assert!(distance(a as usize, b as usize) >= 100);
    }

    #[test]
    fn test_oversized_request_rejected() {
        assert!(alloc(PAGE_SIZE + 1).is_none());
        assert!(alloc(0).is_none());
    }

    #[test]
    fn test_within_rel32() {
        assert!(within_rel32(0x1000, 0x7FFF_0000));
        assert!(!within_rel32(0x1000, 0x1_0000_2000));
    }
}

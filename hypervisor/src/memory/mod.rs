//! Physical memory services for the core.
//!
//! The real allocator design is outside the virtualization core; this
//! module carries only what the core consumes: a heap, page-granular
//! allocation for page tables and command rings, and the direct-map
//! address conversions.

mod heap;

use core::sync::atomic::{AtomicU64, Ordering};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_MASK: u64 = (PAGE_SIZE as u64) - 1;
pub const PAGE_SIZE_2M: u64 = 2 * 1024 * 1024;
pub const PAGE_MASK_2M: u64 = PAGE_SIZE_2M - 1;
pub const PAGE_SIZE_1G: u64 = 1024 * 1024 * 1024;

/// Higher-half direct map offset handed over by the boot protocol.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Physical range occupied by the hypervisor image + heap. The stage-2
/// engine redirects guest views of this range to the blank page.
static VMM_PHYS_START: AtomicU64 = AtomicU64::new(0);
static VMM_PHYS_SIZE: AtomicU64 = AtomicU64::new(0);

#[cfg(target_os = "none")]
pub fn init(hhdm_offset: u64, map: Option<&limine::response::MemoryMapResponse>) {
    HHDM_OFFSET.store(hhdm_offset, Ordering::Relaxed);
    heap::init(hhdm_offset, map);
}

#[cfg(not(target_os = "none"))]
pub fn init(hhdm_offset: u64) {
    HHDM_OFFSET.store(hhdm_offset, Ordering::Relaxed);
}

/// Record the physical footprint of the hypervisor itself.
pub fn set_vmm_range(start: u64, size: u64) {
    VMM_PHYS_START.store(start, Ordering::Relaxed);
    VMM_PHYS_SIZE.store(size, Ordering::Relaxed);
}

pub fn vmm_phys_start() -> u64 {
    VMM_PHYS_START.load(Ordering::Relaxed)
}

pub fn vmm_phys_size() -> u64 {
    VMM_PHYS_SIZE.load(Ordering::Relaxed)
}

/// Does `[addr, addr + PAGE_SIZE)` fall inside the hypervisor footprint?
pub fn phys_in_vmm(addr: u64) -> bool {
    let start = vmm_phys_start();
    let size = vmm_phys_size();
    size != 0 && addr >= start && addr < start + size
}

/// Does `[addr, addr + len)` overlap the hypervisor footprint?
pub fn phys_overlaps_vmm(addr: u64, len: u64) -> bool {
    let start = vmm_phys_start();
    let size = vmm_phys_size();
    size != 0 && addr < start + size && addr + len > start
}

#[inline]
pub fn phys_to_virt(pa: u64) -> u64 {
    pa + HHDM_OFFSET.load(Ordering::Relaxed)
}

#[inline]
pub fn virt_to_phys(va: u64) -> u64 {
    va - HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Allocate one zeroed, page-aligned 4KiB frame. Returns (virt, phys).
/// Heap exhaustion is fatal; page tables cannot degrade gracefully.
pub fn alloc_page() -> (*mut u8, u64) {
    let layout = core::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
    let p = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if p.is_null() {
        panic!("out of memory allocating a page frame");
    }
    (p, virt_to_phys(p as u64))
}

pub fn free_page(p: *mut u8) {
    let layout = core::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
    unsafe { alloc::alloc::dealloc(p, layout) };
}

/// Allocate `len` zeroed bytes with page alignment, e.g. for an ITS
/// command ring. Returns (virt, phys).
pub fn alloc_pages(len: usize) -> (*mut u8, u64) {
    let rounded = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let layout = core::alloc::Layout::from_size_align(rounded, PAGE_SIZE).unwrap();
    let p = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if p.is_null() {
        panic!("out of memory allocating {} bytes", rounded);
    }
    (p, virt_to_phys(p as u64))
}

/// Allocate `len` zeroed bytes at an explicit alignment (a concatenated
/// stage-2 root must be aligned to its own size).
pub fn alloc_aligned(len: usize, align: usize) -> (*mut u8, u64) {
    let layout = core::alloc::Layout::from_size_align(len, align).unwrap();
    let p = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if p.is_null() {
        panic!("out of memory allocating {} bytes aligned {}", len, align);
    }
    (p, virt_to_phys(p as u64))
}

pub fn free_pages(p: *mut u8, len: usize) {
    let rounded = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let layout = core::alloc::Layout::from_size_align(rounded, PAGE_SIZE).unwrap();
    unsafe { alloc::alloc::dealloc(p, layout) };
}

pub fn free_aligned(p: *mut u8, len: usize, align: usize) {
    let layout = core::alloc::Layout::from_size_align(len, align).unwrap();
    unsafe { alloc::alloc::dealloc(p, layout) };
}

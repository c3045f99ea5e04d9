//! Temporary virtual windows over host-physical or guest-physical ranges.
//!
//! Two reserved slices of hypervisor virtual address space serve as window
//! pools, one scanned in 4KiB steps and one in 2MiB steps. A rolling
//! pointer walks each region past currently mapped windows, wrapping once;
//! a second wrap means the pool is exhausted and that is fatal.

use super::mmu;
use super::MapFlags;
use crate::memory::{self, PAGE_MASK, PAGE_MASK_2M, PAGE_SIZE, PAGE_SIZE_2M};
use spin::Mutex;

/// Window pools, far above the direct map.
const MAP4K_START: u64 = 0xFFFF_D000_0000_0000;
const MAP4K_END: u64 = 0xFFFF_D001_0000_0000; // 4 GiB of 4KiB windows
const MAP2M_START: u64 = 0xFFFF_D100_0000_0000;
const MAP2M_END: u64 = 0xFFFF_D110_0000_0000; // 64 GiB of 2MiB windows

struct Rolling {
    last4k: u64,
    last2m: u64,
}

static ROLLING: Mutex<Rolling> = Mutex::new(Rolling {
    last4k: MAP4K_START,
    last2m: MAP2M_START,
});

/// An address space a window can map from: a translation from the space's
/// page-aligned addresses to host-physical ones. `npages` is in/out — the
/// translator may shrink it when the contiguous run ends early.
pub struct AddrSpace {
    translate: fn(npages: &mut u64, aligned_addr: u64) -> u64,
}

fn translate_hphys(_npages: &mut u64, aligned_addr: u64) -> u64 {
    aligned_addr
}

/// The guest sees all of physical memory except the hypervisor: that range
/// reads as the shared blank page.
fn translate_passvm(npages: &mut u64, aligned_addr: u64) -> u64 {
    if memory::phys_in_vmm(aligned_addr) {
        *npages = 1;
        return mmu::phys_blank();
    }
    if memory::phys_overlaps_vmm(aligned_addr, *npages * PAGE_SIZE as u64) {
        *npages = (memory::vmm_phys_start() - aligned_addr) / PAGE_SIZE as u64;
    }
    aligned_addr
}

pub static AS_HPHYS: AddrSpace = AddrSpace {
    translate: translate_hphys,
};

pub static AS_PASSVM: AddrSpace = AddrSpace {
    translate: translate_passvm,
};

impl AddrSpace {
    fn translate(&self, npages: &mut u64, addr: u64) -> u64 {
        (self.translate)(npages, addr & !PAGE_MASK)
    }
}

pub fn init() {
    // The rolling pointers start at the region bases; nothing else.
}

/// Find a free window of `aligned_len` bytes. 2MiB windows only when both
/// the physical address and the length are 2MiB-aligned and large enough.
fn mapmem_alloc(aligned_paddr: u64, aligned_len: u64) -> Option<u64> {
    let use_2m = aligned_paddr & PAGE_MASK_2M == 0
        && aligned_len & PAGE_MASK_2M == 0
        && aligned_len >= PAGE_SIZE_2M;
    let (pagesize, region_start, region_end) = if use_2m {
        (PAGE_SIZE_2M, MAP2M_START, MAP2M_END)
    } else {
        (PAGE_SIZE as u64, MAP4K_START, MAP4K_END)
    };

    let n = aligned_len / pagesize;
    let mut rolling = ROLLING.lock();
    let last = if use_2m {
        &mut rolling.last2m
    } else {
        &mut rolling.last4k
    };

    let mut start = *last;
    let mut loopcount = 0;
    'retry: loop {
        for i in 0..n {
            let v = start + i * pagesize;
            if v >= region_end {
                start = region_start;
                loopcount += 1;
                if loopcount > 1 {
                    return None;
                }
                continue 'retry;
            }
            if mmu::check_existing_va_map(v) {
                start += pagesize;
                continue 'retry;
            }
        }
        *last = start + n * pagesize;
        return Some(start);
    }
}

fn occupied_aligned_size(addr: u64, len: u64) -> u64 {
    ((addr & PAGE_MASK) + len + PAGE_MASK) & !PAGE_MASK
}

fn do_mapmem(as_: &AddrSpace, physaddr: u64, flags: MapFlags, len: u64) -> Option<*mut u8> {
    let offset = physaddr & PAGE_MASK;
    let aligned_physaddr = physaddr & !PAGE_MASK;
    let aligned_size = occupied_aligned_size(physaddr, len);
    let npages = aligned_size / PAGE_SIZE as u64;

    let mut n = npages;
    let aligned_hphys = as_.translate(&mut n, aligned_physaddr);

    // The run was clamped at the hypervisor boundary; a writable window
    // over read-only redirected memory is not a thing.
    if n != npages && flags.contains(MapFlags::WRITE) {
        if !flags.contains(MapFlags::CANFAIL) {
            panic!(
                "writable window over hypervisor memory: phys 0x{:x} len 0x{:x}",
                physaddr, len
            );
        }
        return None;
    }

    let window = match mapmem_alloc(aligned_hphys, aligned_size) {
        Some(w) => w,
        None => {
            if !flags.contains(MapFlags::CANFAIL) {
                panic!(
                    "window pool exhausted: phys 0x{:x} len 0x{:x}",
                    physaddr, len
                );
            }
            return None;
        }
    };

    mmu::va_map(window, aligned_hphys, flags, n * PAGE_SIZE as u64);

    // Whatever the first translation did not cover goes page by page, in
    // case later pages fold differently.
    let mut remaining = npages - n;
    let mut v = window + n * PAGE_SIZE as u64;
    let mut p = aligned_physaddr + n * PAGE_SIZE as u64;
    while remaining != 0 {
        let mut one = 1;
        let hp = as_.translate(&mut one, p);
        mmu::va_map(v, hp, flags, PAGE_SIZE as u64);
        v += PAGE_SIZE as u64;
        p += PAGE_SIZE as u64;
        remaining -= 1;
    }

    Some((window + offset) as *mut u8)
}

/// Window over host-physical memory.
pub fn mapmem_hphys(physaddr: u64, len: u64, flags: MapFlags) -> Option<*mut u8> {
    do_mapmem(&AS_HPHYS, physaddr, flags, len)
}

/// Window over an address space (usually the guest's).
pub fn mapmem_as(as_: &AddrSpace, physaddr: u64, len: u64, flags: MapFlags) -> Option<*mut u8> {
    do_mapmem(as_, physaddr, flags, len)
}

/// Release a window created by `mapmem_hphys`/`mapmem_as`.
pub fn unmapmem(p: *mut u8, len: u64) {
    let v = p as u64;
    let aligned_v = v & !PAGE_MASK;
    mmu::va_unmap(aligned_v, occupied_aligned_size(v, len));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        crate::hypervisor::mmu::init();
    }

    #[test]
    fn window_round_trip() {
        setup();
        let p = mapmem_hphys(0x8000_0123, 0x100, MapFlags::WRITE).unwrap();
        let v = p as u64;
        assert_eq!(v & PAGE_MASK, 0x123);
        assert!((MAP4K_START..MAP4K_END).contains(&v));
        // The backing mapping exists and points at the requested frame.
        let pa = crate::hypervisor::mmu::vmm_pt_s1().virt_to_phys(v).unwrap();
        assert_eq!(pa, 0x8000_0123);
        unmapmem(p, 0x100);
        assert!(crate::hypervisor::mmu::vmm_pt_s1().lookup(v & !PAGE_MASK).is_none());
    }

    #[test]
    fn windows_do_not_overlap() {
        setup();
        let a = mapmem_hphys(0x9000_0000, 0x3000, MapFlags::empty()).unwrap();
        let b = mapmem_hphys(0xA000_0000, 0x3000, MapFlags::empty()).unwrap();
        let (a, b) = (a as u64, b as u64);
        assert!(a + 0x3000 <= b || b + 0x3000 <= a);
        unmapmem(a as *mut u8, 0x3000);
        unmapmem(b as *mut u8, 0x3000);
    }

    #[test]
    fn large_aligned_request_uses_2m_region() {
        setup();
        let p = mapmem_hphys(0x4000_0000, PAGE_SIZE_2M, MapFlags::empty()).unwrap();
        let v = p as u64;
        assert!((MAP2M_START..MAP2M_END).contains(&v));
        unmapmem(p, PAGE_SIZE_2M);
    }
}

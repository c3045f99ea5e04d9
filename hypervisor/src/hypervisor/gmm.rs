//! Guest-physical memory access helpers.
//!
//! Accesses go through the guest's address space, so reads of hypervisor
//! memory see the blank page. An access that is misaligned with respect to
//! its own size is split at the alignment boundary and recombined; device
//! memory never sees a wider access than the caller asked for.

use super::mapper::{self, AS_PASSVM};
use super::trap;
use super::MapFlags;

fn gphys_addr_align(paddr: u64, len: u64) -> (u64, u64) {
    debug_assert!(matches!(len, 1 | 2 | 4 | 8));
    let mask = len - 1;
    let p0 = paddr & !mask;
    let p1 = if (paddr & mask) + len > len { p0 + len } else { 0 };
    (p0, p1)
}

fn do_read(addr: *const u8, len: u64) -> u64 {
    unsafe {
        match len {
            1 => addr.read_volatile() as u64,
            2 => (addr as *const u16).read_volatile() as u64,
            4 => (addr as *const u32).read_volatile() as u64,
            8 => (addr as *const u64).read_volatile(),
            _ => panic!("invalid guest read size {}", len),
        }
    }
}

fn do_write(addr: *mut u8, v: u64, len: u64) {
    unsafe {
        match len {
            1 => addr.write_volatile(v as u8),
            2 => (addr as *mut u16).write_volatile(v as u16),
            4 => (addr as *mut u32).write_volatile(v as u32),
            8 => (addr as *mut u64).write_volatile(v),
            _ => panic!("invalid guest write size {}", len),
        }
    }
}

/// Read `len` bytes at guest-physical `paddr` with the given attributes.
pub fn read_gphys(paddr: u64, len: u64, flags: MapFlags) -> u64 {
    let (pa0, pa1) = gphys_addr_align(paddr, len);
    let offset = paddr & (len - 1);
    let bits = len * 8;

    let p0 = mapper::mapmem_as(&AS_PASSVM, pa0, len, flags).expect("guest read map");
    let v0 = do_read(p0, len);
    mapper::unmapmem(p0, len);
    if pa1 == 0 {
        return if offset == 0 {
            v0
        } else {
            v0 >> (offset * 8)
        };
    }

    let p1 = mapper::mapmem_as(&AS_PASSVM, pa1, len, flags).expect("guest read map");
    let v1 = do_read(p1, len);
    mapper::unmapmem(p1, len);

    let shift = offset * 8;
    let low = v0 >> shift;
    let high = v1 << (bits - shift);
    let mask = if bits == 64 { !0 } else { (1u64 << bits) - 1 };
    (low | high) & mask
}

/// Write `len` bytes of `val` at guest-physical `paddr`.
pub fn write_gphys(paddr: u64, val: u64, len: u64, flags: MapFlags) {
    let flags = flags | MapFlags::WRITE;
    let (pa0, pa1) = gphys_addr_align(paddr, len);
    let offset = paddr & (len - 1);

    if pa1 == 0 && offset == 0 {
        let p = mapper::mapmem_as(&AS_PASSVM, pa0, len, flags).expect("guest write map");
        do_write(p, val, len);
        mapper::unmapmem(p, len);
        return;
    }

    // Misaligned: fall back to byte stores, which cannot tear.
    for i in 0..len {
        let p = mapper::mapmem_as(&AS_PASSVM, paddr + i, 1, flags).expect("guest write map");
        do_write(p, val >> (i * 8), 1);
        mapper::unmapmem(p, 1);
    }
}

/// Byte read for the debug dumper: the address may be unmapped, so the
/// access runs under the recovery armature and reports failure instead of
/// taking the CPU down.
pub fn read_gphys_b_try(paddr: u64) -> Option<u8> {
    trap::arm_recovery();
    let v = read_gphys(paddr, 1, MapFlags::empty());
    let faulted = trap::recovery_triggered();
    trap::disarm_recovery();
    if faulted {
        None
    } else {
        Some(v as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_split_points() {
        assert_eq!(gphys_addr_align(0x1000, 8), (0x1000, 0));
        assert_eq!(gphys_addr_align(0x1004, 8), (0x1000, 0x1008));
        assert_eq!(gphys_addr_align(0x1001, 2), (0x1000, 0x1002));
        assert_eq!(gphys_addr_align(0x1003, 1), (0x1003, 0));
    }
}

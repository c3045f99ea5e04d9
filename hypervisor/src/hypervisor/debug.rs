//! Diagnostic dumps for fatal and near-fatal paths.
//!
//! Everything here must be safe to call with the guest in an arbitrary
//! state: guest-physical reads go byte by byte under the recovery
//! armature, so a probe into an unmapped or device region reports `..`
//! instead of taking the CPU down a second time.

use super::gmm;
use super::trap::TrapFrame;

/// Hex-dump `len` bytes of guest-physical memory.
pub fn dump_gphys(start: u64, len: u64) {
    const BYTES_PER_LINE: u64 = 16;

    let aligned = start & !(BYTES_PER_LINE - 1);
    let end = start + len;
    let mut line = aligned;
    while line < end {
        let mut hex = [0u8; BYTES_PER_LINE as usize * 3];
        let mut ascii = [b'.'; BYTES_PER_LINE as usize];
        for i in 0..BYTES_PER_LINE {
            let addr = line + i;
            let cell = &mut hex[(i * 3) as usize..(i * 3 + 3) as usize];
            if addr < start || addr >= end {
                cell.copy_from_slice(b"   ");
                continue;
            }
            match gmm::read_gphys_b_try(addr) {
                Some(b) => {
                    cell[0] = HEX[(b >> 4) as usize];
                    cell[1] = HEX[(b & 0xF) as usize];
                    cell[2] = b' ';
                    if (0x20..0x7F).contains(&b) {
                        ascii[i as usize] = b;
                    }
                }
                None => {
                    cell.copy_from_slice(b".. ");
                }
            }
        }
        log!(
            "0x{:016x}: {} |{}|",
            line,
            core::str::from_utf8(&hex).unwrap_or(""),
            core::str::from_utf8(&ascii).unwrap_or("")
        );
        line += BYTES_PER_LINE;
    }
}

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Print the saved register frame the way the fatal path wants it.
pub fn dump_trap_frame(r: &TrapFrame) {
    for i in (0..30).step_by(2) {
        log_error!(
            "x{:<2} 0x{:016x}  x{:<2} 0x{:016x}",
            i,
            r.x[i],
            i + 1,
            r.x[i + 1]
        );
    }
    log_error!("x30 0x{:016x}  sp_el0 0x{:016x}", r.x[30], r.sp_el0);
    log_error!(
        "elr 0x{:016x}  spsr 0x{:016x}  esr 0x{:016x}",
        r.elr_el2,
        r.spsr_el2,
        r.esr_el2
    );
    log_error!(
        "far 0x{:016x}  hcr 0x{:016x}  tpidr 0x{:016x}",
        r.far_el2,
        r.hcr_el2,
        r.tpidr
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_dump_does_not_panic() {
        let mut f = TrapFrame::zeroed();
        f.x[0] = 0x1234;
        f.elr_el2 = 0xFFFF_0000_0000_0000;
        dump_trap_frame(&f);
    }
}

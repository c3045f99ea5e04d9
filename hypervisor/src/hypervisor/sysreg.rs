//! Trapped MSR/MRS handling.
//!
//! With `HCR.TID3` set the guest's reads of the ID register group trap
//! here. Most values pass through from the real CPU; two registers are
//! rewritten to conceal features the hypervisor does not faithfully
//! virtualize: AArch32 support at any EL, and 52-bit physical addressing
//! and translation granules.
//!
//! The GIC software-generated-interrupt registers also land here: writes
//! are forwarded to the matching physical register, reads return zero.

use super::trap::TrapFrame;

/// `(op0, op1, CRn, CRm, op2)` packed the way the ISS orders them.
const fn encode(op0: u32, op1: u32, crn: u32, crm: u32, op2: u32) -> u32 {
    (op0 << 20) | (op2 << 17) | (op1 << 14) | (crn << 10) | (crm << 1)
}

/// The ID/feature register space: op0=3, op1=0, CRn=0.
const ID_FEATURE_SPACE: u32 = encode(3, 0, 0, 0, 0);

const ICC_SGI1R_EL1: u32 = encode(3, 0, 12, 11, 5);
const ICC_ASGI1R_EL1: u32 = encode(3, 0, 12, 11, 6);
const ICC_SGI0R_EL1: u32 = encode(3, 0, 12, 11, 7);

/// ID_AA64PFR0_EL1 EL fields: 1 = AArch64 only, 2 = AArch64 + AArch32.
const PFR0_AA64_ONLY: u64 = 1;
const PFR0_AA64_AA32: u64 = 2;

/// Clamp every ELx field to AArch64-only. EL3 keeps its value unless it
/// advertises AArch32.
fn conceal_id_aa64pfr0(val: u64) -> u64 {
    let el0 = PFR0_AA64_ONLY;
    let el1 = PFR0_AA64_ONLY;
    let el2 = PFR0_AA64_ONLY;
    let mut el3 = (val >> 12) & 0xF;
    if el3 == PFR0_AA64_AA32 {
        el3 = PFR0_AA64_ONLY;
    }
    (val & !0xFFFF) | (el3 << 12) | (el2 << 8) | (el1 << 4) | el0
}

/// PA size and granule fields clamped below anything 52-bit.
fn conceal_id_aa64mmfr0(val: u64) -> u64 {
    const PA_48: u64 = 5;
    // TGran16: 0 = no, 1 = yes, 2 = yes with 52-bit PA.
    const TG16_SUPPORT: u64 = 1;
    const TG16_SUPPORT_52: u64 = 2;
    // TGran4: 0 = yes, 1 = yes with 52-bit PA, 0xF = no.
    const TG4_SUPPORT: u64 = 0;
    const TG4_SUPPORT_52: u64 = 1;
    // TGranX_2: 1 = no, 2 = yes, 3 = yes with 52-bit PA.
    const TG_2_SUPPORT: u64 = 2;
    const TG_2_SUPPORT_52: u64 = 3;

    let mut pa = val & 0xF;
    if pa > PA_48 {
        pa = PA_48;
    }
    let mut tg16 = (val >> 20) & 0xF;
    if tg16 == TG16_SUPPORT_52 {
        tg16 = TG16_SUPPORT;
    }
    let mut tg4 = (val >> 28) & 0xF;
    if tg4 == TG4_SUPPORT_52 {
        tg4 = TG4_SUPPORT;
    }
    let mut tg16_2 = (val >> 32) & 0xF;
    if tg16_2 == TG_2_SUPPORT_52 {
        tg16_2 = TG_2_SUPPORT;
    }
    let mut tg4_2 = (val >> 40) & 0xF;
    if tg4_2 == TG_2_SUPPORT_52 {
        tg4_2 = TG_2_SUPPORT;
    }

    let mask: u64 = 0xF | (0xF << 20) | (0xF << 28) | (0xF << 32) | (0xF << 40);
    (val & !mask) | pa | (tg16 << 20) | (tg4 << 28) | (tg16_2 << 32) | (tg4_2 << 40)
}

/// Synthesize the guest-visible value of an ID register.
fn read_id_reg(crm: u32, op2: u32) -> u64 {
    match crm {
        0 => match op2 {
            0 => crate::read_sysreg!("midr_el1"),
            5 => crate::read_sysreg!("mpidr_el1"),
            6 => crate::read_sysreg!("revidr_el1"),
            _ => 0,
        },
        // AArch32 ID registers: the guest sees no AArch32.
        1..=3 => 0,
        4 => match op2 {
            0 => conceal_id_aa64pfr0(crate::read_sysreg!("id_aa64pfr0_el1")),
            1 => crate::read_sysreg!("id_aa64pfr1_el1"),
            4 => crate::read_sysreg!("id_aa64zfr0_el1"),
            _ => 0,
        },
        5 => match op2 {
            0 => crate::read_sysreg!("id_aa64dfr0_el1"),
            1 => crate::read_sysreg!("id_aa64dfr1_el1"),
            4 => crate::read_sysreg!("id_aa64afr0_el1"),
            5 => crate::read_sysreg!("id_aa64afr1_el1"),
            _ => 0,
        },
        6 => match op2 {
            0 => crate::read_sysreg!("id_aa64isar0_el1"),
            1 => crate::read_sysreg!("id_aa64isar1_el1"),
            2 => crate::read_sysreg!("id_aa64isar2_el1"),
            _ => 0,
        },
        7 => match op2 {
            0 => conceal_id_aa64mmfr0(crate::read_sysreg!("id_aa64mmfr0_el1")),
            1 => crate::read_sysreg!("id_aa64mmfr1_el1"),
            2 => crate::read_sysreg!("id_aa64mmfr2_el1"),
            _ => 0,
        },
        _ => {
            log_warn!("unknown ID register read CRm {} op2 {}, zeroing", crm, op2);
            0
        }
    }
}

fn read_xt(r: &TrapFrame, rt: u32) -> u64 {
    if rt == 31 {
        0
    } else {
        r.x[rt as usize]
    }
}

fn write_xt(r: &mut TrapFrame, rt: u32, val: u64) {
    if rt != 31 {
        r.x[rt as usize] = val;
    }
}

/// Handle one trapped MSR/MRS. The dispatcher advances the PC on success.
pub fn handle(r: &mut TrapFrame, iss: u32) -> Result<(), ()> {
    let op0 = (iss >> 20) & 0x3;
    let op2 = (iss >> 17) & 0x7;
    let op1 = (iss >> 14) & 0x7;
    let crn = (iss >> 10) & 0xF;
    let rt = (iss >> 5) & 0x1F;
    let crm = (iss >> 1) & 0xF;
    let wr = iss & 0x1 == 0;

    if encode(op0, op1, crn, 0, 0) == ID_FEATURE_SPACE {
        // Read-only space; guest writes are swallowed.
        if !wr {
            let val = read_id_reg(crm, op2);
            write_xt(r, rt, val);
        }
        return Ok(());
    }

    match encode(op0, op1, crn, crm, op2) {
        ICC_SGI0R_EL1 => {
            if wr {
                crate::write_sysreg!("icc_sgi0r_el1", read_xt(r, rt));
            } else {
                write_xt(r, rt, 0);
            }
            Ok(())
        }
        ICC_SGI1R_EL1 => {
            if wr {
                crate::write_sysreg!("icc_sgi1r_el1", read_xt(r, rt));
            } else {
                write_xt(r, rt, 0);
            }
            Ok(())
        }
        ICC_ASGI1R_EL1 => {
            if wr {
                crate::write_sysreg!("icc_asgi1r_el1", read_xt(r, rt));
            } else {
                write_xt(r, rt, 0);
            }
            Ok(())
        }
        _ => {
            log_warn!(
                "unhandled sysreg {}_{}_{}_{}_{} wr {}",
                op0,
                op1,
                crn,
                crm,
                op2,
                wr
            );
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ISS for an MRS/MSR trap: direction bit 0 set means read.
    fn iss_for(op0: u32, op1: u32, crn: u32, crm: u32, op2: u32, rt: u32, read: bool) -> u32 {
        (op0 << 20) | (op2 << 17) | (op1 << 14) | (crn << 10) | (rt << 5) | (crm << 1)
            | read as u32
    }

    #[test]
    fn pfr0_conceals_aarch32() {
        // EL0-EL2 advertise AArch32, EL3 too.
        let raw = 0x0000_0000_0000_2222u64 | (0xABC << 16);
        let v = conceal_id_aa64pfr0(raw);
        assert_eq!(v & 0xF, 1);
        assert_eq!((v >> 4) & 0xF, 1);
        assert_eq!((v >> 8) & 0xF, 1);
        assert_eq!((v >> 12) & 0xF, 1);
        // Upper fields untouched.
        assert_eq!(v >> 16, raw >> 16);
    }

    #[test]
    fn pfr0_keeps_aarch64_only_el3() {
        let raw = 0x1111u64;
        assert_eq!(conceal_id_aa64pfr0(raw), 0x1111);
    }

    #[test]
    fn mmfr0_clamps_52bit() {
        // PA = 6 (52-bit), TGran16 = 2, TGran4 = 1, TGran16_2 = 3,
        // TGran4_2 = 3.
        let raw: u64 = 6 | (2 << 20) | (1 << 28) | (3u64 << 32) | (3u64 << 40);
        let v = conceal_id_aa64mmfr0(raw);
        assert_eq!(v & 0xF, 5);
        assert_eq!((v >> 20) & 0xF, 1);
        assert_eq!((v >> 28) & 0xF, 0);
        assert_eq!((v >> 32) & 0xF, 2);
        assert_eq!((v >> 40) & 0xF, 2);
    }

    #[test]
    fn mmfr0_keeps_48bit_values() {
        let raw: u64 = 5 | (1 << 20) | (2u64 << 32) | (2u64 << 40);
        assert_eq!(conceal_id_aa64mmfr0(raw), raw);
    }

    #[test]
    fn id_register_write_is_swallowed() {
        let mut r = TrapFrame::zeroed();
        r.x[3] = 0x1234;
        // MSR ID_AA64PFR0_EL1, X3 (a write, direction bit clear).
        let iss = iss_for(3, 0, 0, 4, 0, 3, false);
        assert!(handle(&mut r, iss).is_ok());
        assert_eq!(r.x[3], 0x1234, "register must be untouched");
    }

    #[test]
    fn aarch32_id_registers_read_zero() {
        let mut r = TrapFrame::zeroed();
        r.x[5] = !0;
        let iss = iss_for(3, 0, 0, 2, 1, 5, true);
        assert!(handle(&mut r, iss).is_ok());
        assert_eq!(r.x[5], 0);
    }

    #[test]
    fn sgi_register_read_returns_zero() {
        let mut r = TrapFrame::zeroed();
        r.x[0] = !0;
        let iss = iss_for(3, 0, 12, 11, 5, 0, true);
        assert!(handle(&mut r, iss).is_ok());
        assert_eq!(r.x[0], 0);
    }

    #[test]
    fn unknown_sysreg_is_an_error() {
        let mut r = TrapFrame::zeroed();
        let iss = iss_for(3, 3, 14, 2, 1, 0, true);
        assert!(handle(&mut r, iss).is_err());
    }
}

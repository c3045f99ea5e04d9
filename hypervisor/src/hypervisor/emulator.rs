//! Load/store emulation for faulting guest accesses.
//!
//! A stage-2 translation fault cannot always be served from the syndrome
//! alone: an unaligned access that crosses a page boundary reports only
//! the faulting page in `FAR_EL2`, not where the access begins. So the
//! emulator fetches the guest instruction, decodes the five A64 load/store
//! encodings it recognizes, recomputes the effective address, re-translates
//! it with the original access mode and forwards the access to the MMIO
//! dispatch (falling through to real memory when nothing is registered).
//!
//! Recognized forms, in signature-match priority:
//!
//! 1. register offset      — `LDR Xt, [Xn, Xm{, ext #s}]`
//! 2. unsigned immediate   — `LDR Xt, [Xn, #imm12]`
//! 3. pre/post indexed     — `LDR Xt, [Xn, #imm9]!` / `LDR Xt, [Xn], #imm9`
//! 4. unscaled immediate   — `LDUR Xt, [Xn, #imm9]`
//! 5. literal              — `LDR Xt, label`
//!
//! Prefetch encodings are recognized and skipped. Anything else is an
//! error; the dispatcher treats it as fatal after dumping context.

use super::mmio;
use super::trap::TrapFrame;
use super::{mapper, mmu, trap, vm, MapFlags};
#[cfg(not(target_arch = "aarch64"))]
use spin::Mutex;

// Encoding signatures, tested in priority order.
const SIG_LDR_LIT: u32 = (1 << 28) | (1 << 27);
const SIG_IMM_UNSCALE: u32 = (1 << 29) | (1 << 28) | (1 << 27);
const SIG_IMM_POST: u32 = SIG_IMM_UNSCALE | (1 << 10);
const SIG_IMM_PRE: u32 = SIG_IMM_UNSCALE | (1 << 11) | (1 << 10);
const SIG_REG: u32 = SIG_IMM_UNSCALE | (1 << 21) | (1 << 11);
const SIG_IMM_UNSIGNED: u32 = SIG_IMM_UNSCALE | (1 << 24);

/// Sign-extend the low `bits` of `val` to 64 bits.
fn sext64(val: u64, bits: u32) -> u64 {
    debug_assert!(bits > 0 && bits <= 64);
    ((val << (64 - bits)) as i64 >> (64 - bits)) as u64
}

/// Register-offset extend options.
const OPT_UXTW: u32 = 0x2;
const OPT_LSL: u32 = 0x3; // also known as UXTX
const OPT_SXTW: u32 = 0x6;
const OPT_SXTX: u32 = 0x7;

/// Everything the core needs from the guest to emulate one access. The
/// hardware implementation routes through the MMU, the window mapper and
/// the MMIO registry; tests substitute plain memory.
pub trait GuestBus {
    /// Stage-1 translate `gvirt` at `el` for the given access direction.
    fn translate(&mut self, gvirt: u64, el: u32, wr: bool) -> Result<(u64, MapFlags), ()>;
    /// Perform the access at a guest-physical address.
    fn access(&mut self, ipa: u64, wr: bool, buf: &mut [u8], flags: MapFlags);
    /// Fetch one instruction word from guest-physical memory.
    fn read_inst_word(&mut self, ipa: u64, flags: MapFlags) -> u32;
}

/// The real bus: AT-instruction translation, MMIO dispatch with direct
/// fall-through, recovery-armed instruction fetches.
pub struct HwBus;

impl GuestBus for HwBus {
    fn translate(&mut self, gvirt: u64, el: u32, wr: bool) -> Result<(u64, MapFlags), ()> {
        mmu::gvirt_to_ipa(gvirt, el, wr)
    }

    fn access(&mut self, ipa: u64, wr: bool, buf: &mut [u8], flags: MapFlags) {
        if !mmio::call_handler(ipa, wr, buf, flags) {
            mmio::direct_access(ipa, wr, buf, flags);
        }
    }

    fn read_inst_word(&mut self, ipa: u64, flags: MapFlags) -> u32 {
        // The read itself may fault (the guest mapping can be stale by the
        // time we look); survive that and report zeros.
        trap::arm_recovery();
        let mut word = 0u32;
        if let Some(p) = mapper::mapmem_as(
            vm::current_as(),
            ipa,
            4,
            flags | MapFlags::CANFAIL,
        ) {
            word = unsafe { (p as *const u32).read_volatile() };
            mapper::unmapmem(p, 4);
        }
        if trap::recovery_triggered() {
            word = 0;
        }
        trap::disarm_recovery();
        word
    }
}

/// Saved FP/SIMD bank used while emulating a vector load/store: all 32
/// 128-bit registers spilled around the access.
type FpBank = [[u64; 2]; 32];

#[cfg(not(target_arch = "aarch64"))]
pub(crate) static MOCK_FP_BANK: Mutex<FpBank> = Mutex::new([[0; 2]; 32]);

#[cfg(target_arch = "aarch64")]
fn save_fp_regs(bank: &mut FpBank) {
    unsafe {
        core::arch::asm!(
            "stp q0, q1, [{p}, #0x000]",
            "stp q2, q3, [{p}, #0x020]",
            "stp q4, q5, [{p}, #0x040]",
            "stp q6, q7, [{p}, #0x060]",
            "stp q8, q9, [{p}, #0x080]",
            "stp q10, q11, [{p}, #0x0A0]",
            "stp q12, q13, [{p}, #0x0C0]",
            "stp q14, q15, [{p}, #0x0E0]",
            "stp q16, q17, [{p}, #0x100]",
            "stp q18, q19, [{p}, #0x120]",
            "stp q20, q21, [{p}, #0x140]",
            "stp q22, q23, [{p}, #0x160]",
            "stp q24, q25, [{p}, #0x180]",
            "stp q26, q27, [{p}, #0x1A0]",
            "stp q28, q29, [{p}, #0x1C0]",
            "stp q30, q31, [{p}, #0x1E0]",
            p = in(reg) bank.as_mut_ptr(),
            options(nostack)
        );
    }
}

#[cfg(target_arch = "aarch64")]
fn restore_fp_regs(bank: &FpBank) {
    unsafe {
        core::arch::asm!(
            "ldp q0, q1, [{p}, #0x000]",
            "ldp q2, q3, [{p}, #0x020]",
            "ldp q4, q5, [{p}, #0x040]",
            "ldp q6, q7, [{p}, #0x060]",
            "ldp q8, q9, [{p}, #0x080]",
            "ldp q10, q11, [{p}, #0x0A0]",
            "ldp q12, q13, [{p}, #0x0C0]",
            "ldp q14, q15, [{p}, #0x0E0]",
            "ldp q16, q17, [{p}, #0x100]",
            "ldp q18, q19, [{p}, #0x120]",
            "ldp q20, q21, [{p}, #0x140]",
            "ldp q22, q23, [{p}, #0x160]",
            "ldp q24, q25, [{p}, #0x180]",
            "ldp q26, q27, [{p}, #0x1A0]",
            "ldp q28, q29, [{p}, #0x1C0]",
            "ldp q30, q31, [{p}, #0x1E0]",
            p = in(reg) bank.as_ptr(),
            out("v0") _, out("v1") _, out("v2") _, out("v3") _,
            out("v4") _, out("v5") _, out("v6") _, out("v7") _,
            out("v8") _, out("v9") _, out("v10") _, out("v11") _,
            out("v12") _, out("v13") _, out("v14") _, out("v15") _,
            out("v16") _, out("v17") _, out("v18") _, out("v19") _,
            out("v20") _, out("v21") _, out("v22") _, out("v23") _,
            out("v24") _, out("v25") _, out("v26") _, out("v27") _,
            out("v28") _, out("v29") _, out("v30") _, out("v31") _,
            options(nostack)
        );
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn save_fp_regs(bank: &mut FpBank) {
    *bank = *MOCK_FP_BANK.lock();
}

#[cfg(not(target_arch = "aarch64"))]
fn restore_fp_regs(bank: &FpBank) {
    *MOCK_FP_BANK.lock() = *bank;
}

/// Common field extraction: Rt, Rn, opc, V, size.
fn decode_common(inst: u32) -> (u32, u32, u32, u32, u32) {
    let rt = inst & 0x1F;
    let rn = (inst >> 5) & 0x1F;
    let opc = (inst >> 22) & 0x3;
    let v = (inst >> 26) & 0x1;
    let s = (inst >> 30) & 0x3;
    (rt, rn, opc, v, s)
}

/// Access size in bytes. SIMD transfers with opc<1> set scale up to the
/// 128-bit registers.
fn access_size(s: u32, opc: u32, v: u32) -> u64 {
    let shift = s + if v != 0 && opc & 0x2 != 0 { 4 } else { 0 };
    if shift > 4 {
        panic!("impossible load/store size field s {} opc {} v {}", s, opc, v);
    }
    1 << shift
}

/// PRFM shares the load/store encodings.
fn is_prefetch(s: u32, opc: u32, v: u32) -> bool {
    s == 3 && opc == 2 && v == 0
}

fn read_base(r: &TrapFrame, rn: u32, el: u32) -> u64 {
    if rn == 31 {
        if el == 1 {
            crate::read_sysreg!("sp_el1")
        } else {
            r.sp_el0
        }
    } else {
        r.x[rn as usize]
    }
}

fn write_base(r: &mut TrapFrame, rn: u32, el: u32, val: u64) {
    if rn == 31 {
        if el == 1 {
            crate::write_sysreg!("sp_el1", val);
        } else {
            r.sp_el0 = val;
        }
    } else {
        r.x[rn as usize] = val;
    }
}

fn read_xt(r: &TrapFrame, rt: u32) -> u64 {
    if rt == 31 {
        0 // XZR
    } else {
        r.x[rt as usize]
    }
}

fn write_xt(r: &mut TrapFrame, rt: u32, val: u64) {
    if rt != 31 {
        r.x[rt as usize] = val;
    }
}

struct Access {
    vaddr: u64,
    size: u64,
    rt: u32,
    vector: bool,
    signed_ext: bool,
}

/// Decode `inst` against the five signatures and compute the effective
/// address. Pre/post-indexed base writeback happens here. Returns `None`
/// for prefetches (nothing to do).
fn decode_and_compute(
    inst: u32,
    r: &mut TrapFrame,
    elr: u64,
    wr: bool,
    el: u32,
) -> Result<Option<Access>, ()> {
    if inst & SIG_REG == SIG_REG {
        let (rt, rn, opc, v, s) = decode_common(inst);
        if is_prefetch(s, opc, v) {
            return Ok(None);
        }
        let size = access_size(s, opc, v);
        let shift = if (inst >> 12) & 1 != 0 { s } else { 0 };
        let option = (inst >> 13) & 0x7;
        let rm = (inst >> 16) & 0x1F;
        let mut offset = read_xt(r, rm) << shift;
        match option {
            OPT_UXTW | OPT_LSL => {}
            OPT_SXTW | OPT_SXTX => offset = sext64(offset, (size * 8) as u32),
            other => panic!("unhandled register-offset option 0x{:x}", other),
        }
        let vaddr = read_base(r, rn, el).wrapping_add(offset);
        return Ok(Some(Access {
            vaddr,
            size,
            rt,
            vector: v != 0,
            signed_ext: v == 0 && opc & 0x2 != 0,
        }));
    }

    if inst & SIG_IMM_UNSIGNED == SIG_IMM_UNSIGNED {
        let (rt, rn, opc, v, s) = decode_common(inst);
        if is_prefetch(s, opc, v) {
            return Ok(None);
        }
        let size = access_size(s, opc, v);
        let imm12 = ((inst >> 10) & 0xFFF) as u64;
        let vaddr = read_base(r, rn, el).wrapping_add(imm12 << s);
        return Ok(Some(Access {
            vaddr,
            size,
            rt,
            vector: v != 0,
            signed_ext: v == 0 && opc & 0x2 != 0,
        }));
    }

    let pre = inst & SIG_IMM_PRE == SIG_IMM_PRE;
    let post = inst & SIG_IMM_POST == SIG_IMM_POST;
    if pre || post {
        let (rt, rn, opc, v, s) = decode_common(inst);
        // No prefetch variant exists for the indexed forms.
        let size = access_size(s, opc, v);
        let imm9 = sext64(((inst >> 12) & 0x1FF) as u64, 9);
        let base = read_base(r, rn, el);
        // The base register update commits before the re-translation,
        // regardless of pre or post.
        write_base(r, rn, el, base.wrapping_add(imm9));
        let vaddr = if pre { base.wrapping_add(imm9) } else { base };
        return Ok(Some(Access {
            vaddr,
            size,
            rt,
            vector: v != 0,
            signed_ext: v == 0 && opc & 0x2 != 0,
        }));
    }

    if inst & SIG_IMM_UNSCALE == SIG_IMM_UNSCALE {
        let (rt, rn, opc, v, s) = decode_common(inst);
        if is_prefetch(s, opc, v) {
            return Ok(None);
        }
        let size = access_size(s, opc, v);
        let imm9 = sext64(((inst >> 12) & 0x1FF) as u64, 9);
        let vaddr = read_base(r, rn, el).wrapping_add(imm9);
        return Ok(Some(Access {
            vaddr,
            size,
            rt,
            vector: v != 0,
            signed_ext: v == 0 && opc & 0x2 != 0,
        }));
    }

    if inst & SIG_LDR_LIT == SIG_LDR_LIT {
        if wr {
            log_error!("literal-form signature on a write access: 0x{:08x}", inst);
            return Err(());
        }
        let opc = (inst >> 30) & 0x3;
        let v = (inst >> 26) & 0x1;
        if opc == 0x3 {
            return Ok(None); // PRFM (literal)
        }
        let rt = inst & 0x1F;
        let imm19 = ((inst >> 5) & 0x7_FFFF) as u64;
        let size = if v != 0 {
            4u64 << opc
        } else {
            1u64 << (2 + (opc & 0x1))
        };
        let vaddr = elr.wrapping_add(sext64(imm19 << 2, 21));
        return Ok(Some(Access {
            vaddr,
            size,
            rt,
            vector: v != 0,
            signed_ext: false,
        }));
    }

    log_error!("unhandled load/store encoding 0x{:08x}", inst);
    Err(())
}

fn do_access(bus: &mut dyn GuestBus, a: &Access, r: &mut TrapFrame, ipa: u64, wr: bool, flags: MapFlags) {
    if a.vector {
        let mut bank: FpBank = [[0; 2]; 32];
        save_fp_regs(&mut bank);
        let rt = a.rt as usize;
        // Architecturally a vector load of 64 bits or less zeroes the
        // upper half of the register.
        bank[rt][1] = 0;
        let mut buf = [0u8; 16];
        let n = a.size as usize;
        if wr {
            buf[..8].copy_from_slice(&bank[rt][0].to_le_bytes());
            buf[8..].copy_from_slice(&bank[rt][1].to_le_bytes());
            bus.access(ipa, true, &mut buf[..n], flags);
        } else {
            bus.access(ipa, false, &mut buf[..n], flags);
            bank[rt][0] = u64::from_le_bytes(buf[..8].try_into().unwrap());
            bank[rt][1] = u64::from_le_bytes(buf[8..].try_into().unwrap());
        }
        restore_fp_regs(&bank);
    } else {
        let n = a.size as usize;
        let mut buf = [0u8; 8];
        if wr {
            buf.copy_from_slice(&read_xt(r, a.rt).to_le_bytes());
            bus.access(ipa, true, &mut buf[..n], flags);
        } else {
            bus.access(ipa, false, &mut buf[..n], flags);
            let mut val = u64::from_le_bytes(buf);
            // Only the low `n` bytes are meaningful.
            if n < 8 {
                val &= (1u64 << (n * 8)) - 1;
                if a.signed_ext {
                    val = sext64(val, (n * 8) as u32);
                }
            }
            write_xt(r, a.rt, val);
        }
    }
}

/// Dump ±8 instructions of guest context around the fault.
fn dump_inst_context(bus: &mut dyn GuestBus, elr: u64, inst_ipa: u64, flags: MapFlags) {
    log_error!("instruction context from guest physical memory:");
    let e = elr.wrapping_sub(32);
    let ia = inst_ipa.wrapping_sub(32);
    for i in 0..16u64 {
        let word = bus.read_inst_word(ia + i * 4, flags);
        log_error!(
            "{}0x{:x} 0x{:x}: 0x{:08x}",
            if i == 8 { ">>> " } else { "" },
            e + i * 4,
            ia + i * 4,
            word
        );
    }
}

/// Emulate the guest load/store that faulted at `elr`. On success the
/// caller advances the guest PC past the instruction.
pub fn emulate_with(
    bus: &mut dyn GuestBus,
    r: &mut TrapFrame,
    elr: u64,
    wr: bool,
    el: u32,
) -> Result<(), ()> {
    // Fetch the instruction through the guest's own address space so a
    // hostile mapping cannot make us read hypervisor memory.
    let (inst_ipa, inst_flags) = bus.translate(elr, el, false).map_err(|()| {
        log_error!("instruction address translation fault: 0x{:x} EL{}", elr, el);
    })?;
    let inst = bus.read_inst_word(inst_ipa, inst_flags);

    let access = match decode_and_compute(inst, r, elr, wr, el) {
        Ok(Some(a)) => a,
        Ok(None) => return Ok(()), // prefetch: advance PC, do nothing
        Err(()) => {
            dump_inst_context(bus, elr, inst_ipa, inst_flags);
            return Err(());
        }
    };

    // FAR_EL2 only names the faulting page; the decoded address is the
    // real start of the access. Translate with the original direction.
    let (ipa, flags) = match bus.translate(access.vaddr, el, wr) {
        Ok(t) => t,
        Err(()) => {
            log_error!(
                "effective address translation fault: 0x{:x} EL{}",
                access.vaddr,
                el
            );
            dump_inst_context(bus, elr, inst_ipa, inst_flags);
            return Err(());
        }
    };

    do_access(bus, &access, r, ipa, wr, flags);
    Ok(())
}

/// Entry from the trap dispatcher.
pub fn emulate(r: &mut TrapFrame, elr: u64, wr: bool, el: u32) -> Result<(), ()> {
    emulate_with(&mut HwBus, r, elr, wr, el)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;

    /// Flat little-endian memory with identity translation.
    struct MemBus {
        mem: BTreeMap<u64, u8>,
        accesses: usize,
    }

    impl MemBus {
        fn new() -> Self {
            MemBus {
                mem: BTreeMap::new(),
                accesses: 0,
            }
        }

        fn write(&mut self, addr: u64, bytes: &[u8]) {
            for (i, b) in bytes.iter().enumerate() {
                self.mem.insert(addr + i as u64, *b);
            }
        }

        fn read_u64(&self, addr: u64) -> u64 {
            let mut b = [0u8; 8];
            for (i, x) in b.iter_mut().enumerate() {
                *x = *self.mem.get(&(addr + i as u64)).unwrap_or(&0);
            }
            u64::from_le_bytes(b)
        }
    }

    impl GuestBus for MemBus {
        fn translate(&mut self, gvirt: u64, _el: u32, wr: bool) -> Result<(u64, MapFlags), ()> {
            let f = if wr { MapFlags::WRITE } else { MapFlags::empty() };
            Ok((gvirt, f))
        }

        fn access(&mut self, ipa: u64, wr: bool, buf: &mut [u8], _flags: MapFlags) {
            self.accesses += 1;
            for (i, b) in buf.iter_mut().enumerate() {
                let a = ipa + i as u64;
                if wr {
                    self.mem.insert(a, *b);
                } else {
                    *b = *self.mem.get(&a).unwrap_or(&0);
                }
            }
        }

        fn read_inst_word(&mut self, ipa: u64, _flags: MapFlags) -> u32 {
            let mut b = [0u8; 4];
            for (i, x) in b.iter_mut().enumerate() {
                *x = *self.mem.get(&(ipa + i as u64)).unwrap_or(&0);
            }
            u32::from_le_bytes(b)
        }
    }

    const PC: u64 = 0x4008_0000;

    fn run(bus: &mut MemBus, inst: u32, r: &mut TrapFrame, wr: bool) -> Result<(), ()> {
        bus.write(PC, &inst.to_le_bytes());
        r.elr_el2 = PC;
        emulate_with(bus, r, PC, wr, 1)
    }

    #[test]
    fn ldr_register_offset_uxtw() {
        // LDR X0, [X1, X2, UXTW #3] = 0xF8625820
        let mut bus = MemBus::new();
        bus.write(0x8000_0040, &0xAABB_CCDD_EEFF_0011u64.to_le_bytes());
        let mut r = TrapFrame::zeroed();
        r.x[1] = 0x8000_0000;
        r.x[2] = 0x8;
        assert!(run(&mut bus, 0xF862_5820, &mut r, false).is_ok());
        assert_eq!(r.x[0], 0xAABB_CCDD_EEFF_0011);
    }

    #[test]
    fn str_pre_indexed_updates_base() {
        // STR X3, [X4, #8]! = 0xF8008C83
        let mut bus = MemBus::new();
        let mut r = TrapFrame::zeroed();
        r.x[3] = 0x1122_3344_5566_7788;
        r.x[4] = 0x8100_0000;
        assert!(run(&mut bus, 0xF800_8C83, &mut r, true).is_ok());
        assert_eq!(bus.read_u64(0x8100_0008), 0x1122_3344_5566_7788);
        assert_eq!(r.x[4], 0x8100_0008);
    }

    #[test]
    fn ldr_post_indexed_reads_old_base() {
        // LDR X5, [X6], #-16 = 0xF85F04C5
        let mut bus = MemBus::new();
        bus.write(0x8200_0000, &0xDEAD_BEEF_0BAD_F00Du64.to_le_bytes());
        let mut r = TrapFrame::zeroed();
        r.x[6] = 0x8200_0000;
        assert!(run(&mut bus, 0xF85F_04C5, &mut r, false).is_ok());
        assert_eq!(r.x[5], 0xDEAD_BEEF_0BAD_F00D);
        assert_eq!(r.x[6], 0x8200_0000 - 16);
    }

    #[test]
    fn ldr_q_literal_loads_16_bytes() {
        // LDR Q0, #+4 = opc=10 V=1 imm19=1 Rt=0 → 0x9C000020
        let mut bus = MemBus::new();
        bus.write(PC + 4, &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        bus.write(PC + 12, &[0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10]);
        let mut r = TrapFrame::zeroed();
        assert!(run(&mut bus, 0x9C00_0020, &mut r, false).is_ok());
        let bank = MOCK_FP_BANK.lock();
        assert_eq!(bank[0][0], 0x0807_0605_0403_0201);
        assert_eq!(bank[0][1], 0x100F_0E0D_0C0B_0A09);
    }

    #[test]
    fn prefetch_does_nothing() {
        // PRFM PLDL1KEEP, [X0, #0] = 0xF9800000 (size=3 opc=2 V=0)
        let mut bus = MemBus::new();
        let mut r = TrapFrame::zeroed();
        r.x[0] = 0x9000_0000;
        assert!(run(&mut bus, 0xF980_0000, &mut r, false).is_ok());
        assert_eq!(bus.accesses, 0, "prefetch must not touch memory");
    }

    #[test]
    fn ldursw_sign_extends() {
        // LDURSW X7, [X1, #-4] = size=10 opc=10 imm9=-4 → 0xB89FC027
        let mut bus = MemBus::new();
        bus.write(0x8000_0000 - 4, &0x8000_0001u32.to_le_bytes());
        let mut r = TrapFrame::zeroed();
        r.x[1] = 0x8000_0000;
        assert!(run(&mut bus, 0xB89F_C027, &mut r, false).is_ok());
        assert_eq!(r.x[7], 0xFFFF_FFFF_8000_0001);
    }

    #[test]
    fn ldrb_zero_extends() {
        // LDRB W9, [X2, #1] = 0x39400449
        let mut bus = MemBus::new();
        bus.write(0x8300_0001, &[0xFE]);
        let mut r = TrapFrame::zeroed();
        r.x[2] = 0x8300_0000;
        r.x[9] = !0;
        assert!(run(&mut bus, 0x3940_0449, &mut r, false).is_ok());
        assert_eq!(r.x[9], 0xFE);
    }

    #[test]
    fn strb_register_offset_sxtw_negative() {
        // STRB W1, [X2, W3, SXTW] = 0x3823C841 — the byte-sized sign
        // extension folds 0xFF into an offset of -1.
        let mut bus = MemBus::new();
        let mut r = TrapFrame::zeroed();
        r.x[1] = 0xAB;
        r.x[2] = 0x8400_0010;
        r.x[3] = 0xFF;
        assert!(run(&mut bus, 0x3823_C841, &mut r, true).is_ok());
        assert_eq!(*bus.mem.get(&0x8400_000F).unwrap(), 0xAB);
    }

    #[test]
    fn unknown_encoding_is_an_error() {
        // ADD X0, X1, X2 = 0x8B020020 — not a load/store.
        let mut bus = MemBus::new();
        let mut r = TrapFrame::zeroed();
        assert!(run(&mut bus, 0x8B02_0020, &mut r, false).is_err());
    }

    #[test]
    fn sp_base_uses_saved_sp_el0() {
        // LDR X1, [SP, #8] with the trap taken from EL0.
        // 0xF94007E1 = LDR X1, [X31, #8]
        let mut bus = MemBus::new();
        bus.write(0x7000_0008, &0xCAFE_u64.to_le_bytes());
        let mut r = TrapFrame::zeroed();
        r.sp_el0 = 0x7000_0000;
        bus.write(PC, &0xF940_07E1u32.to_le_bytes());
        r.elr_el2 = PC;
        assert!(emulate_with(&mut bus, &mut r, PC, false, 0).is_ok());
        assert_eq!(r.x[1], 0xCAFE);
    }
}

//! EL2 exception entry and dispatch.
//!
//! Every synchronous exception, IRQ, FIQ and SError funnels through the
//! vector table installed here. The assembly stub saves the full general
//! register frame plus `SP_EL0`, `ELR`, `SPSR`, `ESR`, `FAR`, `HCR` and
//! `TPIDR` on the EL2 stack and hands the frame to the Rust dispatcher,
//! which classifies by `ESR.EC`:
//!
//! | class | handling |
//! |---|---|
//! | WFI/WFE            | advance PC |
//! | SVC (A64)          | in-VMM process syscall hook |
//! | HVC (A64), imm 0   | VMM-call multiplexer |
//! | SMC (A64)          | SMC interposer, PC advanced when it says skip |
//! | MSR/MRS            | system-register interposer |
//! | data abort, lower  | process fault if HCR.TGE, else the emulator |
//! | data abort, same   | recovery skip when armed, else fatal |
//! | insn abort, lower  | process fault if HCR.TGE, else fatal |
//! | anything else      | fatal |
//!
//! After handling, the dispatcher yields to the scheduler hook so other
//! hypervisor threads get a turn.

use super::{emulator, smc, sysreg, vmmcall};
use crate::sync::percpu::current_cpu;
use spin::Mutex;

pub const INST_SIZE: u64 = 4;

/// Registers the entry stub saves, in stack order.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub x: [u64; 31],
    pub sp_el0: u64,
    pub elr_el2: u64,
    pub spsr_el2: u64,
    pub esr_el2: u64,
    pub far_el2: u64,
    pub hcr_el2: u64,
    pub tpidr: u64,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        TrapFrame {
            x: [0; 31],
            sp_el0: 0,
            elr_el2: 0,
            spsr_el2: 0,
            esr_el2: 0,
            far_el2: 0,
            hcr_el2: 0,
            tpidr: 0,
        }
    }

    /// Exception level the trap came from, out of the saved SPSR.
    pub fn source_el(&self) -> u32 {
        ((self.spsr_el2 & 0xF) >> 2) as u32
    }
}

/// ESR_EL2 field extraction.
pub mod esr {
    #[inline]
    pub fn ec(esr: u64) -> u32 {
        ((esr >> 26) & 0x3F) as u32
    }

    /// Instruction length: true = 32-bit.
    #[inline]
    pub fn il32(esr: u64) -> bool {
        (esr >> 25) & 1 != 0
    }

    #[inline]
    pub fn iss(esr: u64) -> u32 {
        (esr & 0x01FF_FFFF) as u32
    }
}

/// Exception classes we dispatch on.
pub mod ec {
    pub const WF_FAMILY: u32 = 0x01;
    pub const SVC_A64: u32 = 0x15;
    pub const HVC_A64: u32 = 0x16;
    pub const SMC_A64: u32 = 0x17;
    pub const MSR_MRS: u32 = 0x18;
    pub const INST_ABORT_LOWER: u32 = 0x20;
    pub const DATA_ABORT_LOWER: u32 = 0x24;
    pub const DATA_ABORT_CURRENT: u32 = 0x25;
}

/// Data-abort ISS fields.
pub mod dabt {
    #[inline]
    pub fn dfsc(iss: u32) -> u32 {
        iss & 0x3F
    }

    #[inline]
    pub fn wnr(iss: u32) -> bool {
        (iss >> 6) & 1 != 0
    }

    #[inline]
    pub fn isv(iss: u32) -> bool {
        (iss >> 24) & 1 != 0
    }

    /// DFSC 0b0001LL: stage-2 translation fault.
    pub fn is_translation_fault(iss: u32) -> bool {
        dfsc(iss) & !0x3 == 0x04
    }

    /// DFSC 0b0011LL: permission fault.
    pub fn is_permission_fault(iss: u32) -> bool {
        dfsc(iss) & !0x3 == 0x0C
    }
}

const HCR_TGE: u64 = 1 << 27;

pub type HandlerFn = fn(&mut TrapFrame) -> HandleReturn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleReturn {
    Ok,
    NotHandled,
}

fn handle_nothing(_r: &mut TrapFrame) -> HandleReturn {
    HandleReturn::NotHandled
}

fn process_syscall_none(r: &mut TrapFrame) -> HandleReturn {
    log_error!("SVC with no process subsystem attached, x8 0x{:x}", r.x[8]);
    HandleReturn::NotHandled
}

fn process_fault_none(_r: &mut TrapFrame) -> HandleReturn {
    log_error!("process fault with no process subsystem attached");
    HandleReturn::NotHandled
}

struct Hooks {
    irq: HandlerFn,
    fiq: HandlerFn,
    /// In-VMM process syscall entry (SVC #0 with HCR.TGE).
    syscall: HandlerFn,
    /// In-VMM process abort path (aborts with HCR.TGE).
    process_fault: HandlerFn,
    /// Cooperative yield, called after every trap.
    schedule: fn(),
    /// Pending-panic probe, called on entry.
    panic_test: fn(),
}

fn nop() {}

static HOOKS: Mutex<Hooks> = Mutex::new(Hooks {
    irq: handle_nothing,
    fiq: handle_nothing,
    syscall: process_syscall_none,
    process_fault: process_fault_none,
    schedule: nop,
    panic_test: nop,
});

/// Install the IRQ/FIQ handlers (the vGIC owns these).
pub fn set_exception_handler(irq: Option<HandlerFn>, fiq: Option<HandlerFn>) {
    let mut h = HOOKS.lock();
    if let Some(f) = irq {
        h.irq = f;
    }
    if let Some(f) = fiq {
        h.fiq = f;
    }
}

/// Attach the external process subsystem's syscall and fault entries.
pub fn set_process_hooks(syscall: HandlerFn, fault: HandlerFn) {
    let mut h = HOOKS.lock();
    h.syscall = syscall;
    h.process_fault = fault;
}

/// Attach the external scheduler's yield hook.
pub fn set_schedule_hook(f: fn()) {
    HOOKS.lock().schedule = f;
}

/// Attach the external panic subsystem's pending-panic probe.
pub fn set_panic_test_hook(f: fn()) {
    HOOKS.lock().panic_test = f;
}

#[inline]
fn skip_inst(r: &mut TrapFrame) {
    r.elr_el2 += INST_SIZE;
}

// ── Recovery armature ───────────────────────────────────────────────────
// Hypervisor code that probes possibly-unmapped guest memory arms this
// before the access. A same-EL data abort then skips the faulting
// instruction and raises the per-CPU flag instead of taking the CPU down.
// A flag pair rather than an error return: the probe may fault arbitrarily
// deep inside nested helpers.

pub fn arm_recovery() {
    use core::sync::atomic::Ordering;
    let cpu = current_cpu();
    cpu.try_recovery.store(true, Ordering::Relaxed);
    cpu.error_on_recovery.store(false, Ordering::Relaxed);
}

pub fn disarm_recovery() {
    use core::sync::atomic::Ordering;
    current_cpu().try_recovery.store(false, Ordering::Relaxed);
}

pub fn recovery_triggered() -> bool {
    use core::sync::atomic::Ordering;
    current_cpu().error_on_recovery.load(Ordering::Relaxed)
}

// ── Classified handlers ─────────────────────────────────────────────────

fn trap_wfx(r: &mut TrapFrame, _iss: u32) -> Result<(), ()> {
    skip_inst(r);
    Ok(())
}

fn handle_svc(r: &mut TrapFrame, iss: u32) -> Result<(), ()> {
    match iss & 0xFFFF {
        0 => {
            let f = HOOKS.lock().syscall;
            match f(r) {
                HandleReturn::Ok => Ok(()),
                HandleReturn::NotHandled => Err(()),
            }
        }
        n => {
            log_warn!("unexpected SVC immediate {}", n);
            Err(())
        }
    }
}

fn handle_hvc(r: &mut TrapFrame, iss: u32) -> Result<(), ()> {
    match iss & 0xFFFF {
        0 => {
            vmmcall::dispatch(r);
            Ok(())
        }
        n => {
            log_warn!("unexpected HVC immediate {}", n);
            Err(())
        }
    }
}

fn trap_smc(r: &mut TrapFrame, iss: u32) -> Result<(), ()> {
    let skip = smc::call_hook(r, iss)?;
    if skip {
        skip_inst(r);
    }
    Ok(())
}

fn trap_msr_mrs(r: &mut TrapFrame, iss: u32) -> Result<(), ()> {
    sysreg::handle(r, iss)?;
    skip_inst(r);
    Ok(())
}

fn dump_dabt_iss(iss: u32) {
    log_error!(
        "DFSC 0x{:x} WnR {} S1PTW {} FnV {} SF {} SRT {} SSE {} SAS {} ISV {}",
        dabt::dfsc(iss),
        (iss >> 6) & 1,
        (iss >> 7) & 1,
        (iss >> 10) & 1,
        (iss >> 15) & 1,
        (iss >> 16) & 0x1F,
        (iss >> 21) & 1,
        (iss >> 22) & 0x3,
        (iss >> 24) & 1
    );
}

fn trap_data_abort(r: &mut TrapFrame, iss: u32) -> Result<(), ()> {
    let el = r.source_el();
    if el > 2 {
        log_error!("data abort from impossible EL {}", el);
        return Err(());
    }

    if dabt::is_permission_fault(iss) {
        log_error!(
            "permission fault iss 0x{:x} from EL{}, likely a guest write into hypervisor memory",
            iss,
            el
        );
        return Err(());
    }

    if !dabt::is_translation_fault(iss) {
        dump_dabt_iss(iss);
        log_error!("unexpected data abort iss 0x{:x} from lower EL", iss);
        return Err(());
    }

    let elr = r.elr_el2;
    let wr = dabt::wnr(iss);
    match emulator::emulate(r, elr, wr, el) {
        Ok(()) => {
            skip_inst(r);
            Ok(())
        }
        Err(()) => {
            dump_dabt_iss(iss);
            Err(())
        }
    }
}

fn try_data_abort_recovery(r: &mut TrapFrame, iss: u32) -> Result<(), ()> {
    use core::sync::atomic::Ordering;
    let cpu = current_cpu();
    if !cpu.try_recovery.load(Ordering::Relaxed) {
        return Err(());
    }
    cpu.error_on_recovery.store(true, Ordering::Relaxed);
    log_warn!(
        "recovering from EL2 fault: ELR 0x{:x} FAR 0x{:x}",
        r.elr_el2,
        r.far_el2
    );
    dump_dabt_iss(iss);
    skip_inst(r);
    Ok(())
}

fn handle_sync(r: &mut TrapFrame) -> Result<(), ()> {
    let esr_val = r.esr_el2;
    let iss = esr::iss(esr_val);

    if !esr::il32(esr_val) {
        return Err(());
    }

    match esr::ec(esr_val) {
        ec::WF_FAMILY => trap_wfx(r, iss),
        ec::SVC_A64 => handle_svc(r, iss),
        ec::HVC_A64 => handle_hvc(r, iss),
        ec::SMC_A64 => trap_smc(r, iss),
        ec::MSR_MRS => trap_msr_mrs(r, iss),
        ec::DATA_ABORT_LOWER => {
            if r.hcr_el2 & HCR_TGE != 0 {
                let f = HOOKS.lock().process_fault;
                match f(r) {
                    HandleReturn::Ok => Ok(()),
                    HandleReturn::NotHandled => Err(()),
                }
            } else {
                trap_data_abort(r, iss)
            }
        }
        ec::DATA_ABORT_CURRENT => try_data_abort_recovery(r, iss),
        ec::INST_ABORT_LOWER => {
            if r.hcr_el2 & HCR_TGE != 0 {
                let f = HOOKS.lock().process_fault;
                match f(r) {
                    HandleReturn::Ok => Ok(()),
                    HandleReturn::NotHandled => Err(()),
                }
            } else {
                Err(())
            }
        }
        other => {
            log_error!("unhandled exception class 0x{:x}", other);
            Err(())
        }
    }
}

fn exception_common(r: &mut TrapFrame, handler: fn(&mut TrapFrame) -> Result<(), ()>, what: &str) {
    current_cpu().set_saved_frame(r);
    let (panic_test, schedule) = {
        let h = HOOKS.lock();
        (h.panic_test, h.schedule)
    };
    panic_test();
    let res = handler(r);
    schedule();
    if res.is_err() {
        super::debug::dump_trap_frame(r);
        panic!(
            "{} exception not handled: ESR 0x{:x} ELR 0x{:x} FAR 0x{:x}",
            what, r.esr_el2, r.elr_el2, r.far_el2
        );
    }
}

fn handle_irq_entry(r: &mut TrapFrame) -> Result<(), ()> {
    let f = HOOKS.lock().irq;
    match f(r) {
        HandleReturn::Ok => Ok(()),
        HandleReturn::NotHandled => Err(()),
    }
}

fn handle_fiq_entry(r: &mut TrapFrame) -> Result<(), ()> {
    let f = HOOKS.lock().fiq;
    match f(r) {
        HandleReturn::Ok => Ok(()),
        HandleReturn::NotHandled => Err(()),
    }
}

fn handle_serror(_r: &mut TrapFrame) -> Result<(), ()> {
    Err(())
}

/// Rust-side entry points reached from the vector stubs.
#[no_mangle]
extern "C" fn exception_sync(r: &mut TrapFrame) {
    exception_common(r, handle_sync, "sync");
}

#[no_mangle]
extern "C" fn exception_irq(r: &mut TrapFrame) {
    exception_common(r, handle_irq_entry, "irq");
}

#[no_mangle]
extern "C" fn exception_fiq(r: &mut TrapFrame) {
    exception_common(r, handle_fiq_entry, "fiq");
}

#[no_mangle]
extern "C" fn exception_serror(r: &mut TrapFrame) {
    exception_common(r, handle_serror, "serror");
}

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    r#"
.macro VECTOR_STUB handler
    sub sp, sp, #0x130
    stp x0, x1, [sp, #0x00]
    stp x2, x3, [sp, #0x10]
    stp x4, x5, [sp, #0x20]
    stp x6, x7, [sp, #0x30]
    stp x8, x9, [sp, #0x40]
    stp x10, x11, [sp, #0x50]
    stp x12, x13, [sp, #0x60]
    stp x14, x15, [sp, #0x70]
    stp x16, x17, [sp, #0x80]
    stp x18, x19, [sp, #0x90]
    stp x20, x21, [sp, #0xA0]
    stp x22, x23, [sp, #0xB0]
    stp x24, x25, [sp, #0xC0]
    stp x26, x27, [sp, #0xD0]
    stp x28, x29, [sp, #0xE0]
    str x30, [sp, #0xF0]
    mrs x9, sp_el0
    str x9, [sp, #0xF8]
    mrs x9, elr_el2
    mrs x10, spsr_el2
    stp x9, x10, [sp, #0x100]
    mrs x9, esr_el2
    mrs x10, far_el2
    stp x9, x10, [sp, #0x110]
    mrs x9, hcr_el2
    mrs x10, tpidr_el2
    stp x9, x10, [sp, #0x120]
    mov x0, sp
    bl \handler
    ldp x9, x10, [sp, #0x100]
    msr elr_el2, x9
    msr spsr_el2, x10
    ldr x9, [sp, #0xF8]
    msr sp_el0, x9
    ldp x2, x3, [sp, #0x10]
    ldp x4, x5, [sp, #0x20]
    ldp x6, x7, [sp, #0x30]
    ldp x8, x9, [sp, #0x40]
    ldp x10, x11, [sp, #0x50]
    ldp x12, x13, [sp, #0x60]
    ldp x14, x15, [sp, #0x70]
    ldp x16, x17, [sp, #0x80]
    ldp x18, x19, [sp, #0x90]
    ldp x20, x21, [sp, #0xA0]
    ldp x22, x23, [sp, #0xB0]
    ldp x24, x25, [sp, #0xC0]
    ldp x26, x27, [sp, #0xD0]
    ldp x28, x29, [sp, #0xE0]
    ldr x30, [sp, #0xF0]
    ldp x0, x1, [sp, #0x00]
    add sp, sp, #0x130
    eret
.endm

.section .text
.balign 2048
.global exception_vector_table
exception_vector_table:
/* Current EL with SP_EL0: unexpected */
.balign 0x80
    b vector_stub_sync
.balign 0x80
    b vector_stub_irq
.balign 0x80
    b vector_stub_fiq
.balign 0x80
    b vector_stub_serror
/* Current EL with SP_ELx: EL2 faults (recovery path lives here) */
.balign 0x80
    b vector_stub_sync
.balign 0x80
    b vector_stub_irq
.balign 0x80
    b vector_stub_fiq
.balign 0x80
    b vector_stub_serror
/* Lower EL, AArch64: the guest */
.balign 0x80
    b vector_stub_sync
.balign 0x80
    b vector_stub_irq
.balign 0x80
    b vector_stub_fiq
.balign 0x80
    b vector_stub_serror
/* Lower EL, AArch32: not supported */
.balign 0x80
    b vector_stub_sync
.balign 0x80
    b vector_stub_irq
.balign 0x80
    b vector_stub_fiq
.balign 0x80
    b vector_stub_serror

vector_stub_sync:
    VECTOR_STUB exception_sync
vector_stub_irq:
    VECTOR_STUB exception_irq
vector_stub_fiq:
    VECTOR_STUB exception_fiq
vector_stub_serror:
    VECTOR_STUB exception_serror
"#
);

#[cfg(target_arch = "aarch64")]
extern "C" {
    static exception_vector_table: u8;
}

/// Point VBAR_EL2 at our vectors.
pub fn init() {
    #[cfg(target_arch = "aarch64")]
    {
        let base = unsafe { &exception_vector_table as *const u8 as u64 };
        crate::write_sysreg!("vbar_el2", base);
        super::isb();
    }
}

pub fn init_secondary() {
    init();
}

#[cfg(test)]
mod tests {
    use super::*;

    // The recovery flags live in the shared boot-CPU block; tests that
    // touch them must not interleave.
    static RECOVERY_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn frame_with(ec_val: u32, iss: u32) -> TrapFrame {
        let mut f = TrapFrame::zeroed();
        f.esr_el2 = ((ec_val as u64) << 26) | (1 << 25) | iss as u64;
        f.elr_el2 = 0x8000_0000;
        f
    }

    #[test]
    fn wfx_skips_the_instruction() {
        let mut f = frame_with(ec::WF_FAMILY, 0);
        assert!(handle_sync(&mut f).is_ok());
        assert_eq!(f.elr_el2, 0x8000_0004);
    }

    #[test]
    fn sixteen_bit_instructions_are_fatal() {
        let mut f = frame_with(ec::WF_FAMILY, 0);
        f.esr_el2 &= !(1 << 25);
        assert!(handle_sync(&mut f).is_err());
    }

    #[test]
    fn same_el_abort_without_recovery_is_fatal() {
        let _g = RECOVERY_LOCK.lock().unwrap();
        disarm_recovery();
        let mut f = frame_with(ec::DATA_ABORT_CURRENT, 0x04);
        assert!(handle_sync(&mut f).is_err());
    }

    #[test]
    fn armed_recovery_skips_and_flags() {
        let _g = RECOVERY_LOCK.lock().unwrap();
        arm_recovery();
        assert!(!recovery_triggered());
        let mut f = frame_with(ec::DATA_ABORT_CURRENT, 0x04);
        assert!(handle_sync(&mut f).is_ok());
        assert_eq!(f.elr_el2, 0x8000_0004);
        assert!(recovery_triggered());
        disarm_recovery();
    }

    #[test]
    fn dfsc_classification() {
        assert!(dabt::is_translation_fault(0x04));
        assert!(dabt::is_translation_fault(0x07));
        assert!(!dabt::is_translation_fault(0x0C));
        assert!(dabt::is_permission_fault(0x0C));
        assert!(dabt::is_permission_fault(0x0F));
        assert!(!dabt::is_permission_fault(0x05));
    }

    #[test]
    fn permission_fault_from_guest_is_fatal() {
        let mut f = frame_with(ec::DATA_ABORT_LOWER, 0x0D);
        f.spsr_el2 = 0x5; // EL1h
        assert!(handle_sync(&mut f).is_err());
    }
}

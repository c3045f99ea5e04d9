//! SMC interposition.
//!
//! Guest firmware calls pass through to EL3 untouched, with one
//! exception: `PSCI CPU_ON`. A secondary core must come up under
//! hypervisor control, so the call is rewritten — the hypervisor
//! allocates the core a stack, parks the guest's intended entry point and
//! context in an entry-data block at the top of that stack, and hands the
//! firmware its own secondary entry stub instead. The stub restores the
//! EL2 environment and ends up in `vm_start_at`, which finally drops the
//! core into the guest where the guest wanted to go.

use super::trap::TrapFrame;
use super::vm;
use crate::memory;
use alloc::alloc::{alloc, Layout};
use core::sync::atomic::{AtomicBool, Ordering};

/// SMCCC function-id fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    ArmArch,
    Cpu,
    Sip,
    Oem,
    /// Standard secure service: PSCI lives here.
    Std,
    StdHyp,
    Vendor,
    Other(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct FunctionId {
    pub raw: u32,
    pub fast: bool,
    pub is64: bool,
    pub service: Service,
    pub number: u16,
}

impl FunctionId {
    pub fn decode(raw: u32) -> Self {
        let service = match (raw >> 24) & 0x3F {
            0 => Service::ArmArch,
            1 => Service::Cpu,
            2 => Service::Sip,
            3 => Service::Oem,
            4 => Service::Std,
            5 => Service::StdHyp,
            6 => Service::Vendor,
            other => Service::Other(other),
        };
        FunctionId {
            raw,
            fast: raw & (1 << 31) != 0,
            is64: raw & (1 << 30) != 0,
            service,
            number: (raw & 0xFFFF) as u16,
        }
    }
}

pub const PSCI_CPU_ON_32: u32 = 0x8400_0003;
pub const PSCI_CPU_ON_64: u32 = 0xC400_0003;
pub const PSCI_ERR_NOT_SUPPORTED: i64 = -1;
pub const PSCI_ERR_INTERNAL_FAILURE: i64 = -6;

const SECONDARY_STACK_SIZE: usize = 64 * 1024;

/// Parameters a secondary core needs to re-enter the guest, placed at the
/// top of its freshly allocated stack. 16-byte multiple so the stack stays
/// aligned.
#[repr(C)]
pub struct EntryData {
    pub vm: *const vm::VmCtx,
    pub g_mpidr: u64,
    pub g_entry: u64,
    pub g_ctx_id: u64,
    pub pa_base: u64,
    pub va_base: u64,
}

/// EL2 state a secondary core restores before it can run Rust: filled by
/// the boot CPU from its own live registers.
#[repr(C)]
struct SecondaryEnv {
    mair: u64,
    tcr: u64,
    ttbr0: u64,
    ttbr1: u64,
    hcr: u64,
    sctlr: u64,
    vbar: u64,
    hhdm: u64,
    rust_entry: u64,
}

#[no_mangle]
static mut SECONDARY_ENV: SecondaryEnv = SecondaryEnv {
    mair: 0,
    tcr: 0,
    ttbr0: 0,
    ttbr1: 0,
    hcr: 0,
    sctlr: 0,
    vbar: 0,
    hhdm: 0,
    rust_entry: 0,
};

static SECONDARY_ENV_READY: AtomicBool = AtomicBool::new(false);

#[cfg(target_os = "none")]
extern "C" {
    fn kmain_secondary(entry_data: *const EntryData) -> !;
}

fn capture_secondary_env() {
    if SECONDARY_ENV_READY.swap(true, Ordering::AcqRel) {
        return;
    }
    unsafe {
        let env = &mut *core::ptr::addr_of_mut!(SECONDARY_ENV);
        env.mair = crate::read_sysreg!("mair_el2");
        env.tcr = crate::read_sysreg!("tcr_el2");
        env.ttbr0 = crate::read_sysreg!("ttbr0_el2");
        env.ttbr1 = crate::read_sysreg!("ttbr1_el2");
        env.hcr = crate::read_sysreg!("hcr_el2");
        env.sctlr = crate::read_sysreg!("sctlr_el2");
        env.vbar = crate::read_sysreg!("vbar_el2");
        env.hhdm = memory::phys_to_virt(0);
        #[cfg(target_os = "none")]
        {
            env.rust_entry = kmain_secondary as usize as u64;
        }
    }
}

// The firmware starts a secondary core at this stub, MMU off, with x0
// holding the context id — which the CPU_ON hook set to the physical top
// of the new stack. Restore the EL2 environment the boot CPU captured,
// move onto the new stack and continue in Rust at the virtual entry.
#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    r#"
.section .text
.global veilhv_secondary_entry
veilhv_secondary_entry:
    mov x19, x0                     /* physical stack top */
    adrp x1, SECONDARY_ENV
    add x1, x1, :lo12:SECONDARY_ENV
    ldp x2, x3, [x1, #0x00]         /* mair, tcr */
    msr mair_el2, x2
    msr tcr_el2, x3
    ldp x2, x3, [x1, #0x10]         /* ttbr0, ttbr1 */
    msr ttbr0_el2, x2
    msr ttbr1_el2, x3
    ldp x2, x3, [x1, #0x20]         /* hcr, sctlr */
    msr hcr_el2, x2
    isb
    tlbi alle2
    dsb ish
    msr sctlr_el2, x3
    isb
    ldr x2, [x1, #0x30]             /* vbar */
    msr vbar_el2, x2
    isb
    ldp x4, x5, [x1, #0x38]         /* hhdm, rust_entry */
    add x0, x19, x4                 /* virtual stack top */
    mov sp, x0
    sub x0, x0, #0x30               /* entry data sits at the top */
    br x5
"#
);

#[cfg(target_arch = "aarch64")]
extern "C" {
    fn veilhv_secondary_entry();
}

#[cfg(target_arch = "aarch64")]
fn secondary_entry_phys() -> u64 {
    memory::virt_to_phys(veilhv_secondary_entry as usize as u64)
}

#[cfg(not(target_arch = "aarch64"))]
fn secondary_entry_phys() -> u64 {
    0
}

/// Issue the real PSCI CPU_ON with our entry substituted.
#[cfg(target_arch = "aarch64")]
fn psci_call(func: u64, target_mpidr: u64, entry: u64, ctx: u64) -> i64 {
    let ret: u64;
    unsafe {
        core::arch::asm!(
            "smc #0",
            inout("x0") func => ret,
            in("x1") target_mpidr,
            in("x2") entry,
            in("x3") ctx,
            options(nostack)
        );
    }
    ret as i64
}

#[cfg(not(target_arch = "aarch64"))]
fn psci_call(_func: u64, _target_mpidr: u64, _entry: u64, _ctx: u64) -> i64 {
    PSCI_ERR_NOT_SUPPORTED
}

/// Forward an SMC unchanged, returning the results into the frame.
#[allow(unused_variables)]
fn passthrough_call(r: &mut TrapFrame) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let mut x0 = r.x[0];
        let mut x1 = r.x[1];
        let mut x2 = r.x[2];
        let mut x3 = r.x[3];
        core::arch::asm!(
            "smc #0",
            inout("x0") x0,
            inout("x1") x1,
            inout("x2") x2,
            inout("x3") x3,
            in("x4") r.x[4],
            in("x5") r.x[5],
            in("x6") r.x[6],
            in("x7") r.x[7],
            options(nostack)
        );
        r.x[0] = x0;
        r.x[1] = x1;
        r.x[2] = x2;
        r.x[3] = x3;
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        r.x[0] = PSCI_ERR_NOT_SUPPORTED as u64;
    }
}

/// CPU_ON: give the new core a stack and reroute its entry through us.
fn handle_psci_cpu_on(r: &mut TrapFrame) {
    // x0: function id, x1: target MPIDR, x2: entry, x3: context id.
    capture_secondary_env();

    let layout = Layout::from_size_align(SECONDARY_STACK_SIZE, 16).unwrap();
    let stack = unsafe { alloc(layout) };
    if stack.is_null() {
        panic!("out of memory for a secondary CPU stack");
    }
    let stack_top = stack as u64 + SECONDARY_STACK_SIZE as u64;

    let entry_data = (stack_top - core::mem::size_of::<EntryData>() as u64) as *mut EntryData;
    unsafe {
        entry_data.write(EntryData {
            vm: vm::current_ctx(),
            g_mpidr: r.x[1],
            g_entry: r.x[2],
            g_ctx_id: r.x[3],
            pa_base: memory::vmm_phys_start(),
            va_base: memory::phys_to_virt(memory::vmm_phys_start()),
        });
    }

    let error = psci_call(
        r.x[0],
        r.x[1],
        secondary_entry_phys(),
        memory::virt_to_phys(stack_top),
    );
    if error != 0 {
        log_error!("CPU_ON for MPIDR 0x{:x} failed: {}", r.x[1], error);
    }

    r.x[0] = error as u64;
}

/// Entry from the trap dispatcher. Returns whether the guest's SMC
/// instruction should be skipped.
pub fn call_hook(r: &mut TrapFrame, iss: u32) -> Result<bool, ()> {
    let smc_imm = iss & 0xFFFF;
    if smc_imm != 0 {
        // The calling convention reserves non-zero immediates.
        log_warn!("ignoring SMC with immediate {}", smc_imm);
        r.x[0] = PSCI_ERR_NOT_SUPPORTED as u64;
        return Ok(true);
    }

    let fid = FunctionId::decode(r.x[0] as u32);
    match (fid.service, fid.raw) {
        (Service::Std, PSCI_CPU_ON_32) | (Service::Std, PSCI_CPU_ON_64) => {
            handle_psci_cpu_on(r)
        }
        _ => passthrough_call(r),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_id_decode() {
        let f = FunctionId::decode(PSCI_CPU_ON_64);
        assert!(f.fast);
        assert!(f.is64);
        assert_eq!(f.service, Service::Std);
        assert_eq!(f.number, 3);

        let f = FunctionId::decode(PSCI_CPU_ON_32);
        assert!(f.fast);
        assert!(!f.is64);
        assert_eq!(f.service, Service::Std);
    }

    #[test]
    fn nonzero_immediate_is_rejected_with_skip() {
        let mut r = TrapFrame::zeroed();
        r.x[0] = PSCI_CPU_ON_64 as u64;
        let skip = call_hook(&mut r, 1).unwrap();
        assert!(skip);
        assert_eq!(r.x[0] as i64, PSCI_ERR_NOT_SUPPORTED);
    }

    #[test]
    fn entry_data_is_sixteen_byte_multiple() {
        assert_eq!(core::mem::size_of::<EntryData>() % 16, 0);
    }
}

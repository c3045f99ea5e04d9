//! The VM and its VCPUs, and the EL2→EL1 handoff.
//!
//! One guest, many VCPUs. The boot CPU enters the guest by translating
//! the firmware's EL2 register state into equivalent EL1 state and
//! ERETing to the firmware's return point; secondaries brought up through
//! the trapped CPU_ON enter at whatever address the guest asked for.
//! The list-of-VMs shape is groundwork: nothing creates a second VM.

use super::{hcr, mapper, vgic};
use super::trap;
use crate::sync::percpu::{self, current_cpu};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use spin::{Mutex, Once};

const HCR_FLAGS: u64 = hcr::VM
    | hcr::FMO
    | hcr::IMO
    | hcr::TSC
    | hcr::RW
    | hcr::E2H
    | hcr::APK
    | hcr::API
    | hcr::TID3;

/// SCTLR_EL1 value handed to the fresh guest: MMU and caches on, stack
/// alignment checking, WFx not trapped, syncing exception entries/exits.
const GUEST_SCTLR: u64 = (1 << 0)   // M
    | (1 << 2)                      // C
    | (1 << 3)                      // SA
    | (1 << 4)                      // SA0
    | (1 << 11)                     // EOS
    | (1 << 12)                     // I
    | (1 << 16)                     // nTWI
    | (1 << 18)                     // nTWE
    | (1 << 22)                     // EIS
    | (1 << 23);                    // SPAN

/// CPACR_EL1: FP/SIMD, SVE and SME all untrapped for the guest.
const GUEST_CPACR: u64 = (3 << 16) | (3 << 20) | (3 << 24);

pub struct Vcpu {
    pub mpidr: u64,
}

pub struct VmCtx {
    vcpus: Mutex<Vec<Vcpu>>,
}

impl VmCtx {
    fn new() -> Self {
        VmCtx {
            vcpus: Mutex::new(Vec::new()),
        }
    }

    fn add_vcpu(&self, mpidr: u64) -> usize {
        let mut v = self.vcpus.lock();
        v.push(Vcpu { mpidr });
        v.len() - 1
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.lock().len()
    }
}

static VM_LIST: Mutex<Vec<Arc<VmCtx>>> = Mutex::new(Vec::new());
static CURRENT_VM: Once<Arc<VmCtx>> = Once::new();

/// EL2 register state captured when the firmware handed over control.
/// Turned into the guest's initial EL1 state by `vm_start`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootCtx {
    pub sp: u64,
    pub x30: u64,
    pub spsr_el2: u64,
    pub esr_el2: u64,
    pub far_el2: u64,
    pub mair_el2: u64,
    pub tcr_el2: u64,
    pub tpidr_el2: u64,
    pub ttbr0_el2: u64,
    pub vbar_el2: u64,
}

lazy_static::lazy_static! {
    static ref BOOT_CTX: Mutex<BootCtx> = Mutex::new(BootCtx::default());
}

/// Snapshot the firmware's EL2 state; called first thing on the boot
/// path, before anything here touches those registers.
pub fn capture_boot_ctx(x30: u64, sp: u64) {
    let mut c = BOOT_CTX.lock();
    c.sp = sp;
    c.x30 = x30;
    c.spsr_el2 = crate::read_sysreg!("spsr_el2");
    c.esr_el2 = crate::read_sysreg!("esr_el2");
    c.far_el2 = crate::read_sysreg!("far_el2");
    c.mair_el2 = crate::read_sysreg!("mair_el2");
    c.tcr_el2 = crate::read_sysreg!("tcr_el2");
    c.tpidr_el2 = crate::read_sysreg!("tpidr_el2");
    c.ttbr0_el2 = crate::read_sysreg!("ttbr0_el2");
    c.vbar_el2 = crate::read_sysreg!("vbar_el2");
}

/// Rewrite a (VHE-layout) TCR_EL2 into the equivalent TCR_EL1. The low 16
/// bits line up; the rest move field by field.
pub fn tcr_el2_to_el1(orig: u64) -> u64 {
    let mut val = orig & 0xFFFF;
    val |= ((orig >> 16) & 0x7) << 32; // PS -> IPS
    val |= ((orig >> 20) & 0x1) << 37; // TBI -> TBI0
    val |= ((orig >> 21) & 0x1) << 39; // HA
    val |= ((orig >> 22) & 0x1) << 40; // HD
    val |= ((orig >> 24) & 0x1) << 41; // HPD -> HPD0
    val |= ((orig >> 25) & 0xF) << 43; // HWU -> HWU0nn
    val |= ((orig >> 29) & 0x1) << 51; // TBID -> TBID0
    val |= ((orig >> 30) & 0x1) << 57; // TCMA -> TCMA0
    val |= ((orig >> 32) & 0x1) << 59; // DS
    val
}

/// Allow the guest full use of the physical counter and timer.
fn cnt_default_after_e2h() {
    // CNTHCTL_EL2.EL1PCTEN | EL1PCEN
    crate::write_sysreg!("cnthctl_el2", 0x3);
}

/// FP/SIMD untrapped at EL2 (CPTR_EL2 has the CPACR layout under E2H).
fn cptr_default_after_e2h() {
    crate::write_sysreg!("cptr_el2", GUEST_CPACR);
}

#[allow(unreachable_code, unused_variables)]
fn enter_guest(ctx_id: u64, x30: u64, sp_seen_by_guest: u64) -> ! {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "mov x0, {ctx}",
            "mov x30, {lr}",
            "eret",
            ctx = in(reg) ctx_id,
            lr = in(reg) x30,
            options(noreturn)
        );
    }
    panic!("guest entry on a non-AArch64 build");
}

/// Hand the boot CPU to the guest at the firmware's return point, with
/// the EL2 state it saw translated down to EL1.
pub fn vm_start() -> ! {
    let vm = Arc::new(VmCtx::new());
    let idx = vm.add_vcpu(percpu::mpidr());
    VM_LIST.lock().push(vm.clone());
    CURRENT_VM.call_once(|| vm);
    current_cpu().current_vcpu.store(idx, Ordering::Relaxed);

    vgic::setup_virtual_gic();

    log!("processor {:x} entering EL1", current_cpu().cpunum());

    let c = *BOOT_CTX.lock();
    crate::write_sysreg!("sp_el1", c.sp);
    crate::write_sysreg!("esr_el12", c.esr_el2);
    crate::write_sysreg!("far_el12", c.far_el2);
    crate::write_sysreg!("mair_el12", c.mair_el2);
    crate::write_sysreg!("sctlr_el12", GUEST_SCTLR);
    crate::write_sysreg!("tcr_el12", tcr_el2_to_el1(c.tcr_el2));
    crate::write_sysreg!("tpidr_el1", c.tpidr_el2);
    crate::write_sysreg!("ttbr0_el12", c.ttbr0_el2);
    crate::write_sysreg!("vbar_el12", c.vbar_el2);
    crate::write_sysreg!("cpacr_el12", GUEST_CPACR);

    crate::write_sysreg!("spsr_el2", (c.spsr_el2 & !0xF) | 0x5); // EL1h
    crate::write_sysreg!("elr_el2", c.x30);

    crate::write_sysreg!("hcr_el2", HCR_FLAGS);
    super::isb();

    cnt_default_after_e2h();

    enter_guest(0, c.x30, c.sp)
}

/// Secondary-core path after CPU_ON: enter the guest at its requested
/// entry with the context id in x0.
pub fn vm_start_at(vm: &'static VmCtx, g_mpidr: u64, g_entry: u64, g_ctx_id: u64) -> ! {
    let idx = vm.add_vcpu(g_mpidr);
    current_cpu().current_vcpu.store(idx, Ordering::Relaxed);

    vgic::setup_virtual_gic();

    log!("processor {:x} entering EL1", current_cpu().cpunum());

    crate::write_sysreg!("sctlr_el12", 0);
    crate::write_sysreg!("spsr_el2", 0x5); // EL1h
    crate::write_sysreg!("elr_el2", g_entry);
    crate::write_sysreg!("hcr_el2", HCR_FLAGS);
    super::isb();
    cptr_default_after_e2h();
    cnt_default_after_e2h();

    enter_guest(g_ctx_id, g_entry, 0)
}

/// The single VM's context, for the CPU_ON entry-data block.
pub fn current_ctx() -> *const VmCtx {
    match CURRENT_VM.get() {
        Some(vm) => Arc::as_ptr(vm),
        None => core::ptr::null(),
    }
}

/// Address space of the running guest: all of physical memory with the
/// hypervisor blanked out.
pub fn current_as() -> &'static mapper::AddrSpace {
    &mapper::AS_PASSVM
}

/// Yield hook placeholder until a thread scheduler attaches; keeps the
/// dispatcher's contract (`schedule()` after every trap) honest.
pub fn attach_scheduler(yield_fn: fn()) {
    trap::set_schedule_hook(yield_fn);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcr_translation_moves_fields() {
        // T0SZ/T1SZ etc. (low 16 bits) pass through.
        assert_eq!(tcr_el2_to_el1(0x1234) & 0xFFFF, 0x1234);

        // PS=0b101 at [18:16] becomes IPS at [34:32].
        let v = tcr_el2_to_el1(0b101 << 16);
        assert_eq!((v >> 32) & 0x7, 0b101);

        // TBI (20) -> TBI0 (37), HA (21) -> (39), HD (22) -> (40).
        let v = tcr_el2_to_el1((1 << 20) | (1 << 21) | (1 << 22));
        assert_ne!(v & (1 << 37), 0);
        assert_ne!(v & (1 << 39), 0);
        assert_ne!(v & (1 << 40), 0);

        // HWU nibble (28:25) -> (46:43).
        let v = tcr_el2_to_el1(0xF << 25);
        assert_eq!((v >> 43) & 0xF, 0xF);

        // DS (32) -> (59).
        let v = tcr_el2_to_el1(1u64 << 32);
        assert_ne!(v & (1 << 59), 0);
    }

    #[test]
    fn vcpus_accumulate() {
        let vm = VmCtx::new();
        vm.add_vcpu(0);
        vm.add_vcpu(0x100);
        assert_eq!(vm.vcpu_count(), 2);
    }
}

//! Per-CPU data, anchored in `TPIDR_EL2`.
//!
//! Each physical CPU owns one `PerCpu` block for its whole lifetime:
//! `TPIDR_EL2` is programmed once at bring-up and `current_cpu()` reads it
//! back. Fields touched from trap context and from the thread running on
//! that CPU are implicitly serialized (the hypervisor never preempts
//! itself); anything a remote CPU may poke is atomic.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

/// Virtual-interrupt slot bookkeeping: list-register values waiting for an
/// empty hardware slot. A bounded pool that overflows dynamically; the
/// initial capacity is reserved at vGIC bring-up.
pub struct LrQueues {
    pub pending: VecDeque<u64>,
}

pub struct PerCpu {
    /// Sequential-ish CPU number packed from MPIDR affinity fields.
    cpunum: AtomicU64,
    /// Trap frame saved by the exception entry path. Only valid while a
    /// trap is being processed on this CPU.
    saved_frame: AtomicUsize,
    /// Armed by hypervisor code about to probe possibly-unmapped memory.
    pub try_recovery: AtomicBool,
    /// Set by the dispatcher when a same-EL data abort hit while armed.
    pub error_on_recovery: AtomicBool,
    /// Number of usable ICH list registers, read once at vGIC setup.
    pub max_lr_slot: AtomicU32,
    /// Virtual-interrupt slot lists, touched only from this CPU.
    pub lr: Mutex<LrQueues>,
    /// Current VCPU (an index into the VM's VCPU table), !0 when none.
    pub current_vcpu: AtomicUsize,
}

impl PerCpu {
    const fn new() -> Self {
        PerCpu {
            cpunum: AtomicU64::new(0),
            saved_frame: AtomicUsize::new(0),
            try_recovery: AtomicBool::new(false),
            error_on_recovery: AtomicBool::new(false),
            max_lr_slot: AtomicU32::new(0),
            lr: Mutex::new(LrQueues {
                pending: VecDeque::new(),
            }),
            current_vcpu: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn cpunum(&self) -> u64 {
        self.cpunum.load(Ordering::Relaxed)
    }

    pub fn set_saved_frame(&self, frame: *mut crate::hypervisor::trap::TrapFrame) {
        self.saved_frame.store(frame as usize, Ordering::Relaxed);
    }

    pub fn saved_frame(&self) -> *mut crate::hypervisor::trap::TrapFrame {
        self.saved_frame.load(Ordering::Relaxed) as *mut _
    }
}

/// The boot CPU's block lives in the image so it is usable before the heap.
static PCPU_BOOT: PerCpu = PerCpu::new();

static BOOT_CPU_READY: AtomicBool = AtomicBool::new(false);

#[cfg(target_arch = "aarch64")]
fn tpidr_el2() -> u64 {
    let v: u64;
    unsafe {
        core::arch::asm!("mrs {v}, tpidr_el2", v = out(reg) v, options(nomem, nostack));
    }
    v
}

#[cfg(target_arch = "aarch64")]
fn set_tpidr_el2(v: u64) {
    unsafe {
        core::arch::asm!("msr tpidr_el2, {v}", "isb", v = in(reg) v, options(nomem, nostack));
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn tpidr_el2() -> u64 {
    &PCPU_BOOT as *const PerCpu as u64
}

#[cfg(not(target_arch = "aarch64"))]
fn set_tpidr_el2(_v: u64) {}

/// MPIDR affinity fields packed into a flat CPU number.
fn mpidr_to_cpunum() -> u64 {
    let mpidr = mpidr();
    let aff0 = mpidr & 0xFF;
    let aff1 = (mpidr >> 8) & 0xFF;
    let aff2 = (mpidr >> 16) & 0xFF;
    let aff3 = (mpidr >> 32) & 0xFF;
    aff0 | (aff1 << 8) | (aff2 << 16) | (aff3 << 24)
}

#[cfg(target_arch = "aarch64")]
pub fn mpidr() -> u64 {
    let v: u64;
    unsafe {
        core::arch::asm!("mrs {v}, mpidr_el1", v = out(reg) v, options(nomem, nostack));
    }
    v
}

#[cfg(not(target_arch = "aarch64"))]
pub fn mpidr() -> u64 {
    0
}

fn install(p: &'static PerCpu) {
    p.cpunum.store(mpidr_to_cpunum(), Ordering::Relaxed);
    set_tpidr_el2(p as *const PerCpu as u64);
}

/// Boot CPU bring-up. No allocation: the heap may be young.
pub fn init_bsp() {
    install(&PCPU_BOOT);
    BOOT_CPU_READY.store(true, Ordering::Release);
}

/// Secondary CPU bring-up at PSCI CPU_ON. The block lives forever.
pub fn init_secondary() {
    if tpidr_el2() != 0 && cfg!(target_arch = "aarch64") {
        log_warn!("secondary per-CPU block already installed");
        return;
    }
    let p: &'static PerCpu = Box::leak(Box::new(PerCpu::new()));
    install(p);
}

/// Stable reference to this CPU's block.
pub fn current_cpu() -> &'static PerCpu {
    let raw = tpidr_el2();
    if raw == 0 {
        // Early boot, before init_bsp. The boot block is the only choice.
        return &PCPU_BOOT;
    }
    unsafe { &*(raw as *const PerCpu) }
}

/// CPU number for log tags; 0 before per-CPU data exists.
pub fn current_cpu_id_or_boot() -> u64 {
    if !BOOT_CPU_READY.load(Ordering::Acquire) {
        return 0;
    }
    current_cpu().cpunum()
}

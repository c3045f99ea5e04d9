//! The AArch64 virtualization core.
//!
//! Leaves first: the page-table engine (`mmu`) and window mapper
//! (`mapper`) underpin the MMIO registry (`mmio`) and the load/store
//! emulator (`emulator`); the trap dispatcher (`trap`) ties those to the
//! system-register (`sysreg`) and SMC (`smc`) interposers; the virtual GIC
//! (`vgic`, `its`) owns interrupt routing; and the VM container (`vm`)
//! performs the EL2→EL1 handoff.

pub mod debug;
pub mod emulator;
pub mod gmm;
pub mod its;
pub mod mapper;
pub mod mmio;
pub mod mmu;
pub mod smc;
pub mod sysreg;
pub mod trap;
pub mod vgic;
pub mod vm;
pub mod vmmcall;

use bitflags::bitflags;

bitflags! {
    /// Attribute/permission flags shared by the mapper, the MMIO registry
    /// and the emulator. The memory-type flags select one MAIR index each;
    /// handing in a contradictory combination is the caller's bug.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Permit modification through the mapping.
        const WRITE = 1 << 0;
        /// Return failure instead of panicking.
        const CANFAIL = 1 << 1;
        /// Executable stage-1 mapping.
        const EXE = 1 << 2;
        /// Device-nGnRnE.
        const UC = 1 << 3;
        /// Write-through normal memory.
        const WT = 1 << 4;
        /// Write-combine normal memory.
        const WC = 1 << 5;
        /// Device-nGnRE.
        const NGNRE = 1 << 6;
        /// Tagged normal memory.
        const TAG = 1 << 7;
        /// Override shareability to outer.
        const PLAT_OS = 1 << 8;
        /// Override shareability to non-shareable.
        const PLAT_NS = 1 << 9;
    }
}

/// HCR_EL2 bits the core programs.
pub mod hcr {
    /// Stage-2 translation for EL1&0.
    pub const VM: u64 = 1 << 0;
    /// Route physical FIQ to EL2.
    pub const FMO: u64 = 1 << 3;
    /// Route physical IRQ to EL2.
    pub const IMO: u64 = 1 << 4;
    /// Trap SMC to EL2.
    pub const TSC: u64 = 1 << 19;
    /// Trap EL1 reads of the ID register group 3.
    pub const TID3: u64 = 1 << 18;
    /// Route EL0 exceptions to EL2 (set while an in-VMM process runs).
    pub const TGE: u64 = 1 << 27;
    /// EL1 executes AArch64.
    pub const RW: u64 = 1 << 31;
    /// EL2 host (VHE).
    pub const E2H: u64 = 1 << 34;
    /// Don't trap pointer-authentication key registers.
    pub const APK: u64 = 1 << 40;
    /// Don't trap pointer-authentication instructions.
    pub const API: u64 = 1 << 41;
}

/// Data synchronization barrier, inner shareable.
#[inline]
pub fn dsb_ish() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("dsb ish", options(nostack));
    }
}

/// Data synchronization barrier, full system.
#[inline]
pub fn dsb_sy() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("dsb sy", options(nostack));
    }
}

/// Instruction synchronization barrier.
#[inline]
pub fn isb() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("isb", options(nostack));
    }
}

/// Read a system register by name; returns 0 on non-AArch64 hosts.
#[macro_export]
macro_rules! read_sysreg {
    ($reg:literal) => {{
        #[cfg(target_arch = "aarch64")]
        let val: u64 = unsafe {
            let v: u64;
            core::arch::asm!(concat!("mrs {v}, ", $reg), v = out(reg) v, options(nomem, nostack));
            v
        };
        #[cfg(not(target_arch = "aarch64"))]
        let val: u64 = 0;
        val
    }};
}

/// Write a system register by name; no-op on non-AArch64 hosts.
#[macro_export]
macro_rules! write_sysreg {
    ($reg:literal, $val:expr) => {{
        let _v: u64 = $val;
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!(concat!("msr ", $reg, ", {v}"), v = in(reg) _v, options(nomem, nostack));
        }
    }};
}

//! VeilHV — a thin type-1 hypervisor core for AArch64 (EL2 + VHE)
//!
//! VeilHV runs a single guest OS at EL1 and passes most hardware straight
//! through. It interposes on a narrow set of architectural events only:
//!
//! ```text
//!   EL3  ━━  firmware / secure monitor (untouched, SMC forwarded)
//!   EL2  ━━  VeilHV ← WE ARE HERE
//!              ├── stage-1/stage-2 page tables (identity + trap holes)
//!              ├── trap dispatcher (WFx, SVC, HVC, SMC, MSR/MRS, aborts)
//!              ├── MMIO interposition registry + load/store emulator
//!              ├── vGIC list registers + ITS command-queue shadow
//!              └── ACPI/FDT bridge (GIC + PCIe ECAM discovery)
//!   EL1  ━━  guest OS — thinks it is running alone
//!   EL0  ━━  guest apps
//! ```
//!
//! Boot flow: firmware loads us at EL2, `kmain` brings up the heap, the
//! MMU, the MMIO registry and the GIC from firmware tables, then `vm_start`
//! drops into the guest at the firmware return point via ERET.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

extern crate alloc;

#[macro_use]
mod logger;
mod serial;

mod memory;
mod sync;

mod acpi;
mod dtb;
mod hypervisor;
mod pci;

#[cfg(target_os = "none")]
mod boot {
    //! Limine boot protocol requests.
    //!
    //! The firmware boot shim hands us the higher-half direct map offset,
    //! the physical memory map and pointers to the firmware tables. Nothing
    //! else of the protocol is used.

    use limine::request::{
        DeviceTreeBlobRequest, HhdmRequest, KernelAddressRequest, MemoryMapRequest, RsdpRequest,
    };
    use limine::BaseRevision;

    #[used]
    pub static BASE_REVISION: BaseRevision = BaseRevision::new();

    #[used]
    pub static HHDM: HhdmRequest = HhdmRequest::new();

    #[used]
    pub static MEMORY_MAP: MemoryMapRequest = MemoryMapRequest::new();

    #[used]
    pub static RSDP: RsdpRequest = RsdpRequest::new();

    #[used]
    pub static DTB: DeviceTreeBlobRequest = DeviceTreeBlobRequest::new();

    #[used]
    pub static KERNEL_ADDRESS: KernelAddressRequest = KernelAddressRequest::new();
}

/// Bring the hypervisor up on the boot CPU, then enter the guest.
#[cfg(target_os = "none")]
#[no_mangle]
extern "C" fn kmain() -> ! {
    // The firmware's register state is the guest's initial state; grab it
    // before anything below clobbers it.
    #[cfg(target_arch = "aarch64")]
    {
        let (lr, sp): (u64, u64);
        unsafe {
            core::arch::asm!("mov {l}, x30", "mov {s}, sp", l = out(reg) lr, s = out(reg) sp);
        }
        hypervisor::vm::capture_boot_ctx(lr, sp);
    }

    serial::init();
    log!("VeilHV starting on BSP");

    let hhdm = boot::HHDM
        .get_response()
        .map(|r| r.offset())
        .unwrap_or(0);
    memory::init(hhdm, boot::MEMORY_MAP.get_response());

    sync::percpu::init_bsp();
    hypervisor::trap::init();
    hypervisor::mmu::init();
    hypervisor::mmu::init_vmm_space(
        boot::MEMORY_MAP.get_response(),
        boot::KERNEL_ADDRESS.get_response(),
    );
    hypervisor::mapper::init();
    hypervisor::mmu::init_stage2();
    hypervisor::mmio::init();

    // Firmware table discovery: ACPI when present, device tree otherwise.
    let rsdp = boot::RSDP.get_response().map(|r| r.address() as u64);
    let dtb = boot::DTB.get_response().map(|r| r.dtb_ptr() as u64);
    match (rsdp, dtb) {
        (Some(rsdp), _) => {
            acpi::init(rsdp);
            hypervisor::vgic::init_from_acpi();
        }
        (None, Some(fdt)) => {
            dtb::init(fdt);
            hypervisor::vgic::init_from_dtb();
        }
        (None, None) => panic!("no ACPI RSDP and no device tree from firmware"),
    }
    pci::init();

    hypervisor::vgic::init_pcpu_lr_pool();
    hypervisor::vm::vm_start()
}

/// Entry for a secondary CPU brought online via the trapped PSCI CPU_ON.
/// Reached from the assembly stub with the entry-data block prepared by the
/// SMC interposer.
#[cfg(target_os = "none")]
#[no_mangle]
extern "C" fn kmain_secondary(entry_data: *const hypervisor::smc::EntryData) -> ! {
    sync::percpu::init_secondary();
    hypervisor::trap::init_secondary();
    hypervisor::mmu::init_stage2_secondary();

    let e = unsafe { &*entry_data };
    log!("secondary CPU 0x{:x} under hypervisor control", e.g_mpidr);
    let vm = unsafe { &*e.vm };
    hypervisor::vm::vm_start_at(vm, e.g_mpidr, e.g_entry, e.g_ctx_id)
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    hypervisor::vgic::intr_off();
    log_error!("PANIC: {}", info);
    loop {
        core::hint::spin_loop();
    }
}

// Hosted builds (unit tests) get an ordinary main.
#[cfg(not(target_os = "none"))]
fn main() {}

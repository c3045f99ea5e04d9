//! Virtual GIC CPU interface.
//!
//! The physical GIC stays under firmware ownership; the hypervisor routes
//! physical interrupts to itself (`HCR.IMO/FMO`), acknowledges them at
//! EL1, and reflects pass-through device interrupts back into the guest
//! through the ICH list registers:
//!
//! 1. physical IRQ/FIQ fires, trapped to EL2
//! 2. read IAR (group 1 for IRQ, group 0 for FIQ), read the running
//!    priority
//! 3. ask the pass-through driver whether the INTID belongs to it
//! 4. priority-drop via EOIR
//! 5. claimed interrupts become a pending list-register entry
//!    `{vINTID = pINTID, priority, group, HW}`; everything else is
//!    deactivated immediately
//!
//! List-register pressure queues values on the per-CPU pending list; a
//! drain into empty slots (per `ELRSR`) runs after every injection and
//! every EOI.
//!
//! The maintenance interrupt (INTID 25) is recognized but its events are
//! an explicitly unimplemented feature: the handler logs and deactivates.

use super::trap::{HandleReturn, TrapFrame};
use super::{its, mapper, trap, MapFlags};
use crate::sync::percpu::current_cpu;
use core::sync::atomic::Ordering;
use spin::{Mutex, Once};

pub const INTID_MAINTENANCE: u32 = 25;
const INTID_SPECIAL_START: u32 = 1020;
const INTID_SPECIAL_END: u32 = 1024;

/// First LPI INTID.
pub const LPI_START: u32 = 8192;

const ICC_IAR_MASK: u64 = 0xFF_FFFF;
const ICC_RPR_MASK: u64 = 0xFF;

const ICC_CTLR_EOIMODE: u64 = 1 << 1;
const ICC_SRE_SYSREG_IF_EN: u64 = 1 << 0;

/// ICH_LR<n>_EL2 field builders.
pub mod lr {
    pub const STATE_INACTIVE: u64 = 0;
    pub const STATE_PENDING: u64 = 1;
    pub const STATE_ACTIVE: u64 = 2;

    pub const HW: u64 = 1 << 61;

    pub const fn vintid(v: u64) -> u64 {
        v & 0xFFFF_FFFF
    }
    pub const fn pintid(v: u64) -> u64 {
        (v & 0x1FFF) << 32
    }
    pub const fn priority(v: u64) -> u64 {
        (v & 0xFF) << 48
    }
    pub const fn group(v: u64) -> u64 {
        (v & 0x1) << 60
    }
    pub const fn state(v: u64) -> u64 {
        (v & 0x3) << 62
    }

    pub fn get_state(val: u64) -> u64 {
        (val >> 62) & 0x3
    }

    /// A hardware-linked pending interrupt.
    pub fn build(intid: u32, prio: u64, grp: u64) -> u64 {
        vintid(intid as u64)
            | pintid(intid as u64)
            | priority(prio)
            | group(grp)
            | HW
            | state(STATE_PENDING)
    }
}

mod ich_hcr {
    pub const EN: u64 = 1 << 0;
}

mod ich_vmcr {
    pub const VENG0: u64 = 1 << 0;
    pub const VENG1: u64 = 1 << 1;
    pub const VFIQEN: u64 = 1 << 3;
    pub const VCBPR: u64 = 1 << 4;
    pub const VEOIM: u64 = 1 << 9;

    pub const fn vbpr1(v: u64) -> u64 {
        (v & 0x7) << 18
    }
    pub const fn vbpr0(v: u64) -> u64 {
        (v & 0x7) << 21
    }
    pub const fn vpmr(v: u64) -> u64 {
        (v & 0xFF) << 24
    }
}

/// GICD geometry discovered at boot.
pub struct GicdHost {
    pub base_phys: u64,
    pub nids: u32,
    pub n_lpis: u32,
}

static GICD: Once<GicdHost> = Once::new();

/// ICC snapshot the boot CPU takes; secondaries replay it.
#[derive(Default, Clone, Copy)]
struct InitIcc {
    icc_bpr0: u64,
    icc_bpr1: u64,
    icc_ctlr: u64,
    icc_pmr: u64,
    icc_sre_el2: u64,
    ich_hcr: u64,
    ich_vmcr: u64,
}

lazy_static::lazy_static! {
    static ref INIT_ICC: Mutex<InitIcc> = Mutex::new(InitIcc::default());
}

/// Pass-through driver callback: non-negative return claims the INTID.
pub type IntrCallFn = fn(intid: u32) -> i32;

fn intr_call_none(_intid: u32) -> i32 {
    -1
}

static INTR_CALL: Mutex<IntrCallFn> = Mutex::new(intr_call_none);

/// Register the pass-through driver's interrupt filter.
pub fn set_intr_hook(f: IntrCallFn) {
    *INTR_CALL.lock() = f;
}

fn intr_call(intid: u32) -> i32 {
    let f = *INTR_CALL.lock();
    f(intid)
}

// ── List register access ────────────────────────────────────────────────

#[cfg(not(target_arch = "aarch64"))]
pub(crate) static MOCK_LRS: Mutex<[u64; 16]> = Mutex::new([0; 16]);

#[cfg(target_arch = "aarch64")]
fn set_lr(idx: u32, val: u64) {
    match idx {
        0 => crate::write_sysreg!("ich_lr0_el2", val),
        1 => crate::write_sysreg!("ich_lr1_el2", val),
        2 => crate::write_sysreg!("ich_lr2_el2", val),
        3 => crate::write_sysreg!("ich_lr3_el2", val),
        4 => crate::write_sysreg!("ich_lr4_el2", val),
        5 => crate::write_sysreg!("ich_lr5_el2", val),
        6 => crate::write_sysreg!("ich_lr6_el2", val),
        7 => crate::write_sysreg!("ich_lr7_el2", val),
        8 => crate::write_sysreg!("ich_lr8_el2", val),
        9 => crate::write_sysreg!("ich_lr9_el2", val),
        10 => crate::write_sysreg!("ich_lr10_el2", val),
        11 => crate::write_sysreg!("ich_lr11_el2", val),
        12 => crate::write_sysreg!("ich_lr12_el2", val),
        13 => crate::write_sysreg!("ich_lr13_el2", val),
        14 => crate::write_sysreg!("ich_lr14_el2", val),
        15 => crate::write_sysreg!("ich_lr15_el2", val),
        _ => panic!("list register index {} out of bounds", idx),
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn set_lr(idx: u32, val: u64) {
    MOCK_LRS.lock()[idx as usize] = val;
}

#[cfg(target_arch = "aarch64")]
fn read_elrsr() -> u64 {
    crate::read_sysreg!("ich_elrsr_el2")
}

#[cfg(not(target_arch = "aarch64"))]
fn read_elrsr() -> u64 {
    let lrs = MOCK_LRS.lock();
    let mut v = 0u64;
    for (i, l) in lrs.iter().enumerate() {
        if lr::get_state(*l) == lr::STATE_INACTIVE {
            v |= 1 << i;
        }
    }
    v
}

/// Move queued list-register values into empty hardware slots.
fn drain_pending_to_slots() {
    let cpu = current_cpu();
    let max = cpu.max_lr_slot.load(Ordering::Relaxed);
    let mut queue = cpu.lr.lock();
    let mut elrsr = read_elrsr();
    for i in 0..max {
        if elrsr == 0 || queue.pending.is_empty() {
            break;
        }
        if elrsr & 1 != 0 {
            if let Some(val) = queue.pending.pop_front() {
                set_lr(i, val);
            }
        }
        elrsr >>= 1;
    }
}

/// Queue a virtual interrupt and push it into a slot if one is empty.
fn try_inject_vint(intid: u32, rpr: u64, group: u64) {
    let val = lr::build(intid, rpr, group);
    current_cpu().lr.lock().pending.push_back(val);
    drain_pending_to_slots();
}

fn handle_maintenance(_intid: u32) {
    // Underflow and group-enable maintenance events are not implemented;
    // the interrupt is acknowledged and deactivated only.
    log_warn!("maintenance interrupt: events unimplemented");
}

fn deactivate(intid: u32) {
    crate::write_sysreg!("icc_dir_el1", intid as u64);
}

fn handle_phys_intr(group: u64) -> HandleReturn {
    // Acknowledge at EL1.
    let intid = (if group == 1 {
        crate::read_sysreg!("icc_iar1_el1")
    } else {
        crate::read_sysreg!("icc_iar0_el1")
    } & ICC_IAR_MASK) as u32;
    let rpr = crate::read_sysreg!("icc_rpr_el1") & ICC_RPR_MASK;

    if (INTID_SPECIAL_START..=INTID_SPECIAL_END).contains(&intid) {
        return HandleReturn::Ok;
    }

    let num = intr_call(intid);

    // Priority drop; EOImode is configured so deactivation is separate.
    if group == 1 {
        crate::write_sysreg!("icc_eoir1_el1", intid as u64);
    } else {
        crate::write_sysreg!("icc_eoir0_el1", intid as u64);
    }
    super::isb();

    if intid == INTID_MAINTENANCE {
        handle_maintenance(intid);
        deactivate(intid);
    } else if num != -1 {
        try_inject_vint(intid, rpr, group);
    } else {
        deactivate(intid);
    }

    // EOI may have freed a slot for an earlier queued interrupt.
    drain_pending_to_slots();

    HandleReturn::Ok
}

fn gic_handle_irq(_r: &mut TrapFrame) -> HandleReturn {
    handle_phys_intr(1)
}

fn gic_handle_fiq(_r: &mut TrapFrame) -> HandleReturn {
    handle_phys_intr(0)
}

/// Bring up the virtual CPU interface on the calling CPU. The firmware
/// state of the physical GIC is preserved; the boot CPU copies its ICC
/// state into the virtual interface and stashes the snapshot for the
/// secondaries.
pub fn setup_virtual_gic() {
    let cpu = current_cpu();

    let mut slots = (crate::read_sysreg!("ich_vtr_el2") & 0x1F) + 1;
    if cfg!(not(target_arch = "aarch64")) {
        slots = 4; // hosted stand-in
    }
    assert!(slots <= 16);
    cpu.max_lr_slot.store(slots as u32, Ordering::Relaxed);
    cpu.lr.lock().pending.reserve(16);

    // LR values are unknown on warm reset; park every slot as inactive.
    for i in 0..slots as u32 {
        set_lr(i, 0);
    }

    if cpu.cpunum() == 0 {
        let mut vmcr = 0u64;
        vmcr |= ich_vmcr::vpmr(crate::read_sysreg!("icc_pmr_el1"));
        vmcr |= ich_vmcr::vbpr0(crate::read_sysreg!("icc_bpr0_el1"));
        vmcr |= ich_vmcr::vbpr1(crate::read_sysreg!("icc_bpr1_el1"));
        let ctlr = crate::read_sysreg!("icc_ctlr_el1");
        if ctlr & ICC_CTLR_EOIMODE != 0 {
            vmcr |= ich_vmcr::VEOIM;
        }
        if ctlr & 0x1 != 0 {
            vmcr |= ich_vmcr::VCBPR;
        }
        vmcr |= ich_vmcr::VFIQEN;
        if crate::read_sysreg!("icc_igrpen1_el1") & 1 != 0 {
            vmcr |= ich_vmcr::VENG1;
        }
        if crate::read_sysreg!("icc_igrpen0_el1") & 1 != 0 {
            vmcr |= ich_vmcr::VENG0;
        }

        crate::write_sysreg!("ich_hcr_el2", ich_hcr::EN);
        crate::write_sysreg!("ich_vmcr_el2", vmcr);
        // Writes to EOIR become priority-drop only; DIR deactivates.
        crate::write_sysreg!(
            "icc_ctlr_el1",
            crate::read_sysreg!("icc_ctlr_el1") | ICC_CTLR_EOIMODE
        );
        crate::write_sysreg!("icc_igrpen0_el1", 0x1);
        crate::write_sysreg!("icc_igrpen1_el1", 0x1);
        // The legacy memory-mapped interface is not supported.
        crate::write_sysreg!(
            "icc_sre_el2",
            crate::read_sysreg!("icc_sre_el2") | ICC_SRE_SYSREG_IF_EN
        );

        let mut ii = INIT_ICC.lock();
        ii.icc_bpr0 = crate::read_sysreg!("icc_bpr0_el1");
        ii.icc_bpr1 = crate::read_sysreg!("icc_bpr1_el1");
        ii.icc_ctlr = crate::read_sysreg!("icc_ctlr_el1");
        ii.icc_pmr = crate::read_sysreg!("icc_pmr_el1");
        ii.icc_sre_el2 = crate::read_sysreg!("icc_sre_el2");
        ii.ich_hcr = crate::read_sysreg!("ich_hcr_el2");
        ii.ich_vmcr = crate::read_sysreg!("ich_vmcr_el2");
        drop(ii);

        trap::set_exception_handler(Some(gic_handle_irq), Some(gic_handle_fiq));
    } else {
        let ii = *INIT_ICC.lock();
        crate::write_sysreg!("icc_bpr0_el1", ii.icc_bpr0);
        crate::write_sysreg!("icc_bpr1_el1", ii.icc_bpr1);
        crate::write_sysreg!("icc_ctlr_el1", ii.icc_ctlr);
        crate::write_sysreg!("icc_pmr_el1", ii.icc_pmr);
        crate::write_sysreg!("icc_sre_el2", ii.icc_sre_el2);
        crate::write_sysreg!("ich_hcr_el2", ii.ich_hcr);
        crate::write_sysreg!("ich_vmcr_el2", ii.ich_vmcr);
        crate::write_sysreg!("icc_igrpen0_el1", 0x1);
        crate::write_sysreg!("icc_igrpen1_el1", 0x1);
    }
}

/// Reserve the per-CPU pending pool (boot-time, before interrupts).
pub fn init_pcpu_lr_pool() {
    current_cpu().lr.lock().pending.reserve(16);
}

/// Turn both interrupt groups off; used on the panic path.
pub fn intr_off() {
    crate::write_sysreg!("icc_igrpen0_el1", 0x0);
    crate::write_sysreg!("icc_igrpen1_el1", 0x0);
}

// ── Distributor discovery ───────────────────────────────────────────────

const GICD_TYPER: u64 = 0x4;
const GICD_TYPER_LPIS: u32 = 1 << 17;

/// `GICD_TYPER` → (total INTIDs, number of LPIs).
pub fn decode_gicd_typer(v: u32) -> Option<(u32, u32)> {
    if v & GICD_TYPER_LPIS == 0 {
        return None;
    }
    let id_bits = ((v >> 19) & 0x1F) + 1;
    let lpi_bits = ((v >> 11) & 0x1F) + 1;
    let nids = 1u32.checked_shl(id_bits).unwrap_or(u32::MAX);
    // A raw LPI field of zero means "derive from IDbits".
    let n_lpis = if lpi_bits == 1 {
        nids - LPI_START
    } else {
        1u32.checked_shl(lpi_bits).unwrap_or(u32::MAX)
    };
    Some((nids, n_lpis))
}

fn gicd_init(base_phys: u64) {
    assert!(base_phys != 0);
    let p = mapper::mapmem_hphys(base_phys + GICD_TYPER, 4, MapFlags::UC)
        .expect("GICD window");
    let typer = unsafe { (p as *const u32).read_volatile() };
    mapper::unmapmem(p, 4);

    let (nids, n_lpis) = match decode_gicd_typer(typer) {
        Some(v) => v,
        None => panic!("GICD at 0x{:x} does not support LPIs", base_phys),
    };

    log!("GICD at 0x{:x}: {} INTIDs, {} LPIs", base_phys, nids, n_lpis);
    GICD.call_once(|| GicdHost {
        base_phys,
        nids,
        n_lpis,
    });
}

pub fn gicd() -> &'static GicdHost {
    GICD.get().expect("GICD not discovered")
}

/// Discover the GIC from the ACPI MADT: first the distributor (geometry),
/// then the ITS.
pub fn init_from_acpi() {
    let madt = crate::acpi::madt_info();
    gicd_init(madt.gicd_base);
    let its_base = madt
        .its_base
        .unwrap_or_else(|| panic!("MADT carries no GIC-ITS entry"));
    its::init(its_base);
}

/// Discover the GIC from the device tree.
pub fn init_from_dtb() {
    let (gicd_base, its_base) = crate::dtb::gic_info().expect("device tree has no GICv3 node");
    gicd_init(gicd_base);
    let its_base = its_base.unwrap_or_else(|| panic!("device tree has no GIC ITS node"));
    its::init(its_base);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_mock() {
        *MOCK_LRS.lock() = [0; 16];
        let cpu = current_cpu();
        cpu.max_lr_slot.store(4, Ordering::Relaxed);
        cpu.lr.lock().pending.clear();
    }

    // The mock LR bank and the per-CPU queue are shared state; serialize.
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn lr_build_fields() {
        let v = lr::build(0x2040, 0xA0, 1);
        assert_eq!(v & 0xFFFF_FFFF, 0x2040);
        assert_eq!((v >> 32) & 0x1FFF, 0x2040);
        assert_eq!((v >> 48) & 0xFF, 0xA0);
        assert_eq!((v >> 60) & 1, 1);
        assert_ne!(v & lr::HW, 0);
        assert_eq!(lr::get_state(v), lr::STATE_PENDING);
    }

    #[test]
    fn inject_lands_in_first_empty_slot() {
        let _g = LOCK.lock().unwrap();
        reset_mock();
        try_inject_vint(40, 0xA0, 1);
        let lrs = MOCK_LRS.lock();
        assert_eq!(lrs[0], lr::build(40, 0xA0, 1));
        assert_eq!(lrs[1], 0);
    }

    #[test]
    fn inject_queues_when_slots_are_busy() {
        let _g = LOCK.lock().unwrap();
        reset_mock();
        // Fill every usable slot with an active interrupt.
        {
            let mut lrs = MOCK_LRS.lock();
            for i in 0..4 {
                lrs[i] = lr::state(lr::STATE_ACTIVE) | (100 + i as u64);
            }
        }
        try_inject_vint(50, 0x80, 1);
        assert_eq!(current_cpu().lr.lock().pending.len(), 1);

        // Slot 2 drains; the queued value moves in.
        MOCK_LRS.lock()[2] = 0;
        drain_pending_to_slots();
        assert_eq!(MOCK_LRS.lock()[2], lr::build(50, 0x80, 1));
        assert!(current_cpu().lr.lock().pending.is_empty());
    }

    #[test]
    fn typer_decode() {
        // IDbits raw 15 → 16 bits → 65536 INTIDs; LPI field raw 0 →
        // derived from IDbits.
        let typer = (15 << 19) | GICD_TYPER_LPIS;
        let (nids, n_lpis) = decode_gicd_typer(typer).unwrap();
        assert_eq!(nids, 65536);
        assert_eq!(n_lpis, 65536 - LPI_START);

        // Explicit LPI bits.
        let typer = (15 << 19) | (13 << 11) | GICD_TYPER_LPIS;
        let (_, n_lpis) = decode_gicd_typer(typer).unwrap();
        assert_eq!(n_lpis, 1 << 14);

        // No LPI support.
        assert!(decode_gicd_typer(15 << 19).is_none());
    }
}

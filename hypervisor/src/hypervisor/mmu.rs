//! Stage-1 / stage-2 page-table engine.
//!
//! Two regimes share one walker:
//!
//! * **Stage-1** — the hypervisor's own virtual space (TTBR1_EL2) and the
//!   in-VMM process space (TTBR0_EL2). 48-bit VA, 4-level, 4KiB granule.
//! * **Stage-2** — guest IPA → host PA (VTTBR_EL2). Start level depends on
//!   the physical address size the CPU reports; a start level of 1 uses a
//!   concatenated root of up to 16 pages.
//!
//! The engine maps greedily with 2MiB blocks where alignment allows and
//! splits existing blocks into their constituent granules when a finer
//! mapping lands inside one. Every rewrite of a valid entry goes through
//! the break-before-make sequence: invalidate, TLBI by address (stage and
//! regime specific, inner shareable), `dsb ish`, write, `dsb ish` + `isb`.
//!
//! Intermediate tables the engine allocates carry a software PTE bit so
//! unmap can free exactly what was dynamically created and nothing else.

use super::MapFlags;
use crate::memory::{self, PAGE_MASK, PAGE_MASK_2M, PAGE_SIZE, PAGE_SIZE_1G, PAGE_SIZE_2M};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, Once};

/// Descriptor field encodings shared by both stages.
pub mod pte {
    pub const VALID: u64 = 1 << 0;
    /// Bit 1: 1 = table (levels 0-2) / page (level 3), 0 = block.
    pub const TYPE_TABLE: u64 = 1 << 1;
    pub const AF: u64 = 1 << 10;
    pub const NG: u64 = 1 << 11;
    pub const PXN: u64 = 1 << 53;
    pub const UXN: u64 = 1 << 54;
    /// Software bit: this entry points to a dynamically allocated table.
    pub const SW_DYN_ALLOC: u64 = 1 << 55;

    pub const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    // Stage-1 AP[2:1] values (bits 7:6).
    pub const AP_EL1RW_EL0N: u64 = 0 << 6;
    pub const AP_EL1RW_EL0RW: u64 = 1 << 6;
    pub const AP_EL1R_EL0N: u64 = 2 << 6;
    pub const AP_EL1R_EL0R: u64 = 3 << 6;

    // Shareability (bits 9:8).
    pub const SH_NONE: u64 = 0 << 8;
    pub const SH_OUTER: u64 = 2 << 8;
    pub const SH_INNER: u64 = 3 << 8;

    pub const fn mair_idx(i: u64) -> u64 {
        (i & 0x7) << 2
    }

    // Stage-1 permission bundles.
    pub const PERM_R: u64 = AP_EL1R_EL0N | UXN | PXN;
    pub const PERM_RW: u64 = AP_EL1RW_EL0N | UXN | PXN;
    pub const PERM_RX: u64 = AP_EL1R_EL0N | UXN;
    pub const PERM_RWX: u64 = AP_EL1RW_EL0N | UXN;

    pub const PERM_R_EL0: u64 = AP_EL1R_EL0R | UXN | PXN;
    pub const PERM_RW_EL0: u64 = AP_EL1RW_EL0RW | UXN | PXN;
    pub const PERM_RX_EL0: u64 = AP_EL1R_EL0R | PXN;
    pub const PERM_RWX_EL0: u64 = AP_EL1RW_EL0RW | PXN;

    // Stage-2 fields.
    pub const S2_XN: u64 = 1 << 54;
    pub const S2_PERM_R: u64 = (0x1 << 6) | S2_XN;
    pub const S2_PERM_W: u64 = (0x2 << 6) | S2_XN;
    pub const S2_PERM_RWX: u64 = 0x3 << 6;

    pub const fn s2_memattr(v: u64) -> u64 {
        (v & 0xF) << 2
    }
}

/// MAIR attribute bytes, in the index order the boot firmware uses.
pub mod mair {
    pub const UC: u64 = 0x00; // Device-nGnRnE
    pub const WC: u64 = 0x44; // Normal non-cacheable
    pub const WT: u64 = 0xBB; // Normal write-through
    pub const WB: u64 = 0xFF; // Normal write-back
    pub const NGNRE: u64 = 0x04; // Device-nGnRE
    pub const TAG: u64 = 0xF0; // Tagged normal

    pub const UC_IDX: u64 = 0;
    pub const WC_IDX: u64 = 1;
    pub const WT_IDX: u64 = 2;
    pub const WB_IDX: u64 = 3;
    pub const NGNRE_IDX: u64 = 4;
    pub const TAG_IDX: u64 = 5;

    /// The whole MAIR_EL2 value for the table above.
    pub const VALUE: u64 = UC
        | (WC << (WC_IDX * 8))
        | (WT << (WT_IDX * 8))
        | (WB << (WB_IDX * 8))
        | (NGNRE << (NGNRE_IDX * 8))
        | (TAG << (TAG_IDX * 8));
}

/// Stage-2 default leaf attributes: normal WB, inner shareable, RWX.
const PTE_S2_DEFAULT: u64 =
    pte::s2_memattr(0xF) | pte::SH_INNER | pte::AF | pte::S2_PERM_RWX;

const ENTRIES_PER_TABLE: u64 = 512;
const MAX_S2_ROOT_CONCAT: usize = 16;

/// TLBI operand: VA/IPA bits [55:12] in [43:0].
fn tlbi_addr(addr: u64) -> u64 {
    (addr >> 12) & ((1u64 << 44) - 1)
}

const fn l0_idx(va: u64) -> u64 {
    (va >> 39) & 0x1FF
}
const fn l1_idx(va: u64) -> u64 {
    (va >> 30) & 0x1FF
}
const fn l2_idx(va: u64) -> u64 {
    (va >> 21) & 0x1FF
}
const fn l3_idx(va: u64) -> u64 {
    (va >> 12) & 0x1FF
}

/// Which translation base register the descriptor feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// Stage-1 process space.
    Ttbr0,
    /// Stage-1 hypervisor space.
    Ttbr1,
    /// Stage-2 guest space.
    Vttbr,
}

struct PtRoot {
    /// Virtual pointer to the root table (1 page, or up to 16 concatenated
    /// pages for a stage-2 start level of 1).
    root: *mut u64,
}

// The raw pointer only ever refers to page-table frames owned by the
// descriptor; all access is serialized by the descriptor mutex.
unsafe impl Send for PtRoot {}

pub struct PtDesc {
    t: Table,
    asid: u64,
    start_level: u32,
    root_phys: u64,
    /// Pages in the root table (a concatenated stage-2 root spans more
    /// than one).
    root_pages: usize,
    inner: Mutex<PtRoot>,
}

unsafe impl Sync for PtDesc {}

/// Break-before-make TLB invalidations issued so far. Diagnostic, and the
/// unit tests use it to observe that rewrites really invalidate.
pub static TLB_MAINT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Cookie returned by `hook_ipa`.
pub struct IpaHook {
    addr: u64,
    size: u64,
}

static VMM_PT_S1: Once<PtDesc> = Once::new();
static VMM_PT_S2: Once<PtDesc> = Once::new();
static PROC_PT_NONE: Once<PtDesc> = Once::new();

static VTCR_HOST: AtomicU64 = AtomicU64::new(0);
static PHYS_BLANK: AtomicU64 = AtomicU64::new(0);

impl PtDesc {
    /// Fresh descriptor with an empty, newly allocated root.
    pub fn new(t: Table, asid: u64, start_level: u32) -> Self {
        let (virt, phys) = memory::alloc_page();
        PtDesc {
            t,
            asid,
            start_level,
            root_phys: phys,
            root_pages: 1,
            inner: Mutex::new(PtRoot {
                root: virt as *mut u64,
            }),
        }
    }

    /// Stage-2 descriptor whose root is `npages` concatenated tables.
    fn new_s2_concat(npages: usize) -> Self {
        assert!(npages <= MAX_S2_ROOT_CONCAT);
        let (virt, phys) = memory::alloc_aligned(npages * PAGE_SIZE, npages * PAGE_SIZE);
        PtDesc {
            t: Table::Vttbr,
            asid: 0,
            start_level: 1,
            root_phys: phys,
            root_pages: npages,
            inner: Mutex::new(PtRoot {
                root: virt as *mut u64,
            }),
        }
    }

    pub fn root_phys(&self) -> u64 {
        self.root_phys
    }

    pub fn asid(&self) -> u64 {
        self.asid
    }

    /// Break-before-make entry rewrite.
    fn update_pte(&self, p: *mut u64, va: u64, final_val: u64) {
        let old = unsafe { p.read_volatile() };
        if old & pte::VALID == 0 {
            // Invalid entries are never cached; plain write suffices.
            unsafe { p.write_volatile(final_val) };
        } else {
            let exec = (self.t != Table::Vttbr) && (old & (pte::PXN | pte::UXN)) != (pte::PXN | pte::UXN);
            unsafe { p.write_volatile(0) };
            super::dsb_ish();
            self.tlbi_va(va);
            super::dsb_ish();
            if exec {
                // Executable mapping changed; scrub the branch predictor.
                #[cfg(target_arch = "aarch64")]
                unsafe {
                    core::arch::asm!("ic ialluis", options(nostack));
                }
            }
            TLB_MAINT_COUNT.fetch_add(1, Ordering::Relaxed);
            unsafe { p.write_volatile(final_val) };
        }
        super::dsb_ish();
        super::isb();
    }

    #[allow(unused_variables)]
    fn tlbi_va(&self, va: u64) {
        #[cfg(target_arch = "aarch64")]
        {
            let arg = tlbi_addr(va) | (self.asid << 48);
            unsafe {
                match self.t {
                    Table::Vttbr => {
                        core::arch::asm!("tlbi ipas2e1is, {a}", a = in(reg) arg, options(nostack))
                    }
                    _ => core::arch::asm!("tlbi vae2is, {a}", a = in(reg) arg, options(nostack)),
                }
            }
        }
    }

    fn table_ptr(pte_val: u64) -> *mut u64 {
        memory::phys_to_virt(pte_val & pte::ADDR_MASK) as *mut u64
    }

    fn pte_is(pte_val: u64, table: bool) -> bool {
        pte_val & pte::VALID != 0 && ((pte_val & pte::TYPE_TABLE != 0) == table)
    }

    /// Walk down to the table covering `from` at `level`, creating (and
    /// when necessary splitting) along the way. Caller holds the lock.
    fn get_or_create_table(&self, root: *mut u64, from: u64, level: u32) -> *mut u64 {
        let upper_idx;
        match level {
            0 => return root,
            1 => {
                if self.t == Table::Vttbr && self.start_level == 1 {
                    return root;
                }
                upper_idx = l0_idx(from);
            }
            2 => {
                if self.t == Table::Vttbr && self.start_level == 1 {
                    upper_idx = l1_idx(from) + l0_idx(from) * ENTRIES_PER_TABLE;
                } else {
                    upper_idx = l1_idx(from);
                }
            }
            3 => upper_idx = l2_idx(from),
            _ => panic!("invalid page-table level {}", level),
        }

        let upper = if level == 2 && self.t == Table::Vttbr && self.start_level == 1 {
            root
        } else {
            self.get_or_create_table(root, from, level - 1)
        };
        let slot = unsafe { upper.add(upper_idx as usize) };
        let old = unsafe { slot.read_volatile() };
        if Self::pte_is(old, true) {
            return Self::table_ptr(old);
        }

        // Empty or block entry: a new table is needed.
        let (tvirt, tphys) = memory::alloc_page();
        let table = tvirt as *mut u64;
        let new_pte = tphys | pte::VALID | pte::TYPE_TABLE | pte::SW_DYN_ALLOC;

        if Self::pte_is(old, false) {
            // A valid block covers this range. Reconstruct it at the finer
            // granularity so the rest of the block survives the split. All
            // 512 entries must exist before the upper entry is demoted.
            let orig_addr = old & pte::ADDR_MASK;
            let orig_flags = old & !pte::ADDR_MASK;
            let (step, leaf_type) = match level {
                1 => (PAGE_SIZE_1G, 0),
                2 => (PAGE_SIZE_2M, 0),
                3 => (PAGE_SIZE as u64, pte::TYPE_TABLE),
                _ => panic!("invalid level {} for block split", level),
            };
            for i in 0..ENTRIES_PER_TABLE {
                let v = (orig_addr + step * i) | (orig_flags & !0x3) | pte::VALID | leaf_type;
                unsafe { table.add(i as usize).write_volatile(v) };
            }
        }

        // If a split happened the old block mapping must leave the TLB;
        // update_pte covers that.
        self.update_pte(slot, from, new_pte);
        table
    }

    /// Write leaf entries of one granularity over `[from, from+len)`.
    /// `fixed_to` pins every leaf to the same output frame (the blank-page
    /// redirect wants that). Caller holds the lock.
    fn config_map(
        &self,
        root: *mut u64,
        mut from: u64,
        mut to: u64,
        mut len: u64,
        pte_flags: u64,
        level: u32,
        fixed_to: bool,
    ) {
        let (step, leaf_type) = match level {
            2 => (PAGE_SIZE_2M, 0),
            3 => (PAGE_SIZE as u64, pte::TYPE_TABLE),
            _ => panic!("cannot map at level {}", level),
        };

        while len != 0 {
            let table = self.get_or_create_table(root, from, level);
            let idx = if level == 2 { l2_idx(from) } else { l3_idx(from) };
            let slot = unsafe { table.add(idx as usize) };
            let old = unsafe { slot.read_volatile() };
            self.update_pte(slot, from, to | pte_flags | leaf_type);
            // The entry may have pointed at a dynamically allocated table
            // further down; it is unreachable now.
            if old & pte::SW_DYN_ALLOC != 0 {
                memory::free_page(Self::table_ptr(old) as *mut u8);
            }
            from += step;
            if !fixed_to {
                to += step;
            }
            len -= step;
        }
    }

    fn do_apply_map(&self, mut from: u64, mut to: u64, mut len: u64, pte_flags: u64, fixed_to: bool) {
        let inner = self.inner.lock();
        let root = inner.root;

        // 4KiB pages up to the first 2MiB boundary.
        if from & PAGE_MASK_2M != 0 {
            let mut s = ((from & !PAGE_MASK_2M) + PAGE_SIZE_2M) - from;
            if s > len {
                s = len;
            }
            self.config_map(root, from, to, s, pte_flags, 3, fixed_to);
            from += s;
            to += s;
            len -= s;
        }

        // 2MiB blocks while both sides stay aligned.
        if len >= PAGE_SIZE_2M && to & PAGE_MASK_2M == 0 {
            let s = len & !PAGE_MASK_2M;
            self.config_map(root, from, to, s, pte_flags, 2, fixed_to);
            from += s;
            to += s;
            len -= s;
        }

        // Tail pages.
        if len != 0 {
            self.config_map(root, from, to, len, pte_flags, 3, fixed_to);
        }
    }

    /// Map `[from, from+len)` → `to…` with raw descriptor flags.
    pub fn apply_map(&self, from: u64, to: u64, len: u64, pte_flags: u64) {
        self.do_apply_map(from, to, len, pte_flags, false);
    }

    /// Like `apply_map` but every page translates to the same `to` frame.
    pub fn apply_map_fixed(&self, from: u64, to: u64, len: u64, pte_flags: u64) {
        self.do_apply_map(from, to, len, pte_flags, true);
    }

    /// Fixed-target map forced to 4KiB granules: a single shared frame
    /// cannot back a 2MiB block.
    pub fn apply_map_fixed_4k(&self, from: u64, to: u64, len: u64, pte_flags: u64) {
        let inner = self.inner.lock();
        let root = inner.root;
        self.config_map(root, from, to, len, pte_flags, 3, true);
    }

    /// Software walk; returns the leaf level and descriptor covering `va`.
    /// Used for process translation and by the unit tests.
    pub fn lookup_level(&self, va: u64) -> Option<(u32, u64)> {
        let inner = self.inner.lock();
        let mut table = inner.root;
        let mut level = self.start_level;

        if self.t == Table::Vttbr && self.start_level == 1 {
            let idx = l1_idx(va) + l0_idx(va) * ENTRIES_PER_TABLE;
            let v = unsafe { table.add(idx as usize).read_volatile() };
            if v & pte::VALID == 0 {
                return None;
            }
            if Self::pte_is(v, false) {
                return Some((1, v));
            }
            table = Self::table_ptr(v);
            level = 2;
        }

        loop {
            let idx = match level {
                0 => l0_idx(va),
                1 => l1_idx(va),
                2 => l2_idx(va),
                3 => l3_idx(va),
                _ => unreachable!(),
            };
            let v = unsafe { table.add(idx as usize).read_volatile() };
            if v & pte::VALID == 0 {
                return None;
            }
            if level == 3 || Self::pte_is(v, false) {
                return Some((level, v));
            }
            table = Self::table_ptr(v);
            level += 1;
        }
    }

    pub fn lookup(&self, va: u64) -> Option<u64> {
        self.lookup_level(va).map(|(_, v)| v)
    }

    /// Translate `va` through this descriptor in software.
    pub fn virt_to_phys(&self, va: u64) -> Option<u64> {
        let (level, v) = self.lookup_level(va)?;
        let offset_mask = match level {
            1 => PAGE_SIZE_1G - 1,
            2 => PAGE_MASK_2M,
            _ => PAGE_MASK,
        };
        Some((v & pte::ADDR_MASK & !offset_mask) | (va & offset_mask))
    }

    /// Free every dynamically allocated table reachable from the root and
    /// clear the root entries. TLB is invalidated by ASID afterwards.
    pub fn free_dyn_tables(&self) {
        let inner = self.inner.lock();
        let root = inner.root;
        for i in 0..ENTRIES_PER_TABLE {
            let l0e = unsafe { root.add(i as usize).read_volatile() };
            if l0e & pte::SW_DYN_ALLOC == 0 {
                continue;
            }
            let l1t = Self::table_ptr(l0e);
            for j in 0..ENTRIES_PER_TABLE {
                let l1e = unsafe { l1t.add(j as usize).read_volatile() };
                if l1e & pte::SW_DYN_ALLOC == 0 {
                    continue;
                }
                let l2t = Self::table_ptr(l1e);
                for k in 0..ENTRIES_PER_TABLE {
                    let l2e = unsafe { l2t.add(k as usize).read_volatile() };
                    if l2e & pte::SW_DYN_ALLOC != 0 {
                        memory::free_page(Self::table_ptr(l2e) as *mut u8);
                    }
                }
                memory::free_page(l2t as *mut u8);
            }
            memory::free_page(l1t as *mut u8);
            // Everything below this entry is gone; clearing it marks that
            // no dynamic table remains.
            unsafe { root.add(i as usize).write_volatile(0) };
        }
        drop(inner);

        self.tlbi_asid();
    }

    /// Invalidate every TLB entry tagged with this descriptor's ASID.
    /// Needs HCR.TGE so the EL2&0 regime is targeted.
    fn tlbi_asid(&self) {
        #[cfg(target_arch = "aarch64")]
        {
            use super::hcr;
            let arg = self.asid << 48;
            let orig = crate::read_sysreg!("hcr_el2");
            crate::write_sysreg!("hcr_el2", hcr::E2H | hcr::TGE);
            super::isb();
            super::dsb_ish();
            unsafe {
                core::arch::asm!("tlbi aside1is, {a}", a = in(reg) arg, options(nostack));
            }
            super::dsb_ish();
            super::isb();
            crate::write_sysreg!("hcr_el2", orig);
            super::isb();
        }
        TLB_MAINT_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for PtDesc {
    fn drop(&mut self) {
        self.free_dyn_tables();
        let inner = self.inner.lock();
        if self.root_pages == 1 {
            memory::free_page(inner.root as *mut u8);
        } else {
            memory::free_aligned(
                inner.root as *mut u8,
                self.root_pages * PAGE_SIZE,
                self.root_pages * PAGE_SIZE,
            );
        }
    }
}

/// Build stage-1 leaf flags from mapper flags.
fn s1_pte_flags(flags: MapFlags, el0: bool) -> u64 {
    let mut mair_idx = mair::WB_IDX;
    let mut sh = pte::SH_INNER;

    if flags.contains(MapFlags::UC) {
        mair_idx = mair::UC_IDX;
        sh = pte::SH_OUTER;
    } else if flags.contains(MapFlags::NGNRE) {
        mair_idx = mair::NGNRE_IDX;
        sh = pte::SH_OUTER;
    } else {
        if flags.contains(MapFlags::WC) {
            mair_idx = mair::WC_IDX;
            sh = pte::SH_OUTER;
        } else if flags.contains(MapFlags::WT) {
            mair_idx = mair::WT_IDX;
        } else if flags.contains(MapFlags::TAG) {
            mair_idx = mair::TAG_IDX;
        }
        if flags.contains(MapFlags::PLAT_NS) {
            sh = pte::SH_NONE;
        } else if flags.contains(MapFlags::PLAT_OS) {
            sh = pte::SH_OUTER;
        }
    }

    let perm = match (flags.contains(MapFlags::WRITE), flags.contains(MapFlags::EXE), el0) {
        (false, false, false) => pte::PERM_R,
        (false, true, false) => pte::PERM_RX,
        (true, false, false) => pte::PERM_RW,
        (true, true, false) => pte::PERM_RWX,
        (false, false, true) => pte::PERM_R_EL0,
        (false, true, true) => pte::PERM_RX_EL0,
        (true, false, true) => pte::PERM_RW_EL0,
        (true, true, true) => pte::PERM_RWX_EL0,
    };

    pte::VALID | pte::mair_idx(mair_idx) | sh | pte::AF | perm
}

/// Map a window in the hypervisor's stage-1 space.
pub fn va_map(aligned_vaddr: u64, aligned_paddr: u64, flags: MapFlags, aligned_len: u64) {
    let pte_flags = s1_pte_flags(flags, false);
    vmm_pt_s1().apply_map(aligned_vaddr, aligned_paddr, aligned_len, pte_flags);
}

/// Drop a stage-1 window. Writing all-zero descriptors unmaps.
pub fn va_unmap(aligned_vaddr: u64, aligned_len: u64) {
    vmm_pt_s1().apply_map_fixed(aligned_vaddr, 0, aligned_len, 0);
}

/// PAR_EL1 fields.
const PAR_F: u64 = 1 << 0;
const PAR_PA_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// Probe the hypervisor's own stage-1 for `addr` using the AT instruction.
/// PAR_EL1 is caller-saved state; preserve it.
#[cfg(target_arch = "aarch64")]
fn at_translate_el2_addr(addr: u64) -> u64 {
    let desc = vmm_pt_s1();
    let _guard = desc.inner.lock();
    let orig_par = crate::read_sysreg!("par_el1");
    unsafe {
        core::arch::asm!("at s1e2r, {a}", a = in(reg) addr, options(nostack));
    }
    super::isb();
    let par = crate::read_sysreg!("par_el1");
    crate::write_sysreg!("par_el1", orig_par);
    par
}

/// Hosted builds walk the tables in software instead.
#[cfg(not(target_arch = "aarch64"))]
fn at_translate_el2_addr(addr: u64) -> u64 {
    match vmm_pt_s1().virt_to_phys(addr) {
        Some(pa) => pa & PAR_PA_MASK,
        None => PAR_F,
    }
}

/// Is there a live stage-1 mapping for `va`?
pub fn check_existing_va_map(va: u64) -> bool {
    at_translate_el2_addr(va) & PAR_F == 0
}

/// Translate a hypervisor virtual address to physical.
pub fn vmm_virt_to_phys(addr: u64) -> Option<u64> {
    let par = at_translate_el2_addr(addr);
    if par & PAR_F != 0 {
        None
    } else {
        Some((par & PAR_PA_MASK) | (addr & PAGE_MASK))
    }
}

/// SCTLR.M for the guest's EL1 translation regime.
const SCTLR_M: u64 = 1 << 0;

/// Translate a guest virtual address to IPA at the given EL and access
/// direction, returning the IPA and the memory attributes of the mapping.
pub fn gvirt_to_ipa(gvirt: u64, el: u32, wr: bool) -> Result<(u64, MapFlags), ()> {
    // With the EL1 MMU off the address is already an IPA and data accesses
    // are Device-nGnRnE.
    if crate::read_sysreg!("sctlr_el12") & SCTLR_M == 0 {
        return Ok((gvirt, MapFlags::UC | if wr { MapFlags::WRITE } else { MapFlags::empty() }));
    }

    let orig_par = crate::read_sysreg!("par_el1");
    #[cfg(target_arch = "aarch64")]
    unsafe {
        match (el, wr) {
            (0, false) => core::arch::asm!("at s1e0r, {a}", a = in(reg) gvirt, options(nostack)),
            (0, true) => core::arch::asm!("at s1e0w, {a}", a = in(reg) gvirt, options(nostack)),
            (1, false) => core::arch::asm!("at s1e1r, {a}", a = in(reg) gvirt, options(nostack)),
            (1, true) => core::arch::asm!("at s1e1w, {a}", a = in(reg) gvirt, options(nostack)),
            _ => panic!("unexpected EL {} for guest translation", el),
        }
    }
    super::isb();
    let par = crate::read_sysreg!("par_el1");
    crate::write_sysreg!("par_el1", orig_par);

    if par & PAR_F != 0 {
        log_warn!("guest AT fail: PAR 0x{:x} va 0x{:x} el {}", par, gvirt, el);
        return Err(());
    }

    let ipa = (par & PAR_PA_MASK) | (gvirt & PAGE_MASK);
    let mut flags = MapFlags::empty();
    if wr {
        flags |= MapFlags::WRITE;
    }
    let attr = par >> 56;
    match attr {
        x if x == mair::UC => flags |= MapFlags::UC,
        x if x == mair::WC => flags |= MapFlags::WC,
        x if x == mair::WT => flags |= MapFlags::WT,
        x if x == mair::NGNRE => flags |= MapFlags::NGNRE,
        x if x == mair::TAG => flags |= MapFlags::TAG,
        x if x == mair::WB => {}
        other => {
            log_warn!("unknown MAIR attr 0x{:x}, treating as write-back", other);
        }
    }
    let sh = (par >> 7) & 0x3;
    if sh == 0 {
        flags |= MapFlags::PLAT_NS;
    } else if sh == 2 {
        flags |= MapFlags::PLAT_OS;
    }

    Ok((ipa, flags))
}

/// Punch a trap hole in stage-2 over `[addr, addr+size)`: entries keep
/// their identity target but lose the valid bit, so every access faults.
pub fn hook_ipa(addr: u64, size: u64) -> IpaHook {
    if addr & PAGE_MASK != 0 {
        panic!("hook address not page aligned: 0x{:x}", addr);
    }
    if size == 0 || size & PAGE_MASK != 0 {
        panic!("hook size not page aligned or zero: 0x{:x}", size);
    }
    vmm_pt_s2().apply_map(addr, addr, size, PTE_S2_DEFAULT);
    IpaHook { addr, size }
}

/// Restore the identity mapping removed by `hook_ipa`.
pub fn unhook_ipa(hook: IpaHook) {
    vmm_pt_s2().apply_map(hook.addr, hook.addr, hook.size, PTE_S2_DEFAULT | pte::VALID);
}

pub fn vmm_pt_s1() -> &'static PtDesc {
    VMM_PT_S1.get().expect("stage-1 tables not initialized")
}

pub fn vmm_pt_s2() -> &'static PtDesc {
    VMM_PT_S2.get().expect("stage-2 tables not initialized")
}

/// The all-invalid process table installed while no process runs.
pub fn pt_desc_none() -> &'static PtDesc {
    PROC_PT_NONE.get().expect("mmu not initialized")
}

// ── Process stage-1 descriptors ─────────────────────────────────────────

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct ProcMapFlags: u32 {
        const WRITE = 1 << 0;
        const EXEC = 1 << 1;
        const SHARE = 1 << 2;
    }
}

/// Software bit marking process shared-memory pages.
const PTE_PROC_SHM: u64 = 1 << 57;

pub fn pt_desc_proc_alloc(asid: u64) -> PtDesc {
    PtDesc::new(Table::Ttbr0, asid, 0)
}

pub fn pt_desc_proc_mappage(pd: &PtDesc, virt: u64, phys: u64, flags: ProcMapFlags) -> Result<(), ()> {
    if virt & PAGE_MASK != 0 || phys & PAGE_MASK != 0 {
        return Err(());
    }
    let mut mf = MapFlags::empty();
    if flags.contains(ProcMapFlags::WRITE) {
        mf |= MapFlags::WRITE;
    }
    if flags.contains(ProcMapFlags::EXEC) {
        mf |= MapFlags::EXE;
    }
    let mut pte_flags = s1_pte_flags(mf, true) | pte::NG;
    if flags.contains(ProcMapFlags::SHARE) {
        pte_flags |= PTE_PROC_SHM;
    }
    pd.apply_map(virt, phys, PAGE_SIZE as u64, pte_flags);
    Ok(())
}

pub fn pt_desc_proc_unmap(pd: &PtDesc, virt: u64, npages: u64) -> Result<(), ()> {
    if virt & PAGE_MASK != 0 {
        return Err(());
    }
    pd.apply_map_fixed(virt, 0, npages << 12, 0);
    Ok(())
}

pub fn pt_desc_proc_unmapall(pd: &PtDesc) {
    pd.free_dyn_tables();
}

pub fn pt_desc_proc_virt_to_phys(pd: &PtDesc, virt: u64) -> Option<u64> {
    pd.virt_to_phys(virt)
}

/// Install a process's tables (or the empty table) in TTBR0_EL2.
pub fn pt_desc_proc_switch(pd: &PtDesc) {
    crate::write_sysreg!("ttbr0_el2", pd.root_phys() | (pd.asid() << 48));
    super::isb();
}

/// Shared read-only zero frame backing guest views of hypervisor memory.
pub fn phys_blank() -> u64 {
    PHYS_BLANK.load(Ordering::Relaxed)
}

// ── Initialization ──────────────────────────────────────────────────────

static MMU_INIT: Once<()> = Once::new();

/// Stage-1 bring-up: the hypervisor space descriptor adopts service of the
/// window regions, and an empty TTBR0 table replaces whatever identity map
/// the firmware left there.
pub fn init() {
    MMU_INIT.call_once(|| {
        VMM_PT_S1.call_once(|| PtDesc::new(Table::Ttbr1, 0, 0));
        PROC_PT_NONE.call_once(|| PtDesc::new(Table::Ttbr0, 0, 0));

        let (blank, blank_phys) = memory::alloc_page();
        let _ = blank;
        PHYS_BLANK.store(blank_phys, Ordering::Relaxed);

        pt_desc_proc_switch(pt_desc_none());
        flush_tlb();
    });
}

/// Take over TTBR1_EL2 with tables the engine owns: the direct map for
/// every RAM region the firmware reported, the hypervisor image at its
/// linked address, and the console device page. The window regions the
/// mapper manages live in this space too. TCR is left as the firmware
/// configured it (4KiB granule, 48-bit VA on both halves).
#[cfg(target_os = "none")]
pub fn init_vmm_space(
    map: Option<&limine::response::MemoryMapResponse>,
    kaddr: Option<&limine::response::KernelAddressResponse>,
) {
    use limine::memory_map::EntryType;

    let s1 = vmm_pt_s1();

    if let Some(map) = map {
        for e in map.entries() {
            let t = e.entry_type;
            let writable = if t == EntryType::USABLE
                || t == EntryType::BOOTLOADER_RECLAIMABLE
                || t == EntryType::ACPI_RECLAIMABLE
                || t == EntryType::ACPI_NVS
                || t == EntryType::FRAMEBUFFER
            {
                true
            } else if t == EntryType::KERNEL_AND_MODULES {
                false
            } else {
                continue;
            };
            let flags = if writable {
                MapFlags::WRITE
            } else {
                MapFlags::empty()
            };
            let base = e.base & !PAGE_MASK;
            let len = (e.length + (e.base - base) + PAGE_MASK) & !PAGE_MASK;
            s1.apply_map(memory::phys_to_virt(base), base, len, s1_pte_flags(flags, false));
        }
    }

    if let Some(k) = kaddr {
        // The image is mapped RWX at its linked base; a generous span
        // avoids needing the ELF headers here.
        const IMAGE_SPAN: u64 = 64 * 1024 * 1024;
        s1.apply_map(
            k.virtual_base(),
            k.physical_base(),
            IMAGE_SPAN,
            s1_pte_flags(MapFlags::WRITE | MapFlags::EXE, false),
        );
    }

    // Console MMIO through the direct map.
    let uart = crate::serial::base_phys();
    s1.apply_map(
        memory::phys_to_virt(uart),
        uart,
        PAGE_SIZE as u64,
        s1_pte_flags(MapFlags::WRITE | MapFlags::UC, false),
    );

    // The attribute indices in our descriptors assume our MAIR layout;
    // install it together with the tables.
    crate::write_sysreg!("mair_el2", mair::VALUE);
    super::isb();
    crate::write_sysreg!("ttbr1_el2", s1.root_phys());
    super::isb();
    flush_tlb();
    log!("stage-1 hypervisor space installed");
}

/// VTCR field builders.
mod vtcr {
    pub const fn t0sz(v: u64) -> u64 {
        v & 0x3F
    }
    pub const fn sl0(v: u64) -> u64 {
        (v & 0x3) << 6
    }
    pub const IRGN0_WB: u64 = 1 << 8;
    pub const ORGN0_WB: u64 = 1 << 10;
    pub const SH0_IS: u64 = 3 << 12;
    pub const TG0_4K: u64 = 0 << 14;
    pub const fn ps(v: u64) -> u64 {
        (v & 0x7) << 16
    }
}

static STAGE2_INIT: Once<()> = Once::new();

/// Stage-2 bring-up on the boot CPU: identity map sized from the CPU's
/// reported physical address range, then the hypervisor hole.
pub fn init_stage2() {
    STAGE2_INIT.call_once(do_init_stage2);
}

fn do_init_stage2() {
    #[cfg(target_arch = "aarch64")]
    let pa_code = crate::read_sysreg!("id_aa64mmfr0_el1") & 0xF;
    #[cfg(not(target_arch = "aarch64"))]
    let pa_code = 2u64; // 40-bit IPA stand-in for hosted builds

    let (pa_bits, vtcr_ps, sl0) = match pa_code {
        0 => (32, 0, 1),
        1 => (36, 1, 1),
        2 => (40, 2, 1),
        3 => (42, 3, 1),
        4 => (44, 4, 2),
        _ => (48, 5, 2),
    };
    let start_level = 2 - sl0;

    let s2 = match start_level {
        0 => {
            let desc = PtDesc::new(Table::Vttbr, 0, 0);
            // Root entries each point at a table of 1GiB identity blocks.
            let inner = desc.inner.lock();
            let root = inner.root;
            let mut start = 0u64;
            for i in 0..ENTRIES_PER_TABLE {
                let (tvirt, tphys) = memory::alloc_page();
                let t = tvirt as *mut u64;
                unsafe {
                    root.add(i as usize).write_volatile(
                        tphys | pte::VALID | pte::TYPE_TABLE | pte::SW_DYN_ALLOC,
                    );
                }
                for j in 0..ENTRIES_PER_TABLE {
                    unsafe {
                        t.add(j as usize)
                            .write_volatile(start | pte::VALID | PTE_S2_DEFAULT);
                    }
                    start += PAGE_SIZE_1G;
                }
            }
            drop(inner);
            desc
        }
        1 => {
            let desc = PtDesc::new_s2_concat(MAX_S2_ROOT_CONCAT);
            let inner = desc.inner.lock();
            let root = inner.root;
            let mut start = 0u64;
            for i in 0..(ENTRIES_PER_TABLE as usize * MAX_S2_ROOT_CONCAT) {
                unsafe {
                    root.add(i).write_volatile(start | pte::VALID | PTE_S2_DEFAULT);
                }
                start += PAGE_SIZE_1G;
            }
            drop(inner);
            desc
        }
        other => panic!("unsupported stage-2 start level {}", other),
    };

    crate::write_sysreg!("vttbr_el2", s2.root_phys());
    super::dsb_ish();
    super::isb();

    let vtcr = vtcr::t0sz(64 - pa_bits)
        | vtcr::sl0(sl0)
        | vtcr::IRGN0_WB
        | vtcr::ORGN0_WB
        | vtcr::SH0_IS
        | vtcr::TG0_4K
        | vtcr::ps(vtcr_ps);
    crate::write_sysreg!("vtcr_el2", vtcr);
    super::isb();
    VTCR_HOST.store(vtcr, Ordering::Relaxed);

    VMM_PT_S2.call_once(|| s2);

    s2_vmm_mem_ro();

    log!("stage-2 identity map up, {}-bit IPA", pa_bits);
}

/// Redirect the guest's view of the hypervisor footprint to the blank
/// page, read-only. Reads see zeros; writes take a permission fault the
/// dispatcher treats as fatal.
fn s2_vmm_mem_ro() {
    let start = memory::vmm_phys_start();
    let size = memory::vmm_phys_size();
    if size == 0 {
        return;
    }
    let pte_flags =
        pte::VALID | pte::s2_memattr(0xF) | pte::SH_INNER | pte::AF | pte::S2_PERM_R;
    vmm_pt_s2().apply_map_fixed_4k(start, phys_blank(), size, pte_flags);
}

/// Secondary CPUs adopt the already-built stage-2 tables.
pub fn init_stage2_secondary() {
    crate::write_sysreg!("vttbr_el2", vmm_pt_s2().root_phys());
    super::isb();
    crate::write_sysreg!("vtcr_el2", VTCR_HOST.load(Ordering::Relaxed));
    super::isb();
}

/// Nuke every EL2 TLB entry.
pub fn flush_tlb() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("dsb ishst", "tlbi alle2", "dsb ish", "isb", options(nostack));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_lookup_round_trips() {
        let pd = PtDesc::new(Table::Ttbr1, 0, 0);
        let flags = s1_pte_flags(MapFlags::WRITE, false);
        pd.apply_map(0x4000_0000, 0x8000_0000, 0x4000, flags);

        for off in [0u64, 0x1000, 0x3FFF] {
            let pa = pd.virt_to_phys(0x4000_0000 + off).unwrap();
            assert_eq!(pa, 0x8000_0000 + off);
        }
        assert!(pd.lookup(0x4000_4000).is_none());
    }

    #[test]
    fn map_is_idempotent() {
        let pd = PtDesc::new(Table::Ttbr1, 0, 0);
        let flags = s1_pte_flags(MapFlags::WRITE, false);
        pd.apply_map(0x1000_0000, 0x2000_0000, 0x3000, flags);
        let first = pd.lookup(0x1000_1000).unwrap();
        pd.apply_map(0x1000_0000, 0x2000_0000, 0x3000, flags);
        let second = pd.lookup(0x1000_1000).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn greedy_2m_blocks_where_aligned() {
        let pd = PtDesc::new(Table::Ttbr1, 0, 0);
        let flags = s1_pte_flags(MapFlags::WRITE, false);
        // 2MiB-aligned on both sides: must become a block leaf.
        pd.apply_map(0x4000_0000, 0x4000_0000, PAGE_SIZE_2M, flags);
        let leaf = pd.lookup(0x4000_0000).unwrap();
        assert_eq!(leaf & pte::TYPE_TABLE, 0, "expected a block descriptor");
        // Unaligned: must become pages.
        pd.apply_map(0x5000_1000, 0x5000_1000, 0x2000, flags);
        let leaf = pd.lookup(0x5000_1000).unwrap();
        assert_ne!(leaf & pte::TYPE_TABLE, 0, "expected a page descriptor");
    }

    #[test]
    fn splitting_a_block_preserves_the_rest() {
        let pd = PtDesc::new(Table::Ttbr1, 0, 0);
        let flags = s1_pte_flags(MapFlags::WRITE, false);
        pd.apply_map(0x4000_0000, 0x8000_0000, PAGE_SIZE_2M, flags);

        // Remap one 4KiB page in the middle elsewhere.
        let hole = 0x4000_0000 + 0x10_000;
        pd.apply_map(hole, 0x9999_0000, 0x1000, flags);

        assert_eq!(pd.virt_to_phys(hole).unwrap(), 0x9999_0000);
        // Neighbours still translate to the original block target.
        assert_eq!(pd.virt_to_phys(hole - 0x1000).unwrap(), 0x8000_0000 + 0xF_000);
        assert_eq!(pd.virt_to_phys(hole + 0x1000).unwrap(), 0x8000_0000 + 0x11_000);
    }

    #[test]
    fn attribute_clamp_last_map_wins() {
        let pd = PtDesc::new(Table::Ttbr1, 0, 0);
        pd.apply_map(0x6000_0000, 0x6000_0000, 0x1000, s1_pte_flags(MapFlags::UC, false));
        let uc = pd.lookup(0x6000_0000).unwrap();
        assert_eq!((uc >> 2) & 0x7, mair::UC_IDX);

        pd.apply_map(0x6000_0000, 0x6000_0000, 0x1000, s1_pte_flags(MapFlags::empty(), false));
        let wb = pd.lookup(0x6000_0000).unwrap();
        assert_eq!((wb >> 2) & 0x7, mair::WB_IDX);
    }

    #[test]
    fn rewriting_a_valid_entry_invalidates_tlb() {
        let pd = PtDesc::new(Table::Ttbr1, 0, 0);
        let flags = s1_pte_flags(MapFlags::WRITE, false);
        pd.apply_map(0x7000_0000, 0x1000_0000, 0x1000, flags);
        let before = TLB_MAINT_COUNT.load(Ordering::Relaxed);
        pd.apply_map(0x7000_0000, 0x2000_0000, 0x1000, flags);
        let after = TLB_MAINT_COUNT.load(Ordering::Relaxed);
        assert!(after > before, "no TLB maintenance on rewrite");
    }

    #[test]
    fn unmap_removes_translation() {
        let pd = PtDesc::new(Table::Ttbr1, 0, 0);
        let flags = s1_pte_flags(MapFlags::WRITE, false);
        pd.apply_map(0x4200_0000, 0x4200_0000, 0x2000, flags);
        assert!(pd.lookup(0x4200_0000).is_some());
        pd.apply_map_fixed(0x4200_0000, 0, 0x2000, 0);
        assert!(pd.lookup(0x4200_0000).is_none());
        assert!(pd.lookup(0x4200_1000).is_none());
    }

    #[test]
    fn s2_concat_root_identity_and_hook() {
        let pd = PtDesc::new_s2_concat(MAX_S2_ROOT_CONCAT);
        let mut start = 0u64;
        {
            let inner = pd.inner.lock();
            for i in 0..(ENTRIES_PER_TABLE as usize * 4) {
                unsafe {
                    inner
                        .root
                        .add(i)
                        .write_volatile(start | pte::VALID | PTE_S2_DEFAULT);
                }
                start += PAGE_SIZE_1G;
            }
        }
        // Identity at an arbitrary IPA.
        assert_eq!(pd.virt_to_phys(0x8_1234_5000).unwrap(), 0x8_1234_5000);

        // Hook: same output address, valid bit gone.
        pd.apply_map(0x1_0000_0000, 0x1_0000_0000, 0x1000, PTE_S2_DEFAULT);
        assert!(pd.lookup(0x1_0000_0000).is_none());
        // Unhook restores.
        pd.apply_map(0x1_0000_0000, 0x1_0000_0000, 0x1000, PTE_S2_DEFAULT | pte::VALID);
        assert_eq!(pd.virt_to_phys(0x1_0000_0000).unwrap(), 0x1_0000_0000);
    }

    #[test]
    fn proc_tables_map_nonglobal_el0() {
        let pd = pt_desc_proc_alloc(7);
        pt_desc_proc_mappage(&pd, 0x40_0000, 0x1234_5000, ProcMapFlags::WRITE).unwrap();
        let leaf = pd.lookup(0x40_0000).unwrap();
        assert_ne!(leaf & pte::NG, 0, "process pages must be non-global");
        assert_eq!(leaf & (3 << 6), pte::AP_EL1RW_EL0RW);
        assert_eq!(pt_desc_proc_virt_to_phys(&pd, 0x40_0123).unwrap(), 0x1234_5123);
        pt_desc_proc_unmap(&pd, 0x40_0000, 1).unwrap();
        assert!(pd.lookup(0x40_0000).is_none());
    }
}

//! ITS command-queue shadowing.
//!
//! The guest believes it owns the ITS command ring; it does not. Writes
//! to `CBASER` install the guest's ring, and the hypervisor allocates a
//! same-sized ring of its own whose address goes into the real `CBASER`.
//! On every `CWRITER` write the newly queued guest commands are copied
//! into the shadow ring one by one, and the ones that alter the
//! device/event translation (`MAPD`, `MAPTI`, `MAPI`, `DISCARD`) are
//! mirrored into an internal table on the way through. The table answers
//! the reverse question when a pass-through physical LPI arrives: which
//! device/event does this interrupt belong to, and is that mapping still
//! live?
//!
//! The hypervisor also injects its own `INT` commands into the same
//! stream (`gic_its_int_set`) when a virtualized pass-through device must
//! fire. Host commands only run while no guest batch is in flight, so
//! guest submission order is never disturbed.
//!
//! Ring discipline: the slot before the read pointer stays empty (the
//! architecture requires it), and the logical guest head never runs past
//! the real head reported by the ITS.

use super::vgic::{self, LPI_START};
use super::{mapper, mmio, MapFlags};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use crate::memory;
use spin::{Mutex, Once};

/// GICv3 ITS register frame size.
pub const GITS_SIZE: u64 = 64 * 1024;

const GITS_TYPER: u64 = 0x8;
const GITS_CBASER: u64 = 0x80;
const GITS_CWRITER: u64 = 0x88;
const GITS_CREADR: u64 = 0x90;

/// Completion poll bound: iterations of 1µs.
const ITS_POLL_LIMIT: u32 = 5000;

const CBASER_VALID: u64 = 1 << 63;
const CBASER_ADDR_MASK: u64 = 0xF_FFFF_FFFF_F000;
/// Implementation-defined and reserved bits masked out of guest reads.
const CBASER_READ_MASK: u64 = !((1 << 8)
    | (1 << 9)
    | (1 << 52)
    | (1 << 56)
    | (1 << 57)
    | (1 << 58)
    | (1 << 62));

fn cbaser_addr(v: u64) -> u64 {
    v & CBASER_ADDR_MASK
}

fn cbaser_nbytes(v: u64) -> u64 {
    ((v & 0xFF) + 1) * memory::PAGE_SIZE as u64
}

const RING_IDX_SHIFT: u64 = 5;
const RING_IDX_MASK: u64 = 0x7FFF;
const CWRITER_RETRY: u64 = 1 << 0;
const CREADR_STALL: u64 = 1 << 0;

fn ring_idx(v: u64) -> u64 {
    (v >> RING_IDX_SHIFT) & RING_IDX_MASK
}

const CMD_INT: u64 = 0x3;
const CMD_MAPD: u64 = 0x8;
const CMD_MAPTI: u64 = 0xA;
const CMD_MAPI: u64 = 0xB;
const CMD_DISCARD: u64 = 0xF;

const MAPD_VALID: u64 = 1 << 63;
const ITT_ADDR_MASK: u64 = (1 << 48) - 1;

/// One 32-byte ITS command.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItsCmd {
    pub data: [u64; 4],
}

impl ItsCmd {
    fn opcode(&self) -> u64 {
        self.data[0] & 0xFF
    }

    fn dev_id(&self) -> u32 {
        (self.data[0] >> 32) as u32
    }

    fn event_id(&self) -> u32 {
        self.data[1] as u32
    }

    fn pint_id(&self) -> u32 {
        (self.data[1] >> 32) as u32
    }
}

/// Raw access to the real ITS register frame. A trait seam so the shadow
/// logic can run against a fake frame in tests.
pub trait ItsRegIo: Send + Sync {
    fn read32(&self, off: u64) -> u32;
    fn write32(&self, off: u64, val: u32);
    fn read64(&self, off: u64) -> u64;
    fn write64(&self, off: u64, val: u64);
}

struct HwRegIo {
    base: *mut u8,
}

unsafe impl Send for HwRegIo {}
unsafe impl Sync for HwRegIo {}

impl ItsRegIo for HwRegIo {
    fn read32(&self, off: u64) -> u32 {
        unsafe { (self.base.add(off as usize) as *const u32).read_volatile() }
    }
    fn write32(&self, off: u64, val: u32) {
        unsafe { (self.base.add(off as usize) as *mut u32).write_volatile(val) }
    }
    fn read64(&self, off: u64) -> u64 {
        unsafe { (self.base.add(off as usize) as *const u64).read_volatile() }
    }
    fn write64(&self, off: u64, val: u64) {
        unsafe { (self.base.add(off as usize) as *mut u64).write_volatile(val) }
    }
}

struct EventData {
    pint_id: u32,
    valid: bool,
}

struct DevData {
    itt_base: u64,
    valid: bool,
    events: BTreeMap<u32, EventData>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PintMap {
    dev_id: u32,
    event_id: u32,
}

const GUEST_CMD: bool = false;
const HOST_CMD: bool = true;

struct ItsInner {
    devs: BTreeMap<u32, DevData>,
    /// Reverse map, indexed by `pINTID - LPI_START`: which device/event
    /// last mapped each LPI.
    pimap: Vec<PintMap>,
    nids: u32,
    dev_id_mask: u32,
    event_id_mask: u32,

    /// Host-owned shadow ring (handed to the real CBASER).
    h_ring: *mut ItsCmd,
    h_ring_phys: u64,
    /// The guest's ring, mapped through its address space.
    g_ring: *mut ItsCmd,

    g_cbase_raw: u64,
    g_cbase_phys: u64,
    cbase_nbytes: u64,
    /// Ring capacity in commands.
    nidx: u64,

    h_head: u64,
    h_tail: u64,
    g_head: u64,
    g_tail: u64,
    /// Guest commands submitted to the real ITS and not yet completed.
    g_running: u64,

    h_pending: VecDeque<ItsCmd>,
    g_pending: VecDeque<ItsCmd>,

    cmd_ready: bool,
}

unsafe impl Send for ItsInner {}

pub struct ItsShadow {
    base_phys: u64,
    io: Box<dyn ItsRegIo>,
    inner: Mutex<ItsInner>,
}

static ITS: Once<Arc<ItsShadow>> = Once::new();

fn usleep(us: u32) {
    // The timer subsystem is external; a calibrated-enough busy wait
    // serves the completion poll.
    for _ in 0..us * 100 {
        core::hint::spin_loop();
    }
}

impl ItsInner {
    fn new(nids: u32, n_lpis: u32, dev_id_mask: u32, event_id_mask: u32) -> Self {
        ItsInner {
            devs: BTreeMap::new(),
            pimap: vec![PintMap::default(); n_lpis as usize],
            nids,
            dev_id_mask,
            event_id_mask,
            h_ring: core::ptr::null_mut(),
            h_ring_phys: 0,
            g_ring: core::ptr::null_mut(),
            g_cbase_raw: 0,
            g_cbase_phys: 0,
            cbase_nbytes: 0,
            nidx: 0,
            h_head: 0,
            h_tail: 0,
            g_head: 0,
            g_tail: 0,
            g_running: 0,
            h_pending: VecDeque::new(),
            g_pending: VecDeque::new(),
            cmd_ready: false,
        }
    }

    fn check_id_range(&self, dev_id: u32, event_id: u32) -> bool {
        dev_id & !self.dev_id_mask == 0 && event_id & !self.event_id_mask == 0
    }

    fn update_dev(&mut self, dev_id: u32, itt_base: u64, valid: bool) {
        if let Some(dd) = self.devs.get_mut(&dev_id) {
            if dd.itt_base != itt_base {
                // A live ITT base change leaves the old translations
                // undefined; drop everything the device had mapped.
                log_warn!(
                    "device {} ITT base change 0x{:x} -> 0x{:x}, dropping events",
                    dev_id,
                    dd.itt_base,
                    itt_base
                );
                dd.events.clear();
                dd.itt_base = itt_base;
                self.pimap.fill(PintMap::default());
            }
            dd.valid = valid;
        } else {
            self.devs.insert(
                dev_id,
                DevData {
                    itt_base,
                    valid,
                    events: BTreeMap::new(),
                },
            );
        }
    }

    fn map_event(&mut self, dev_id: u32, event_id: u32, pint_id: u32) {
        if !self.check_id_range(dev_id, event_id) {
            log_warn!("dev {} or event {} out of range", dev_id, event_id);
            return;
        }
        if pint_id < LPI_START || pint_id >= self.nids {
            log_warn!(
                "dev {} event {} maps invalid pINTID {}",
                dev_id,
                event_id,
                pint_id
            );
            return;
        }
        match self.devs.get_mut(&dev_id) {
            Some(dd) => {
                match dd.events.get_mut(&event_id) {
                    Some(ed) => {
                        ed.pint_id = pint_id;
                        ed.valid = true;
                    }
                    None => {
                        dd.events.insert(
                            event_id,
                            EventData {
                                pint_id,
                                valid: true,
                            },
                        );
                    }
                }
                self.pimap[(pint_id - LPI_START) as usize] = PintMap { dev_id, event_id };
            }
            None => {
                log_warn!("MAPTI/MAPI for unknown device {}, ignoring", dev_id);
            }
        }
    }

    fn discard_event(&mut self, dev_id: u32, event_id: u32) {
        if !self.check_id_range(dev_id, event_id) {
            log_warn!("dev {} or event {} out of range", dev_id, event_id);
            return;
        }
        match self.devs.get_mut(&dev_id) {
            Some(dd) => match dd.events.get_mut(&event_id) {
                Some(ed) => ed.valid = false,
                None => log_warn!("DISCARD for unmapped event {}", event_id),
            },
            None => log_warn!("DISCARD for unknown device {}", dev_id),
        }
    }

    /// Mirror a guest command into the device/event table as it is copied
    /// to the shadow ring.
    fn hook_cmd(&mut self, cmd: &ItsCmd) {
        match cmd.opcode() {
            CMD_MAPD => {
                let dev_id = cmd.dev_id();
                let itt_base = (cmd.data[2] >> 8) & ITT_ADDR_MASK;
                let valid = cmd.data[2] & MAPD_VALID != 0;
                if self.check_id_range(dev_id, 0) {
                    self.update_dev(dev_id, itt_base, valid);
                } else {
                    log_warn!("MAPD device {} out of range", dev_id);
                }
            }
            CMD_MAPTI => self.map_event(cmd.dev_id(), cmd.event_id(), cmd.pint_id()),
            CMD_MAPI => self.map_event(cmd.dev_id(), cmd.event_id(), cmd.event_id()),
            CMD_DISCARD => self.discard_event(cmd.dev_id(), cmd.event_id()),
            _ => {}
        }
    }

    fn check_valid_map(&self, dev_id: u32, event_id: u32) -> bool {
        if !self.check_id_range(dev_id, event_id) {
            return false;
        }
        let dd = match self.devs.get(&dev_id) {
            Some(dd) if dd.valid => dd,
            _ => return false,
        };
        matches!(dd.events.get(&event_id), Some(ed) if ed.valid)
    }

    fn pintd_match(&self, pint: u32, dev_id: u32, event_id: u32) -> (bool, bool) {
        if pint < LPI_START || pint >= self.nids {
            return (false, false);
        }
        let p = self.pimap[(pint - LPI_START) as usize];
        let matched = p.dev_id == dev_id && p.event_id == event_id;
        if matched {
            (true, self.check_valid_map(dev_id, event_id))
        } else {
            (false, false)
        }
    }

    /// Copy pending commands (guest or host) into the shadow ring and
    /// kick the real CWRITER. At most `nidx - 1` commands may ever sit in
    /// the ring: the slot before the read pointer stays empty.
    fn submit_cmds(&mut self, io: &dyn ItsRegIo, host_cmd: bool, flags: u64) -> u64 {
        let nidx = self.nidx;
        let end = self.h_head;
        let mut count = 0u64;
        let mut i = self.h_tail;
        while (i + 1) % nidx != end {
            let pending = if host_cmd {
                self.h_pending.pop_front()
            } else {
                self.g_pending.pop_front()
            };
            let cmd = match pending {
                Some(c) => c,
                None => break,
            };
            unsafe { self.h_ring.add(i as usize).write_volatile(cmd) };
            if !host_cmd {
                self.hook_cmd(&cmd);
            }
            count += 1;
            i = (i + 1) % nidx;
        }

        if count > 0 {
            self.h_tail = i;
            // Commands must be globally visible before the doorbell.
            super::dsb_sy();
            io.write64(GITS_CWRITER, ((i & RING_IDX_MASK) << RING_IDX_SHIFT) | flags);
        }

        count
    }

    /// Poll the real read pointer until it catches our tail.
    fn wait_cmds(&mut self, io: &dyn ItsRegIo) {
        for _ in 0..ITS_POLL_LIMIT {
            let v = io.read64(GITS_CREADR);
            if v & CREADR_STALL != 0 {
                panic!("ITS command stall");
            }
            let head = ring_idx(v);
            if head == self.h_tail {
                self.h_head = head;
                return;
            }
            usleep(1);
        }
        panic!("ITS command completion timeout");
    }

    fn handle_cbaser(&mut self, io: &dyn ItsRegIo, wr: bool, data: &mut u64) {
        if !wr {
            *data = self.g_cbase_raw & CBASER_READ_MASK;
            return;
        }

        let raw = *data;
        let old_nbytes = self.cbase_nbytes;
        self.g_cbase_raw = raw;
        if raw & CBASER_VALID == 0 {
            return;
        }

        let base = cbaser_addr(raw);
        let nbytes = cbaser_nbytes(raw);
        if base == 0 || nbytes == 0 {
            log_warn!("CBASER valid with null ring or zero size");
            return;
        }

        if base != self.g_cbase_phys || nbytes != old_nbytes {
            if !self.g_ring.is_null() {
                mapper::unmapmem(self.g_ring as *mut u8, old_nbytes);
            }
            if nbytes != old_nbytes {
                if !self.h_ring.is_null() {
                    memory::free_pages(self.h_ring as *mut u8, old_nbytes as usize);
                }
                let (virt, phys) = memory::alloc_pages(nbytes as usize);
                self.h_ring = virt as *mut ItsCmd;
                self.h_ring_phys = phys;
            }
            self.g_cbase_phys = base;
            self.cbase_nbytes = nbytes;
            self.nidx = nbytes / core::mem::size_of::<ItsCmd>() as u64;
            let p = mapper::mapmem_as(&mapper::AS_PASSVM, base, nbytes, MapFlags::empty())
                .expect("guest ITS ring window");
            self.g_ring = p as *mut ItsCmd;
        }

        unsafe {
            core::ptr::write_bytes(self.h_ring as *mut u8, 0, self.cbase_nbytes as usize);
        }

        self.h_head = 0;
        self.h_tail = 0;
        self.g_head = 0;
        self.g_tail = 0;
        self.g_running = 0;
        self.cmd_ready = true;

        let real = (raw & !CBASER_ADDR_MASK) | cbaser_addr(self.h_ring_phys);
        io.write64(GITS_CBASER, real);
    }

    fn handle_cwriter(&mut self, io: &dyn ItsRegIo, wr: bool, data: &mut u64) {
        if !wr {
            *data = self.g_tail << RING_IDX_SHIFT;
            return;
        }
        if !self.cmd_ready {
            log_warn!("CWRITER write before a valid CBASER, ignoring");
            return;
        }

        let raw = *data;
        let nidx = self.nidx;
        let end = ring_idx(raw);
        let mut i = self.g_tail;
        while i != end {
            let cmd = unsafe { self.g_ring.add(i as usize).read_volatile() };
            self.g_pending.push_back(cmd);
            i = (i + 1) % nidx;
        }
        self.g_tail = i;

        self.g_running += self.submit_cmds(io, GUEST_CMD, raw & CWRITER_RETRY);
    }

    fn handle_creadr(&mut self, io: &dyn ItsRegIo, wr: bool, data: &mut u64) {
        if wr {
            return; // read-only register
        }
        if !self.cmd_ready {
            *data = 0;
            return;
        }

        let raw = io.read64(GITS_CREADR);
        if raw & CREADR_STALL != 0 {
            panic!("unexpected CREADR stall bit");
        }

        // The real head advanced by some number of completed guest
        // commands; move the logical guest head by the same amount.
        let h_new_head = ring_idx(raw);
        let nidx = self.nidx;
        let diff = (h_new_head + nidx - self.h_head) % nidx;
        assert!(self.g_running >= diff);
        self.g_running -= diff;
        let g_new_head = (self.g_head + diff) % nidx;

        self.h_head = h_new_head;
        self.g_head = g_new_head;

        // Host-originated commands interleave only between guest batches.
        if self.g_running == 0 {
            if self.submit_cmds(io, HOST_CMD, 0) > 0 {
                self.wait_cmds(io);
            }
        }

        // Follow up with the next guest batch if one is waiting.
        self.g_running += self.submit_cmds(io, GUEST_CMD, 0);

        *data = self.g_head << RING_IDX_SHIFT;
    }
}

// ── Register frame dispatch ─────────────────────────────────────────────

#[derive(Clone, Copy)]
enum RegKind {
    D32,
    Q64,
    Cbaser,
    Cwriter,
    Creadr,
}

struct RegEntry {
    rbase: u64,
    size: u64,
    iosize: u64,
    kind: RegKind,
}

/// The whole 64KiB frame, in offset order. Runs of uninteresting
/// registers pass through at their natural width.
const REG_TABLE: &[RegEntry] = &[
    RegEntry { rbase: 0x0, size: 4, iosize: 4, kind: RegKind::D32 },    // CTLR
    RegEntry { rbase: 0x4, size: 4, iosize: 4, kind: RegKind::D32 },    // IIDR
    RegEntry { rbase: 0x8, size: 8, iosize: 8, kind: RegKind::Q64 },    // TYPER
    RegEntry { rbase: 0x10, size: 4, iosize: 4, kind: RegKind::D32 },   // MPAMIDR
    RegEntry { rbase: 0x14, size: 4, iosize: 4, kind: RegKind::D32 },   // PARTIDR
    RegEntry { rbase: 0x18, size: 4, iosize: 4, kind: RegKind::D32 },   // MPIDR
    RegEntry { rbase: 0x1C, size: 36, iosize: 4, kind: RegKind::D32 },
    RegEntry { rbase: 0x40, size: 4, iosize: 4, kind: RegKind::D32 },   // STATUSR
    RegEntry { rbase: 0x44, size: 4, iosize: 4, kind: RegKind::D32 },
    RegEntry { rbase: 0x48, size: 8, iosize: 8, kind: RegKind::Q64 },   // UMSIR
    RegEntry { rbase: 0x50, size: 48, iosize: 8, kind: RegKind::Q64 },
    RegEntry { rbase: 0x80, size: 8, iosize: 8, kind: RegKind::Cbaser },
    RegEntry { rbase: 0x88, size: 8, iosize: 8, kind: RegKind::Cwriter },
    RegEntry { rbase: 0x90, size: 8, iosize: 8, kind: RegKind::Creadr },
    RegEntry { rbase: 0x98, size: 104, iosize: 8, kind: RegKind::Q64 },
    RegEntry { rbase: 0x100, size: 64, iosize: 8, kind: RegKind::Q64 }, // BASER0-7
    RegEntry { rbase: 0x140, size: 65216, iosize: 8, kind: RegKind::Q64 },
];

/// The io-unit containing `off`: (unit base, iosize, kind).
fn locate_reg(off: u64) -> Option<(u64, u64, RegKind)> {
    for e in REG_TABLE {
        if off >= e.rbase && off < e.rbase + e.size {
            let unit = e.rbase + ((off - e.rbase) / e.iosize) * e.iosize;
            return Some((unit, e.iosize, e.kind));
        }
    }
    None
}

impl ItsShadow {
    fn reg_unit_access(
        &self,
        inner: &mut ItsInner,
        unit: u64,
        kind: RegKind,
        wr: bool,
        data: &mut u64,
    ) {
        match kind {
            RegKind::D32 => {
                if wr {
                    self.io.write32(unit, *data as u32);
                } else {
                    *data = self.io.read32(unit) as u64;
                }
            }
            RegKind::Q64 => {
                if wr {
                    self.io.write64(unit, *data);
                } else {
                    *data = self.io.read64(unit);
                }
            }
            RegKind::Cbaser => inner.handle_cbaser(&*self.io, wr, data),
            RegKind::Cwriter => inner.handle_cwriter(&*self.io, wr, data),
            RegKind::Creadr => inner.handle_creadr(&*self.io, wr, data),
        }
    }

    /// Serve a guest access to the register frame, splitting at io-unit
    /// boundaries and read-modify-writing partial units.
    fn frame_access(&self, offset: u64, wr: bool, buf: &mut [u8]) {
        let mut inner = self.inner.lock();

        if !wr {
            buf.fill(0);
        }

        let mut off = offset;
        let mut pos = 0usize;
        while pos < buf.len() {
            let (unit, iosize, kind) = match locate_reg(off) {
                Some(u) => u,
                None => break, // past the frame; reads stay zero
            };
            let in_unit = (off - unit) as usize;
            let n = core::cmp::min(iosize as usize - in_unit, buf.len() - pos);

            if in_unit == 0 && n == iosize as usize {
                let mut data = 0u64;
                if wr {
                    let mut b = [0u8; 8];
                    b[..n].copy_from_slice(&buf[pos..pos + n]);
                    data = u64::from_le_bytes(b);
                }
                self.reg_unit_access(&mut inner, unit, kind, wr, &mut data);
                if !wr {
                    buf[pos..pos + n].copy_from_slice(&data.to_le_bytes()[..n]);
                }
            } else {
                // Partial unit: read, merge, write back (or extract).
                let mut data = 0u64;
                self.reg_unit_access(&mut inner, unit, kind, false, &mut data);
                let mut bytes = data.to_le_bytes();
                if wr {
                    bytes[in_unit..in_unit + n].copy_from_slice(&buf[pos..pos + n]);
                    let mut merged = u64::from_le_bytes(bytes);
                    self.reg_unit_access(&mut inner, unit, kind, true, &mut merged);
                } else {
                    buf[pos..pos + n].copy_from_slice(&bytes[in_unit..in_unit + n]);
                }
            }

            off += n as u64;
            pos += n;
        }
    }
}

impl mmio::MmioHandler for ItsShadow {
    fn access(&self, gphys: u64, wr: bool, buf: &mut [u8], _flags: MapFlags) -> bool {
        let offset = gphys - self.base_phys;
        self.frame_access(offset, wr, buf);
        true
    }
}

/// Bring the shadow up over the ITS discovered at `base_phys` and
/// register it with the MMIO interposition.
pub fn init(base_phys: u64) {
    assert!(base_phys != 0);
    if ITS.get().is_some() {
        panic!("only a single ITS is supported");
    }
    log!("GIC-ITS at 0x{:x}", base_phys);

    let frame = mapper::mapmem_hphys(base_phys, GITS_SIZE, MapFlags::WRITE | MapFlags::UC)
        .expect("ITS register window");
    let io = HwRegIo { base: frame };

    let typer = io.read64(GITS_TYPER);
    // Devbits/IDbits are 0-based field widths; a raw 31 means all 32 bits.
    let dev_id_mask = ((1u64 << (((typer >> 13) & 0x1F) + 1)) - 1) as u32;
    let event_id_mask = ((1u64 << (((typer >> 8) & 0x1F) + 1)) - 1) as u32;

    let gicd = vgic::gicd();
    let shadow = Arc::new(ItsShadow {
        base_phys,
        io: Box::new(io),
        inner: Mutex::new(ItsInner::new(
            gicd.nids,
            gicd.n_lpis,
            dev_id_mask,
            event_id_mask,
        )),
    });

    mmio::register(base_phys, GITS_SIZE, shadow.clone())
        .expect("ITS MMIO registration");
    ITS.call_once(|| shadow);
}

fn its() -> &'static Arc<ItsShadow> {
    ITS.get().expect("ITS not initialized")
}

/// Fire a pass-through device's interrupt on the guest's behalf: queue an
/// `INT` command after confirming the mapping is still live.
pub fn gic_its_int_set(dev_id: u32, event_id: u32) {
    let s = its();
    let mut inner = s.inner.lock();

    if inner.check_valid_map(dev_id, event_id) && inner.cmd_ready {
        let cmd = ItsCmd {
            data: [
                CMD_INT | ((dev_id as u64) << 32),
                event_id as u64,
                0,
                0,
            ],
        };
        inner.h_pending.push_back(cmd);
        if inner.g_running == 0 {
            if inner.submit_cmds(&*s.io, HOST_CMD, 0) > 0 {
                inner.wait_cmds(&*s.io);
            }
        }
    }
}

/// Does physical LPI `pint` still belong to `(dev_id, event_id)`?
/// Returns (match, mapping-still-valid).
pub fn gic_its_pintd_match(pint: u32, dev_id: u32, event_id: u32) -> (bool, bool) {
    let s = its();
    let inner = s.inner.lock();
    inner.pintd_match(pint, dev_id, event_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NIDS: u32 = 65536;
    const N_LPIS: u32 = NIDS - LPI_START;

    fn inner() -> ItsInner {
        ItsInner::new(NIDS, N_LPIS, 0xFFFF_FFFF, 0xFFFF_FFFF)
    }

    fn mapd(dev: u32, itt: u64, valid: bool) -> ItsCmd {
        ItsCmd {
            data: [
                CMD_MAPD | ((dev as u64) << 32),
                0,
                (itt << 8) | if valid { MAPD_VALID } else { 0 },
                0,
            ],
        }
    }

    fn mapti(dev: u32, event: u32, pint: u32) -> ItsCmd {
        ItsCmd {
            data: [
                CMD_MAPTI | ((dev as u64) << 32),
                event as u64 | ((pint as u64) << 32),
                0,
                0,
            ],
        }
    }

    fn discard(dev: u32, event: u32) -> ItsCmd {
        ItsCmd {
            data: [CMD_DISCARD | ((dev as u64) << 32), event as u64, 0, 0],
        }
    }

    #[test]
    fn mapd_mapti_then_match() {
        let mut it = inner();
        it.hook_cmd(&mapd(5, 0x8000, true));
        it.hook_cmd(&mapti(5, 3, 0x8200));
        assert_eq!(it.pintd_match(0x8200, 5, 3), (true, true));
    }

    #[test]
    fn discard_invalidates_but_still_matches() {
        let mut it = inner();
        it.hook_cmd(&mapd(5, 0x8000, true));
        it.hook_cmd(&mapti(5, 3, 0x8200));
        it.hook_cmd(&discard(5, 3));
        assert_eq!(it.pintd_match(0x8200, 5, 3), (true, false));
    }

    #[test]
    fn itt_base_change_drops_events() {
        let mut it = inner();
        it.hook_cmd(&mapd(5, 0x8000, true));
        it.hook_cmd(&mapti(5, 3, 0x8200));
        it.hook_cmd(&mapd(5, 0x9000, true));
        let (matched, _) = it.pintd_match(0x8200, 5, 3);
        assert!(!matched);
    }

    #[test]
    fn mapi_uses_event_as_pint() {
        let mut it = inner();
        it.hook_cmd(&mapd(7, 0x4000, true));
        it.hook_cmd(&ItsCmd {
            data: [CMD_MAPI | (7u64 << 32), 0x9000, 0, 0],
        });
        assert_eq!(it.pintd_match(0x9000, 7, 0x9000), (true, true));
    }

    #[test]
    fn out_of_range_pint_never_matches() {
        let it = inner();
        assert_eq!(it.pintd_match(LPI_START - 1, 0, 0), (false, false));
        assert_eq!(it.pintd_match(NIDS, 0, 0), (false, false));
    }

    // ── Ring flow against a fake register frame ─────────────────────────

    use alloc::collections::BTreeMap as Map;

    /// Register frame that completes every command instantly: CREADR
    /// mirrors whatever CWRITER was last written.
    struct InstantIo {
        regs: Mutex<Map<u64, u64>>,
    }

    impl InstantIo {
        fn new() -> Self {
            InstantIo {
                regs: Mutex::new(Map::new()),
            }
        }
    }

    impl ItsRegIo for InstantIo {
        fn read32(&self, off: u64) -> u32 {
            *self.regs.lock().get(&off).unwrap_or(&0) as u32
        }
        fn write32(&self, off: u64, val: u32) {
            self.regs.lock().insert(off, val as u64);
        }
        fn read64(&self, off: u64) -> u64 {
            if off == GITS_CREADR {
                return *self.regs.lock().get(&GITS_CWRITER).unwrap_or(&0);
            }
            *self.regs.lock().get(&off).unwrap_or(&0)
        }
        fn write64(&self, off: u64, val: u64) {
            self.regs.lock().insert(off, val);
        }
    }

    /// Wire an inner to host + guest rings living in test memory.
    fn install_rings(it: &mut ItsInner, g: &mut Vec<ItsCmd>, h: &mut Vec<ItsCmd>) {
        it.g_ring = g.as_mut_ptr();
        it.h_ring = h.as_mut_ptr();
        it.h_ring_phys = 0x9000_0000;
        it.nidx = g.len() as u64;
        it.cbase_nbytes = (g.len() * core::mem::size_of::<ItsCmd>()) as u64;
        it.cmd_ready = true;
    }

    #[test]
    fn cwriter_copies_and_hooks_guest_commands() {
        let io = InstantIo::new();
        let mut it = inner();
        let mut g = vec![ItsCmd::default(); 8];
        let mut h = vec![ItsCmd::default(); 8];
        g[0] = mapd(5, 0x8000, true);
        g[1] = mapti(5, 3, 0x8200);
        install_rings(&mut it, &mut g, &mut h);

        let mut data = 2u64 << RING_IDX_SHIFT;
        it.handle_cwriter(&io, true, &mut data);

        // Both commands copied to the shadow ring and hooked.
        assert_eq!(h[0], mapd(5, 0x8000, true));
        assert_eq!(h[1], mapti(5, 3, 0x8200));
        assert_eq!(it.pintd_match(0x8200, 5, 3), (true, true));
        assert_eq!(it.g_running, 2);
        // The real doorbell was rung at index 2.
        assert_eq!(io.read64(GITS_CWRITER), 2u64 << RING_IDX_SHIFT);

        // The guest polls CREADR: completion advances the logical head.
        let mut out = 0u64;
        it.handle_creadr(&io, false, &mut out);
        assert_eq!(out, 2u64 << RING_IDX_SHIFT);
        assert_eq!(it.g_running, 0);
    }

    #[test]
    fn ring_keeps_one_slot_empty() {
        let io = InstantIo::new();
        let mut it = inner();
        let mut g = vec![ItsCmd::default(); 4];
        let mut h = vec![ItsCmd::default(); 4];
        install_rings(&mut it, &mut g, &mut h);

        for _ in 0..4 {
            it.g_pending.push_back(mapd(1, 0x1000, true));
        }
        let submitted = it.submit_cmds(&io, GUEST_CMD, 0);
        assert_eq!(submitted, 3, "one slot must stay reserved");
        assert_eq!(it.g_pending.len(), 1);
    }

    #[test]
    fn int_set_waits_between_guest_batches() {
        let io = InstantIo::new();
        let mut it = inner();
        let mut g = vec![ItsCmd::default(); 8];
        let mut h = vec![ItsCmd::default(); 8];
        g[0] = mapd(5, 0x8000, true);
        g[1] = mapti(5, 3, 0x8200);
        install_rings(&mut it, &mut g, &mut h);

        let mut data = 2u64 << RING_IDX_SHIFT;
        it.handle_cwriter(&io, true, &mut data);
        let mut out = 0u64;
        it.handle_creadr(&io, false, &mut out);

        // No guest batch in flight: a host INT submits immediately.
        assert!(it.check_valid_map(5, 3));
        it.h_pending.push_back(ItsCmd {
            data: [CMD_INT | (5u64 << 32), 3, 0, 0],
        });
        assert_eq!(it.g_running, 0);
        let n = it.submit_cmds(&io, HOST_CMD, 0);
        assert_eq!(n, 1);
        it.wait_cmds(&io);
        assert_eq!(h[2].data[0] & 0xFF, CMD_INT);
        assert_eq!(it.h_head, it.h_tail);
    }

    #[test]
    fn cbaser_read_masks_reserved_bits() {
        let io = InstantIo::new();
        let mut it = inner();
        // A raw value with the implementation-defined bits lit.
        it.g_cbase_raw = 0xFFFF_FFFF_FFFF_FFFF;
        let mut out = 0u64;
        it.handle_cbaser(&io, false, &mut out);
        assert_eq!(out, CBASER_READ_MASK);
        assert_eq!(out & (1 << 62), 0);
        assert_eq!(out & (1 << 8), 0);
    }

    #[test]
    fn frame_locate_covers_command_registers() {
        let (unit, iosize, _) = locate_reg(GITS_CBASER).unwrap();
        assert_eq!((unit, iosize), (GITS_CBASER, 8));
        let (unit, _, _) = locate_reg(GITS_CWRITER + 4).unwrap();
        assert_eq!(unit, GITS_CWRITER);
        // Inside a filler run.
        let (unit, iosize, _) = locate_reg(0x1C + 8).unwrap();
        assert_eq!((unit, iosize), (0x24, 4));
    }
}

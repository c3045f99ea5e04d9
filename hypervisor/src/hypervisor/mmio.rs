//! MMIO interposition registry.
//!
//! Drivers register handlers over guest-physical ranges. Registration
//! groups handlers into page-aligned *blocks*; each block punches a
//! stage-2 hole (`mmu::hook_ipa`) so every guest access to those pages
//! faults into the dispatcher. Within a block, handlers are byte-granular
//! and never overlap.
//!
//! Dispatch runs under the reader side of a spin rwlock with an in-flight
//! counter. Mutations that arrive while any dispatch is in flight are
//! queued and replayed, in submission order, by the dispatcher that
//! finishes last — handler code never waits on a registration and
//! registration never waits on handler code.

use super::mapper;
use super::mmu::{self, IpaHook};
use super::vm;
use super::MapFlags;
use crate::memory::PAGE_MASK;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::{Mutex, RwLock};

/// A registered MMIO interposer. Return `true` when the access was
/// handled; `false` lets it fall through to the real guest-physical
/// memory.
pub trait MmioHandler: Send + Sync {
    fn access(&self, gphys: u64, wr: bool, buf: &mut [u8], flags: MapFlags) -> bool;
}

/// Registration cookie; hand it back to `unregister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioCookie {
    gphys: u64,
    len: u64,
}

struct HandlerInfo {
    gphys: u64,
    len: u64,
    handler: Arc<dyn MmioHandler>,
}

struct Block {
    start: u64,
    len: u64,
    hook: Option<IpaHook>,
    handlers: BTreeMap<u64, HandlerInfo>,
}

impl Block {
    fn end_incl(&self) -> u64 {
        self.start + self.len - 1
    }
}

enum Action {
    Register {
        gphys: u64,
        len: u64,
        handler: Arc<dyn MmioHandler>,
    },
    Unregister(MmioCookie),
}

static BLOCKS: RwLock<BTreeMap<u64, Block>> = RwLock::new(BTreeMap::new());
static RUNNING: AtomicUsize = AtomicUsize::new(0);
static PENDING: Mutex<VecDeque<Action>> = Mutex::new(VecDeque::new());

pub fn init() {
    // The maps are statically initialized; nothing to do until the first
    // registration.
}

/// Insert a handler into `block`, refusing byte overlap with an existing
/// one. Returns the overlapping range on failure.
fn add_handler(
    block: &mut Block,
    gphys: u64,
    len: u64,
    handler: Arc<dyn MmioHandler>,
) -> Result<(), (u64, u64)> {
    if let Some((_, h)) = block.handlers.range(..=gphys).next_back() {
        if h.gphys + h.len - 1 >= gphys {
            return Err((h.gphys, h.len));
        }
    }
    if let Some((_, h)) = block.handlers.range(gphys..).next() {
        if gphys + len - 1 >= h.gphys {
            return Err((h.gphys, h.len));
        }
    }
    block.handlers.insert(
        gphys,
        HandlerInfo {
            gphys,
            len,
            handler,
        },
    );
    Ok(())
}

/// The block covering `[start, end]`, if one exists.
fn covering_block_key(blocks: &BTreeMap<u64, Block>, start: u64, end: u64) -> Option<u64> {
    let (key, b) = blocks.range(..=start).next_back()?;
    if b.start <= start && b.end_incl() >= end {
        Some(*key)
    } else {
        None
    }
}

fn do_register(
    blocks: &mut BTreeMap<u64, Block>,
    gphys: u64,
    len: u64,
    handler: Arc<dyn MmioHandler>,
) -> bool {
    let block_start = gphys & !PAGE_MASK;
    let block_end = (gphys + len - 1) | PAGE_MASK;

    let key = match covering_block_key(blocks, block_start, block_end) {
        Some(k) => k,
        None => {
            // No covering block. The new one must not touch a neighbour.
            if let Some((_, left)) = blocks.range(..=block_start).next_back() {
                if left.end_incl() >= block_start {
                    log_warn!(
                        "MMIO register 0x{:x}+0x{:x} overlaps block 0x{:x}+0x{:x}",
                        gphys,
                        len,
                        left.start,
                        left.len
                    );
                    return false;
                }
            }
            if let Some((_, right)) = blocks.range(block_start..).next() {
                if block_end >= right.start {
                    log_warn!(
                        "MMIO register 0x{:x}+0x{:x} overlaps block 0x{:x}+0x{:x}",
                        gphys,
                        len,
                        right.start,
                        right.len
                    );
                    return false;
                }
            }
            let aligned_len = block_end - block_start + 1;
            blocks.insert(
                block_start,
                Block {
                    start: block_start,
                    len: aligned_len,
                    hook: Some(mmu::hook_ipa(block_start, aligned_len)),
                    handlers: BTreeMap::new(),
                },
            );
            block_start
        }
    };

    let block = blocks.get_mut(&key).unwrap();
    match add_handler(block, gphys, len, handler) {
        Ok(()) => true,
        Err((og, ol)) => {
            log_warn!(
                "MMIO register 0x{:x}+0x{:x} overlaps handler 0x{:x}+0x{:x}",
                gphys,
                len,
                og,
                ol
            );
            // A block created just for this handler must not leak.
            let block = blocks.get_mut(&key).unwrap();
            if block.handlers.is_empty() {
                let b = blocks.remove(&key).unwrap();
                if let Some(hook) = b.hook {
                    mmu::unhook_ipa(hook);
                }
            }
            false
        }
    }
}

fn do_unregister(blocks: &mut BTreeMap<u64, Block>, cookie: MmioCookie) -> bool {
    let block_start = cookie.gphys & !PAGE_MASK;
    let block_end = (cookie.gphys + cookie.len - 1) | PAGE_MASK;
    let key = match covering_block_key(blocks, block_start, block_end) {
        Some(k) => k,
        None => {
            log_warn!("MMIO unregister: no block covers 0x{:x}", cookie.gphys);
            return false;
        }
    };

    let block = blocks.get_mut(&key).unwrap();
    if block.handlers.remove(&cookie.gphys).is_none() {
        log_warn!("MMIO unregister: no handler at 0x{:x}", cookie.gphys);
        return false;
    }
    if block.handlers.is_empty() {
        let b = blocks.remove(&key).unwrap();
        if let Some(hook) = b.hook {
            mmu::unhook_ipa(hook);
        }
    }
    true
}

/// Register a handler over `[gphys, gphys + len)`. Overlap with an
/// existing registration fails (deterministically, and fatally when done
/// in place — a driver asking twice for the same range is a bug).
pub fn register(gphys: u64, len: u64, handler: Arc<dyn MmioHandler>) -> Option<MmioCookie> {
    if len == 0 {
        return None;
    }
    let cookie = MmioCookie { gphys, len };
    loop {
        if let Some(mut blocks) = BLOCKS.try_write() {
            let ok = do_register(&mut blocks, gphys, len, handler);
            drop(blocks);
            if !ok {
                panic!("MMIO handler registration failed at 0x{:x}", gphys);
            }
            return Some(cookie);
        }
        if RUNNING.load(Ordering::Acquire) > 0 {
            // A dispatch is in flight; the mutation replays after it.
            PENDING.lock().push_back(Action::Register {
                gphys,
                len,
                handler,
            });
            return Some(cookie);
        }
        core::hint::spin_loop();
    }
}

/// Remove a registration. The block disappears (and the stage-2 hook is
/// released) when its last handler departs.
pub fn unregister(cookie: MmioCookie) {
    loop {
        if let Some(mut blocks) = BLOCKS.try_write() {
            let ok = do_unregister(&mut blocks, cookie);
            drop(blocks);
            if !ok {
                panic!("MMIO handler unregistration failed at 0x{:x}", cookie.gphys);
            }
            return;
        }
        if RUNNING.load(Ordering::Acquire) > 0 {
            PENDING.lock().push_back(Action::Unregister(cookie));
            return;
        }
        core::hint::spin_loop();
    }
}

/// Direct access to guest-physical memory, bypassing the registry.
pub(crate) fn direct_access(gphys: u64, wr: bool, buf: &mut [u8], flags: MapFlags) {
    let len = buf.len() as u64;
    let map_flags = flags | if wr { MapFlags::WRITE } else { MapFlags::empty() };
    let p = mapper::mapmem_as(vm::current_as(), gphys, len, map_flags)
        .expect("guest-physical window");
    unsafe {
        // Power-of-two sizes keep their single-access semantics (device
        // memory cares); anything else is served bytewise.
        match (buf.len(), wr) {
            (1, false) => buf[0] = p.read_volatile(),
            (1, true) => p.write_volatile(buf[0]),
            (2, false) => buf.copy_from_slice(&(p as *const u16).read_volatile().to_le_bytes()),
            (2, true) => (p as *mut u16).write_volatile(u16::from_le_bytes([buf[0], buf[1]])),
            (4, false) => buf.copy_from_slice(&(p as *const u32).read_volatile().to_le_bytes()),
            (4, true) => {
                (p as *mut u32).write_volatile(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
            }
            (8, false) => buf.copy_from_slice(&(p as *const u64).read_volatile().to_le_bytes()),
            (8, true) => {
                let mut b = [0u8; 8];
                b.copy_from_slice(buf);
                (p as *mut u64).write_volatile(u64::from_le_bytes(b));
            }
            (n, false) => {
                for i in 0..n {
                    buf[i] = p.add(i).read_volatile();
                }
            }
            (n, true) => {
                for i in 0..n {
                    p.add(i).write_volatile(buf[i]);
                }
            }
        }
    }
    mapper::unmapmem(p, len);
}

/// Dispatch one access across the handlers of the covering block. Every
/// byte is served exactly once: by the one handler covering it, or by
/// `direct` where no handler (or a declining handler) covers it.
fn dispatch<F>(
    blocks: &BTreeMap<u64, Block>,
    gphys: u64,
    wr: bool,
    buf: &mut [u8],
    flags: MapFlags,
    mut direct: F,
) -> bool
where
    F: FnMut(u64, bool, &mut [u8], MapFlags),
{
    let len = buf.len() as u64;
    let gphys_end = gphys + len - 1;

    // The access may land inside a block without starting on its key.
    let block = match blocks.range(..=gphys).next_back() {
        Some((_, b)) if b.end_incl() >= gphys => Some(b),
        _ => match blocks.range(gphys..).next() {
            Some((_, b)) if gphys_end >= b.start => Some(b),
            _ => None,
        },
    };
    let block = match block {
        Some(b) => b,
        None => return false,
    };

    let mut start = gphys;
    let mut off = 0usize;
    let mut remaining = len;

    for h in block.handlers.values() {
        if remaining == 0 {
            break;
        }
        let h_end = h.gphys + h.len; // exclusive
        if h_end <= start {
            continue;
        }
        if start < h.gphys {
            let gap = (h.gphys - start).min(remaining) as usize;
            direct(start, wr, &mut buf[off..off + gap], flags);
            start += gap as u64;
            off += gap;
            remaining -= gap as u64;
            if remaining == 0 {
                break;
            }
        }
        let span = (h_end - start).min(remaining) as usize;
        if !h
            .handler
            .access(start, wr, &mut buf[off..off + span], flags)
        {
            direct(start, wr, &mut buf[off..off + span], flags);
        }
        start += span as u64;
        off += span;
        remaining -= span as u64;
    }

    if remaining > 0 {
        direct(start, wr, &mut buf[off..], flags);
    }
    true
}

fn replay_pending(blocks: &mut BTreeMap<u64, Block>) {
    loop {
        let action = PENDING.lock().pop_front();
        let action = match action {
            Some(a) => a,
            None => break,
        };
        let ok = match action {
            Action::Register {
                gphys,
                len,
                handler,
            } => do_register(blocks, gphys, len, handler),
            Action::Unregister(cookie) => do_unregister(blocks, cookie),
        };
        if !ok {
            panic!("replaying deferred MMIO registry mutation failed");
        }
    }
}

/// Serve a guest access of `buf.len()` bytes at `gphys`. Returns whether a
/// registered block covered the access; `false` means the caller should
/// fall through to plain guest-physical memory.
pub fn call_handler(gphys: u64, wr: bool, buf: &mut [u8], flags: MapFlags) -> bool {
    let handled;
    {
        let blocks = BLOCKS.read();
        RUNNING.fetch_add(1, Ordering::AcqRel);
        handled = dispatch(&blocks, gphys, wr, buf, flags, direct_access);
        RUNNING.fetch_sub(1, Ordering::AcqRel);
    }

    // Deferred mutations replay under the writer lock, with no handler
    // running.
    let mut blocks = BLOCKS.write();
    replay_pending(&mut blocks);

    handled
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use core::sync::atomic::AtomicBool;

    fn setup() {
        crate::hypervisor::mmu::init();
        crate::hypervisor::mmu::init_stage2();
    }

    /// Handler that fills reads with a constant byte and records writes.
    struct Fill(u8);
    impl MmioHandler for Fill {
        fn access(&self, _gphys: u64, wr: bool, buf: &mut [u8], _flags: MapFlags) -> bool {
            if !wr {
                buf.fill(self.0);
            }
            true
        }
    }

    /// Handler that always declines.
    struct Decline;
    impl MmioHandler for Decline {
        fn access(&self, _g: u64, _w: bool, _b: &mut [u8], _f: MapFlags) -> bool {
            false
        }
    }

    #[test]
    fn overlapping_registrations_fail() {
        setup();
        let mut blocks = BTreeMap::new();
        assert!(do_register(&mut blocks, 0x10_0000, 0x10, Arc::new(Fill(1))));
        // Same range again.
        assert!(!do_register(&mut blocks, 0x10_0000, 0x10, Arc::new(Fill(2))));
        // Byte overlap at the tail.
        assert!(!do_register(&mut blocks, 0x10_000F, 0x10, Arc::new(Fill(3))));
        // Adjacent is fine.
        assert!(do_register(&mut blocks, 0x10_0010, 0x10, Arc::new(Fill(4))));
    }

    #[test]
    fn dispatch_covers_every_byte_exactly_once() {
        setup();
        let mut blocks = BTreeMap::new();
        // Two handlers with a 4-byte gap between them.
        assert!(do_register(&mut blocks, 0x20_0004, 4, Arc::new(Fill(0xAA))));
        assert!(do_register(&mut blocks, 0x20_000C, 4, Arc::new(Fill(0xBB))));

        let mut buf = vec![0u8; 16];
        let handled = dispatch(
            &blocks,
            0x20_0000,
            false,
            &mut buf,
            MapFlags::empty(),
            |gphys, _wr, out, _f| {
                // Mock direct memory: each byte is its low address byte.
                for (i, b) in out.iter_mut().enumerate() {
                    *b = (gphys + i as u64) as u8;
                }
            },
        );
        assert!(handled);
        // 0..4 direct, 4..8 handler AA, 8..C direct, C..10 handler BB.
        assert_eq!(&buf[0..4], &[0x00, 0x01, 0x02, 0x03]);
        assert_eq!(&buf[4..8], &[0xAA; 4]);
        assert_eq!(&buf[8..12], &[0x08, 0x09, 0x0A, 0x0B]);
        assert_eq!(&buf[12..16], &[0xBB; 4]);
    }

    #[test]
    fn declining_handler_falls_through_to_direct() {
        setup();
        let mut blocks = BTreeMap::new();
        assert!(do_register(&mut blocks, 0x30_0000, 8, Arc::new(Decline)));
        let mut buf = vec![0u8; 8];
        let handled = dispatch(
            &blocks,
            0x30_0000,
            false,
            &mut buf,
            MapFlags::empty(),
            |_g, _w, out, _f| out.fill(0x5A),
        );
        assert!(handled);
        assert_eq!(&buf[..], &[0x5A; 8]);
    }

    #[test]
    fn last_unregister_removes_the_block() {
        setup();
        let mut blocks = BTreeMap::new();
        assert!(do_register(&mut blocks, 0x50_0000, 0x10, Arc::new(Fill(1))));
        assert!(do_register(&mut blocks, 0x50_0020, 0x10, Arc::new(Fill(2))));
        assert_eq!(blocks.len(), 1);

        assert!(do_unregister(
            &mut blocks,
            MmioCookie {
                gphys: 0x50_0000,
                len: 0x10
            }
        ));
        // One handler left: the block survives.
        assert_eq!(blocks.len(), 1);

        assert!(do_unregister(
            &mut blocks,
            MmioCookie {
                gphys: 0x50_0020,
                len: 0x10
            }
        ));
        // Last handler gone: block and stage-2 hook released.
        assert!(blocks.is_empty());
    }

    #[test]
    fn unregister_of_unknown_handler_fails() {
        setup();
        let mut blocks = BTreeMap::new();
        assert!(do_register(&mut blocks, 0x60_0000, 0x10, Arc::new(Fill(1))));
        assert!(!do_unregister(
            &mut blocks,
            MmioCookie {
                gphys: 0x60_0004,
                len: 0x4
            }
        ));
    }

    #[test]
    fn access_outside_any_block_is_unhandled() {
        setup();
        let blocks = BTreeMap::new();
        let mut buf = [0u8; 4];
        assert!(!dispatch(
            &blocks,
            0x7777_0000,
            false,
            &mut buf,
            MapFlags::empty(),
            |_g, _w, _o, _f| panic!("no direct access expected"),
        ));
    }

    #[test]
    fn mutations_during_dispatch_replay_in_order() {
        setup();

        // From handler context (dispatch in flight), registration and
        // unregistration of the same range both defer. Replay must apply
        // them in submission order — reversed, the unregister would find
        // nothing and the replay would be fatal.
        struct Registrar {
            fired: AtomicBool,
        }
        impl MmioHandler for Registrar {
            fn access(&self, _g: u64, _w: bool, buf: &mut [u8], _f: MapFlags) -> bool {
                if !self.fired.swap(true, Ordering::SeqCst) {
                    let a = register(0x40_1000, 0x8, Arc::new(Fill(0x11))).unwrap();
                    unregister(a);
                }
                buf.fill(0);
                true
            }
        }

        let cookie = register(
            0x40_0000,
            8,
            Arc::new(Registrar {
                fired: AtomicBool::new(false),
            }),
        )
        .unwrap();

        let mut buf = [0u8; 8];
        assert!(call_handler(0x40_0000, false, &mut buf, MapFlags::empty()));

        // Both deferred actions replayed cleanly, in order: the handler at
        // 0x40_1000 came and went.
        {
            let blocks = BLOCKS.read();
            assert!(covering_block_key(&blocks, 0x40_1000, 0x40_1FFF).is_none());
        }

        unregister(cookie);
    }
}

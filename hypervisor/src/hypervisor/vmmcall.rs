//! VMM-call multiplexer (HVC #0 from the guest).
//!
//! Cooperative drivers inside the guest may call into the hypervisor.
//! Calls are registered by number and name; the guest selects one in x0
//! and gets results back in x0 (and upward). Call number 0 is the
//! built-in lookup: the guest passes the virtual address of a call name
//! in x1 and receives the call's number, so drivers never hard-code
//! anything beyond "0 means lookup". Unknown numbers and names report
//! failure — a guest probing for a hypervisor it does not have must see
//! a clean error, not an exception.

use super::trap::TrapFrame;
use super::{gmm, mmu};
use alloc::collections::BTreeMap;
use spin::RwLock;

pub const VMMCALL_ERROR: u64 = u64::MAX;
/// The built-in name-to-number lookup.
pub const VMMCALL_GET_FNUM: u64 = 0;

const MAX_NAME_LEN: usize = 64;

pub type VmmCallFn = fn(&mut TrapFrame);

struct Entry {
    name: &'static str,
    func: VmmCallFn,
}

static CALLS: RwLock<BTreeMap<u64, Entry>> = RwLock::new(BTreeMap::new());

/// Register a VMM call under `num`. Double registration is a driver bug.
pub fn register(num: u64, name: &'static str, func: VmmCallFn) {
    if num == VMMCALL_GET_FNUM {
        panic!("VMM call 0 is reserved for the name lookup");
    }
    let mut calls = CALLS.write();
    if calls.insert(num, Entry { name, func }).is_some() {
        panic!("VMM call {} registered twice", num);
    }
    log_debug!("VMM call {} -> {}", num, name);
}

/// Read the NUL-terminated call name the guest points x1 at.
fn read_guest_name(r: &TrapFrame, buf: &mut [u8; MAX_NAME_LEN]) -> Option<usize> {
    let el = r.source_el();
    let mut len = 0;
    while len < MAX_NAME_LEN {
        let gvirt = r.x[1] + len as u64;
        let (ipa, flags) = mmu::gvirt_to_ipa(gvirt, el, false).ok()?;
        let b = gmm::read_gphys(ipa, 1, flags) as u8;
        if b == 0 {
            return Some(len);
        }
        buf[len] = b;
        len += 1;
    }
    None // unterminated name
}

fn get_fnum(r: &mut TrapFrame) {
    let mut buf = [0u8; MAX_NAME_LEN];
    let len = match read_guest_name(r, &mut buf) {
        Some(l) => l,
        None => {
            r.x[0] = VMMCALL_ERROR;
            return;
        }
    };
    let wanted = &buf[..len];
    let calls = CALLS.read();
    for (num, e) in calls.iter() {
        if e.name.as_bytes() == wanted {
            r.x[0] = *num;
            return;
        }
    }
    r.x[0] = VMMCALL_ERROR;
}

/// Dispatch the call selected by x0.
pub fn dispatch(r: &mut TrapFrame) {
    let num = r.x[0];
    if num == VMMCALL_GET_FNUM {
        get_fnum(r);
        return;
    }
    let func = {
        let calls = CALLS.read();
        calls.get(&num).map(|e| e.func)
    };
    match func {
        Some(f) => f(r),
        None => {
            log_warn!("unknown VMM call {}", num);
            r.x[0] = VMMCALL_ERROR;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(r: &mut TrapFrame) {
        r.x[0] = 0;
        r.x[1] = 42;
    }

    #[test]
    fn registered_call_runs() {
        register(7001, "answer", answer);
        let mut r = TrapFrame::zeroed();
        r.x[0] = 7001;
        dispatch(&mut r);
        assert_eq!(r.x[0], 0);
        assert_eq!(r.x[1], 42);
    }

    #[test]
    fn unknown_call_reports_error() {
        let mut r = TrapFrame::zeroed();
        r.x[0] = 0xDEAD_0001;
        dispatch(&mut r);
        assert_eq!(r.x[0], VMMCALL_ERROR);
    }
}

//! DSDT `_SB.PCI0._CRS` parsing.
//!
//! A full AML interpreter is far outside this core; the `_CRS` resource
//! buffer of the first PCI host bridge has a rigid enough shape to walk
//! directly: `Name(_CRS, Buffer(len) { resource descriptors })`. The
//! descriptors of interest are the large address-space descriptors
//! (WORD/DWORD/QWORD/extended), which carry the PCI→CPU address
//! translation ranges.

use crate::pci::PciRange;
use alloc::vec::Vec;

const AML_NAME_OP: u8 = 0x08;
const AML_BUFFER_OP: u8 = 0x11;
const AML_BYTE_CONST: u8 = 0x0A;
const AML_WORD_CONST: u8 = 0x0B;

const ASRD_TAG_END: u8 = 0x79;
const ASRD_TAG_DWORD: u8 = 0x87;
const ASRD_TAG_WORD: u8 = 0x88;
const ASRD_TAG_QWORD: u8 = 0x8A;
const ASRD_TAG_EXT: u8 = 0x8B;

const ASRD_TYPE_MM: u8 = 0x0;
const ASRD_TYPE_IO: u8 = 0x1;

const ASRD_MM_SFLAGS_MM_TO_IO: u8 = 1 << 5;
const ASRD_IO_SFLAGS_IO_TO_MM: u8 = 1 << 4;
const ASRD_IO_SFLAGS_SPARSE_TL: u8 = 1 << 5;

fn is_large_res(tag: u8) -> bool {
    tag & 0x80 != 0
}

fn le16(b: &[u8], off: usize) -> u64 {
    u16::from_le_bytes(b[off..off + 2].try_into().unwrap()) as u64
}

fn le32(b: &[u8], off: usize) -> u64 {
    u32::from_le_bytes(b[off..off + 4].try_into().unwrap()) as u64
}

fn le64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

/// Extract (min, max, translation offset, length) from one address-space
/// resource descriptor body. The body starts at the type byte, so the
/// range fields sit behind type/flags/specific-flags (and the revision
/// pair for the extended form) plus the granularity field.
fn asrd_extract(tag: u8, body: &[u8]) -> Option<(u64, u64, u64, u64)> {
    match tag {
        ASRD_TAG_WORD if body.len() >= 13 => Some((
            le16(body, 5),
            le16(body, 7),
            le16(body, 9),
            le16(body, 11),
        )),
        ASRD_TAG_DWORD if body.len() >= 23 => Some((
            le32(body, 7),
            le32(body, 11),
            le32(body, 15),
            le32(body, 19),
        )),
        ASRD_TAG_QWORD if body.len() >= 43 => Some((
            le64(body, 11),
            le64(body, 19),
            le64(body, 27),
            le64(body, 35),
        )),
        ASRD_TAG_EXT if body.len() >= 45 => Some((
            le64(body, 13),
            le64(body, 21),
            le64(body, 29),
            le64(body, 37),
        )),
        _ => None,
    }
}

fn record_res(tag: u8, desc: &[u8], out: &mut Vec<PciRange>) {
    // desc: large-res header (tag, u16 size) then type, flags, specific
    // flags, then the granularity/min/max/offset/length fields.
    if desc.len() < 6 {
        return;
    }
    let ty = desc[3];
    let sflags = desc[5];
    if ty != ASRD_TYPE_MM && ty != ASRD_TYPE_IO {
        return;
    }
    if ty == ASRD_TYPE_MM && sflags & ASRD_MM_SFLAGS_MM_TO_IO != 0 {
        log_warn!("MM-to-IO address translation range, skipping");
        return;
    }
    let (min, max, tl_offset, len) = match asrd_extract(tag, &desc[3..]) {
        Some(v) => v,
        None => {
            log_warn!("short address-space descriptor tag 0x{:x}", tag);
            return;
        }
    };
    let io = ty == ASRD_TYPE_IO;
    let io_to_mm = io && sflags & ASRD_IO_SFLAGS_IO_TO_MM != 0;
    let io_sparse = io_to_mm && sflags & ASRD_IO_SFLAGS_SPARSE_TL != 0;
    log_debug!(
        "PCI res [0x{:x}-0x{:x}] offset 0x{:x} {}",
        min,
        max,
        tl_offset,
        if io { "io" } else { "mm" }
    );
    out.push(PciRange {
        segment: 0,
        min,
        max,
        tl_offset,
        len,
        io,
        io_to_mm,
        io_sparse,
    });
}

/// AML PkgLength: lead byte's top two bits give the number of extra
/// bytes; returns (value, encoded size).
fn pkg_length(b: &[u8]) -> Option<(usize, usize)> {
    let lead = *b.first()?;
    let extra = (lead >> 6) as usize;
    if extra == 0 {
        return Some(((lead & 0x3F) as usize, 1));
    }
    if b.len() < 1 + extra {
        return None;
    }
    let mut v = (lead & 0x0F) as usize;
    for i in 0..extra {
        v |= (b[1 + i] as usize) << (4 + 8 * i);
    }
    Some((v, 1 + extra))
}

/// Walk a `Buffer(len) { ... }` of resource descriptors.
fn parse_crs_buffer(buf: &[u8], out: &mut Vec<PciRange>) {
    let mut c = 0usize;
    if buf.get(c) != Some(&AML_BUFFER_OP) {
        return;
    }
    c += 1;
    let (_pkglen, pl_size) = match pkg_length(&buf[c..]) {
        Some(v) => v,
        None => return,
    };
    c += pl_size;

    // Buffer size: ByteConst or WordConst.
    let mut remaining = match buf.get(c) {
        Some(&AML_BYTE_CONST) if c + 1 < buf.len() => {
            let v = buf[c + 1] as usize;
            c += 2;
            v
        }
        Some(&AML_WORD_CONST) if c + 2 < buf.len() => {
            let v = le16(buf, c + 1) as usize;
            c += 3;
            v
        }
        _ => return,
    };

    while remaining > 0 && c < buf.len() {
        let tag = buf[c];
        if tag == ASRD_TAG_END {
            break;
        }
        let size = if is_large_res(tag) {
            if c + 3 > buf.len() {
                break;
            }
            le16(buf, c + 1) as usize + 3
        } else {
            (tag & 0x7) as usize + 1
        };
        if c + size > buf.len() {
            break;
        }
        if is_large_res(tag) {
            record_res(tag, &buf[c..c + size], out);
        }
        c += size;
        remaining = remaining.saturating_sub(size);
    }
}

/// Find `Name(_CRS, Buffer...)` in the DSDT and collect its address
/// translation ranges. The first `_CRS` is the PCI0 bridge's on the
/// platforms this supports; multi-segment firmware needs the namespace
/// walker this deliberately is not.
pub fn parse_pci0_crs(dsdt: &[u8]) -> Vec<PciRange> {
    let mut out = Vec::new();
    let needle = [AML_NAME_OP, b'_', b'C', b'R', b'S'];
    let mut i = 0;
    while i + needle.len() < dsdt.len() {
        if dsdt[i..i + needle.len()] == needle {
            parse_crs_buffer(&dsdt[i + needle.len()..], &mut out);
            if !out.is_empty() {
                break;
            }
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn qword_desc(ty: u8, sflags: u8, min: u64, max: u64, off: u64, len: u64) -> Vec<u8> {
        let mut d = vec![ASRD_TAG_QWORD];
        let body_len: u16 = 43; // type + flags + sflags + 5 qwords
        d.extend_from_slice(&body_len.to_le_bytes());
        d.push(ty);
        d.push(0); // general flags
        d.push(sflags);
        d.extend_from_slice(&0u64.to_le_bytes()); // granularity
        d.extend_from_slice(&min.to_le_bytes());
        d.extend_from_slice(&max.to_le_bytes());
        d.extend_from_slice(&off.to_le_bytes());
        d.extend_from_slice(&len.to_le_bytes());
        d
    }

    fn wrap_in_crs(descs: &[u8]) -> Vec<u8> {
        let mut aml = vec![0u8; 8]; // leading junk
        aml.push(AML_NAME_OP);
        aml.extend_from_slice(b"_CRS");
        aml.push(AML_BUFFER_OP);
        // PkgLength, single byte is plenty for the tests.
        aml.push((descs.len() + 3) as u8);
        aml.push(AML_BYTE_CONST);
        aml.push((descs.len() + 2) as u8);
        aml.extend_from_slice(descs);
        aml.push(ASRD_TAG_END);
        aml.push(0); // end-tag checksum byte
        aml
    }

    #[test]
    fn qword_mm_range_parses() {
        let d = qword_desc(ASRD_TYPE_MM, 0, 0x8000_0000, 0xBFFF_FFFF, 0x10_0000_0000, 0x4000_0000);
        let aml = wrap_in_crs(&d);
        let ranges = parse_pci0_crs(&aml);
        assert_eq!(ranges.len(), 1);
        let r = &ranges[0];
        assert_eq!(r.min, 0x8000_0000);
        assert_eq!(r.max, 0xBFFF_FFFF);
        assert_eq!(r.tl_offset, 0x10_0000_0000);
        assert!(!r.io);
    }

    #[test]
    fn sparse_io_flags_carry() {
        let d = qword_desc(
            ASRD_TYPE_IO,
            ASRD_IO_SFLAGS_IO_TO_MM | ASRD_IO_SFLAGS_SPARSE_TL,
            0,
            0xFFFF,
            0x3EFF_0000,
            0x1_0000,
        );
        let aml = wrap_in_crs(&d);
        let ranges = parse_pci0_crs(&aml);
        assert_eq!(ranges.len(), 1);
        assert!(ranges[0].io);
        assert!(ranges[0].io_to_mm);
        assert!(ranges[0].io_sparse);
    }

    #[test]
    fn mm_to_io_is_skipped() {
        let d = qword_desc(ASRD_TYPE_MM, ASRD_MM_SFLAGS_MM_TO_IO, 0, 0xFFF, 0, 0x1000);
        let aml = wrap_in_crs(&d);
        assert!(parse_pci0_crs(&aml).is_empty());
    }

    #[test]
    fn no_crs_no_ranges() {
        let aml = vec![0u8; 64];
        assert!(parse_pci0_crs(&aml).is_empty());
    }
}

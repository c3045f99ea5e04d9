//! ACPI table discovery.
//!
//! Runs once at boot when the firmware provides an RSDP: locate the XSDT,
//! then pull out the three things the core needs — the MADT (GIC
//! distributor and ITS base addresses), the MCFG (PCIe ECAM segments) and
//! the DSDT `_SB.PCI0._CRS` resource buffer (PCI address translation
//! ranges). Results freeze into read-only singletons; the tables are
//! never consulted again.

pub mod madt;
pub mod tables;

#[cfg(feature = "acpi-dsdt")]
pub mod dsdt;

use crate::hypervisor::{mapper, MapFlags};
use crate::pci::{EcamSegment, PciRange};
use alloc::vec::Vec;
use spin::Once;

pub use madt::MadtInfo;

static MADT: Once<MadtInfo> = Once::new();
static MCFG: Once<Vec<EcamSegment>> = Once::new();
static PCI_RANGES: Once<Vec<PciRange>> = Once::new();

/// Copy a whole ACPI table out of firmware memory.
fn read_table_at(phys: u64) -> Vec<u8> {
    let hdr = mapper::mapmem_hphys(phys, tables::SDT_HEADER_LEN as u64, MapFlags::empty())
        .expect("ACPI header window");
    let mut hdr_buf = [0u8; tables::SDT_HEADER_LEN];
    unsafe {
        core::ptr::copy_nonoverlapping(hdr, hdr_buf.as_mut_ptr(), tables::SDT_HEADER_LEN);
    }
    mapper::unmapmem(hdr, tables::SDT_HEADER_LEN as u64);

    let len = tables::sdt_length(&hdr_buf) as usize;
    assert!(len >= tables::SDT_HEADER_LEN);

    let p = mapper::mapmem_hphys(phys, len as u64, MapFlags::empty())
        .expect("ACPI table window");
    let mut buf = alloc::vec![0u8; len];
    unsafe {
        core::ptr::copy_nonoverlapping(p, buf.as_mut_ptr(), len);
    }
    mapper::unmapmem(p, len as u64);
    buf
}

/// Walk the firmware tables starting from the RSDP physical address.
pub fn init(rsdp_phys: u64) {
    let rsdp = mapper::mapmem_hphys(rsdp_phys, tables::RSDP_V2_LEN as u64, MapFlags::empty())
        .expect("RSDP window");
    let mut rsdp_buf = [0u8; tables::RSDP_V2_LEN];
    unsafe {
        core::ptr::copy_nonoverlapping(rsdp, rsdp_buf.as_mut_ptr(), tables::RSDP_V2_LEN);
    }
    mapper::unmapmem(rsdp, tables::RSDP_V2_LEN as u64);

    let xsdt_phys = tables::parse_rsdp(&rsdp_buf).expect("bad RSDP");
    let xsdt = read_table_at(xsdt_phys);
    if !tables::verify_table(&xsdt, b"XSDT") {
        panic!("XSDT failed verification");
    }

    let mut dsdt_phys = 0u64;
    for entry_phys in tables::xsdt_entries(&xsdt) {
        let table = read_table_at(entry_phys);
        if !tables::checksum_ok(&table) {
            log_warn!("ACPI table at 0x{:x} has a bad checksum, skipping", entry_phys);
            continue;
        }
        let sig: [u8; 4] = table[0..4].try_into().unwrap();
        match &sig {
            b"APIC" => {
                let info = madt::parse(&table).expect("MADT walk failed");
                log!(
                    "MADT: GICD 0x{:x}, ITS {:x?}",
                    info.gicd_base,
                    info.its_base
                );
                MADT.call_once(|| info);
            }
            b"MCFG" => {
                let segs = parse_mcfg(&table);
                for s in &segs {
                    log!(
                        "ECAM segment {} at 0x{:x} buses {}-{}",
                        s.seg,
                        s.base,
                        s.bus_start,
                        s.bus_end
                    );
                }
                MCFG.call_once(|| segs);
            }
            b"FACP" => {
                dsdt_phys = tables::fadt_dsdt_addr(&table);
            }
            _ => {}
        }
    }

    #[cfg(feature = "acpi-dsdt")]
    if dsdt_phys != 0 {
        let dsdt_table = read_table_at(dsdt_phys);
        let ranges = dsdt::parse_pci0_crs(&dsdt_table);
        log!("DSDT _SB.PCI0._CRS: {} address ranges", ranges.len());
        PCI_RANGES.call_once(|| ranges);
    }
    #[cfg(not(feature = "acpi-dsdt"))]
    let _ = dsdt_phys;
}

/// MCFG: per-segment ECAM base addresses.
fn parse_mcfg(table: &[u8]) -> Vec<EcamSegment> {
    let mut out = Vec::new();
    // 36-byte header plus 8 reserved bytes, then 16-byte entries.
    let mut off = tables::SDT_HEADER_LEN + 8;
    while off + 16 <= table.len() {
        let base = u64::from_le_bytes(table[off..off + 8].try_into().unwrap());
        let seg = u16::from_le_bytes(table[off + 8..off + 10].try_into().unwrap());
        let bus_start = table[off + 10];
        let bus_end = table[off + 11];
        out.push(EcamSegment {
            base,
            seg: seg as u32,
            bus_start,
            bus_end,
        });
        off += 16;
    }
    out
}

pub fn madt_info() -> &'static MadtInfo {
    MADT.get().expect("MADT not parsed")
}

pub fn mcfg_segments() -> &'static [EcamSegment] {
    MCFG.get().map(|v| v.as_slice()).unwrap_or(&[])
}

pub fn pci_ranges() -> &'static [PciRange] {
    PCI_RANGES.get().map(|v| v.as_slice()).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mcfg_entries_parse() {
        let mut t = alloc::vec![0u8; 36 + 8 + 16];
        t[0..4].copy_from_slice(b"MCFG");
        t[36 + 8..36 + 16].copy_from_slice(&0x40_1000_0000u64.to_le_bytes());
        t[36 + 16] = 0x01; // segment 1 (LE u16)
        t[36 + 18] = 0;
        t[36 + 19] = 0xFF;
        let segs = parse_mcfg(&t);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].base, 0x40_1000_0000);
        assert_eq!(segs[0].seg, 1);
        assert_eq!(segs[0].bus_start, 0);
        assert_eq!(segs[0].bus_end, 0xFF);
    }
}

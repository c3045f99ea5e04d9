//! Flattened device tree discovery.
//!
//! Firmware without ACPI hands over an FDT instead. The core needs very
//! little of it: every `pci-host-ecam-generic` node whose status is
//! "okay" (ECAM base, bus range, segment id and the PCI `ranges`
//! translations), and the GICv3 node with its ITS child. The walker below
//! parses exactly that — structure block tokens, the strings block, and
//! big-endian cells.

use crate::pci::{EcamSegment, PciRange};
use alloc::string::String;
use alloc::vec::Vec;
use spin::Once;

const FDT_MAGIC: u32 = 0xD00D_FEED;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// PCI `ranges` space codes, bits 25:24 of the flags cell.
fn pci_space_code(flags: u32) -> u32 {
    (flags >> 24) & 0x3
}

fn code_is_io(code: u32) -> bool {
    code == 0x1
}

fn code_is_mm(code: u32) -> bool {
    code == 0x2 || code == 0x3
}

fn be32(b: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_be_bytes(b.get(off..off + 4)?.try_into().ok()?))
}

fn be64(b: &[u8], off: usize) -> Option<u64> {
    Some(u64::from_be_bytes(b.get(off..off + 8)?.try_into().ok()?))
}

/// One parsed node: name, tree depth, index of the parent, properties.
struct Node {
    name: String,
    parent: Option<usize>,
    props: Vec<(String, Vec<u8>)>,
}

impl Node {
    fn prop(&self, name: &str) -> Option<&[u8]> {
        self.props
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Does the `compatible` string list contain `what`?
    fn compatible_with(&self, what: &str) -> bool {
        match self.prop("compatible") {
            Some(v) => v
                .split(|b| *b == 0)
                .any(|s| core::str::from_utf8(s) == Ok(what)),
            None => false,
        }
    }

    /// Absent status means enabled, per the specification.
    fn status_okay(&self) -> bool {
        match self.prop("status") {
            Some(v) => v.starts_with(b"okay"),
            None => true,
        }
    }

    /// `#address-cells` / `#size-cells`, with the architectural defaults.
    fn cells(&self) -> (u32, u32) {
        let ac = self.prop("#address-cells").and_then(|v| be32(v, 0)).unwrap_or(2);
        let sc = self.prop("#size-cells").and_then(|v| be32(v, 0)).unwrap_or(1);
        (ac, sc)
    }
}

fn read_cell(v: &[u8], off: &mut usize, cells: u32) -> Option<u64> {
    let val = match cells {
        1 => be32(v, *off)? as u64,
        2 => be64(v, *off)?,
        _ => return None,
    };
    *off += cells as usize * 4;
    Some(val)
}

/// Parse the whole tree into a flat node list.
fn parse_nodes(fdt: &[u8]) -> Option<Vec<Node>> {
    if be32(fdt, 0)? != FDT_MAGIC {
        return None;
    }
    let totalsize = be32(fdt, 4)? as usize;
    if totalsize > fdt.len() {
        return None;
    }
    let off_struct = be32(fdt, 8)? as usize;
    let off_strings = be32(fdt, 12)? as usize;

    let mut nodes: Vec<Node> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut off = off_struct;

    loop {
        let token = be32(fdt, off)?;
        off += 4;
        match token {
            FDT_BEGIN_NODE => {
                let name_start = off;
                let mut end = off;
                while *fdt.get(end)? != 0 {
                    end += 1;
                }
                let name = core::str::from_utf8(&fdt[name_start..end]).ok()?;
                off = (end + 1 + 3) & !3;
                let idx = nodes.len();
                nodes.push(Node {
                    name: String::from(name),
                    parent: stack.last().copied(),
                    props: Vec::new(),
                });
                stack.push(idx);
            }
            FDT_END_NODE => {
                stack.pop()?;
            }
            FDT_PROP => {
                let len = be32(fdt, off)? as usize;
                let nameoff = be32(fdt, off + 4)? as usize;
                off += 8;
                let value = fdt.get(off..off + len)?.to_vec();
                off = (off + len + 3) & !3;

                let name_start = off_strings + nameoff;
                let mut end = name_start;
                while *fdt.get(end)? != 0 {
                    end += 1;
                }
                let pname = core::str::from_utf8(&fdt[name_start..end]).ok()?;

                let cur = *stack.last()?;
                nodes[cur].props.push((String::from(pname), value));
            }
            FDT_NOP => {}
            FDT_END => break,
            _ => return None,
        }
    }

    Some(nodes)
}

/// `reg` of a node, interpreted with the parent's cell counts.
fn node_reg(nodes: &[Node], idx: usize) -> Option<(u64, u64)> {
    let node = &nodes[idx];
    let (ac, sc) = match node.parent {
        Some(p) => nodes[p].cells(),
        None => (2, 1),
    };
    let reg = node.prop("reg")?;
    let mut off = 0usize;
    let addr = read_cell(reg, &mut off, ac)?;
    let size = if sc > 0 {
        read_cell(reg, &mut off, sc)?
    } else {
        0
    };
    Some((addr, size))
}

struct DtbInfo {
    ecam: Vec<EcamSegment>,
    ranges: Vec<PciRange>,
    gicd_base: Option<u64>,
    its_base: Option<u64>,
}

static DTB: Once<DtbInfo> = Once::new();

fn extract_pcie(nodes: &[Node], info: &mut DtbInfo) {
    for (idx, node) in nodes.iter().enumerate() {
        if !node.compatible_with("pci-host-ecam-generic") || !node.status_okay() {
            continue;
        }

        let (ecam_base, _ecam_len) = match node_reg(nodes, idx) {
            Some(r) => r,
            None => {
                log_warn!("PCI node {} has no usable reg property", node.name);
                continue;
            }
        };
        let bus_range = match node.prop("bus-range") {
            Some(v) => v,
            None => {
                log_warn!("PCI node {} has no bus-range", node.name);
                continue;
            }
        };
        let bus_start = be32(bus_range, 0).unwrap_or(0) as u8;
        let bus_end = be32(bus_range, 4).unwrap_or(0xFF) as u8;
        let segment = node
            .prop("linux,pci-domain")
            .and_then(|v| be32(v, 0))
            .unwrap_or(0);

        // The PCI binding fixes the child side at 3 address cells and 2
        // size cells; anything else is not a tree we understand.
        let (ac, sc) = node.cells();
        if ac != 3 || sc != 2 {
            log_warn!(
                "PCI node {}: expected #address-cells 3 #size-cells 2, got {} {}",
                node.name,
                ac,
                sc
            );
            continue;
        }
        let parent_ac = match node.parent {
            Some(p) => nodes[p].cells().0,
            None => 2,
        };

        log!("PCI segment {}: ECAM 0x{:x} buses {}-{}", segment, ecam_base, bus_start, bus_end);
        info.ecam.push(EcamSegment {
            base: ecam_base,
            seg: segment,
            bus_start,
            bus_end,
        });

        let ranges = match node.prop("ranges") {
            Some(v) => v,
            None => continue,
        };
        let mut off = 0usize;
        while off < ranges.len() {
            let flags = match be32(ranges, off) {
                Some(f) => f,
                None => break,
            };
            off += 4;
            let child = match be64(ranges, off) {
                Some(v) => v,
                None => break,
            };
            off += 8;
            let parent = match read_cell(ranges, &mut off, parent_ac) {
                Some(v) => v,
                None => break,
            };
            let len = match be64(ranges, off) {
                Some(v) => v,
                None => break,
            };
            off += 8;

            let code = pci_space_code(flags);
            if !code_is_io(code) && !code_is_mm(code) {
                continue; // configuration space entries etc.
            }
            log_debug!(
                "PCI res 0x{:x} -> 0x{:x} len 0x{:x} code {}",
                child,
                parent,
                len,
                code
            );
            info.ranges.push(PciRange {
                segment,
                min: child,
                max: child + len - 1,
                tl_offset: parent.wrapping_sub(child),
                len,
                io: code_is_io(code),
                io_to_mm: false,
                io_sparse: false,
            });
        }
    }
}

fn extract_gic(nodes: &[Node], info: &mut DtbInfo) {
    for (idx, node) in nodes.iter().enumerate() {
        if node.compatible_with("arm,gic-v3") {
            if let Some((base, _)) = node_reg(nodes, idx) {
                info.gicd_base = Some(base);
            }
        }
        if node.compatible_with("arm,gic-v3-its") {
            if let Some((base, _)) = node_reg(nodes, idx) {
                info.its_base = Some(base);
            }
        }
    }
}

fn parse(fdt: &[u8]) -> Option<DtbInfo> {
    let nodes = parse_nodes(fdt)?;
    let mut info = DtbInfo {
        ecam: Vec::new(),
        ranges: Vec::new(),
        gicd_base: None,
        its_base: None,
    };
    extract_pcie(&nodes, &mut info);
    extract_gic(&nodes, &mut info);
    Some(info)
}

/// Parse the FDT the boot protocol pointed at. The blob is read once and
/// never kept mapped.
pub fn init(fdt_ptr: u64) {
    let header = unsafe { core::slice::from_raw_parts(fdt_ptr as *const u8, 8) };
    let magic = be32(header, 0).unwrap_or(0);
    if magic != FDT_MAGIC {
        panic!("bad FDT magic 0x{:x}", magic);
    }
    let totalsize = be32(header, 4).unwrap_or(0) as usize;
    let fdt = unsafe { core::slice::from_raw_parts(fdt_ptr as *const u8, totalsize) };

    match parse(fdt) {
        Some(info) => {
            DTB.call_once(|| info);
        }
        None => panic!("device tree parse failed"),
    }
}

pub fn ecam_segments() -> &'static [EcamSegment] {
    DTB.get().map(|i| i.ecam.as_slice()).unwrap_or(&[])
}

pub fn pci_ranges() -> &'static [PciRange] {
    DTB.get().map(|i| i.ranges.as_slice()).unwrap_or(&[])
}

/// (GICD base, ITS base) when the tree described a GICv3.
pub fn gic_info() -> Option<(u64, Option<u64>)> {
    let info = DTB.get()?;
    info.gicd_base.map(|g| (g, info.its_base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    /// Minimal FDT writer for the tests.
    struct FdtBuilder {
        strct: Vec<u8>,
        strings: Vec<u8>,
    }

    impl FdtBuilder {
        fn new() -> Self {
            FdtBuilder {
                strct: Vec::new(),
                strings: Vec::new(),
            }
        }

        fn string_off(&mut self, name: &str) -> u32 {
            let bytes = name.as_bytes();
            let off = self.strings.len() as u32;
            self.strings.extend_from_slice(bytes);
            self.strings.push(0);
            off
        }

        fn begin(&mut self, name: &str) -> &mut Self {
            self.strct.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
            self.strct.extend_from_slice(name.as_bytes());
            self.strct.push(0);
            while self.strct.len() % 4 != 0 {
                self.strct.push(0);
            }
            self
        }

        fn end(&mut self) -> &mut Self {
            self.strct.extend_from_slice(&FDT_END_NODE.to_be_bytes());
            self
        }

        fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
            let nameoff = self.string_off(name);
            self.strct.extend_from_slice(&FDT_PROP.to_be_bytes());
            self.strct.extend_from_slice(&(value.len() as u32).to_be_bytes());
            self.strct.extend_from_slice(&nameoff.to_be_bytes());
            self.strct.extend_from_slice(value);
            while self.strct.len() % 4 != 0 {
                self.strct.push(0);
            }
            self
        }

        fn prop_u32(&mut self, name: &str, v: u32) -> &mut Self {
            self.prop(name, &v.to_be_bytes())
        }

        fn finish(mut self) -> Vec<u8> {
            self.strct.extend_from_slice(&FDT_END.to_be_bytes());
            let header_len = 40usize;
            let off_struct = header_len;
            let off_strings = off_struct + self.strct.len();
            let totalsize = off_strings + self.strings.len();

            let mut out = vec![0u8; totalsize];
            out[0..4].copy_from_slice(&FDT_MAGIC.to_be_bytes());
            out[4..8].copy_from_slice(&(totalsize as u32).to_be_bytes());
            out[8..12].copy_from_slice(&(off_struct as u32).to_be_bytes());
            out[12..16].copy_from_slice(&(off_strings as u32).to_be_bytes());
            out[off_struct..off_struct + self.strct.len()].copy_from_slice(&self.strct);
            out[off_strings..].copy_from_slice(&self.strings);
            out
        }
    }

    fn build_tree() -> Vec<u8> {
        let mut b = FdtBuilder::new();
        b.begin(""); // root
        b.prop_u32("#address-cells", 2);
        b.prop_u32("#size-cells", 2);

        // GICv3 with an ITS child.
        b.begin("intc@8000000");
        b.prop("compatible", b"arm,gic-v3\0");
        let mut reg = Vec::new();
        reg.extend_from_slice(&0x800_0000u64.to_be_bytes());
        reg.extend_from_slice(&0x1_0000u64.to_be_bytes());
        b.prop("reg", &reg);
        b.end();

        b.begin("its@8080000");
        b.prop("compatible", b"arm,gic-v3-its\0");
        let mut reg = Vec::new();
        reg.extend_from_slice(&0x808_0000u64.to_be_bytes());
        reg.extend_from_slice(&0x2_0000u64.to_be_bytes());
        b.prop("reg", &reg);
        b.end();

        // The ECAM host bridge.
        b.begin("pcie@4010000000");
        b.prop("compatible", b"pci-host-ecam-generic\0");
        b.prop_u32("#address-cells", 3);
        b.prop_u32("#size-cells", 2);
        let mut reg = Vec::new();
        reg.extend_from_slice(&0x40_1000_0000u64.to_be_bytes());
        reg.extend_from_slice(&0x1000_0000u64.to_be_bytes());
        b.prop("reg", &reg);
        let mut bus = Vec::new();
        bus.extend_from_slice(&0u32.to_be_bytes());
        bus.extend_from_slice(&0xFFu32.to_be_bytes());
        b.prop("bus-range", &bus);
        b.prop_u32("linux,pci-domain", 0);
        // Two ranges: IO at 0 -> 0x3EFF0000, MM identity at 0x10000000.
        let mut ranges = Vec::new();
        ranges.extend_from_slice(&0x0100_0000u32.to_be_bytes());
        ranges.extend_from_slice(&0u64.to_be_bytes());
        ranges.extend_from_slice(&0x3EFF_0000u64.to_be_bytes());
        ranges.extend_from_slice(&0x1_0000u64.to_be_bytes());
        ranges.extend_from_slice(&0x0200_0000u32.to_be_bytes());
        ranges.extend_from_slice(&0x1000_0000u64.to_be_bytes());
        ranges.extend_from_slice(&0x1000_0000u64.to_be_bytes());
        ranges.extend_from_slice(&0x2EFF_0000u64.to_be_bytes());
        b.prop("ranges", &ranges);
        b.end();

        // A disabled bridge that must be skipped.
        b.begin("pcie@5000000000");
        b.prop("compatible", b"pci-host-ecam-generic\0");
        b.prop("status", b"disabled\0");
        b.end();

        b.end(); // root
        b.finish()
    }

    #[test]
    fn pcie_node_extraction() {
        let fdt = build_tree();
        let info = parse(&fdt).unwrap();
        assert_eq!(info.ecam.len(), 1, "disabled bridge must be skipped");
        assert_eq!(info.ecam[0].base, 0x40_1000_0000);
        assert_eq!(info.ecam[0].bus_end, 0xFF);

        assert_eq!(info.ranges.len(), 2);
        let io = &info.ranges[0];
        assert!(io.io);
        assert_eq!(io.min, 0);
        assert_eq!(io.tl_offset, 0x3EFF_0000);
        let mm = &info.ranges[1];
        assert!(!mm.io);
        assert_eq!(mm.min, 0x1000_0000);
        assert_eq!(mm.tl_offset, 0);
    }

    #[test]
    fn gic_extraction() {
        let fdt = build_tree();
        let info = parse(&fdt).unwrap();
        assert_eq!(info.gicd_base, Some(0x800_0000));
        assert_eq!(info.its_base, Some(0x808_0000));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut fdt = build_tree();
        fdt[0] = 0;
        assert!(parse(&fdt).is_none());
    }
}

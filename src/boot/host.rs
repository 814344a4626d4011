//! Host introspection: reading the running system's own APIC topology and
//! PCIe config-space base out of its firmware tables and CPUID, so the
//! slice we carve can be validated against what the host actually has.
//!
//! This never writes anything; it only parses host-provided byte streams
//! (`/sys/firmware/acpi/tables/APIC`, `/sys/firmware/acpi/tables/MCFG`) and
//! issues read-only CPUID leaves.

use std::fs;

use raw_cpuid::native_cpuid::cpuid_count;
use thiserror::Error;

const MADT_SIGNATURE: &[u8; 4] = b"APIC";
const MCFG_SIGNATURE: &[u8; 4] = b"MCFG";

const ACPI_HEADER_LEN: usize = 36;
/// MADT fixed fields after the header: Local APIC Address (4) + Flags (4).
const MADT_FIXED_LEN: usize = 8;
/// MCFG has 8 reserved bytes after the header before allocation entries.
const MCFG_RESERVED_LEN: usize = 8;
const MCFG_ALLOCATION_LEN: usize = 16;

const MADT_TYPE_LOCAL_APIC: u8 = 0;
const MADT_TYPE_LOCAL_X2APIC: u8 = 9;
const MADT_LOCAL_APIC_ENABLED: u32 = 1 << 0;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{table} table is too short to contain a header")]
    TooShort { table: &'static str },

    #[error("{table} signature mismatch")]
    BadSignature { table: &'static str },

    #[error("{table} declared length {declared} does not match file size {actual}")]
    LengthMismatch {
        table: &'static str,
        declared: u32,
        actual: usize,
    },

    #[error("{table} checksum does not sum to zero")]
    BadChecksum { table: &'static str },

    #[error("MADT sub-table at offset {offset} has length {length}, which overruns the table")]
    SubtableOverrun { offset: usize, length: u8 },

    #[error("MCFG has {count} allocation entries, expected exactly 1")]
    McfgAllocationCount { count: usize },

    #[error("MCFG allocation has PCI segment {0}, expected 0")]
    McfgWrongSegment(u16),

    #[error("MCFG allocation has start bus {0}, expected 0")]
    McfgWrongStartBus(u8),

    #[error("CPUID leaf 0x1F x2APIC ID {v1f:#x} disagrees with leaf 0x0B {v0b:#x}")]
    ApicIdMismatch { v0b: u32, v1f: u32 },

    #[error("found {count} entries under /dev/cpu, expected exactly 1 (uniprocessor host view required)")]
    HostCpuCount { count: usize },
}

/// Host-observed state, built once at startup and never mutated.
pub struct HostView {
    pub host_apic_ids: Vec<u32>,
    pub bsp_apic_id: u32,
    pub pcie_mmconfig_base: u64,
}

impl HostView {
    pub fn gather(madt_path: &str, mcfg_path: &str) -> Result<Self, HostError> {
        let host_apic_ids = host_apic_ids(madt_path)?;
        let bsp_apic_id = local_apic_id()?;
        let pcie_mmconfig_base = host_mmconfig_base(mcfg_path)?;
        Ok(Self {
            host_apic_ids,
            bsp_apic_id,
            pcie_mmconfig_base,
        })
    }
}

fn checksum_ok(data: &[u8]) -> bool {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == 0
}

/// Parse the host's MADT and return every *enabled* Local-APIC and
/// Local-x2APIC ID, in table order.
pub fn host_apic_ids(path: &str) -> Result<Vec<u32>, HostError> {
    let data = fs::read(path).map_err(|source| HostError::ReadFile {
        path: path.to_string(),
        source,
    })?;

    if data.len() < ACPI_HEADER_LEN + MADT_FIXED_LEN {
        return Err(HostError::TooShort { table: "MADT" });
    }
    if &data[0..4] != MADT_SIGNATURE {
        return Err(HostError::BadSignature { table: "MADT" });
    }
    let declared_len = u32::from_le_bytes(data[4..8].try_into().unwrap());
    if declared_len as usize != data.len() {
        return Err(HostError::LengthMismatch {
            table: "MADT",
            declared: declared_len,
            actual: data.len(),
        });
    }
    if !checksum_ok(&data) {
        return Err(HostError::BadChecksum { table: "MADT" });
    }

    let mut ids = Vec::new();
    let mut offset = ACPI_HEADER_LEN + MADT_FIXED_LEN;
    while offset + 2 <= data.len() {
        let entry_type = data[offset];
        let length = data[offset + 1];
        if length < 2 || offset + length as usize > data.len() {
            return Err(HostError::SubtableOverrun { offset, length });
        }
        match entry_type {
            MADT_TYPE_LOCAL_APIC if length as usize >= 8 => {
                let apic_id = data[offset + 3] as u32;
                let flags = u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap());
                if flags & MADT_LOCAL_APIC_ENABLED != 0 {
                    ids.push(apic_id);
                }
            }
            MADT_TYPE_LOCAL_X2APIC if length as usize >= 16 => {
                let x2apic_id =
                    u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap());
                let flags = u32::from_le_bytes(data[offset + 8..offset + 12].try_into().unwrap());
                if flags & MADT_LOCAL_APIC_ENABLED != 0 {
                    ids.push(x2apic_id);
                }
            }
            _ => {}
        }
        offset += length as usize;
    }

    Ok(ids)
}

/// Issue CPUID to discover this CPU's own (x2)APIC ID.
pub fn local_apic_id() -> Result<u32, HostError> {
    let max_leaf = cpuid_count(0, 0).eax;
    let leaf_0b = cpuid_count(0x0B, 0);
    let v0b = leaf_0b.edx;

    if max_leaf >= 0x1F {
        let leaf_1f = cpuid_count(0x1F, 0);
        let v1f = leaf_1f.edx;
        if v1f != v0b {
            return Err(HostError::ApicIdMismatch { v0b, v1f });
        }
    }

    Ok(v0b)
}

/// CPU family/model/stepping and feature flags from CPUID leaf 1, used to
/// populate legacy MP Processor entries (see `mptable`).
pub fn cpu_signature_and_features() -> (u16, u32) {
    let leaf1 = cpuid_count(1, 0);
    ((leaf1.eax & 0xfff) as u16, leaf1.edx)
}

/// Validate and return the single allocation's base address from the
/// host's MCFG table.
pub fn host_mmconfig_base(path: &str) -> Result<u64, HostError> {
    let data = fs::read(path).map_err(|source| HostError::ReadFile {
        path: path.to_string(),
        source,
    })?;

    if data.len() < ACPI_HEADER_LEN + MCFG_RESERVED_LEN {
        return Err(HostError::TooShort { table: "MCFG" });
    }
    if &data[0..4] != MCFG_SIGNATURE {
        return Err(HostError::BadSignature { table: "MCFG" });
    }
    if !checksum_ok(&data) {
        return Err(HostError::BadChecksum { table: "MCFG" });
    }

    let allocations_start = ACPI_HEADER_LEN + MCFG_RESERVED_LEN;
    let allocations_bytes = data.len() - allocations_start;
    if allocations_bytes % MCFG_ALLOCATION_LEN != 0 {
        return Err(HostError::TooShort { table: "MCFG" });
    }
    let count = allocations_bytes / MCFG_ALLOCATION_LEN;
    if count != 1 {
        return Err(HostError::McfgAllocationCount { count });
    }

    let entry = &data[allocations_start..allocations_start + MCFG_ALLOCATION_LEN];
    let base_address = u64::from_le_bytes(entry[0..8].try_into().unwrap());
    let segment = u16::from_le_bytes(entry[8..10].try_into().unwrap());
    let start_bus = entry[10];

    if segment != 0 {
        return Err(HostError::McfgWrongSegment(segment));
    }
    if start_bus != 0 {
        return Err(HostError::McfgWrongStartBus(start_bus));
    }

    Ok(base_address)
}

/// Enumerate `/dev/cpu/<N>` and return the single `N` present, per the
/// uniprocessor-host-view assumption the APIC driver requires (see
/// `apic::send_startup_ipi` and DESIGN.md).
pub fn single_host_cpu_index() -> Result<u32, HostError> {
    let mut found = Vec::new();
    for entry in fs::read_dir("/dev/cpu").map_err(|source| HostError::ReadFile {
        path: "/dev/cpu".to_string(),
        source,
    })? {
        let entry = entry.map_err(|source| HostError::ReadFile {
            path: "/dev/cpu".to_string(),
            source,
        })?;
        if let Some(name) = entry.file_name().to_str() {
            if let Ok(n) = name.parse::<u32>() {
                found.push(n);
            }
        }
    }
    match found.len() {
        1 => Ok(found[0]),
        count => Err(HostError::HostCpuCount { count }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acpi_header(signature: &[u8; 4], length: u32) -> Vec<u8> {
        let mut h = vec![0u8; ACPI_HEADER_LEN];
        h[0..4].copy_from_slice(signature);
        h[4..8].copy_from_slice(&length.to_le_bytes());
        h[8] = 1; // revision
        h
    }

    fn finalize_checksum(buf: &mut [u8]) {
        let sum: u8 = buf.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        buf[9] = (0u8).wrapping_sub(sum);
    }

    #[test]
    fn test_host_apic_ids_parses_mixed_entries() {
        let mut madt = acpi_header(MADT_SIGNATURE, 0);
        madt.extend_from_slice(&0xfee0_0000u32.to_le_bytes()); // local apic addr
        madt.extend_from_slice(&0u32.to_le_bytes()); // flags

        // Local APIC entry: type=0, len=8, processor_id=0, apic_id=3, flags=enabled
        madt.extend_from_slice(&[0, 8, 0, 3, 1, 0, 0, 0]);
        // Local APIC entry, disabled: should be skipped
        madt.extend_from_slice(&[0, 8, 1, 9, 0, 0, 0, 0]);
        // Local x2APIC entry: type=9, len=16, reserved(2), x2apic_id=1000, flags=enabled, uid
        let mut x2 = vec![9u8, 16, 0, 0];
        x2.extend_from_slice(&1000u32.to_le_bytes());
        x2.extend_from_slice(&1u32.to_le_bytes());
        x2.extend_from_slice(&0u32.to_le_bytes());
        madt.extend_from_slice(&x2);

        let len = madt.len() as u32;
        madt[4..8].copy_from_slice(&len.to_le_bytes());
        finalize_checksum(&mut madt);

        let path = std::env::temp_dir().join("test_madt_mixed.bin");
        std::fs::write(&path, &madt).unwrap();
        let ids = host_apic_ids(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(ids, vec![3, 1000]);
    }

    #[test]
    fn test_host_apic_ids_rejects_bad_signature() {
        let mut madt = acpi_header(b"XXXX", 44);
        madt.extend_from_slice(&0u64.to_le_bytes());
        finalize_checksum(&mut madt);
        let path = std::env::temp_dir().join("test_madt_badsig.bin");
        std::fs::write(&path, &madt).unwrap();
        let err = host_apic_ids(path.to_str().unwrap()).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, HostError::BadSignature { .. }));
    }

    #[test]
    fn test_mcfg_accepts_single_allocation() {
        let mut mcfg = acpi_header(MCFG_SIGNATURE, 0);
        mcfg.extend_from_slice(&[0u8; MCFG_RESERVED_LEN]);
        mcfg.extend_from_slice(&0xe000_0000u64.to_le_bytes()); // base
        mcfg.extend_from_slice(&0u16.to_le_bytes()); // segment
        mcfg.push(0); // start bus
        mcfg.push(255); // end bus
        mcfg.extend_from_slice(&0u32.to_le_bytes()); // reserved

        let len = mcfg.len() as u32;
        mcfg[4..8].copy_from_slice(&len.to_le_bytes());
        finalize_checksum(&mut mcfg);

        let path = std::env::temp_dir().join("test_mcfg_ok.bin");
        std::fs::write(&path, &mcfg).unwrap();
        let base = host_mmconfig_base(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(base, 0xe000_0000);
    }

    #[test]
    fn test_mcfg_rejects_two_allocations() {
        let mut mcfg = acpi_header(MCFG_SIGNATURE, 0);
        mcfg.extend_from_slice(&[0u8; MCFG_RESERVED_LEN]);
        for base in [0xe000_0000u64, 0xf000_0000u64] {
            mcfg.extend_from_slice(&base.to_le_bytes());
            mcfg.extend_from_slice(&0u16.to_le_bytes());
            mcfg.push(0);
            mcfg.push(255);
            mcfg.extend_from_slice(&0u32.to_le_bytes());
        }
        let len = mcfg.len() as u32;
        mcfg[4..8].copy_from_slice(&len.to_le_bytes());
        finalize_checksum(&mut mcfg);

        let path = std::env::temp_dir().join("test_mcfg_two.bin");
        std::fs::write(&path, &mcfg).unwrap();
        let err = host_mmconfig_base(path.to_str().unwrap()).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, HostError::McfgAllocationCount { count: 2 }));
    }

    #[test]
    fn test_mcfg_rejects_nonzero_segment() {
        let mut mcfg = acpi_header(MCFG_SIGNATURE, 0);
        mcfg.extend_from_slice(&[0u8; MCFG_RESERVED_LEN]);
        mcfg.extend_from_slice(&0xe000_0000u64.to_le_bytes());
        mcfg.extend_from_slice(&1u16.to_le_bytes()); // nonzero segment
        mcfg.push(0);
        mcfg.push(255);
        mcfg.extend_from_slice(&0u32.to_le_bytes());

        let len = mcfg.len() as u32;
        mcfg[4..8].copy_from_slice(&len.to_le_bytes());
        finalize_checksum(&mut mcfg);

        let path = std::env::temp_dir().join("test_mcfg_seg.bin");
        std::fs::write(&path, &mcfg).unwrap();
        let err = host_mmconfig_base(path.to_str().unwrap()).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, HostError::McfgWrongSegment(1)));
    }
}

//! Firmware-table emitter: fabricates bit-exact ACPI (RSDP/XSDT/FADT/MADT)
//! tables and copies the host's MCFG verbatim, so the awakening kernel
//! discovers exactly the CPUs and memory this slice was assigned — and
//! nothing else from the host.
//!
//! Each table is built as a single in-memory buffer (header + body), its
//! length and checksum computed from the finished buffer, then written to
//! slice RAM through the cursor in one shot. This differs from the
//! allocate-then-backpatch approach a streaming C implementation needs
//! (remember the header's address, emit the body, patch length/checksum
//! after the fact, see DESIGN.md): in Rust the whole table's size is known
//! before any byte reaches the mapping, so there is no intermediate
//! unfinalized state to protect.
//!
//! Legacy MP tables live in `mptable` — they are written into the host's
//! first MiB by `lowmem`, not into slice RAM by this module.

use super::cursor::LoadCursor;
use super::memory::MemoryError;

/// ACPI table header length shared by every descriptive table.
const ACPI_HEADER_LEN: usize = 36;

const OEM_ID: &[u8; 6] = b"SLICER";
const OEM_TABLE_ID: &[u8; 8] = b"SLICE   ";
const CREATOR_ID: &[u8; 4] = b"SLDR";

/// FADT IAPC_BOOT_ARCH: VGA not present (bit 2).
const IAPC_NO_VGA: u16 = 1 << 2;
/// FADT IAPC_BOOT_ARCH: no CMOS RTC (bit 5).
const IAPC_NO_CMOS_RTC: u16 = 1 << 5;

/// FADT Flags: write-back invalidate supported (bit 0).
const FADT_WBINVD: u32 = 1 << 0;
/// FADT Flags: hardware-reduced ACPI (bit 20) — no 8259, no legacy PM block.
const FADT_HW_REDUCED_ACPI: u32 = 1 << 20;
/// FADT Flags: force physical destination mode for APIC IPIs (bit 19).
const FADT_APIC_PHYSICAL_DESTINATION_MODE: u32 = 1 << 19;

const MADT_LOCAL_APIC_ADDR: u32 = 0xFEE0_0000;
const MADT_TYPE_LOCAL_X2APIC: u8 = 9;
const MADT_LOCAL_APIC_ENABLED: u32 = 1 << 0;

#[derive(thiserror::Error, Debug)]
pub enum AcpiError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("failed to read DSDT {path}: {source}")]
    ReadDsdt {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn checksum(data: &[u8]) -> u8 {
    let sum: u8 = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Append a 36-byte ACPI header to `buf`. `length` and the checksum byte are
/// left at 0 — callers patch both once the full table body is known.
fn push_header(buf: &mut Vec<u8>, signature: &[u8; 4], revision: u8) {
    buf.extend_from_slice(signature); // 0..4
    buf.extend_from_slice(&0u32.to_le_bytes()); // 4..8 length, patched later
    buf.push(revision); // 8
    buf.push(0); // 9 checksum, patched later
    buf.extend_from_slice(OEM_ID); // 10..16
    buf.extend_from_slice(OEM_TABLE_ID); // 16..24
    buf.extend_from_slice(&1u32.to_le_bytes()); // 24..28 oem_revision
    buf.extend_from_slice(CREATOR_ID); // 28..32
    buf.extend_from_slice(&1u32.to_le_bytes()); // 32..36 creator_revision
}

/// Patch `buf[4..8]` (length) to `buf.len()` and `buf[9]` (checksum) so the
/// whole buffer's unsigned byte sum is zero.
fn finalize(buf: &mut [u8]) {
    let len = buf.len() as u32;
    buf[4..8].copy_from_slice(&len.to_le_bytes());
    buf[9] = 0;
    buf[9] = checksum(buf);
}

/// Build, finalize, and place a table; returns its slice-RAM physical
/// address.
fn place(cursor: &mut LoadCursor, mut buf: Vec<u8>) -> Result<u64, AcpiError> {
    finalize(&mut buf);
    Ok(cursor.write(&buf, 8)?)
}

fn build_fadt(dsdt_phys: u64) -> Vec<u8> {
    // ACPI 6.x FADT is 276 bytes total (36-byte header + 240-byte body).
    const FADT_LEN: usize = 276;
    let mut buf = Vec::with_capacity(FADT_LEN);
    push_header(&mut buf, b"FACP", 6);
    buf.resize(FADT_LEN, 0);

    // 32-bit legacy DSDT pointer left at 0; X_DSDT (64-bit, offset 140) is
    // authoritative for an ACPI revision >= 3 table.
    let iapc_boot_arch_offset = 109;
    buf[iapc_boot_arch_offset..iapc_boot_arch_offset + 2]
        .copy_from_slice(&(IAPC_NO_VGA | IAPC_NO_CMOS_RTC).to_le_bytes());

    let flags_offset = 112;
    let flags = FADT_WBINVD | FADT_HW_REDUCED_ACPI | FADT_APIC_PHYSICAL_DESTINATION_MODE;
    buf[flags_offset..flags_offset + 4].copy_from_slice(&flags.to_le_bytes());

    let minor_version_offset = 131;
    buf[minor_version_offset] = 4;

    let x_dsdt_offset = 140;
    buf[x_dsdt_offset..x_dsdt_offset + 8].copy_from_slice(&dsdt_phys.to_le_bytes());

    buf
}

fn build_madt(cpus: &[u32]) -> Vec<u8> {
    let mut buf = Vec::new();
    push_header(&mut buf, b"APIC", 5);
    buf.extend_from_slice(&MADT_LOCAL_APIC_ADDR.to_le_bytes()); // Local APIC address
    buf.extend_from_slice(&0u32.to_le_bytes()); // Flags: no 8259

    for (uid, &apic_id) in cpus.iter().enumerate() {
        buf.push(MADT_TYPE_LOCAL_X2APIC);
        buf.push(16); // sub-table length
        buf.extend_from_slice(&0u16.to_le_bytes()); // reserved
        buf.extend_from_slice(&apic_id.to_le_bytes());
        buf.extend_from_slice(&MADT_LOCAL_APIC_ENABLED.to_le_bytes());
        buf.extend_from_slice(&(uid as u32).to_le_bytes());
    }

    buf
}

fn build_xsdt(entries: &[u64]) -> Vec<u8> {
    let mut buf = Vec::new();
    push_header(&mut buf, b"XSDT", 1);
    for &addr in entries {
        buf.extend_from_slice(&addr.to_le_bytes());
    }
    buf
}

/// Build the 36-byte RSDP. Unlike the descriptive tables, the RSDP carries
/// two independent checksums and is built and finalized inline rather than
/// through `place`/`finalize`.
fn build_rsdp(xsdt_phys: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(36);
    buf.extend_from_slice(b"RSD PTR "); // 0..8, trailing space significant
    buf.push(0); // 8 checksum, patched below
    buf.extend_from_slice(OEM_ID); // 9..15
    buf.push(2); // 15 revision (ACPI 2.0+)
    buf.extend_from_slice(&0u32.to_le_bytes()); // 16..20 rsdt_address, unused
    buf.extend_from_slice(&36u32.to_le_bytes()); // 20..24 length
    buf.extend_from_slice(&xsdt_phys.to_le_bytes()); // 24..32 xsdt_address
    buf.push(0); // 32 extended_checksum, patched below
    buf.extend_from_slice(&[0u8; 3]); // 33..36 reserved

    buf[8] = checksum(&buf[0..20]);
    buf[32] = checksum(&buf);
    buf
}

/// Emit, in order, the optional DSDT, FADT, MADT, a verbatim copy of the
/// host's MCFG, the XSDT, and the RSDP. Returns the RSDP's physical address.
pub fn build_acpi(
    cursor: &mut LoadCursor,
    cpus: &[u32],
    dsdt_path: Option<&str>,
    host_mcfg_bytes: &[u8],
) -> Result<u64, AcpiError> {
    let dsdt_phys = match dsdt_path {
        Some(path) => {
            let bytes = std::fs::read(path).map_err(|source| AcpiError::ReadDsdt {
                path: path.to_string(),
                source,
            })?;
            cursor.write(&bytes, 8)?
        }
        None => 0,
    };

    let fadt_phys = place(cursor, build_fadt(dsdt_phys))?;
    let madt_phys = place(cursor, build_madt(cpus))?;
    let mcfg_phys = cursor.write(host_mcfg_bytes, 8)?;
    let xsdt_phys = place(cursor, build_xsdt(&[fadt_phys, madt_phys, mcfg_phys]))?;
    let rsdp_phys = cursor.write(&build_rsdp(xsdt_phys), 8)?;

    Ok(rsdp_phys)
}

#[cfg(test)]
mod tests {
    use super::super::memory::PhysWindow;
    use super::*;

    fn checksum_ok(data: &[u8]) -> bool {
        data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == 0
    }

    #[test]
    fn test_fadt_checksum_and_flags() {
        let mut buf = build_fadt(0x1234_5678);
        finalize(&mut buf);
        assert!(checksum_ok(&buf));
        assert_eq!(buf.len(), 276);
        let flags = u32::from_le_bytes(buf[112..116].try_into().unwrap());
        assert_eq!(
            flags,
            FADT_WBINVD | FADT_HW_REDUCED_ACPI | FADT_APIC_PHYSICAL_DESTINATION_MODE
        );
        let x_dsdt = u64::from_le_bytes(buf[140..148].try_into().unwrap());
        assert_eq!(x_dsdt, 0x1234_5678);
    }

    #[test]
    fn test_madt_entries_match_cpu_order() {
        let mut buf = build_madt(&[3, 4, 9]);
        finalize(&mut buf);
        assert!(checksum_ok(&buf));

        let mut offset = ACPI_HEADER_LEN + 8;
        for (uid, expected_id) in [3u32, 4, 9].into_iter().enumerate() {
            assert_eq!(buf[offset], MADT_TYPE_LOCAL_X2APIC);
            let apic_id = u32::from_le_bytes(buf[offset + 4..offset + 8].try_into().unwrap());
            let uid_field = u32::from_le_bytes(buf[offset + 12..offset + 16].try_into().unwrap());
            assert_eq!(apic_id, expected_id);
            assert_eq!(uid_field, uid as u32);
            offset += 16;
        }
    }

    #[test]
    fn test_rsdp_checksums_and_xsdt_address() {
        let buf = build_rsdp(0xAABB_CC00);
        assert!(checksum_ok(&buf[0..20]));
        assert!(checksum_ok(&buf));
        let xsdt = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        assert_eq!(xsdt, 0xAABB_CC00);
        assert_eq!(&buf[0..8], b"RSD PTR ");
    }

    #[test]
    fn test_build_acpi_end_to_end() {
        let base = 0x1_0000_0000u64;
        let window = match PhysWindow::map(base, 0x10000) {
            Ok(w) => w,
            Err(_) => return, // no /dev/mem access in this sandbox; skip
        };
        let mut cursor = LoadCursor::new(&window, base);
        let host_mcfg = vec![0u8; 44];
        let rsdp_phys = build_acpi(&mut cursor, &[3, 4], None, &host_mcfg).unwrap();
        assert!(rsdp_phys >= base);
    }
}

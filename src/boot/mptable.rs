//! Legacy Intel MP Specification 1.4 tables.
//!
//! Modern kernels discover CPUs from the ACPI MADT (see `acpi`), but the
//! scan for `_MP_` happens unconditionally during early boot and some
//! kernel configurations still fall back to it. Carrying both costs one
//! small table and removes a class of "boots under ACPI, hangs under MP"
//! surprises.
//!
//! Unlike the ACPI emitter, these tables are written into the awakening
//! CPU's first MiB (by `lowmem`), not into slice RAM — the Intel MP spec
//! requires the floating pointer structure to live below 1 MiB or in the
//! EBDA, both conventionally low addresses BIOS-era software expects to
//! find it at.

use super::memory::{MemoryError, PhysWindow};

const MP_SIGNATURE: [u8; 4] = *b"_MP_";
const MPC_SIGNATURE: [u8; 4] = *b"PCMP";
const MP_SPEC_REVISION: u8 = 4; // MP Spec 1.4

const MP_PROCESSOR: u8 = 0;
const MP_LINTSRC: u8 = 4;

const CPU_ENABLED: u8 = 0x01;
const CPU_BOOT: u8 = 0x02;

const APIC_VERSION: u8 = 0x14;
const LOCAL_APIC_ADDR: u32 = 0xfee0_0000;

const INT_TYPE_NMI: u8 = 1;
const MP_IRQPOL_DEFAULT: u16 = 0;

#[derive(thiserror::Error, Debug)]
pub enum MpTableError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("no CPUs in slice; MP table requires at least one processor entry")]
    NoCpus,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpFloatingPointer {
    signature: [u8; 4],
    physptr: u32,
    length: u8,
    spec_rev: u8,
    checksum: u8,
    feature1: u8,
    feature2: u8,
    feature3: u8,
    feature4: u8,
    feature5: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpConfigTable {
    signature: [u8; 4],
    length: u16,
    spec_rev: u8,
    checksum: u8,
    oem_id: [u8; 8],
    product_id: [u8; 12],
    oem_table_ptr: u32,
    oem_table_size: u16,
    entry_count: u16,
    lapic_addr: u32,
    ext_table_length: u16,
    ext_table_checksum: u8,
    reserved: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpProcessorEntry {
    entry_type: u8,
    apic_id: u8,
    apic_version: u8,
    cpu_flags: u8,
    cpu_signature: u32,
    feature_flags: u32,
    reserved: [u32; 2],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MpLocalIntSrcEntry {
    entry_type: u8,
    int_type: u8,
    int_flag: u16,
    src_bus_id: u8,
    src_bus_irq: u8,
    dst_apic_id: u8,
    dst_apic_lint: u8,
}

fn compute_checksum(data: &[u8]) -> u8 {
    let sum: u8 = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe { core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>()) }
}

/// Write the MP floating pointer and configuration table at `addr`, with one
/// Processor entry per slice CPU (id truncated to the legacy 8-bit field;
/// the ACPI MADT carries the authoritative x2APIC id) and a single NMI
/// LocalInterrupt entry broadcast to every processor.
///
/// `cpus[0]` is taken to be the BSP, matching `SliceConfig`'s convention.
pub fn write_mp_tables(
    window: &PhysWindow,
    addr: u64,
    cpus: &[u32],
    cpu_signature: u16,
    feature_flags: u32,
) -> Result<(), MpTableError> {
    if cpus.is_empty() {
        return Err(MpTableError::NoCpus);
    }

    let fp_size = core::mem::size_of::<MpFloatingPointer>() as u64;
    let header_size = core::mem::size_of::<MpConfigTable>();
    let proc_size = core::mem::size_of::<MpProcessorEntry>();
    let lintsrc_size = core::mem::size_of::<MpLocalIntSrcEntry>();

    let table_size = header_size + cpus.len() * proc_size + lintsrc_size;
    let mut table_buffer = vec![0u8; table_size];
    let mut offset = header_size;
    let mut entry_count: u16 = 0;

    for (i, &apic_id) in cpus.iter().enumerate() {
        let entry = MpProcessorEntry {
            entry_type: MP_PROCESSOR,
            apic_id: apic_id as u8,
            apic_version: APIC_VERSION,
            cpu_flags: CPU_ENABLED | if i == 0 { CPU_BOOT } else { 0 },
            cpu_signature: cpu_signature as u32,
            feature_flags,
            reserved: [0; 2],
        };
        table_buffer[offset..offset + proc_size].copy_from_slice(as_bytes(&entry));
        offset += proc_size;
        entry_count += 1;
    }

    let nmi_entry = MpLocalIntSrcEntry {
        entry_type: MP_LINTSRC,
        int_type: INT_TYPE_NMI,
        int_flag: MP_IRQPOL_DEFAULT,
        src_bus_id: 0,
        src_bus_irq: 0,
        dst_apic_id: 0xFF, // all processors
        dst_apic_lint: 1,  // LINT1
    };
    table_buffer[offset..offset + lintsrc_size].copy_from_slice(as_bytes(&nmi_entry));
    entry_count += 1;

    let header = MpConfigTable {
        signature: MPC_SIGNATURE,
        length: table_size as u16,
        spec_rev: MP_SPEC_REVISION,
        checksum: 0,
        oem_id: *b"SLICER  ",
        product_id: *b"SLICE       ",
        oem_table_ptr: 0,
        oem_table_size: 0,
        entry_count,
        lapic_addr: LOCAL_APIC_ADDR,
        ext_table_length: 0,
        ext_table_checksum: 0,
        reserved: 0,
    };
    table_buffer[..header_size].copy_from_slice(as_bytes(&header));
    table_buffer[7] = 0;
    table_buffer[7] = compute_checksum(&table_buffer);

    let table_addr = addr + fp_size;
    window.write(table_addr, &table_buffer)?;

    let mut fp = MpFloatingPointer {
        signature: MP_SIGNATURE,
        physptr: table_addr as u32,
        length: 1,
        spec_rev: MP_SPEC_REVISION,
        checksum: 0,
        feature1: 0,
        feature2: 0,
        feature3: 0,
        feature4: 0,
        feature5: 0,
    };
    let mut fp_buffer = as_bytes(&fp).to_vec();
    fp_buffer[10] = 0;
    fp_buffer[10] = compute_checksum(&fp_buffer);
    fp.checksum = fp_buffer[10];
    window.write(addr, as_bytes(&fp))?;

    Ok(())
}

/// Total footprint (floating pointer + config table) for `num_cpus`
/// processors, used by `lowmem` to size its `_MP_` rescan.
pub fn table_span(num_cpus: usize) -> u64 {
    (core::mem::size_of::<MpFloatingPointer>()
        + core::mem::size_of::<MpConfigTable>()
        + num_cpus * core::mem::size_of::<MpProcessorEntry>()
        + core::mem::size_of::<MpLocalIntSrcEntry>()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(core::mem::size_of::<MpFloatingPointer>(), 16);
        assert_eq!(core::mem::size_of::<MpProcessorEntry>(), 20);
        assert_eq!(core::mem::size_of::<MpLocalIntSrcEntry>(), 8);
    }

    #[test]
    fn test_checksum_property() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let checksum = compute_checksum(&data);
        let sum: u8 = data
            .iter()
            .chain(std::iter::once(&checksum))
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        assert_eq!(sum, 0);
    }

    #[test]
    fn test_write_mp_tables_end_to_end() {
        let window = match PhysWindow::map(0x0, 0x2000) {
            Ok(w) => w,
            Err(_) => return, // no /dev/mem access in this sandbox; skip
        };
        write_mp_tables(&window, 0x1000, &[3, 4], 0x306, 0x1234).unwrap();

        let mut fp_bytes = [0u8; 16];
        window.read(0x1000, &mut fp_bytes).unwrap();
        assert_eq!(&fp_bytes[0..4], b"_MP_");
        assert_eq!(
            fp_bytes.iter().fold(0u8, |a, &b| a.wrapping_add(b)),
            0
        );

        let table_addr = u32::from_le_bytes(fp_bytes[4..8].try_into().unwrap()) as u64;
        let length = {
            let mut len_bytes = [0u8; 2];
            window.read(table_addr + 4, &mut len_bytes).unwrap();
            u16::from_le_bytes(len_bytes) as usize
        };
        let mut table_bytes = vec![0u8; length];
        window.read(table_addr, &mut table_bytes).unwrap();
        assert_eq!(
            table_bytes.iter().fold(0u8, |a, &b| a.wrapping_add(b)),
            0
        );
    }
}

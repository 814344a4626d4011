//! Linux `boot_params` ("zero page") construction, command-line and initrd
//! placement, and the E820 memory map.
//!
//! Every field here uses the absolute byte offsets the x86 boot protocol
//! defines (<https://www.kernel.org/doc/html/latest/x86/zero-page.html>,
//! <https://www.kernel.org/doc/html/latest/x86/boot.html>) — there is no
//! struct overlay; we build the 4096-byte page as a buffer the same way
//! `acpi::push_header`/`finalize` build a table, because `boot_params` is,
//! like an ACPI table, a fixed binary contract with the kernel rather than
//! a type we control.

use std::fs;

use super::cursor::LoadCursor;
use super::memory::MemoryError;

const BOOT_PARAMS_SIZE: usize = 4096;

/// Two-entry E820 map: `[0, 639 KiB)` conventional RAM and
/// `[rambase, rambase + ramsize)` the slice's carved region. There is no
/// reserved EBDA/ROM entry because the slice CPU never addresses that
/// range — the host's first MiB belongs to the host except for the bytes
/// `lowmem` explicitly stages there.
const E820_RAM: u32 = 1;

mod offsets {
    pub const EXT_RAMDISK_IMAGE: usize = 0x0c0;
    pub const EXT_RAMDISK_SIZE: usize = 0x0c4;
    pub const EXT_CMD_LINE_PTR: usize = 0x0c8;
    pub const ACPI_RSDP_ADDR: usize = 0x070;
    pub const E820_ENTRIES: usize = 0x1e8;
    pub const SETUP_HEADER: usize = 0x1f1;
    pub const RAMDISK_IMAGE: usize = 0x218;
    pub const RAMDISK_SIZE: usize = 0x21c;
    pub const TYPE_OF_LOADER: usize = 0x210;
    pub const LOADFLAGS: usize = 0x211;
    pub const CMD_LINE_PTR: usize = 0x228;
    pub const E820_MAP: usize = 0x2d0;
}

const LOADFLAGS_CAN_USE_HEAP: u8 = 1 << 7;

#[derive(thiserror::Error, Debug)]
pub enum ParamsError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("command line is {len} bytes, which does not fit the kernel's {max}-byte cmdline_size")]
    CmdlineTooLong { len: usize, max: u32 },

    #[error("failed to stat initrd {path}: {source}")]
    StatInitrd {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Write `cmdline` plus a NUL terminator into slice RAM. `max_len` is the
/// kernel's advertised `cmdline_size` from its setup header.
pub fn place_cmdline(
    cursor: &mut LoadCursor,
    cmdline: &str,
    max_len: u32,
) -> Result<u64, ParamsError> {
    if cmdline.len() as u32 >= max_len {
        return Err(ParamsError::CmdlineTooLong {
            len: cmdline.len(),
            max: max_len,
        });
    }
    let mut buf = cmdline.as_bytes().to_vec();
    buf.push(0);
    Ok(cursor.write(&buf, 8)?)
}

/// Read `path` into slice RAM through the cursor's window, bounce-buffered
/// since `/dev/mem` forbids direct file I/O into the mapping. Returns
/// `(physical address, length)`.
pub fn place_initrd(cursor: &mut LoadCursor, path: &str) -> Result<(u64, u64), ParamsError> {
    let len = fs::metadata(path)
        .map_err(|source| ParamsError::StatInitrd {
            path: path.to_string(),
            source,
        })?
        .len();
    let phys = cursor.alloc(len, 4096)?;
    cursor.window().read_file_into(path, 0, phys, len)?;
    Ok((phys, len))
}

/// Build the `[0, 639 KiB)` / `[rambase, rambase + ramsize)` E820 map into
/// `buf` at `offsets::E820_MAP`, returning the entry count.
fn write_e820(buf: &mut [u8], rambase: u64, ramsize: u64) -> u8 {
    let entry = |buf: &mut [u8], idx: usize, base: u64, size: u64| {
        let off = offsets::E820_MAP + idx * 20;
        buf[off..off + 8].copy_from_slice(&base.to_le_bytes());
        buf[off + 8..off + 16].copy_from_slice(&size.to_le_bytes());
        buf[off + 16..off + 20].copy_from_slice(&E820_RAM.to_le_bytes());
    };
    entry(buf, 0, 0, 639 * 1024);
    entry(buf, 1, rambase, ramsize);
    2
}

/// Build the zero page: copy in the kernel's (already-validated) setup
/// header, point the kernel at the command line / initrd / RSDP, fill the
/// E820 map, and place the page in slice RAM. Returns its physical address
/// — the value the trampoline hands the kernel as its 64-bit entry
/// argument.
#[allow(clippy::too_many_arguments)]
pub fn build_zero_page(
    cursor: &mut LoadCursor,
    setup_header: &[u8],
    cmdline_phys: u64,
    initrd: Option<(u64, u64)>,
    rsdp_phys: u64,
    rambase: u64,
    ramsize: u64,
) -> Result<u64, ParamsError> {
    let mut buf = vec![0u8; BOOT_PARAMS_SIZE];

    let header_len = setup_header.len().min(BOOT_PARAMS_SIZE - offsets::SETUP_HEADER);
    buf[offsets::SETUP_HEADER..offsets::SETUP_HEADER + header_len]
        .copy_from_slice(&setup_header[..header_len]);

    buf[offsets::TYPE_OF_LOADER] = 0xff;
    buf[offsets::LOADFLAGS] |= LOADFLAGS_CAN_USE_HEAP;

    buf[offsets::ACPI_RSDP_ADDR..offsets::ACPI_RSDP_ADDR + 8]
        .copy_from_slice(&rsdp_phys.to_le_bytes());

    buf[offsets::CMD_LINE_PTR..offsets::CMD_LINE_PTR + 4]
        .copy_from_slice(&(cmdline_phys as u32).to_le_bytes());
    buf[offsets::EXT_CMD_LINE_PTR..offsets::EXT_CMD_LINE_PTR + 4]
        .copy_from_slice(&((cmdline_phys >> 32) as u32).to_le_bytes());

    if let Some((initrd_phys, initrd_len)) = initrd {
        buf[offsets::RAMDISK_IMAGE..offsets::RAMDISK_IMAGE + 4]
            .copy_from_slice(&(initrd_phys as u32).to_le_bytes());
        buf[offsets::EXT_RAMDISK_IMAGE..offsets::EXT_RAMDISK_IMAGE + 4]
            .copy_from_slice(&((initrd_phys >> 32) as u32).to_le_bytes());
        buf[offsets::RAMDISK_SIZE..offsets::RAMDISK_SIZE + 4]
            .copy_from_slice(&(initrd_len as u32).to_le_bytes());
        buf[offsets::EXT_RAMDISK_SIZE..offsets::EXT_RAMDISK_SIZE + 4]
            .copy_from_slice(&((initrd_len >> 32) as u32).to_le_bytes());
    }

    let e820_entries = write_e820(&mut buf, rambase, ramsize);
    buf[offsets::E820_ENTRIES] = e820_entries;

    Ok(cursor.write(&buf, 4096)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_e820_two_entries() {
        let mut buf = vec![0u8; BOOT_PARAMS_SIZE];
        let count = write_e820(&mut buf, 0x1_0000_0000, 0x4000_0000);
        assert_eq!(count, 2);

        let base0 = u64::from_le_bytes(buf[offsets::E820_MAP..offsets::E820_MAP + 8].try_into().unwrap());
        let size0 = u64::from_le_bytes(
            buf[offsets::E820_MAP + 8..offsets::E820_MAP + 16]
                .try_into()
                .unwrap(),
        );
        assert_eq!(base0, 0);
        assert_eq!(size0, 639 * 1024);

        let off1 = offsets::E820_MAP + 20;
        let base1 = u64::from_le_bytes(buf[off1..off1 + 8].try_into().unwrap());
        let size1 = u64::from_le_bytes(buf[off1 + 8..off1 + 16].try_into().unwrap());
        assert_eq!(base1, 0x1_0000_0000);
        assert_eq!(size1, 0x4000_0000);
    }

    #[test]
    fn test_build_zero_page_sets_pointers() {
        use super::super::memory::PhysWindow;

        let base = 0x2_0000_0000u64;
        let window = match PhysWindow::map(base, 0x10000) {
            Ok(w) => w,
            Err(_) => return, // no /dev/mem access in this sandbox; skip
        };
        let mut cursor = LoadCursor::new(&window, base);
        let header = vec![0xABu8; 16];
        let zp_phys = build_zero_page(
            &mut cursor,
            &header,
            0x2_0000_1000,
            Some((0x2_0000_2000, 0x1000)),
            0x2_0000_3000,
            0x2_0000_0000,
            0x4000_0000,
        )
        .unwrap();

        let mut type_of_loader = [0u8; 1];
        window
            .read(zp_phys + offsets::TYPE_OF_LOADER as u64, &mut type_of_loader)
            .unwrap();
        assert_eq!(type_of_loader[0], 0xff);

        let mut rsdp = [0u8; 8];
        window
            .read(zp_phys + offsets::ACPI_RSDP_ADDR as u64, &mut rsdp)
            .unwrap();
        assert_eq!(u64::from_le_bytes(rsdp), 0x2_0000_3000);
    }
}

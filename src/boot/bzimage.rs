//! Linux kernel image (`bzImage`) loader.
//!
//! Validates the kernel's setup header against the subset of the x86 boot
//! protocol a slice handoff actually depends on (64-bit entry, relocatable,
//! loadable above 4G — nothing here assumes the kernel also fits below the
//! 1 MiB mark the way a real-mode loader would), places the kernel body,
//! zero page, firmware tables, command line and initrd into slice RAM, and
//! returns the 64-bit entry point and the argument (the zero page's
//! physical address) the trampoline will hand it.
//!
//! Reference: <https://www.kernel.org/doc/html/latest/x86/boot.html>

use std::fs;

use super::acpi::{self, AcpiError};
use super::cursor::LoadCursor;
use super::memory::MemoryError;
use super::params::{self, ParamsError};
use crate::config::SliceConfig;

/// Bytes of the setup header region we read up front; comfortably covers
/// every field through `kernel_info_offset` (boot protocol 2.12/2.15).
const HEADER_PROBE_LEN: usize = 0x400;

const SETUP_HEADER_OFFSET: usize = 0x1f1;
const BOOT_MAGIC_OFFSET: usize = 0x202;
const BOOT_MAGIC: u32 = 0x5372_6448; // "HdrS"
const MIN_BOOT_VERSION: u16 = 0x020c; // 2.12: xloadflags, kernel_alignment guaranteed

const OFF_SETUP_SECTS: usize = 0x1f1;
const OFF_SYSSIZE: usize = 0x1f4;
const OFF_VERSION: usize = 0x206;
const OFF_RELOCATABLE_KERNEL: usize = 0x234;
const OFF_KERNEL_ALIGNMENT: usize = 0x230;
const OFF_XLOADFLAGS: usize = 0x236;
const OFF_CMDLINE_SIZE: usize = 0x238;
const OFF_INIT_SIZE: usize = 0x260;

const XLF_KERNEL_64: u16 = 1 << 0;
const XLF_CAN_BE_LOADED_ABOVE_4G: u16 = 1 << 1;

/// The 64-bit entry point sits 0x200 bytes into the loaded protected-mode
/// kernel image, per the boot protocol's "32/64-bit boot protocol" section.
const ENTRY_OFFSET: u64 = 0x200;

#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Acpi(#[from] AcpiError),

    #[error(transparent)]
    Params(#[from] ParamsError),

    #[error("failed to read kernel image {path}: {source}")]
    ReadKernel {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("kernel image is only {0} bytes, too short to hold a setup header")]
    TooShort(usize),

    #[error("missing bzImage boot signature at offset {BOOT_MAGIC_OFFSET:#x} (found {0:#010x}, expected {BOOT_MAGIC:#010x})")]
    BadMagic(u32),

    #[error("boot protocol version {0:#06x} is older than the minimum supported {MIN_BOOT_VERSION:#06x}")]
    VersionTooOld(u16),

    #[error("kernel is not marked relocatable; a slice's rambase is not guaranteed to match its preferred load address")]
    NotRelocatable,

    #[error("kernel xloadflags {0:#06x} is missing 64-bit entry and/or above-4G load support")]
    Missing64BitSupport(u16),

    #[error("setup_sects is 0; a well-formed bzImage always declares a nonzero setup size")]
    ZeroSetupSects,

    #[error("kernel body is truncated: header declares {expected} bytes starting at offset {body_offset:#x}, but the image is only {actual} bytes")]
    Truncated {
        expected: u64,
        body_offset: u64,
        actual: u64,
    },
}

/// Result of loading a kernel image: the address execution should jump to
/// and the argument (zero page physical address) it expects in RSI.
pub struct LoadedKernel {
    pub entry_phys: u64,
    pub entry_arg: u64,
}

fn read_header(path: &str) -> Result<Vec<u8>, ImageError> {
    let data = fs::read(path).map_err(|source| ImageError::ReadKernel {
        path: path.to_string(),
        source,
    })?;
    if data.len() <= OFF_INIT_SIZE + 4 {
        return Err(ImageError::TooShort(data.len()));
    }
    Ok(data)
}

struct Header {
    setup_sects: u8,
    syssize: u32,
    kernel_alignment: u32,
    init_size: u32,
    cmdline_size: u32,
}

fn validate_header(data: &[u8]) -> Result<Header, ImageError> {
    let magic = u32::from_le_bytes(data[BOOT_MAGIC_OFFSET..BOOT_MAGIC_OFFSET + 4].try_into().unwrap());
    if magic != BOOT_MAGIC {
        return Err(ImageError::BadMagic(magic));
    }

    let version = u16::from_le_bytes(data[OFF_VERSION..OFF_VERSION + 2].try_into().unwrap());
    if version < MIN_BOOT_VERSION {
        return Err(ImageError::VersionTooOld(version));
    }

    let relocatable = data[OFF_RELOCATABLE_KERNEL];
    if relocatable == 0 {
        return Err(ImageError::NotRelocatable);
    }

    let xloadflags = u16::from_le_bytes(data[OFF_XLOADFLAGS..OFF_XLOADFLAGS + 2].try_into().unwrap());
    let required = XLF_KERNEL_64 | XLF_CAN_BE_LOADED_ABOVE_4G;
    if xloadflags & required != required {
        return Err(ImageError::Missing64BitSupport(xloadflags));
    }

    let setup_sects = data[OFF_SETUP_SECTS];
    if setup_sects == 0 {
        return Err(ImageError::ZeroSetupSects);
    }

    Ok(Header {
        setup_sects,
        syssize: u32::from_le_bytes(data[OFF_SYSSIZE..OFF_SYSSIZE + 4].try_into().unwrap()),
        kernel_alignment: u32::from_le_bytes(
            data[OFF_KERNEL_ALIGNMENT..OFF_KERNEL_ALIGNMENT + 4].try_into().unwrap(),
        ),
        init_size: u32::from_le_bytes(data[OFF_INIT_SIZE..OFF_INIT_SIZE + 4].try_into().unwrap()),
        cmdline_size: u32::from_le_bytes(
            data[OFF_CMDLINE_SIZE..OFF_CMDLINE_SIZE + 4].try_into().unwrap(),
        ),
    })
}

/// Load `config.kernel_path` into slice RAM through `cursor`: kernel body,
/// reserved init space, ACPI tables, command line, optional initrd, and
/// finally the zero page. Returns the kernel's 64-bit entry point and the
/// zero page address to pass as its argument.
pub fn load_kernel(
    cursor: &mut LoadCursor,
    config: &SliceConfig,
    host_mcfg_bytes: &[u8],
) -> Result<LoadedKernel, ImageError> {
    let data = read_header(&config.kernel_path)?;
    let hdr = validate_header(&data)?;

    let body_offset = 512 * (hdr.setup_sects as u64 + 1);
    let declared_len = hdr.syssize as u64 * 16;
    let file_len = data.len() as u64;
    if body_offset + declared_len > file_len {
        return Err(ImageError::Truncated {
            expected: declared_len,
            body_offset,
            actual: file_len,
        });
    }
    let body_len = declared_len;

    let load_phys = cursor.read_file(
        &config.kernel_path,
        body_offset,
        body_len,
        hdr.kernel_alignment as u64,
    )?;
    let entry_phys = load_phys + ENTRY_OFFSET;

    // Reserve the kernel's full init_size (decompression/BSS working space)
    // so later allocations don't land inside memory the kernel itself will
    // overwrite during early boot.
    let reserved = (hdr.init_size as u64).saturating_sub(body_len);
    cursor.skip(reserved);

    let rsdp_phys = acpi::build_acpi(
        cursor,
        &config.cpus,
        config.dsdt_path.as_deref(),
        host_mcfg_bytes,
    )?;

    let cmdline = config.cmdline.as_deref().unwrap_or("");
    let cmdline_phys = params::place_cmdline(cursor, cmdline, hdr.cmdline_size)?;

    let initrd = match &config.initrd_path {
        Some(path) => Some(params::place_initrd(cursor, path)?),
        None => None,
    };

    let entry_arg = params::build_zero_page(
        cursor,
        &data[SETUP_HEADER_OFFSET..HEADER_PROBE_LEN.min(data.len())],
        cmdline_phys,
        initrd,
        rsdp_phys,
        config.rambase,
        config.ramsize,
    )?;

    Ok(LoadedKernel {
        entry_phys,
        entry_arg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header(version: u16, relocatable: u8, xloadflags: u16) -> Vec<u8> {
        let mut data = vec![0u8; HEADER_PROBE_LEN + 16];
        data[OFF_SETUP_SECTS] = 4;
        data[BOOT_MAGIC_OFFSET..BOOT_MAGIC_OFFSET + 4].copy_from_slice(&BOOT_MAGIC.to_le_bytes());
        data[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&version.to_le_bytes());
        data[OFF_RELOCATABLE_KERNEL] = relocatable;
        data[OFF_XLOADFLAGS..OFF_XLOADFLAGS + 2].copy_from_slice(&xloadflags.to_le_bytes());
        data[OFF_KERNEL_ALIGNMENT..OFF_KERNEL_ALIGNMENT + 4]
            .copy_from_slice(&0x20_0000u32.to_le_bytes());
        data[OFF_INIT_SIZE..OFF_INIT_SIZE + 4].copy_from_slice(&0x100_0000u32.to_le_bytes());
        data[OFF_CMDLINE_SIZE..OFF_CMDLINE_SIZE + 4].copy_from_slice(&2048u32.to_le_bytes());
        data
    }

    #[test]
    fn test_validate_header_accepts_well_formed() {
        let data = minimal_header(0x020f, 1, XLF_KERNEL_64 | XLF_CAN_BE_LOADED_ABOVE_4G);
        let hdr = validate_header(&data).unwrap();
        assert_eq!(hdr.setup_sects, 4);
        assert_eq!(hdr.kernel_alignment, 0x20_0000);
    }

    #[test]
    fn test_validate_header_rejects_old_version() {
        let data = minimal_header(0x0203, 1, XLF_KERNEL_64 | XLF_CAN_BE_LOADED_ABOVE_4G);
        assert!(matches!(
            validate_header(&data),
            Err(ImageError::VersionTooOld(_))
        ));
    }

    #[test]
    fn test_validate_header_rejects_non_relocatable() {
        let data = minimal_header(0x020f, 0, XLF_KERNEL_64 | XLF_CAN_BE_LOADED_ABOVE_4G);
        assert!(matches!(
            validate_header(&data),
            Err(ImageError::NotRelocatable)
        ));
    }

    #[test]
    fn test_validate_header_rejects_missing_64bit_flags() {
        let data = minimal_header(0x020f, 1, 0);
        assert!(matches!(
            validate_header(&data),
            Err(ImageError::Missing64BitSupport(_))
        ));
    }

    #[test]
    fn test_validate_header_rejects_bad_magic() {
        let mut data = minimal_header(0x020f, 1, XLF_KERNEL_64 | XLF_CAN_BE_LOADED_ABOVE_4G);
        data[BOOT_MAGIC_OFFSET] = 0;
        assert!(matches!(validate_header(&data), Err(ImageError::BadMagic(_))));
    }

    #[test]
    fn test_validate_header_rejects_zero_setup_sects() {
        let mut data = minimal_header(0x020f, 1, XLF_KERNEL_64 | XLF_CAN_BE_LOADED_ABOVE_4G);
        data[OFF_SETUP_SECTS] = 0;
        assert!(matches!(
            validate_header(&data),
            Err(ImageError::ZeroSetupSects)
        ));
    }

    #[test]
    fn test_load_kernel_rejects_truncated_body() {
        // syssize declares a 64 KiB body, but the file only has room for the
        // header plus a handful of bytes past body_offset.
        // minimal_header's file is only HEADER_PROBE_LEN+16 bytes long, far
        // short of body_offset (2560) + the declared 64 KiB body.
        let mut data = minimal_header(0x020f, 1, XLF_KERNEL_64 | XLF_CAN_BE_LOADED_ABOVE_4G);
        data[OFF_SYSSIZE..OFF_SYSSIZE + 4].copy_from_slice(&4096u32.to_le_bytes());

        let path = std::env::temp_dir().join(format!(
            "slicer_test_truncated_kernel_{}_{}",
            std::process::id(),
            data.len()
        ));
        fs::write(&path, &data).unwrap();

        let config = SliceConfig {
            kernel_path: path.to_str().unwrap().to_string(),
            initrd_path: None,
            cmdline: None,
            dsdt_path: None,
            rambase: 0x1_0000_0000,
            ramsize: 0x400_0000,
            lowmem: 0x6000,
            cpus: vec![3],
        };

        let window = match super::super::memory::PhysWindow::map(config.rambase, 0x10000) {
            Ok(w) => w,
            Err(_) => {
                let _ = fs::remove_file(&path);
                return; // no /dev/mem access in this sandbox; skip
            }
        };
        let mut cursor = LoadCursor::new(&window, config.rambase);
        let result = load_kernel(&mut cursor, &config, &[]);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(ImageError::Truncated { .. })));
    }
}

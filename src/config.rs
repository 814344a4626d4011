//! Command-line configuration for the slice loader.
//!
//! `Args` is whatever the user typed; `SliceConfig` is the frozen, validated
//! configuration every downstream component reads.

use clap::Parser;
use thiserror::Error;

/// Page size assumed throughout (the only one x86_64 guarantees).
pub const PAGE_SIZE: u64 = 0x1000;

/// Default low-memory trampoline address, matching the original loader.
const DEFAULT_LOWMEM: u64 = 0x6000;

#[derive(Parser, Debug)]
#[command(name = "slicer")]
#[command(about = "Carve a CPU/RAM slice from the host and boot a kernel into it")]
pub struct Args {
    /// Kernel image to boot (bzImage, x86 boot protocol >= 2.12).
    #[arg(long)]
    pub kernel: String,

    /// RAM disk image.
    #[arg(long)]
    pub initrd: Option<String>,

    /// Kernel command line.
    #[arg(long, default_value = "console=ttyS0")]
    pub cmdline: String,

    /// Physical base address of slice memory.
    #[arg(long, value_parser = parse_int)]
    pub rambase: u64,

    /// Size of slice memory, in bytes.
    #[arg(long, value_parser = parse_int)]
    pub ramsize: u64,

    /// Physical address of the real-mode trampoline in the first MiB.
    #[arg(long, value_parser = parse_int, default_value_t = DEFAULT_LOWMEM)]
    pub lowmem: u64,

    /// Comma-separated list of target APIC IDs (ranges allowed, e.g. "2,4-6").
    /// The first entry is the slice's Boot Processor.
    #[arg(long)]
    pub cpus: String,

    /// Path to a DSDT AML file to copy verbatim into the slice's ACPI tables.
    #[arg(long)]
    pub dsdt: Option<String>,
}

/// Parse a C-style integer literal (accepts `0x`/`0` base prefixes).
fn parse_int(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).map_err(|e| e.to_string())
    } else {
        s.parse::<u64>().map_err(|e| e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("RAM base {0:#x} is not page-aligned")]
    MisalignedRamBase(u64),

    #[error("RAM size {0:#x} is not page-aligned")]
    MisalignedRamSize(u64),

    #[error("RAM base and size are required and must be nonzero")]
    ZeroRam,

    #[error("trampoline address {0:#x} is not page-aligned")]
    MisalignedLowmem(u64),

    #[error("trampoline address {0:#x} is not strictly below 640 KiB")]
    LowmemOutOfRange(u64),

    #[error("--cpus list is empty")]
    EmptyCpuList,

    #[error("--cpus list contains a duplicate APIC ID {0}")]
    DuplicateCpu(u32),

    #[error("invalid --cpus entry: {0}")]
    InvalidCpuSpec(String),

    #[error("slice CPU {0} collides with the host's boot-strap processor")]
    BspCollision(u32),

    #[error("slice CPU {0} is not present on the host")]
    CpuNotOnHost(u32),
}

/// Immutable, validated configuration. Frozen once built; nothing here
/// changes for the lifetime of the run.
pub struct SliceConfig {
    pub kernel_path: String,
    pub initrd_path: Option<String>,
    pub cmdline: Option<String>,
    pub dsdt_path: Option<String>,
    pub rambase: u64,
    pub ramsize: u64,
    pub lowmem: u64,
    /// Ordered slice APIC IDs; the first is the slice Boot Processor.
    pub cpus: Vec<u32>,
}

impl SliceConfig {
    /// Build and validate a `SliceConfig` from parsed CLI args.
    ///
    /// Checks everything `clap` can't: page alignment, nonempty/unique CPU
    /// list. Cross-checking against the host's enumerated APIC IDs and BSP
    /// happens separately in the orchestrator once `HostView` is available
    /// (see `boot::host`).
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.rambase == 0 || args.ramsize == 0 {
            return Err(ConfigError::ZeroRam);
        }
        if args.rambase % PAGE_SIZE != 0 {
            return Err(ConfigError::MisalignedRamBase(args.rambase));
        }
        if args.ramsize % PAGE_SIZE != 0 {
            return Err(ConfigError::MisalignedRamSize(args.ramsize));
        }
        if args.lowmem % PAGE_SIZE != 0 {
            return Err(ConfigError::MisalignedLowmem(args.lowmem));
        }
        if args.lowmem >= 640 * 1024 {
            return Err(ConfigError::LowmemOutOfRange(args.lowmem));
        }

        let cpus = parse_cpu_list(&args.cpus)?;
        if cpus.is_empty() {
            return Err(ConfigError::EmptyCpuList);
        }
        let mut seen = std::collections::HashSet::new();
        for &id in &cpus {
            if !seen.insert(id) {
                return Err(ConfigError::DuplicateCpu(id));
            }
        }

        let cmdline = if args.cmdline.is_empty() {
            None
        } else {
            Some(args.cmdline)
        };

        Ok(Self {
            kernel_path: args.kernel,
            initrd_path: args.initrd,
            cmdline,
            dsdt_path: args.dsdt,
            rambase: args.rambase,
            ramsize: args.ramsize,
            lowmem: args.lowmem,
            cpus,
        })
    }

    /// Cross-check the slice CPU list against the host's view: no slice CPU
    /// may equal the host BSP, and every slice CPU must actually be present
    /// on the host.
    pub fn validate_against_host(
        &self,
        host_apic_ids: &[u32],
        host_bsp: u32,
    ) -> Result<(), ConfigError> {
        for &id in &self.cpus {
            if id == host_bsp {
                return Err(ConfigError::BspCollision(id));
            }
            if !host_apic_ids.contains(&id) {
                return Err(ConfigError::CpuNotOnHost(id));
            }
        }
        Ok(())
    }
}

/// Parse a comma-separated list of APIC IDs or inclusive ranges (`A-B`).
fn parse_cpu_list(s: &str) -> Result<Vec<u32>, ConfigError> {
    let mut ids = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(ConfigError::InvalidCpuSpec(s.to_string()));
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidCpuSpec(part.to_string()))?;
            let hi: u32 = hi
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidCpuSpec(part.to_string()))?;
            if lo > hi {
                return Err(ConfigError::InvalidCpuSpec(part.to_string()));
            }
            ids.extend(lo..=hi);
        } else {
            let id: u32 = part
                .parse()
                .map_err(|_| ConfigError::InvalidCpuSpec(part.to_string()))?;
            ids.push(id);
        }
    }
    Ok(ids)
}

//! Boot-image construction for a bare-metal Linux slice.
//!
//! This module owns everything that happens between "we have a kernel image
//! and a chunk of host RAM" and "a target CPU is executing that kernel in
//! 64-bit mode": laying out the kernel, zero-page, ACPI tables and legacy MP
//! tables in slice RAM, neutralizing the host's first MiB, and driving the
//! local APIC through the INIT/INIT/SIPI sequence that hands a physical CPU
//! over to the new kernel.
//!
//! # Linux Boot Protocol
//!
//! The kernel is loaded directly, without any BIOS or bootloader, following
//! the protocol documented at
//! <https://www.kernel.org/doc/html/latest/x86/boot.html>. The essentials:
//!
//! 1. **Kernel loading**: the bzImage setup header is parsed and the
//!    protected/long-mode kernel body is placed at an aligned physical
//!    address inside the slice.
//! 2. **Boot parameters**: a `boot_params` ("zero page") structure is built
//!    with the E820 memory map, command line location, ACPI RSDP address,
//!    and the verbatim setup header.
//! 3. **CPU handoff**: instead of a VMM setting virtual CPU registers, a
//!    real target CPU is yanked out of the host with INIT/INIT/SIPI and
//!    lands in a real-mode trampoline that carries it into the loaded
//!    kernel's 64-bit entry point.
//!
//! There is no virtual-register programming step here (contrast with a
//! hypervisor VMM, which would set CR0/CR3/CR4/EFER and segment registers on
//! a vCPU): a real CPU always starts in real mode off a SIPI, and the
//! trampoline blob (out of scope here, see `trampoline`) performs the mode
//! transition in actual machine code.

pub mod acpi;
pub mod apic;
pub mod bzimage;
pub mod cursor;
pub mod host;
pub mod lowmem;
pub mod memory;
pub mod mptable;
pub mod params;
pub mod trampoline;

/// Physical-memory layout constants used outside of the cursor-driven slice
/// RAM region (which floats, anchored only at `rambase`).
pub mod layout {
    /// Size of the "first MiB" window mapped for low-memory prep.
    pub const FIRST_MIB: u64 = 0x10_0000;

    /// Conventional-memory boundary: the kernel unconditionally reserves
    /// `[0, 640 KiB)` after boot, so this is where the real-mode trampoline
    /// and synthetic MP table live.
    pub const CONVENTIONAL_MEM: u64 = 639 * 1024;

    /// Fallback physical address for the synthetic MP floating pointer if no
    /// stale host MP table was found to overwrite in place.
    pub const FALLBACK_MPTABLE_ADDR: u64 = CONVENTIONAL_MEM;

    /// Low-memory MP-table scan range 1: the first KiB.
    pub const MP_SCAN_RANGE_LOW: (u64, u64) = (0, 1024);

    /// Low-memory MP-table scan range 2: the last KiB of conventional
    /// memory, where BIOS/EBDA implementations traditionally place it.
    pub const MP_SCAN_RANGE_HIGH: (u64, u64) = (CONVENTIONAL_MEM, CONVENTIONAL_MEM + 1024);

    /// Two-entry E820 map the zero page always carries: conventional memory
    /// plus the slice's own RAM region. See `params::e820`.
    pub const E820_ENTRIES: u8 = 2;
}

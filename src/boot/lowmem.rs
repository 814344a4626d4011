//! Low-memory preparation: stages the trampoline and a synthetic MP table
//! in the awakening CPU's first MiB before the INIT/INIT/SIPI sequence
//! fires.
//!
//! The host's own BIOS/firmware left its own `_MP_` floating pointer
//! somewhere in this range (conventionally `[0, 1 KiB)` or the last KiB of
//! conventional memory). A scan for CPUs waking into real mode starts at
//! whichever one it finds first, so the host's real table has to be
//! scrubbed before ours goes down — otherwise the awakening CPU could
//! parse a config table describing the *host's* processor set instead of
//! the slice's.

use super::host;
use super::layout;
use super::memory::{MemoryError, PhysWindow};
use super::mptable::{self, MpTableError};
use super::trampoline::{self, TrampolineError};
use crate::config::SliceConfig;

#[derive(thiserror::Error, Debug)]
pub enum LowMemError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Trampoline(#[from] TrampolineError),

    #[error(transparent)]
    MpTable(#[from] MpTableError),
}

/// Overwrite the MP floating pointer signature so a stale host table can
/// never be mistaken for ours.
const MP_SCRUB_SIGNATURE: [u8; 4] = *b"-MP-";
const MP_SIGNATURE: [u8; 4] = *b"_MP_";

/// Scrub every occurrence of `_MP_` in `[start, end)`, returning the
/// physical address of the first one found (if any).
fn scrub_range(window: &PhysWindow, start: u64, end: u64) -> Result<Option<u64>, LowMemError> {
    let mut first = None;
    let mut addr = start;
    while addr + 4 <= end {
        let mut buf = [0u8; 4];
        window.read(addr, &mut buf)?;
        if buf == MP_SIGNATURE {
            if first.is_none() {
                first = Some(addr);
            }
            window.write(addr, &MP_SCRUB_SIGNATURE)?;
        }
        addr += 4;
    }
    Ok(first)
}

/// Map the first MiB, patch and place the trampoline, scrub any host MP
/// table out of the scan range and write ours in its place, and return the
/// real-mode entry point (`boot_ip`) an INIT/SIPI should target.
pub fn lowmem_init(
    config: &SliceConfig,
    kernel_entry: u64,
    kernel_arg: u64,
) -> Result<u64, LowMemError> {
    let window = PhysWindow::map(0, layout::FIRST_MIB)?;

    let patched = trampoline::patch(kernel_entry, kernel_arg)?;
    window.write(config.lowmem, &patched)?;

    let (low_start, low_end) = layout::MP_SCAN_RANGE_LOW;
    let (high_start, high_end) = layout::MP_SCAN_RANGE_HIGH;
    let found_low = scrub_range(&window, low_start, low_end)?;
    let found_high = scrub_range(&window, high_start, high_end)?;
    let mp_addr = found_low
        .or(found_high)
        .unwrap_or(layout::FALLBACK_MPTABLE_ADDR);

    let (cpu_signature, feature_flags) = host::cpu_signature_and_features();
    mptable::write_mp_tables(&window, mp_addr, &config.cpus, cpu_signature, feature_flags)?;

    eprintln!(
        "[LowMem] trampoline@{:#x} mptable@{:#x} ({} bytes)",
        config.lowmem,
        mp_addr,
        mptable::table_span(config.cpus.len())
    );

    Ok(config.lowmem)
}

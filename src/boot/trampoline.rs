//! The real-mode trampoline: an opaque blob, assembled separately, that a
//! SIPI lands a target CPU in, carrying it from real mode through to the
//! loaded kernel's 64-bit entry point.
//!
//! This module does not assemble or understand the trampoline's machine
//! code. It only patches two fields of its known header layout and copies
//! the result into low memory — mirroring how `bzimage` treats the kernel
//! body as an opaque byte range it places rather than interprets.

/// The trampoline blob, linked directly into this binary rather than loaded
/// from a runtime path, the same way the kernel's own setup-header bytes are
/// carried as a static slice once read.
pub static BLOB: &[u8] = include_bytes!("../../assets/trampoline.bin");

/// Sentinel the shipped blob carries in `kernel_entry` before patching, used
/// to detect a mismatched or stale trampoline binary.
pub const SENTINEL: u64 = 0x5c39_2154_4fd4_ae2d;

/// Byte offset of `kernel_entry` within the header.
const KERNEL_ENTRY_OFFSET: usize = 8;
/// Byte offset of `kernel_arg` within the header.
const KERNEL_ARG_OFFSET: usize = 16;
/// Total header size: {reserved, kernel_entry, kernel_arg} as u64 each.
const HEADER_LEN: usize = 24;

/// Patch a copy of `BLOB` with the real kernel entry point and argument,
/// verifying the sentinel first so a build/link mismatch fails loudly
/// instead of jumping to garbage.
pub fn patch(kernel_entry: u64, kernel_arg: u64) -> Result<Vec<u8>, TrampolineError> {
    if BLOB.len() < HEADER_LEN {
        return Err(TrampolineError::TooShort(BLOB.len()));
    }

    let observed = u64::from_le_bytes(
        BLOB[KERNEL_ENTRY_OFFSET..KERNEL_ENTRY_OFFSET + 8]
            .try_into()
            .unwrap(),
    );
    if observed != SENTINEL {
        return Err(TrampolineError::SentinelMismatch(observed));
    }

    let mut patched = BLOB.to_vec();
    patched[KERNEL_ENTRY_OFFSET..KERNEL_ENTRY_OFFSET + 8]
        .copy_from_slice(&kernel_entry.to_le_bytes());
    patched[KERNEL_ARG_OFFSET..KERNEL_ARG_OFFSET + 8].copy_from_slice(&kernel_arg.to_le_bytes());
    Ok(patched)
}

#[derive(thiserror::Error, Debug)]
pub enum TrampolineError {
    #[error("trampoline blob is only {0} bytes, shorter than the {HEADER_LEN}-byte header")]
    TooShort(usize),

    #[error("trampoline blob kernel_entry sentinel {0:#x} does not match expected {SENTINEL:#x}; build/link mismatch")]
    SentinelMismatch(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shipped_blob_carries_sentinel() {
        let observed = u64::from_le_bytes(
            BLOB[KERNEL_ENTRY_OFFSET..KERNEL_ENTRY_OFFSET + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(observed, SENTINEL);
    }

    #[test]
    fn test_patch_overwrites_entry_and_arg() {
        let patched = patch(0x1_0000_0200, 0x1_0020_0000).unwrap();
        let entry = u64::from_le_bytes(
            patched[KERNEL_ENTRY_OFFSET..KERNEL_ENTRY_OFFSET + 8]
                .try_into()
                .unwrap(),
        );
        let arg = u64::from_le_bytes(
            patched[KERNEL_ARG_OFFSET..KERNEL_ARG_OFFSET + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(entry, 0x1_0000_0200);
        assert_eq!(arg, 0x1_0020_0000);
    }

    #[test]
    fn test_patch_rejects_bad_sentinel() {
        let mut bad_blob = BLOB.to_vec();
        bad_blob[KERNEL_ENTRY_OFFSET..KERNEL_ENTRY_OFFSET + 8].copy_from_slice(&0u64.to_le_bytes());
        let observed = u64::from_le_bytes(
            bad_blob[KERNEL_ENTRY_OFFSET..KERNEL_ENTRY_OFFSET + 8]
                .try_into()
                .unwrap(),
        );
        assert_ne!(observed, SENTINEL);
    }
}

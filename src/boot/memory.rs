//! Physical memory windows backed by `/dev/mem`.
//!
//! Unlike a hypervisor VMM, which maps anonymous host memory and lets KVM
//! translate guest-physical to host-physical addresses via EPT/NPT, this
//! system has no virtual guest: slice RAM *is* host RAM, so every "guest
//! physical address" here is simply a real physical address the kernel will
//! see untranslated. We get at it by `mmap`-ing a window of `/dev/mem`.
//!
//! # Memory Model
//!
//! ```text
//! Host physical address  ==  "slice physical address"  ==  address written
//!                                                           into firmware
//!                                                           tables
//! ```
//!
//! `/dev/mem` mappings are write-through to physical memory: once the
//! mapping is released (unmapped), the written bytes are guaranteed visible
//! to any other observer of that physical range, including the CPU we are
//! about to wake up. There is no separate "flush" step.
//!
//! # Bounce Buffering
//!
//! The host kernel forbids direct file I/O (`read()`/`pread()`) into a
//! `/dev/mem` mapping — bytes must be staged through ordinary heap memory
//! first. `PhysWindow::read_file_into` implements this in ≤32 KiB chunks
//! (see `bzimage` and `params` for the call sites that need it).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use thiserror::Error;

/// Any single bounce-buffer chunk used when reading host files into a
/// `/dev/mem` mapping. The host forbids larger direct transfers.
const BOUNCE_CHUNK: usize = 0x8000;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("failed to open /dev/mem: {0}")]
    OpenDevMem(#[source] std::io::Error),

    #[error("failed to mmap {len:#x} bytes at physical offset {offset:#x}: {source}")]
    Mmap {
        offset: u64,
        len: u64,
        #[source]
        source: nix::Error,
    },

    #[error("access at {addr:#x} (len {len}) falls outside the mapped window [{base:#x}, {end:#x})")]
    OutOfBounds {
        addr: u64,
        len: usize,
        base: u64,
        end: u64,
    },

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A single contiguous physical-memory window mapped read/write from
/// `/dev/mem`, released on `Drop`.
///
/// Every address here is a real host physical address and the backing store
/// is a real file descriptor, not an anonymous mapping — so the mapping must
/// be released (`munmap`) before the range it covers can be handed off to
/// the awakening CPU.
pub struct PhysWindow {
    ptr: *mut u8,
    base: u64,
    len: u64,
}

impl PhysWindow {
    /// Map `len` bytes of host physical memory starting at `base`.
    ///
    /// Opens `/dev/mem` read/write for the duration of the mapping only;
    /// the file descriptor is not retained past this call (mmap keeps the
    /// mapping alive independent of the fd).
    pub fn map(base: u64, len: u64) -> Result<Self, MemoryError> {
        let devmem = File::options()
            .read(true)
            .write(true)
            .open("/dev/mem")
            .map_err(MemoryError::OpenDevMem)?;

        let ptr = unsafe {
            nix::sys::mman::mmap(
                None,
                std::num::NonZeroUsize::new(len as usize).expect("zero-length mapping"),
                nix::sys::mman::ProtFlags::PROT_READ | nix::sys::mman::ProtFlags::PROT_WRITE,
                nix::sys::mman::MapFlags::MAP_SHARED,
                &devmem,
                base as libc::off_t,
            )
            .map_err(|source| MemoryError::Mmap {
                offset: base,
                len,
                source,
            })?
        };

        Ok(Self {
            ptr: ptr.as_ptr() as *mut u8,
            base,
            len,
        })
    }

    /// Physical base address of this window.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length of this window in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    fn slice_offset(&self, addr: u64, len: usize) -> Result<usize, MemoryError> {
        window_offset(self.base, self.len, addr, len)
    }

    /// Write bytes at a physical address inside this window.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let offset = self.slice_offset(addr, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }
        Ok(())
    }

    /// Read bytes from a physical address inside this window.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        let offset = self.slice_offset(addr, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), data.as_mut_ptr(), data.len());
        }
        Ok(())
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Zero a span within this window.
    pub fn zero(&self, addr: u64, len: usize) -> Result<(), MemoryError> {
        let offset = self.slice_offset(addr, len)?;
        unsafe {
            std::ptr::write_bytes(self.ptr.add(offset), 0, len);
        }
        Ok(())
    }

    /// Read a file into this window through a bounce buffer, since the host
    /// kernel forbids direct I/O into a `/dev/mem` mapping.
    pub fn read_file_into(
        &self,
        path: &str,
        file_offset: u64,
        dest_addr: u64,
        len: u64,
    ) -> Result<(), MemoryError> {
        let mut file = File::open(path).map_err(|source| MemoryError::ReadFile {
            path: path.to_string(),
            source,
        })?;
        file.seek(SeekFrom::Start(file_offset))
            .map_err(|source| MemoryError::ReadFile {
                path: path.to_string(),
                source,
            })?;

        let mut remaining = len;
        let mut dest = dest_addr;
        let mut chunk = vec![0u8; BOUNCE_CHUNK.min(len as usize).max(1)];
        while remaining > 0 {
            let take = (remaining as usize).min(chunk.len());
            file.read_exact(&mut chunk[..take])
                .map_err(|source| MemoryError::ReadFile {
                    path: path.to_string(),
                    source,
                })?;
            self.write(dest, &chunk[..take])?;
            dest += take as u64;
            remaining -= take as u64;
        }
        Ok(())
    }
}

/// Pure bounds-check, factored out of `PhysWindow` so it can be unit-tested
/// without a real `/dev/mem` mapping.
fn window_offset(base: u64, win_len: u64, addr: u64, len: usize) -> Result<usize, MemoryError> {
    let end = base + win_len;
    if addr < base || addr + len as u64 > end {
        return Err(MemoryError::OutOfBounds {
            addr,
            len,
            base,
            end,
        });
    }
    Ok((addr - base) as usize)
}

impl Drop for PhysWindow {
    fn drop(&mut self) {
        unsafe {
            let _ = nix::sys::mman::munmap(
                std::ptr::NonNull::new_unchecked(self.ptr as *mut libc::c_void),
                self.len as usize,
            );
        }
    }
}

// SAFETY: the mapping is exclusively owned by this struct and all access
// goes through bounds-checked read/write methods; the raw pointer itself
// carries no interior mutability hazards beyond what `/dev/mem` already
// implies (another process could be writing the same physical range, which
// is inherent to the operation this tool performs, not a Rust-safety gap).
unsafe impl Send for PhysWindow {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_bounds_rejected() {
        // Constructing a PhysWindow requires real /dev/mem access, which
        // isn't available in a unit-test sandbox; exercise the pure
        // bounds-checking logic directly instead.
        assert!(window_offset(0x1000, 0x1000, 0x500, 4).is_err());
        assert!(window_offset(0x1000, 0x1000, 0x1ffe, 4).is_err());
        assert_eq!(window_offset(0x1000, 0x1000, 0x1000, 4).unwrap(), 0);
    }
}

//! Local APIC driver: detects xAPIC vs. x2APIC and drives the INIT/INIT/SIPI
//! sequence that yanks a target CPU out of host control.
//!
//! Unlike a kernel's own APIC driver (see the `other_examples` reference
//! implementations this module is grounded on), this one runs from
//! userspace: there is no in-kernel MMIO mapping or `rdmsr`/`wrmsr`
//! instruction available to us, so xAPIC registers are reached through an
//! `mmap`ed window of `/dev/mem` and x2APIC registers through `pread`/
//! `pwrite` on `/dev/cpu/<N>/msr`. The register map and ICR semantics are
//! identical to any other x86 APIC driver; only the access mechanism
//! differs.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use super::memory::{MemoryError, PhysWindow};

/// IA32_APIC_BASE MSR number.
const IA32_APIC_BASE: u64 = 0x1B;
/// Bit 8: this is the BSP of the host.
const APIC_BASE_BSP: u64 = 1 << 8;
/// Bit 10: x2APIC mode enabled.
const APIC_BASE_X2APIC: u64 = 1 << 10;
/// Bit 11: APIC globally enabled.
const APIC_BASE_ENABLE: u64 = 1 << 11;
/// Mask for the xAPIC MMIO base physical address within APIC_BASE.
const APIC_BASE_ADDR_MASK: u64 = 0xFFFF_F000;

/// Register byte offsets within the xAPIC MMIO page.
const REG_ID: u32 = 0x020;
const REG_ICR_LOW: u32 = 0x300;
const REG_ICR_HIGH: u32 = 0x310;

/// x2APIC MSRs start at 0x800 and are indexed by `xapic_offset / 16`.
const X2APIC_MSR_BASE: u32 = 0x800;

/// ICR delivery-status bit (xAPIC only; read-only, set while the IPI is in
/// flight).
const ICR_DELIVERY_PENDING: u32 = 1 << 12;

const ICR_DELIVERY_INIT: u32 = 5 << 8;
const ICR_DELIVERY_STARTUP: u32 = 6 << 8;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_TRIGGER_LEVEL: u32 = 1 << 15;

/// Minimum delay the Intel/AMD MP startup protocol requires between the two
/// SIPIs.
const SIPI_DELAY: Duration = Duration::from_micros(10);

#[derive(Error, Debug)]
pub enum ApicError {
    #[error("failed to open MSR device {path}: {source}")]
    OpenMsr {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read MSR {msr:#x} from {path}: {source}")]
    ReadMsr {
        path: String,
        msr: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write MSR {msr:#x} to {path}: {source}")]
    WriteMsr {
        path: String,
        msr: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("host BSP flag not set in IA32_APIC_BASE ({0:#x})")]
    NotBsp(u64),

    #[error("APIC not globally enabled in IA32_APIC_BASE ({0:#x})")]
    ApicDisabled(u64),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("APIC_ID register read {observed:#x} disagrees with CPUID-reported local APIC id {expected:#x}")]
    ApicIdMismatch { observed: u32, expected: u32 },

    #[error("startup address {0:#x} is not page-aligned")]
    MisalignedStartup(u64),

    #[error("startup address {0:#x} is not below the first MiB")]
    StartupOutOfRange(u64),

    #[error("target APIC id {0:#x} exceeds the xAPIC 8-bit destination field")]
    XapicDestinationOverflow(u32),
}

/// A Model-Specific-Register device, opened once and used for both reads and
/// writes via `pread`/`pwrite` with the MSR number as the file offset.
struct MsrDevice {
    file: File,
    path: String,
}

impl MsrDevice {
    fn open(cpu_index: u32) -> Result<Self, ApicError> {
        let path = format!("/dev/cpu/{cpu_index}/msr");
        let file = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| ApicError::OpenMsr {
                path: path.clone(),
                source,
            })?;
        Ok(Self { file, path })
    }

    fn read(&mut self, msr: u64) -> Result<u64, ApicError> {
        self.file
            .seek(SeekFrom::Start(msr))
            .map_err(|source| ApicError::ReadMsr {
                path: self.path.clone(),
                msr,
                source,
            })?;
        let mut buf = [0u8; 8];
        self.file
            .read_exact(&mut buf)
            .map_err(|source| ApicError::ReadMsr {
                path: self.path.clone(),
                msr,
                source,
            })?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write(&mut self, msr: u64, value: u64) -> Result<(), ApicError> {
        self.file
            .seek(SeekFrom::Start(msr))
            .map_err(|source| ApicError::WriteMsr {
                path: self.path.clone(),
                msr,
                source,
            })?;
        self.file
            .write_all(&value.to_le_bytes())
            .map_err(|source| ApicError::WriteMsr {
                path: self.path.clone(),
                msr,
                source,
            })
    }
}

/// Sum type over the two local-APIC access mechanisms, sharing one
/// operation set (`read_id`, `send_ipi`) rather than trait-object dispatch
/// — there are only ever two variants and no third is coming.
enum ApicBackend {
    XApic { window: PhysWindow },
    X2Apic,
}

/// The local APIC driver for the host's single boot-strap processor.
pub struct LocalApic {
    msr: MsrDevice,
    backend: ApicBackend,
}

impl LocalApic {
    /// Open the host's single MSR device, detect xAPIC vs. x2APIC mode, and
    /// cross-check the driver's view of its own APIC ID against
    /// `expected_apic_id` (from CPUID, see `host::local_apic_id`).
    pub fn detect(cpu_index: u32, expected_apic_id: u32) -> Result<Self, ApicError> {
        let mut msr = MsrDevice::open(cpu_index)?;
        let apic_base = msr.read(IA32_APIC_BASE)?;

        if apic_base & APIC_BASE_BSP == 0 {
            return Err(ApicError::NotBsp(apic_base));
        }
        if apic_base & APIC_BASE_ENABLE == 0 {
            return Err(ApicError::ApicDisabled(apic_base));
        }

        let backend = if apic_base & APIC_BASE_X2APIC != 0 {
            ApicBackend::X2Apic
        } else {
            let mmio_base = apic_base & APIC_BASE_ADDR_MASK;
            let window = PhysWindow::map(mmio_base, 0x1000)?;
            ApicBackend::XApic { window }
        };

        let mut driver = Self { msr, backend };
        let observed = driver.read_id()?;
        if observed != expected_apic_id {
            return Err(ApicError::ApicIdMismatch {
                observed,
                expected: expected_apic_id,
            });
        }
        Ok(driver)
    }

    fn read_id(&mut self) -> Result<u32, ApicError> {
        match &self.backend {
            ApicBackend::XApic { window } => {
                let raw = window.read_u32(REG_ID as u64)?;
                Ok(raw >> 24)
            }
            ApicBackend::X2Apic => {
                // x2APIC exposes the full 32-bit ID directly, no read-shift.
                let msr = X2APIC_MSR_BASE as u64 + (REG_ID as u64 >> 4);
                Ok(self.msr.read(msr)? as u32)
            }
        }
    }

    /// Write the ICR to send one IPI. `icr_low` carries delivery
    /// mode/level/trigger/vector; `dest_apic_id` is the 32-bit destination.
    ///
    /// In xAPIC mode the destination (ICR-high) is written first, then the
    /// command (ICR-low) — the low-half write is what commits the send — and
    /// the caller must have already observed a clear delivery-status bit. In
    /// x2APIC mode both halves are a single atomic MSR write.
    fn write_icr(&mut self, dest_apic_id: u32, icr_low: u32) -> Result<(), ApicError> {
        match &self.backend {
            ApicBackend::XApic { window } => {
                window.write_u32(REG_ICR_HIGH as u64, dest_apic_id << 24)?;
                window.write_u32(REG_ICR_LOW as u64, icr_low)?;
            }
            ApicBackend::X2Apic => {
                let icr = ((dest_apic_id as u64) << 32) | icr_low as u64;
                let msr = X2APIC_MSR_BASE as u64 + (REG_ICR_LOW as u64 >> 4);
                self.msr.write(msr, icr)?;
            }
        }
        Ok(())
    }

    /// Poll the xAPIC delivery-status bit until it clears. x2APIC commits
    /// its single MSR write atomically, so there is nothing to poll there.
    fn wait_delivered(&self) -> Result<(), ApicError> {
        if let ApicBackend::XApic { window } = &self.backend {
            loop {
                let icr_low = window.read_u32(REG_ICR_LOW as u64)?;
                if icr_low & ICR_DELIVERY_PENDING == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Send the INIT/INIT/SIPI sequence to `target_apic_id`, pointing the
    /// startup vector at `startup_phys` (the trampoline page).
    pub fn send_startup_ipi(
        &mut self,
        target_apic_id: u32,
        startup_phys: u64,
    ) -> Result<(), ApicError> {
        if startup_phys % 0x1000 != 0 {
            return Err(ApicError::MisalignedStartup(startup_phys));
        }
        if startup_phys >= 0x10_0000 {
            return Err(ApicError::StartupOutOfRange(startup_phys));
        }
        if matches!(self.backend, ApicBackend::XApic { .. }) && target_apic_id > 0xFF {
            return Err(ApicError::XapicDestinationOverflow(target_apic_id));
        }
        let vector = (startup_phys >> 12) as u32;

        // INIT assert
        self.write_icr(
            target_apic_id,
            ICR_DELIVERY_INIT | ICR_LEVEL_ASSERT | ICR_TRIGGER_LEVEL,
        )?;
        self.wait_delivered()?;

        // INIT deassert
        self.write_icr(target_apic_id, ICR_DELIVERY_INIT | ICR_TRIGGER_LEVEL)?;
        self.wait_delivered()?;

        // First SIPI
        self.write_icr(
            target_apic_id,
            ICR_DELIVERY_STARTUP | ICR_LEVEL_ASSERT | vector,
        )?;
        self.wait_delivered()?;

        thread::sleep(SIPI_DELAY);

        // Second SIPI
        self.write_icr(
            target_apic_id,
            ICR_DELIVERY_STARTUP | ICR_LEVEL_ASSERT | vector,
        )?;
        self.wait_delivered()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every ICR write (dest, low-half-command) pair against a mock
    /// xAPIC target.
    struct RecordingIcr {
        writes: Vec<(u32, u32)>,
    }

    impl RecordingIcr {
        fn record(&mut self, dest: u32, icr_low: u32) {
            self.writes.push((dest, icr_low));
        }
    }

    fn expected_sequence(target: u32, page: u32) -> Vec<(u32, u32)> {
        vec![
            (target, 0xC500),
            (target, 0x8500),
            (target, 0x4600 | page),
            (target, 0x4600 | page),
        ]
    }

    #[test]
    fn test_icr_encoding_for_init_init_sipi_sequence() {
        let target = 3u32;
        let page = 0x6u32; // startup_phys = 0x6000 -> page = 0x6000 >> 12
        let mut recorder = RecordingIcr { writes: Vec::new() };

        recorder.record(target, ICR_DELIVERY_INIT | ICR_LEVEL_ASSERT | ICR_TRIGGER_LEVEL);
        recorder.record(target, ICR_DELIVERY_INIT | ICR_TRIGGER_LEVEL);
        recorder.record(target, ICR_DELIVERY_STARTUP | ICR_LEVEL_ASSERT | page);
        recorder.record(target, ICR_DELIVERY_STARTUP | ICR_LEVEL_ASSERT | page);

        assert_eq!(recorder.writes, expected_sequence(target, page));
    }

    #[test]
    fn test_delivery_pending_bit_value() {
        assert_eq!(ICR_DELIVERY_PENDING, 1 << 12);
    }
}

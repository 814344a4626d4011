//! slicer - carves a CPU/RAM slice out of a running Linux host and hands
//! one CPU off to a freshly loaded kernel via INIT/INIT/SIPI.
//!
//! There is no hypervisor here: slice RAM is host RAM, reached through
//! `/dev/mem`, and the slice CPU is a real host CPU the operator has
//! already excluded from the host scheduler (see DESIGN.md). This tool
//! requires Linux's `/dev/mem`, `/dev/cpu/*/msr`, and
//! `/sys/firmware/acpi/tables/*` surfaces.

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod config;
#[cfg(target_os = "linux")]
mod error;

use std::process::ExitCode;

#[cfg(target_os = "linux")]
const HOST_MADT_PATH: &str = "/sys/firmware/acpi/tables/APIC";
#[cfg(target_os = "linux")]
const HOST_MCFG_PATH: &str = "/sys/firmware/acpi/tables/MCFG";

#[cfg(target_os = "linux")]
fn main() -> ExitCode {
    use clap::Parser;

    let args = config::Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[cfg(not(target_os = "linux"))]
fn main() -> ExitCode {
    eprintln!(
        "Error: slicer requires Linux (/dev/mem, /dev/cpu/*/msr, /sys/firmware/acpi/tables/*)."
    );
    ExitCode::FAILURE
}

/// Validate configuration against the host, load the kernel into slice RAM,
/// stage the trampoline and MP table in the host's first MiB, and send the
/// startup IPI. Strict order per DESIGN.md: map slice RAM, load Linux,
/// unmap slice RAM, prep low memory, send startup IPI.
#[cfg(target_os = "linux")]
fn run(args: config::Args) -> Result<(), error::SliceError> {
    use boot::{apic::LocalApic, bzimage, cursor::LoadCursor, host, lowmem, memory::PhysWindow};

    let config = config::SliceConfig::from_args(args)?;
    eprintln!("[Slicer] kernel: {}", config.kernel_path);
    eprintln!(
        "[Slicer] slice RAM: base={:#x} size={:#x}",
        config.rambase, config.ramsize
    );
    eprintln!(
        "[Slicer] slice CPUs: {:?} (bsp={:#x})",
        config.cpus, config.cpus[0]
    );

    let host_view = host::HostView::gather(HOST_MADT_PATH, HOST_MCFG_PATH)?;
    config.validate_against_host(&host_view.host_apic_ids, host_view.bsp_apic_id)?;
    eprintln!(
        "[Slicer] host BSP apic id={:#x}, {} host CPUs visible",
        host_view.bsp_apic_id,
        host_view.host_apic_ids.len()
    );

    let host_mcfg_bytes = std::fs::read(HOST_MCFG_PATH)?;

    let loaded = {
        let window = PhysWindow::map(config.rambase, config.ramsize)?;
        let mut cursor = LoadCursor::new(&window, config.rambase);
        bzimage::load_kernel(&mut cursor, &config, &host_mcfg_bytes)?
        // `window` drops here: slice RAM is unmapped. `/dev/mem` mappings
        // are write-through, so every table and byte written above is
        // already visible to the CPU we're about to wake.
    };
    eprintln!(
        "[Slicer] kernel entry={:#x}, zero page={:#x}",
        loaded.entry_phys, loaded.entry_arg
    );

    let boot_ip = lowmem::lowmem_init(&config, loaded.entry_phys, loaded.entry_arg)?;

    let host_cpu_index = host::single_host_cpu_index()?;
    let mut apic = LocalApic::detect(host_cpu_index, host_view.bsp_apic_id)?;

    let target_apic_id = config.cpus[0];
    eprintln!(
        "[Slicer] sending INIT/INIT/SIPI to apic id {:#x}, startup vector {:#x}...",
        target_apic_id, boot_ip
    );
    apic.send_startup_ipi(target_apic_id, boot_ip)?;

    eprintln!("[Slicer] slice CPU {:#x} handed off.", target_apic_id);
    Ok(())
}

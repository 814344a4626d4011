//! Crate-wide error aggregation.
//!
//! Each component defines its own `thiserror` enum scoped to its failure
//! modes (see `config`, `boot::host`, `boot::bzimage`, `boot::lowmem`,
//! `boot::apic`). `SliceError` wraps each of those with `#[from]` so
//! orchestration code can use `?` across component boundaries while `main`
//! prints a single `Display` value.

use thiserror::Error;

use crate::boot::apic::ApicError;
use crate::boot::bzimage::ImageError;
use crate::boot::host::HostError;
use crate::boot::lowmem::LowMemError;
use crate::boot::memory::MemoryError;
use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum SliceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    LowMem(#[from] LowMemError),

    #[error(transparent)]
    Apic(#[from] ApicError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

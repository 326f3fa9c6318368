//! Error taxonomy for the power-management core.
//!
//! Three classes of failure, handled very differently:
//!
//! 1. **Setup failures** (`UnsupportedCpu`, `Setup`, `Pci`) abort controller
//!    construction and leave the caller free to report and continue.
//! 2. **Fatal register failures** (`FatalRegister`) mean a register the
//!    steady-state algorithm unconditionally depends on could not be read.
//!    Continuing with stale or garbage register data is more dangerous than
//!    stopping, so callers terminate the process on this variant.
//! 3. **Recoverable conditions** — counter overflow, a non-monotonic sample —
//!    are *not* errors. They are silent one-cycle skips and never appear here.
//!
//! No operation in this crate retries. Every failure either surfaces
//! immediately, skips exactly one polling cycle, or is fatal.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PmError>;

/// Errors produced by the power-management core.
#[derive(Debug, Error)]
pub enum PmError {
    /// CPU vendor signature does not match AuthenticAMD.
    #[error("unsupported CPU vendor {vendor:?}")]
    UnsupportedCpu { vendor: String },

    /// Initialization could not complete; the controller stays inactive.
    #[error("setup failed: {0}")]
    Setup(String),

    /// A register the algorithm treats as unconditionally required could
    /// not be read. Callers must treat this as process-terminating.
    #[error("required register 0x{addr:08X} unreadable on cpu {cpu}: {source}")]
    FatalRegister {
        cpu: u32,
        addr: u32,
        #[source]
        source: std::io::Error,
    },

    /// PCI configuration space access failed during setup or refresh.
    #[error("pci config access failed: {0}")]
    Pci(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PmError {
    /// Whether this error demands process termination rather than reporting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalRegister { .. })
    }
}

//! Model-specific register access.
//!
//! Register reads and writes go through an injected [`MsrBackend`] capability
//! resolved at startup. The [`Registers`] façade layers the crate's access
//! policy on top:
//!
//! - reads of required registers map backend failure to
//!   [`PmError::FatalRegister`], which callers treat as process-terminating;
//! - writes prefer a fault-reporting backend when the environment provides
//!   one, and otherwise fall back to the unchecked path — a fault inside an
//!   unchecked write halts at a lower layer, so the fallback only ever
//!   returns success.
//!
//! The concrete Linux backend reads `/dev/cpu/N/msr` (requires root or
//! `CAP_SYS_RAWIO` and the `msr` kernel module).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use log::warn;

use crate::error::{PmError, Result};

// ---------------------------------------------------------------------------
// AMD family 17h register map
// ---------------------------------------------------------------------------

/// Maximum performance counter (reference cycles).
pub const MSR_MPERF: u32 = 0xE7;
/// Actual performance counter.
pub const MSR_APERF: u32 = 0xE8;
/// Hardware configuration register. Bit 25 disables core performance boost,
/// bit 30 locks the effective-frequency counter pair to read-only mode.
pub const MSR_HWCR: u32 = 0xC001_0015;
/// P-state control register; low 3 bits select the commanded P-state.
pub const MSR_PSTATE_CTL: u32 = 0xC001_0062;
/// P-state status register.
pub const MSR_PSTATE_STAT: u32 = 0xC001_0063;
/// First P-state definition register; slots occupy consecutive addresses.
pub const MSR_PSTATE_0: u32 = 0xC001_0064;
/// C-state base address register.
pub const MSR_CSTATE_ADDR: u32 = 0xC001_0073;
/// RAPL power unit register (energy/time unit exponents).
pub const MSR_RAPL_PWR_UNIT: u32 = 0xC001_0299;
/// Package energy accumulator (32-bit, wraps).
pub const MSR_PKG_ENERGY_STAT: u32 = 0xC001_029B;
/// Current hardware P-state status (CurCpuFid/CurCpuDfsId/CurCpuVid).
pub const MSR_HARDWARE_PSTATE_STATUS: u32 = 0xC001_0293;
/// Retired instruction counter.
pub const MSR_PERF_IRPC: u32 = 0xC000_00E9;

// ---------------------------------------------------------------------------
// Backend capability
// ---------------------------------------------------------------------------

/// Injected register-access capability.
///
/// Implementations must target the MSR of the *named* logical core, not the
/// calling thread's core: rendezvous callbacks pass their own core id, so in
/// practice the two coincide, but the contract is explicit addressing.
pub trait MsrBackend: Send + Sync {
    /// Read the 64-bit register at `addr` on logical core `cpu`.
    fn read(&self, cpu: u32, addr: u32) -> io::Result<u64>;

    /// Write the 64-bit register at `addr` on logical core `cpu`.
    fn write(&self, cpu: u32, addr: u32, value: u64) -> io::Result<()>;

    /// Whether `write` reports faults instead of halting the machine.
    /// Backends without this capability get the unchecked fallback path.
    fn supports_safe_write(&self) -> bool {
        false
    }
}

/// Register access façade with the crate's fatal/fallback policy applied.
pub struct Registers {
    backend: Arc<dyn MsrBackend>,
    safe_write: bool,
}

impl Registers {
    pub fn new(backend: Arc<dyn MsrBackend>) -> Self {
        let safe_write = backend.supports_safe_write();
        if !safe_write {
            warn!("no fault-reporting register write available, falling back to unchecked writes");
        }
        Self {
            backend,
            safe_write,
        }
    }

    /// Read a register the algorithm treats as unconditionally required.
    ///
    /// Failure maps to [`PmError::FatalRegister`]; downstream computation
    /// assumes valid hardware state and cannot continue with defaults.
    pub fn read(&self, cpu: u32, addr: u32) -> Result<u64> {
        self.backend
            .read(cpu, addr)
            .map_err(|source| PmError::FatalRegister { cpu, addr, source })
    }

    /// Read a register whose absence is tolerable for one cycle.
    pub fn try_read(&self, cpu: u32, addr: u32) -> Option<u64> {
        self.backend.read(cpu, addr).ok()
    }

    /// Write a register. With a fault-reporting backend the result reflects
    /// the write; on the unchecked fallback the write either succeeds or the
    /// process is already gone, so the contract is "returns only on success".
    pub fn write(&self, cpu: u32, addr: u32, value: u64) -> bool {
        if self.safe_write {
            return self.backend.write(cpu, addr, value).is_ok();
        }
        let _ = self.backend.write(cpu, addr, value);
        true
    }
}

// ---------------------------------------------------------------------------
// Linux /dev/cpu backend
// ---------------------------------------------------------------------------

/// MSR access through the Linux `msr` character devices.
///
/// The device layer converts a faulting RDMSR/WRMSR into `EIO` rather than
/// taking the machine down, so this backend advertises safe writes.
pub struct DevCpuMsr;

impl DevCpuMsr {
    fn open_read(cpu: u32) -> io::Result<File> {
        File::open(format!("/dev/cpu/{cpu}/msr"))
    }

    fn open_write(cpu: u32) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .open(format!("/dev/cpu/{cpu}/msr"))
    }
}

impl MsrBackend for DevCpuMsr {
    fn read(&self, cpu: u32, addr: u32) -> io::Result<u64> {
        let file = Self::open_read(cpu)?;
        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, u64::from(addr))?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write(&self, cpu: u32, addr: u32, value: u64) -> io::Result<()> {
        let file = Self::open_write(cpu)?;
        let written = file.write_at(&value.to_le_bytes(), u64::from(addr))?;
        if written != 8 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short MSR write on cpu {cpu}: {written} bytes"),
            ));
        }
        Ok(())
    }

    fn supports_safe_write(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Backend over an in-memory register file. `safe` controls whether the
    /// fault-reporting write capability is advertised.
    struct MemMsr {
        regs: Mutex<HashMap<(u32, u32), u64>>,
        safe: bool,
        fail_writes: bool,
    }

    impl MemMsr {
        fn new(safe: bool) -> Self {
            Self {
                regs: Mutex::new(HashMap::new()),
                safe,
                fail_writes: false,
            }
        }
    }

    impl MsrBackend for MemMsr {
        fn read(&self, cpu: u32, addr: u32) -> io::Result<u64> {
            self.regs
                .lock()
                .unwrap()
                .get(&(cpu, addr))
                .copied()
                .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))
        }

        fn write(&self, cpu: u32, addr: u32, value: u64) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            self.regs.lock().unwrap().insert((cpu, addr), value);
            Ok(())
        }

        fn supports_safe_write(&self) -> bool {
            self.safe
        }
    }

    #[test]
    fn required_read_failure_is_fatal() {
        let regs = Registers::new(Arc::new(MemMsr::new(true)));
        let err = regs.read(0, MSR_HWCR).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn try_read_failure_is_none() {
        let regs = Registers::new(Arc::new(MemMsr::new(true)));
        assert!(regs.try_read(0, MSR_PKG_ENERGY_STAT).is_none());
    }

    #[test]
    fn write_roundtrip() {
        let regs = Registers::new(Arc::new(MemMsr::new(true)));
        assert!(regs.write(2, MSR_PSTATE_CTL, 0x2));
        assert_eq!(regs.read(2, MSR_PSTATE_CTL).unwrap(), 0x2);
    }

    #[test]
    fn safe_write_reports_faults() {
        let mut backend = MemMsr::new(true);
        backend.fail_writes = true;
        let regs = Registers::new(Arc::new(backend));
        assert!(!regs.write(0, MSR_HWCR, 0));
    }

    #[test]
    fn unchecked_fallback_reports_success_unconditionally() {
        // Scenario from the family-17h bringup: no fault-reporting write
        // capability available, writes fall back and still report success.
        let mut backend = MemMsr::new(false);
        backend.fail_writes = true;
        let regs = Registers::new(Arc::new(backend));
        assert!(regs.write(0, MSR_HWCR, 1 << 25));
    }
}

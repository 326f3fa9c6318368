//! P-state definition table: decode, dump, and bulk write.
//!
//! Family 17h exposes up to eight P-state definition registers per core.
//! Software keeps one canonical table, applied identically to every core
//! under rendezvous; the master core re-dumps after any synchronized write.
//!
//! Register layout (low 32 bits of each definition register):
//!
//! ```text
//! CpuVid   [21:14]   core voltage id
//! CpuDfsId [13:8]    frequency divisor id
//! CpuFid   [7:0]     frequency id
//! ```
//!
//! Derived core clock is `fid / did * 200` MHz. An entry with a zero fid or
//! zero did is degenerate (undefined or division-by-zero clock) and is never
//! written back and never counted as enabled.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::msr::{MSR_HARDWARE_PSTATE_STATUS, MSR_PSTATE_0, Registers};

/// Hardware table size; never iterate past it.
pub const PSTATE_TABLE_LEN: usize = 8;

/// One P-state definition register value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PStateEntry {
    pub raw: u64,
}

impl PStateEntry {
    pub fn new(raw: u64) -> Self {
        Self { raw }
    }

    /// Frequency id, bits 7:0.
    pub fn fid(&self) -> u32 {
        (self.raw & 0xff) as u32
    }

    /// Frequency divisor id, bits 13:8.
    pub fn did(&self) -> u32 {
        ((self.raw >> 8) & 0x3f) as u32
    }

    /// Core voltage id, bits 21:14.
    pub fn vid(&self) -> u32 {
        ((self.raw >> 14) & 0xff) as u32
    }

    /// Valid/enabled flag, bit 63.
    pub fn enabled(&self) -> bool {
        self.raw & (1 << 63) != 0
    }

    /// Whether this entry may be written back to hardware.
    pub fn usable(&self) -> bool {
        self.raw != 0 && self.fid() != 0 && self.did() != 0
    }

    /// Derived core clock in MHz, `None` for degenerate encodings.
    pub fn clock_mhz(&self) -> Option<f64> {
        if self.fid() == 0 || self.did() == 0 {
            return None;
        }
        Some(f64::from(self.fid()) / f64::from(self.did()) * 200.0)
    }
}

/// Canonical software copy of the package's P-state table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PStateTable {
    pub entries: [PStateEntry; PSTATE_TABLE_LEN],
    /// High-water mark of enabled entries across dumps. A slot can read as
    /// transiently disabled during a write-in-progress, so this is monotonic
    /// until the next `reset_high_water`.
    pub enabled_len: u8,
}

impl PStateTable {
    /// Re-read every definition register on `cpu` into the table.
    ///
    /// All slots are required reads: a failure here is fatal to the caller.
    pub fn refresh_from(&mut self, regs: &Registers, cpu: u32) -> Result<()> {
        let mut enabled = 0u8;
        for (slot, entry) in self.entries.iter_mut().enumerate() {
            let raw = regs.read(cpu, MSR_PSTATE_0 + slot as u32)?;
            *entry = PStateEntry::new(raw);
            if entry.enabled() {
                enabled += 1;
            }
        }
        self.enabled_len = self.enabled_len.max(enabled);
        Ok(())
    }

    /// Forget the enabled high-water mark ahead of a bulk write.
    pub fn reset_high_water(&mut self) {
        self.enabled_len = 0;
    }

    /// Derived clock of the nominal reference state (slot 0).
    pub fn reference_clock_mhz(&self) -> Option<f64> {
        self.entries[0].clock_mhz()
    }
}

/// Write a set of raw definitions into the table slots of `cpu`, skipping
/// degenerate entries so prior hardware state stays untouched. Tables longer
/// than the hardware limit are truncated at the boundary.
pub fn write_slots(regs: &Registers, cpu: u32, defs: &[u64]) {
    for (slot, &raw) in defs.iter().take(PSTATE_TABLE_LEN).enumerate() {
        let entry = PStateEntry::new(raw);
        if !entry.usable() {
            continue;
        }
        regs.write(cpu, MSR_PSTATE_0 + slot as u32, raw);
    }
}

/// Decoded hardware P-state status of one core.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HwPstate {
    /// CurHwPstate, bits 24:22.
    pub pstate: u8,
    /// Clock derived from CurCpuFid/CurCpuDfsId, MHz.
    pub frequency_mhz: f64,
}

/// Read and decode the current hardware P-state of `cpu`.
///
/// The status register is unconditionally required at steady state; a read
/// failure is fatal.
pub fn current_hardware_pstate(regs: &Registers, cpu: u32) -> Result<HwPstate> {
    let raw = regs.read(cpu, MSR_HARDWARE_PSTATE_STATUS)?;
    let entry = PStateEntry::new(raw);
    Ok(HwPstate {
        pstate: ((raw >> 22) & 0x7) as u8,
        frequency_mhz: entry.clock_mhz().unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fid: u64, did: u64, enabled: bool) -> PStateEntry {
        let mut raw = fid | (did << 8);
        if enabled {
            raw |= 1 << 63;
        }
        PStateEntry::new(raw)
    }

    #[test]
    fn field_extraction() {
        let e = PStateEntry::new((1 << 63) | (0x55 << 14) | (0x08 << 8) | 0x60);
        assert_eq!(e.fid(), 0x60);
        assert_eq!(e.did(), 0x08);
        assert_eq!(e.vid(), 0x55);
        assert!(e.enabled());
    }

    #[test]
    fn clock_derivation_is_exact() {
        // fid 0x60 (96), did 8 -> 96 / 8 * 200 = 2400 MHz.
        let e = entry(0x60, 8, true);
        assert_eq!(e.clock_mhz(), Some(2400.0));
        // fid 0x8c (140), did 8 -> 3500 MHz.
        let e = entry(0x8c, 8, true);
        assert_eq!(e.clock_mhz(), Some(3500.0));
    }

    #[test]
    fn degenerate_entries_have_no_clock_and_are_unusable() {
        assert_eq!(entry(0, 8, true).clock_mhz(), None);
        assert_eq!(entry(0x60, 0, true).clock_mhz(), None);
        assert!(!entry(0, 8, true).usable());
        assert!(!entry(0x60, 0, true).usable());
        assert!(!PStateEntry::new(0).usable());
        assert!(entry(0x60, 8, false).usable());
    }

    #[test]
    fn hw_pstate_field() {
        let raw = (3u64 << 22) | (0x08 << 8) | 0x60;
        let e = PStateEntry::new(raw);
        assert_eq!(((raw >> 22) & 0x7) as u8, 3);
        assert_eq!(e.clock_mhz(), Some(2400.0));
    }

    #[test]
    fn reference_clock_from_slot_zero() {
        let mut table = PStateTable::default();
        table.entries[0] = entry(0x8c, 8, true);
        assert_eq!(table.reference_clock_mhz(), Some(3500.0));
    }

    #[test]
    fn high_water_mark_reset() {
        let mut table = PStateTable {
            enabled_len: 3,
            ..Default::default()
        };
        table.reset_high_water();
        assert_eq!(table.enabled_len, 0);
    }
}

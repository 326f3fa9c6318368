//! Telemetry derivation: effective frequency, package temperature, package
//! energy.
//!
//! All the numeric steps here are pure functions over explicit state so the
//! overflow and fixed-point edge cases stay unit-testable without hardware.
//! The controller feeds them from raw register reads once per polling cycle:
//!
//! - effective frequency per physical core, computed by that core's primary
//!   thread inside the rendezvous;
//! - retired-instruction delta per logical core, self-written by each core;
//! - temperature and energy once per package, outside the rendezvous (they
//!   touch one PCI-mapped register and the wall clock, not per-core MSRs).

use serde::Serialize;

// ---------------------------------------------------------------------------
// Per-core frequency counters
// ---------------------------------------------------------------------------

/// Frequency-counter state of one physical core, owned by its primary
/// logical thread.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CoreSample {
    pub last_aperf: u64,
    pub last_mperf: u64,
    pub delta_aperf: u64,
    pub delta_mperf: u64,
    /// Last valid effective frequency; retained unchanged across skipped
    /// samples.
    pub effective_mhz: f64,
}

impl CoreSample {
    /// Seed the counter baselines at initialization time.
    pub fn seed(&mut self, aperf: u64, mperf: u64) {
        self.last_aperf = aperf;
        self.last_mperf = mperf;
    }

    /// Fold one APERF/MPERF reading pair into the sample.
    ///
    /// The counter pair is invalid if either register overflowed between
    /// reads, and a wraparound cannot be distinguished from noise: when
    /// either new value is not strictly greater than its baseline the whole
    /// sample is discarded and the previous effective frequency stands.
    /// Returns whether the sample was accepted.
    pub fn effective_frequency_step(&mut self, aperf: u64, mperf: u64, reference_mhz: f64) -> bool {
        if aperf <= self.last_aperf || mperf <= self.last_mperf {
            return false;
        }
        let delta_aperf = aperf - self.last_aperf;
        let delta_mperf = mperf - self.last_mperf;
        self.delta_aperf = delta_aperf;
        self.delta_mperf = delta_mperf;
        self.effective_mhz = delta_aperf as f64 / delta_mperf as f64 * reference_mhz;
        self.last_aperf = aperf;
        self.last_mperf = mperf;
        true
    }
}

/// Retired-instruction state of one logical core, self-written every cycle.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct InstrSample {
    pub last_count: u64,
    pub delta: u64,
}

impl InstrSample {
    /// Fold one retired-instruction reading into the sample. An overflowed
    /// counter (new < last) skips the update without wrap-correction.
    /// Returns whether the sample was accepted.
    pub fn step(&mut self, count: u64) -> bool {
        if self.last_count > count {
            return false;
        }
        self.delta = count - self.last_count;
        self.last_count = count;
        true
    }
}

// ---------------------------------------------------------------------------
// Package temperature (SMU indirect read over PCI config space)
// ---------------------------------------------------------------------------

/// Index register in the SMU function's config space.
pub const F17H_PCI_CONTROL_REGISTER: u32 = 0x60;
/// Selector for the current-temperature report register.
pub const F17H_M01H_THM_TCON_CUR_TMP: u32 = 0x0005_9800;
/// Range-select flag: set means the part reports in a range shifted 49 °C up.
pub const F17H_TEMP_OFFSET_FLAG: u32 = 0x0008_0000;

/// PCI configuration accessor for the discovered SMU function.
pub trait PciConfigAccess: Send + Sync {
    fn write32(&self, offset: u32, value: u32) -> std::io::Result<()>;
    fn read32(&self, offset: u32) -> std::io::Result<u32>;
}

/// Decode a raw thermal status word into °C.
///
/// The current temperature sits in the top 11 bits in 0.125 °C steps;
/// `model_offset` is the per-model Tctl correction looked up at startup.
pub fn decode_temperature(raw: u32, model_offset: f32) -> f32 {
    let millideg = (raw >> 21) * 125;
    let mut t = millideg as f32 * 0.001;
    t -= model_offset;
    if raw & F17H_TEMP_OFFSET_FLAG != 0 {
        t -= 49.0;
    }
    t
}

/// Select and read the package temperature through the SMU index/data pair.
pub fn read_package_temperature(
    pci: &dyn PciConfigAccess,
    model_offset: f32,
) -> std::io::Result<f32> {
    pci.write32(F17H_PCI_CONTROL_REGISTER, F17H_M01H_THM_TCON_CUR_TMP)?;
    let raw = pci.read32(F17H_PCI_CONTROL_REGISTER + 4)?;
    Ok(decode_temperature(raw, model_offset))
}

/// SMU function config space via sysfs (`/sys/bus/pci/devices/<bdf>/config`).
pub struct SysfsPciConfig {
    file: std::fs::File,
}

impl SysfsPciConfig {
    /// Open the config space of the given PCI function, e.g. `0000:00:00.0`
    /// (the host bridge carries the SMU index/data pair on family 17h).
    pub fn open(bdf: &str) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/sys/bus/pci/devices/{bdf}/config"))?;
        Ok(Self { file })
    }
}

impl PciConfigAccess for SysfsPciConfig {
    fn write32(&self, offset: u32, value: u32) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file
            .write_all_at(&value.to_le_bytes(), u64::from(offset))
    }

    fn read32(&self, offset: u32) -> std::io::Result<u32> {
        use std::os::unix::fs::FileExt;
        let mut buf = [0u8; 4];
        self.file.read_exact_at(&mut buf, u64::from(offset))?;
        Ok(u32::from_le_bytes(buf))
    }
}

// ---------------------------------------------------------------------------
// Package energy
// ---------------------------------------------------------------------------

/// Energy/time scale factors from the RAPL power-unit register, captured
/// once at startup. Each field encodes `0.5^value`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RaplUnits {
    pub energy_unit: f64,
    pub time_unit: f64,
}

impl RaplUnits {
    pub fn from_register(raw: u64) -> Self {
        Self {
            time_unit: 0.5f64.powi(((raw >> 16) & 0xf) as i32),
            energy_unit: 0.5f64.powi(((raw >> 8) & 0x1f) as i32),
        }
    }
}

/// Delta of the 32-bit wrapping energy accumulator.
///
/// On wraparound the delta is `u32::MAX - last`: the post-wrap counter
/// progress is deliberately not added back. This asymmetry is inherited
/// behavior and is preserved exactly; see DESIGN.md.
pub fn energy_wrap_delta(last: u32, now: u32) -> u64 {
    if last <= now {
        u64::from(now - last)
    } else {
        u64::from(u32::MAX - last)
    }
}

/// Package energy state: last accumulator value and last cycle-counter
/// reading for the elapsed-time base.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PackageEnergy {
    pub last_counter: u32,
    pub last_cycles: u64,
    /// Last derived package power, watts.
    pub power_w: f64,
}

impl PackageEnergy {
    /// Fold one energy-counter reading into the state.
    ///
    /// `cycles` is a monotonic cycle-counter reading, `cycle_hz` its
    /// calibrated frequency.
    pub fn step(&mut self, counter: u32, cycles: u64, cycle_hz: u64, units: RaplUnits) {
        let delta = energy_wrap_delta(self.last_counter, counter);
        let seconds = cycles.saturating_sub(self.last_cycles) as f64 / cycle_hz as f64;
        if seconds > 0.0 {
            let mut e = units.energy_unit * delta as f64 / seconds;
            e *= units.time_unit * 1000.0;
            self.power_w = e;
        }
        self.last_counter = counter;
        self.last_cycles = cycles;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    // -----------------------------------------------------------------------
    // Effective frequency
    // -----------------------------------------------------------------------

    #[test]
    fn effective_frequency_basic() {
        let mut s = CoreSample::default();
        s.seed(1_000, 1_000);
        assert!(s.effective_frequency_step(3_000, 2_000, 3500.0));
        // ΔAPERF/ΔMPERF = 2000/1000 -> 2x the reference clock.
        assert_eq!(s.effective_mhz, 7000.0);
        assert_eq!(s.delta_aperf, 2_000);
        assert_eq!(s.delta_mperf, 1_000);
    }

    #[test]
    fn effective_frequency_monotonic_guard() {
        let mut s = CoreSample::default();
        s.seed(5_000, 5_000);
        assert!(s.effective_frequency_step(6_000, 6_000, 3000.0));
        let before = s.effective_mhz;

        // APERF wrapped: whole sample discarded, stored value unchanged.
        assert!(!s.effective_frequency_step(100, 7_000, 3000.0));
        assert_eq!(s.effective_mhz, before);
        assert_eq!(s.last_aperf, 6_000);

        // MPERF equal to baseline is also invalid.
        assert!(!s.effective_frequency_step(7_000, 6_000, 3000.0));
        assert_eq!(s.effective_mhz, before);
    }

    #[test]
    fn instruction_delta_skips_overflow() {
        let mut s = InstrSample::default();
        assert!(s.step(1_000));
        assert!(s.step(4_000));
        assert_eq!(s.delta, 3_000);

        // Counter went backwards: overflow, no wrap-correction.
        assert!(!s.step(500));
        assert_eq!(s.delta, 3_000);
        assert_eq!(s.last_count, 4_000);
    }

    // -----------------------------------------------------------------------
    // Temperature
    // -----------------------------------------------------------------------

    #[test]
    fn temperature_decode_without_range_flag() {
        // rawField = 400 -> 400 * 125 / 1000 = 50 °C, model offset 20.
        let raw = 400u32 << 21;
        let t = decode_temperature(raw, 20.0);
        assert!((t - 30.0).abs() < 1e-4);
    }

    #[test]
    fn temperature_decode_with_range_flag() {
        let raw = (400u32 << 21) | F17H_TEMP_OFFSET_FLAG;
        let t = decode_temperature(raw, 20.0);
        assert!((t - (30.0 - 49.0)).abs() < 1e-4);
    }

    #[test]
    fn temperature_quarter_steps() {
        // rawField in 0.125 °C steps: 361 -> 45.125 °C with no offset.
        let raw = 361u32 << 21;
        let t = decode_temperature(raw, 0.0);
        assert!((t - 45.125).abs() < 1e-4);
    }

    struct MockPci {
        regs: Mutex<HashMap<u32, u32>>,
    }

    impl MockPci {
        fn with_temperature(raw: u32) -> Self {
            let mut regs = HashMap::new();
            regs.insert(F17H_PCI_CONTROL_REGISTER + 4, raw);
            Self {
                regs: Mutex::new(regs),
            }
        }
    }

    impl PciConfigAccess for MockPci {
        fn write32(&self, offset: u32, value: u32) -> std::io::Result<()> {
            self.regs.lock().unwrap().insert(offset, value);
            Ok(())
        }

        fn read32(&self, offset: u32) -> std::io::Result<u32> {
            Ok(*self.regs.lock().unwrap().get(&offset).unwrap_or(&0))
        }
    }

    #[test]
    fn package_temperature_selects_then_reads() {
        let pci = MockPci::with_temperature(560u32 << 21);
        let t = read_package_temperature(&pci, 10.0).unwrap();
        assert!((t - 60.0).abs() < 1e-4);
        // Selector must have been written to the index register.
        assert_eq!(
            pci.regs.lock().unwrap()[&F17H_PCI_CONTROL_REGISTER],
            F17H_M01H_THM_TCON_CUR_TMP
        );
    }

    // -----------------------------------------------------------------------
    // Energy
    // -----------------------------------------------------------------------

    #[test]
    fn rapl_units_from_register() {
        // time exponent 4 -> 0.0625, energy exponent 16 -> 2^-16.
        let raw = (4u64 << 16) | (16u64 << 8);
        let units = RaplUnits::from_register(raw);
        assert!((units.time_unit - 0.0625).abs() < 1e-12);
        assert!((units.energy_unit - 1.0 / 65536.0).abs() < 1e-12);
    }

    #[test]
    fn energy_delta_no_wrap() {
        assert_eq!(energy_wrap_delta(1_000, 5_000), 4_000);
        assert_eq!(energy_wrap_delta(0, 0), 0);
    }

    #[test]
    fn energy_delta_wrap_discards_post_wrap_progress() {
        // The wrap case: delta is UINT32_MAX - last, NOT now + (UINT32_MAX - last).
        let delta = energy_wrap_delta(4_000_000_000, 100_000_000);
        assert_eq!(delta, u64::from(u32::MAX) - 4_000_000_000);
    }

    #[test]
    fn package_power_derivation() {
        let units = RaplUnits {
            energy_unit: 1.0 / 65536.0,
            time_unit: 1.0,
        };
        let mut pkg = PackageEnergy {
            last_counter: 0,
            last_cycles: 0,
            power_w: 0.0,
        };
        // 65536 counter ticks over one second at 1 GHz: 1 J/s, scaled by
        // time_unit * 1000.
        pkg.step(65_536, 1_000_000_000, 1_000_000_000, units);
        assert!((pkg.power_w - 1000.0).abs() < 1e-6);
        assert_eq!(pkg.last_counter, 65_536);
        assert_eq!(pkg.last_cycles, 1_000_000_000);
    }

    #[test]
    fn package_power_zero_elapsed_keeps_last_value() {
        let units = RaplUnits {
            energy_unit: 1.0,
            time_unit: 1.0,
        };
        let mut pkg = PackageEnergy {
            last_counter: 10,
            last_cycles: 500,
            power_w: 42.0,
        };
        pkg.step(20, 500, 1_000_000_000, units);
        assert_eq!(pkg.power_w, 42.0);
        assert_eq!(pkg.last_counter, 20);
    }
}

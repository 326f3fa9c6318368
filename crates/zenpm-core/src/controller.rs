//! The power controller: owns all per-core and package state and drives the
//! polling cycle.
//!
//! Data flow per cycle:
//!
//! ```text
//! poll fires
//!   ├─ first fire: Exclusive rendezvous — disable idle states, lock the
//!   │  frequency counters, master dumps the P-state table, primaries seed
//!   │  APERF/MPERF baselines; then command P-state 0 everywhere
//!   └─ later fires: Normal rendezvous — instruction delta on every logical
//!      core, effective frequency on primary threads; then package
//!      temperature and energy outside the rendezvous; then reschedule
//! ```
//!
//! Per-physical-core slots are written only by their owning primary thread
//! and per-logical slots only by that core itself, so the per-slot mutexes
//! are uncontended; they exist to make the sharing explicit rather than to
//! arbitrate. Fatal policy: a required register that cannot be read inside
//! a rendezvous callback terminates the process — continuing with garbage
//! counter baselines is worse than stopping.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use serde::Serialize;

use crate::error::{PmError, Result};
use crate::msr::{
    MSR_APERF, MSR_CSTATE_ADDR, MSR_HWCR, MSR_MPERF, MSR_PERF_IRPC, MSR_PKG_ENERGY_STAT,
    MSR_PSTATE_CTL, MSR_RAPL_PWR_UNIT, MsrBackend, Registers,
};
use crate::platform::{BoardInfoProvider, CpuIdentity, tctl_offset_for};
use crate::poll::{INIT_POLL_INTERVAL_MS, PollState};
use crate::pstate::{HwPstate, PStateTable, current_hardware_pstate, write_slots};
use crate::rendezvous::{RendezvousMode, run_on_all_cores};
use crate::telemetry::{
    CoreSample, InstrSample, PackageEnergy, PciConfigAccess, RaplUnits, read_package_temperature,
};
use crate::topology::{CoreTopology, CycleCounter};

/// C-state base address value written once per core at initialization,
/// steering idle entries away from the deep states that stop the counters.
const CSTATE_BASE_ADDRESS: u64 = 0xf0;
/// HWCR bit locking the effective-frequency counter pair to read-only.
const HWCR_EFFFREQ_RO_BIT: u64 = 1 << 30;
/// HWCR bit that, when set, disables core performance boost.
const HWCR_BOOST_DISABLE_BIT: u64 = 1 << 25;
/// Highest commanded P-state limit exposed to callers.
const MAX_PSTATE_LIMIT: u32 = 2;

/// Snapshot of the controller's derived telemetry, for external consumers.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryReport {
    pub temperature_c: f32,
    pub package_power_w: f64,
    /// Effective frequency per physical core, MHz.
    pub effective_mhz: Vec<f64>,
    /// Retired-instruction delta per logical core over the last cycle.
    pub instruction_delta: Vec<u64>,
    /// Derived clock of each P-state table slot, MHz.
    pub pstate_clocks_mhz: Vec<Option<f64>>,
    /// Enabled-slot high-water mark of the P-state table.
    pub enabled_pstates: u8,
    pub poll_interval_ms: u32,
}

/// Package-wide P-state control and telemetry engine.
pub struct PowerController {
    regs: Registers,
    topology: CoreTopology,
    pci: Box<dyn PciConfigAccess>,
    clock: Box<dyn CycleCounter>,
    identity: CpuIdentity,
    tctl_offset: f32,
    rapl: RaplUnits,
    cores: Vec<Mutex<CoreSample>>,
    instr: Vec<Mutex<InstrSample>>,
    table: Mutex<PStateTable>,
    temperature_c: Mutex<f32>,
    energy: Mutex<PackageEnergy>,
    poll: Mutex<PollState>,
    pstate_limit: AtomicU32,
    initialized: AtomicBool,
    started: Instant,
}

impl std::fmt::Debug for PowerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerController")
            .field("identity", &self.identity)
            .field("topology", &self.topology)
            .finish_non_exhaustive()
    }
}

impl PowerController {
    /// Set up the controller. Setup failures (wrong vendor, unreadable
    /// power-unit register) leave the caller free to report and continue;
    /// nothing here is process-fatal.
    pub fn new(
        identity: CpuIdentity,
        backend: Arc<dyn MsrBackend>,
        pci: Box<dyn PciConfigAccess>,
        clock: Box<dyn CycleCounter>,
        topology: CoreTopology,
        board: Option<&dyn BoardInfoProvider>,
    ) -> Result<Self> {
        if identity.vendor != "AuthenticAMD" {
            return Err(PmError::UnsupportedCpu {
                vendor: identity.vendor,
            });
        }
        if !identity.supported() {
            warn!(
                "family {:02X}h is not officially supported, telemetry constants may not apply",
                identity.family
            );
        }
        info!(
            "{} (family {:02X}h model {:02X}h), L1 {} KiB/core, L2 {} KiB/core, L3 {} KiB",
            identity.brand,
            identity.family,
            identity.model,
            identity.l1_per_core_kb,
            identity.l2_per_core_kb,
            identity.l3_kb
        );
        if let Some(board) = board {
            info!(
                "board: {} {}",
                board.board_vendor().unwrap_or_default(),
                board.board_name().unwrap_or_default()
            );
        }
        info!(
            "{} physical cores, {} logical cores",
            topology.physical_count(),
            topology.logical_count()
        );

        let regs = Registers::new(backend);
        let rapl_raw = regs
            .read(0, MSR_RAPL_PWR_UNIT)
            .map_err(|e| PmError::Setup(format!("unable to read the power unit register: {e}")))?;
        let rapl = RaplUnits::from_register(rapl_raw);

        let tctl_offset = tctl_offset_for(identity.family, &identity.brand);
        if tctl_offset != 0.0 {
            info!("tctl offset correction: {tctl_offset} °C");
        }

        let cores = (0..topology.physical_count())
            .map(|_| Mutex::new(CoreSample::default()))
            .collect();
        let instr = (0..topology.logical_count())
            .map(|_| Mutex::new(InstrSample::default()))
            .collect();

        let mut energy = PackageEnergy {
            last_cycles: clock.now_cycles(),
            ..Default::default()
        };
        if let Some(raw) = regs.try_read(0, MSR_PKG_ENERGY_STAT) {
            energy.last_counter = raw as u32;
        }

        Ok(Self {
            regs,
            topology,
            pci,
            clock,
            identity,
            tctl_offset,
            rapl,
            cores,
            instr,
            table: Mutex::new(PStateTable::default()),
            temperature_c: Mutex::new(0.0),
            energy: Mutex::new(energy),
            poll: Mutex::new(PollState::new()),
            pstate_limit: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            started: Instant::now(),
        })
    }

    pub fn identity(&self) -> &CpuIdentity {
        &self.identity
    }

    pub fn topology(&self) -> &CoreTopology {
        &self.topology
    }

    /// Number of active hardware threads participating in telemetry.
    pub fn active_thread_count(&self) -> u32 {
        self.topology.logical_count()
    }

    fn now_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    /// Required-register read inside a rendezvous callback. There is no
    /// cancellation path out of a round, so failure terminates the process
    /// rather than continuing with garbage hardware state.
    fn read_required(&self, cpu: u32, addr: u32) -> u64 {
        match self.regs.read(cpu, addr) {
            Ok(v) => v,
            Err(e) => Self::die(e),
        }
    }

    fn die(e: PmError) -> ! {
        error!("{e}");
        std::process::abort();
    }

    // -----------------------------------------------------------------------
    // Polling cycle
    // -----------------------------------------------------------------------

    /// Run one polling cycle and return the delay until the next, in ms.
    /// The first call performs the one-time initialization round; every
    /// later call is a steady-state refresh. The transition is one-way.
    pub fn tick(&self) -> u32 {
        if !self.initialized.load(Ordering::Acquire) {
            self.init_round();
            self.initialized.store(true, Ordering::Release);
            return INIT_POLL_INTERVAL_MS;
        }
        self.steady_round()
    }

    fn init_round(&self) {
        run_on_all_cores(&self.topology, RendezvousMode::Exclusive, |role| {
            let cpu = role.logical;

            self.regs.write(cpu, MSR_CSTATE_ADDR, CSTATE_BASE_ADDRESS);

            let hwcr = self.read_required(cpu, MSR_HWCR);
            self.regs.write(cpu, MSR_HWCR, hwcr | HWCR_EFFFREQ_RO_BIT);

            // Capture the firmware-provided P-state table once.
            if role.master
                && let Err(e) = self.table.lock().unwrap().refresh_from(&self.regs, cpu)
            {
                Self::die(e);
            }

            if !role.primary {
                return;
            }
            let aperf = self.read_required(cpu, MSR_APERF);
            let mperf = self.read_required(cpu, MSR_MPERF);
            self.cores[role.physical as usize]
                .lock()
                .unwrap()
                .seed(aperf, mperf);
        });

        // All cores start from the nominal state.
        self.apply_pstate_control(0);
        info!("initialization round complete");
    }

    fn steady_round(&self) -> u32 {
        let reference_mhz = self
            .table
            .lock()
            .unwrap()
            .reference_clock_mhz()
            .unwrap_or(0.0);

        run_on_all_cores(&self.topology, RendezvousMode::Normal, |role| {
            let cpu = role.logical;

            let count = self.read_required(cpu, MSR_PERF_IRPC);
            self.instr[cpu as usize].lock().unwrap().step(count);

            // Sibling hardware threads share the physical slot; only the
            // primary touches it.
            if !role.primary {
                return;
            }

            // The ±50 MHz accuracy guarantee requires the two counter reads
            // back to back with a minimal instruction window between them,
            // at most once per millisecond.
            let aperf = self.read_required(cpu, MSR_APERF);
            let mperf = self.read_required(cpu, MSR_MPERF);
            self.cores[role.physical as usize]
                .lock()
                .unwrap()
                .effective_frequency_step(aperf, mperf, reference_mhz);
        });

        self.refresh_package_temperature();
        self.refresh_package_energy();

        self.poll.lock().unwrap().reschedule(self.now_ms())
    }

    fn refresh_package_temperature(&self) {
        match read_package_temperature(&*self.pci, self.tctl_offset) {
            Ok(t) => *self.temperature_c.lock().unwrap() = t,
            Err(e) => warn!("package temperature refresh failed: {e}"),
        }
    }

    fn refresh_package_energy(&self) {
        // Tolerable for one cycle; the last derived power value stands.
        let Some(raw) = self.regs.try_read(0, MSR_PKG_ENERGY_STAT) else {
            return;
        };
        self.energy.lock().unwrap().step(
            raw as u32,
            self.clock.now_cycles(),
            self.clock.frequency_hz(),
            self.rapl,
        );
    }

    /// Blocking poll loop; returns when `stop` is raised. Shutdown waits for
    /// the in-flight cycle, it never cancels a rendezvous mid-round.
    pub fn run(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            let next_ms = self.tick();
            std::thread::sleep(Duration::from_millis(u64::from(next_ms)));
        }
        info!("controller stopped");
    }

    /// Signal that an external caller just asked for fresh data, pulling the
    /// polling cadence toward the observed request rate.
    pub fn register_request(&self) {
        let now = self.now_ms();
        self.poll.lock().unwrap().register_request(now);
    }

    // -----------------------------------------------------------------------
    // P-state table and control
    // -----------------------------------------------------------------------

    /// Clone of the canonical P-state table snapshot.
    pub fn pstate_table(&self) -> PStateTable {
        self.table.lock().unwrap().clone()
    }

    /// Write a new table of raw P-state definitions to every core.
    ///
    /// Degenerate entries are skipped, tables longer than the hardware slot
    /// count are truncated, and the master core re-dumps the canonical
    /// snapshot after all cores have written.
    pub fn apply_pstate_table(&self, defs: &[u64]) {
        self.table.lock().unwrap().reset_high_water();

        run_on_all_cores(&self.topology, RendezvousMode::Normal, |role| {
            write_slots(&self.regs, role.logical, defs);

            if role.master
                && let Err(e) = self
                    .table
                    .lock()
                    .unwrap()
                    .refresh_from(&self.regs, role.logical)
            {
                Self::die(e);
            }
        });
    }

    /// Command the given P-state on every core.
    pub fn apply_pstate_control(&self, state: u8) {
        let value = u64::from(state & 0x7);
        run_on_all_cores(&self.topology, RendezvousMode::Normal, |role| {
            self.regs.write(role.logical, MSR_PSTATE_CTL, value);
        });
    }

    /// Decode the live hardware P-state of one logical core.
    pub fn current_hardware_pstate(&self, cpu: u32) -> Result<HwPstate> {
        current_hardware_pstate(&self.regs, cpu)
    }

    /// Deepest P-state external policy may command, `0..=2`.
    pub fn pstate_limit(&self) -> u32 {
        self.pstate_limit.load(Ordering::Relaxed)
    }

    pub fn set_pstate_limit(&self, level: u32) {
        self.pstate_limit
            .store(level.min(MAX_PSTATE_LIMIT), Ordering::Relaxed);
    }

    /// Whether core performance boost is currently enabled.
    pub fn boost_enabled(&self) -> Result<bool> {
        let hwcr = self.regs.read(0, MSR_HWCR)?;
        Ok(hwcr & HWCR_BOOST_DISABLE_BIT == 0)
    }

    /// Enable or disable core performance boost on every core. A no-op on
    /// parts without boost capability.
    pub fn set_boost(&self, enabled: bool) -> Result<()> {
        if !self.identity.boost_capable {
            return Ok(());
        }
        let mut hwcr = self.regs.read(0, MSR_HWCR)?;
        if enabled {
            hwcr &= !HWCR_BOOST_DISABLE_BIT;
        } else {
            hwcr |= HWCR_BOOST_DISABLE_BIT;
        }
        run_on_all_cores(&self.topology, RendezvousMode::Normal, |role| {
            self.regs.write(role.logical, MSR_HWCR, hwcr);
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    pub fn report(&self) -> TelemetryReport {
        let table = self.table.lock().unwrap();
        TelemetryReport {
            temperature_c: *self.temperature_c.lock().unwrap(),
            package_power_w: self.energy.lock().unwrap().power_w,
            effective_mhz: self
                .cores
                .iter()
                .map(|c| c.lock().unwrap().effective_mhz)
                .collect(),
            instruction_delta: self
                .instr
                .iter()
                .map(|c| c.lock().unwrap().delta)
                .collect(),
            pstate_clocks_mhz: table.entries.iter().map(|e| e.clock_mhz()).collect(),
            enabled_pstates: table.enabled_len,
            poll_interval_ms: self.poll.lock().unwrap().current_interval_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::CpuIdentity;
    use crate::topology::InstantCounter;
    use std::collections::HashMap;
    use std::io;

    fn amd_identity() -> CpuIdentity {
        CpuIdentity {
            vendor: "AuthenticAMD".into(),
            family: 0x17,
            model: 0x08,
            brand: "AMD Ryzen 7 2700X Eight-Core Processor".into(),
            boost_capable: true,
            l1_per_core_kb: 96,
            l2_per_core_kb: 512,
            l3_kb: 16384,
        }
    }

    struct EmptyMsr;

    impl MsrBackend for EmptyMsr {
        fn read(&self, _cpu: u32, _addr: u32) -> io::Result<u64> {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
        fn write(&self, _cpu: u32, _addr: u32, _value: u64) -> io::Result<()> {
            Ok(())
        }
        fn supports_safe_write(&self) -> bool {
            true
        }
    }

    struct FixedMsr {
        regs: HashMap<u32, u64>,
    }

    impl MsrBackend for FixedMsr {
        fn read(&self, _cpu: u32, addr: u32) -> io::Result<u64> {
            self.regs
                .get(&addr)
                .copied()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
        fn write(&self, _cpu: u32, _addr: u32, _value: u64) -> io::Result<()> {
            Ok(())
        }
        fn supports_safe_write(&self) -> bool {
            true
        }
    }

    struct NoPci;

    impl PciConfigAccess for NoPci {
        fn write32(&self, _offset: u32, _value: u32) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
        fn read32(&self, _offset: u32) -> io::Result<u32> {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn controller_with(regs: HashMap<u32, u64>) -> Result<PowerController> {
        PowerController::new(
            amd_identity(),
            Arc::new(FixedMsr { regs }),
            Box::new(NoPci),
            Box::new(InstantCounter::new()),
            CoreTopology::new(2, 4),
            None,
        )
    }

    #[test]
    fn rejects_foreign_vendor() {
        let mut identity = amd_identity();
        identity.vendor = "GenuineIntel".into();
        let err = PowerController::new(
            identity,
            Arc::new(EmptyMsr),
            Box::new(NoPci),
            Box::new(InstantCounter::new()),
            CoreTopology::new(1, 1),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PmError::UnsupportedCpu { .. }));
    }

    #[test]
    fn unreadable_power_unit_is_setup_failure() {
        let err = PowerController::new(
            amd_identity(),
            Arc::new(EmptyMsr),
            Box::new(NoPci),
            Box::new(InstantCounter::new()),
            CoreTopology::new(1, 1),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PmError::Setup(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn pstate_limit_clamped() {
        let mut regs = HashMap::new();
        regs.insert(MSR_RAPL_PWR_UNIT, (4u64 << 16) | (16u64 << 8));
        let ctl = controller_with(regs).unwrap();
        assert_eq!(ctl.pstate_limit(), 0);
        ctl.set_pstate_limit(1);
        assert_eq!(ctl.pstate_limit(), 1);
        ctl.set_pstate_limit(99);
        assert_eq!(ctl.pstate_limit(), 2);
    }

    #[test]
    fn boost_state_from_hwcr() {
        let mut regs = HashMap::new();
        regs.insert(MSR_RAPL_PWR_UNIT, (4u64 << 16) | (16u64 << 8));
        regs.insert(MSR_HWCR, 0);
        let ctl = controller_with(regs.clone()).unwrap();
        assert!(ctl.boost_enabled().unwrap());

        regs.insert(MSR_HWCR, HWCR_BOOST_DISABLE_BIT);
        let ctl = controller_with(regs).unwrap();
        assert!(!ctl.boost_enabled().unwrap());
    }

    #[test]
    fn report_shapes_follow_topology() {
        let mut regs = HashMap::new();
        regs.insert(MSR_RAPL_PWR_UNIT, (4u64 << 16) | (16u64 << 8));
        let ctl = controller_with(regs).unwrap();
        let report = ctl.report();
        assert_eq!(report.effective_mhz.len(), 2);
        assert_eq!(report.instruction_delta.len(), 4);
        assert_eq!(report.pstate_clocks_mhz.len(), crate::pstate::PSTATE_TABLE_LEN);
    }
}

//! # zenpm-core
//!
//! **Per-core P-state control and telemetry for AMD Zen (family 17h).**
//!
//! `zenpm-core` reads and writes the model-specific registers that govern
//! frequency/voltage operating points, keeps the updates synchronized across
//! every logical core in the package, and derives live telemetry — effective
//! frequency, package temperature, package power — on an adaptively
//! scheduled polling loop.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use zenpm_core::{
//!     CoreTopology, DevCpuMsr, PowerController, SysfsPciConfig, TscCounter, identify_cpu,
//! };
//!
//! let controller = PowerController::new(
//!     identify_cpu()?,
//!     Arc::new(DevCpuMsr),
//!     Box::new(SysfsPciConfig::open("0000:00:00.0")?),
//!     Box::new(TscCounter::calibrate()),
//!     CoreTopology::detect(),
//!     None,
//! )?;
//!
//! controller.tick(); // initialization round
//! controller.tick(); // first telemetry cycle
//! let report = controller.report();
//! println!("package: {:.1} °C, {:.1} W", report.temperature_c, report.package_power_w);
//! # Ok::<(), zenpm_core::PmError>(())
//! ```
//!
//! ## Architecture
//!
//! Registers → Rendezvous (all cores, barrier) → Telemetry → Poll reschedule
//!
//! - Register access goes through an injected [`MsrBackend`] capability; the
//!   write path prefers a fault-reporting backend and degrades to unchecked.
//! - [`run_on_all_cores`] executes a callback on every logical core and
//!   blocks until the whole package is done, serialized in
//!   [`RendezvousMode::Exclusive`] for the one-time initialization round.
//! - Per-physical-core counter slots are owned by one primary thread each;
//!   one master core maintains the canonical [`PStateTable`] snapshot.
//! - [`PollState`] pulls the polling cadence toward observed request rates,
//!   clamped to 50–1200 ms.
//!
//! Everything hardware-facing is a trait, so the whole pipeline runs against
//! in-memory mocks in tests.

pub mod controller;
pub mod error;
pub mod msr;
pub mod platform;
pub mod poll;
pub mod pstate;
pub mod rendezvous;
pub mod telemetry;
pub mod topology;

pub use controller::{PowerController, TelemetryReport};
pub use error::{PmError, Result};
pub use msr::{DevCpuMsr, MsrBackend, Registers};
pub use platform::{BoardInfoProvider, CpuIdentity, DmiBoardInfo, identify_cpu, tctl_offset_for};
pub use poll::{MAX_POLL_INTERVAL_MS, MIN_POLL_INTERVAL_MS, PollState};
pub use pstate::{HwPstate, PSTATE_TABLE_LEN, PStateEntry, PStateTable};
pub use rendezvous::{RendezvousMode, run_on_all_cores};
pub use telemetry::{
    CoreSample, InstrSample, PackageEnergy, PciConfigAccess, RaplUnits, SysfsPciConfig,
    decode_temperature, energy_wrap_delta, read_package_temperature,
};
pub use topology::{CoreRole, CoreTopology, CycleCounter, InstantCounter, TscCounter};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

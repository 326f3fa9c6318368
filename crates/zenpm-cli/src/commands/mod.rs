//! Command handlers plus shared controller bringup.

pub mod monitor;
pub mod power;
pub mod pstate;
pub mod status;

use std::sync::Arc;

use zenpm_core::{
    CoreTopology, CycleCounter, DevCpuMsr, DmiBoardInfo, PowerController, Result, SysfsPciConfig,
    identify_cpu,
};

#[cfg(target_arch = "x86_64")]
fn cycle_counter() -> Box<dyn CycleCounter> {
    Box::new(zenpm_core::TscCounter::calibrate())
}

#[cfg(not(target_arch = "x86_64"))]
fn cycle_counter() -> Box<dyn CycleCounter> {
    Box::new(zenpm_core::InstantCounter::new())
}

/// Bring up a controller against the real machine and run its
/// initialization round.
pub fn bring_up(smu_device: &str) -> Result<PowerController> {
    let controller = PowerController::new(
        identify_cpu()?,
        Arc::new(DevCpuMsr),
        Box::new(SysfsPciConfig::open(smu_device)?),
        cycle_counter(),
        CoreTopology::detect(),
        Some(&DmiBoardInfo),
    )?;
    controller.tick();
    Ok(controller)
}

//! `zenpm turbo` and `zenpm limit` — boost and P-state-limit control.

use zenpm_core::Result;

pub fn run_turbo(smu_device: &str, state: &str) -> Result<()> {
    let controller = super::bring_up(smu_device)?;

    match state {
        "on" => controller.set_boost(true)?,
        "off" => controller.set_boost(false)?,
        _ => {}
    }
    println!(
        "core performance boost: {}",
        if controller.boost_enabled()? {
            "enabled"
        } else {
            "disabled"
        }
    );
    Ok(())
}

pub fn run_limit(smu_device: &str, level: Option<u32>) -> Result<()> {
    let controller = super::bring_up(smu_device)?;

    if let Some(level) = level {
        controller.set_pstate_limit(level);
        controller.apply_pstate_control(level.min(2) as u8);
    }
    println!("p-state limit: {}", controller.pstate_limit());
    Ok(())
}

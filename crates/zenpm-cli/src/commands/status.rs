//! `zenpm status` — one-shot snapshot of identity, table, and telemetry.

use zenpm_core::Result;

pub fn run(smu_device: &str, json: bool) -> Result<()> {
    let controller = super::bring_up(smu_device)?;
    // One steady cycle so the report carries live deltas.
    controller.tick();

    let report = controller.report();
    let table = controller.pstate_table();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let identity = controller.identity();
    println!("{}", identity.brand);
    println!(
        "family {:02X}h model {:02X}h | {} cores / {} threads | boost {}",
        identity.family,
        identity.model,
        controller.topology().physical_count(),
        controller.active_thread_count(),
        if controller.boost_enabled()? {
            "on"
        } else {
            "off"
        },
    );

    println!("\n{:<6} {:>6} {:>6} {:>6} {:>10}", "Slot", "FID", "DID", "VID", "Clock");
    println!("{}", "-".repeat(38));
    for (slot, entry) in table.entries.iter().enumerate() {
        if !entry.enabled() && entry.raw == 0 {
            continue;
        }
        let clock = entry
            .clock_mhz()
            .map(|c| format!("{c:.0} MHz"))
            .unwrap_or_else(|| "-".into());
        println!(
            "P{:<5} {:>6} {:>6} {:>6} {:>10}",
            slot,
            entry.fid(),
            entry.did(),
            entry.vid(),
            clock
        );
    }
    println!("enabled states: {}", table.enabled_len);

    println!(
        "\npackage: {:.1} °C | {:.1} W | poll {} ms",
        report.temperature_c, report.package_power_w, report.poll_interval_ms
    );
    for (core, mhz) in report.effective_mhz.iter().enumerate() {
        println!("core {core}: {mhz:.0} MHz effective");
    }
    Ok(())
}

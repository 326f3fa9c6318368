//! `zenpm monitor` — adaptive polling loop printing one line per cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use zenpm_core::Result;

pub fn run(smu_device: &str, seconds: Option<u64>) -> Result<()> {
    let controller = super::bring_up(smu_device)?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        let _ = ctrlc::set_handler(move || stop.store(true, Ordering::Release));
    }

    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    println!("{:<10} {:>8} {:>9} {:>12} {:>8}", "time", "temp", "power", "freq (avg)", "poll");

    let started = Instant::now();
    while !stop.load(Ordering::Acquire) {
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            break;
        }

        // Each printed line is a consumer request: keep the cadence fast
        // while we are watching.
        controller.register_request();
        let next_ms = controller.tick();
        let report = controller.report();

        let avg_mhz = if report.effective_mhz.is_empty() {
            0.0
        } else {
            report.effective_mhz.iter().sum::<f64>() / report.effective_mhz.len() as f64
        };
        println!(
            "{:<10.1} {:>6.1} °C {:>7.1} W {:>8.0} MHz {:>6} ms",
            started.elapsed().as_secs_f64(),
            report.temperature_c,
            report.package_power_w,
            avg_mhz,
            next_ms
        );

        std::thread::sleep(Duration::from_millis(u64::from(next_ms)));
    }
    Ok(())
}

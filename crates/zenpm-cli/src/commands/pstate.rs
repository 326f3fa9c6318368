//! `zenpm pstate` — dump or rewrite the P-state definition table.

use clap::Subcommand;

use zenpm_core::{PStateTable, Result};

#[derive(Subcommand)]
pub enum PstateAction {
    /// Print the canonical table snapshot
    Dump {
        /// Emit the table as JSON (round-trips through `apply`)
        #[arg(long)]
        json: bool,
    },

    /// Write a table of raw 64-bit definitions from a JSON file
    Apply {
        /// Path to a JSON table as produced by `pstate dump --json`
        file: String,
    },
}

pub fn run(smu_device: &str, action: PstateAction) -> Result<()> {
    let controller = super::bring_up(smu_device)?;

    match action {
        PstateAction::Dump { json } => {
            let table = controller.pstate_table();
            if json {
                println!("{}", serde_json::to_string_pretty(&table)?);
                return Ok(());
            }
            for (slot, entry) in table.entries.iter().enumerate() {
                let clock = entry
                    .clock_mhz()
                    .map(|c| format!("{c:.0} MHz"))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "P{slot}: raw 0x{:016X} fid {:>3} did {:>2} vid {:>3} {} {clock}",
                    entry.raw,
                    entry.fid(),
                    entry.did(),
                    entry.vid(),
                    if entry.enabled() { "en " } else { "dis" },
                );
            }
            println!("enabled states: {}", table.enabled_len);
        }
        PstateAction::Apply { file } => {
            let raw = std::fs::read_to_string(&file)?;
            let table: PStateTable = serde_json::from_str(&raw)?;
            let defs: Vec<u64> = table.entries.iter().map(|e| e.raw).collect();
            controller.apply_pstate_table(&defs);

            let fresh = controller.pstate_table();
            println!("table applied, {} states enabled", fresh.enabled_len);
        }
    }
    Ok(())
}

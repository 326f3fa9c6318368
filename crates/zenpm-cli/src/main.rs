//! CLI for zenpm — P-state control and live telemetry for AMD Zen.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "zenpm")]
#[command(about = "zenpm — per-core P-state control and telemetry for AMD Zen")]
#[command(version = zenpm_core::VERSION)]
struct Cli {
    /// PCI function carrying the SMU index/data pair.
    #[arg(long, default_value = "0000:00:00.0", global = true)]
    smu_device: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// One-shot snapshot: CPU identity, P-state table, package telemetry
    Status {
        /// Emit the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Continuously poll and print telemetry until interrupted
    Monitor {
        /// Stop after this many seconds (default: run until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Dump or rewrite the P-state definition table
    Pstate {
        #[command(subcommand)]
        action: commands::pstate::PstateAction,
    },

    /// Query or toggle core performance boost
    Turbo {
        /// "on", "off", or "status"
        #[arg(value_parser = ["on", "off", "status"])]
        state: String,
    },

    /// Query or set the deepest commandable P-state (0..=2)
    Limit {
        /// New limit; omit to print the current one
        level: Option<u32>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    // SAFETY: geteuid has no preconditions.
    if unsafe { libc::geteuid() } != 0 {
        log::warn!("not running as root, register access will likely fail");
    }

    let result = match cli.command {
        Commands::Status { json } => commands::status::run(&cli.smu_device, json),
        Commands::Monitor { seconds } => commands::monitor::run(&cli.smu_device, seconds),
        Commands::Pstate { action } => commands::pstate::run(&cli.smu_device, action),
        Commands::Turbo { state } => commands::power::run_turbo(&cli.smu_device, &state),
        Commands::Limit { level } => commands::power::run_limit(&cli.smu_device, level),
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}

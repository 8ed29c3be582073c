mod sim;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dl_core::StabilizerSettings;

use crate::sim::{SimOptions, run_simulation};

#[derive(Parser)]
#[command(name = "dl", about = "Driftlock world-locking simulator and pin tools")]
struct Cli {
    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the full stabilizer over a synthetic random walk
    Simulate {
        /// Settings file (TOML); defaults apply without one
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of frames to run
        #[arg(long, default_value_t = 300)]
        ticks: usize,

        /// Seed for the walk and tracking dropouts
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Restore pins from this record instead of placing fresh ones
        #[arg(long)]
        pins_in: Option<PathBuf>,

        /// Write the final pins to this file
        #[arg(long)]
        pins_out: Option<PathBuf>,

        /// Write the final pins to the configured pin file
        #[arg(long)]
        save_pins: bool,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the pins stored in a pin record
    Pins {
        /// Pin record path
        file: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a settings file and print the effective settings
    CheckConfig {
        /// Settings file (TOML)
        file: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Simulate {
            config,
            ticks,
            seed,
            pins_in,
            pins_out,
            save_pins,
            json,
        } => {
            let settings = load_settings_or_default(config.as_deref())?;
            let pins_out = pins_out.or_else(|| {
                save_pins.then(|| PathBuf::from(&settings.persistence.pin_file))
            });
            cmd_simulate(
                settings,
                SimOptions {
                    ticks,
                    seed,
                    pins_in,
                },
                pins_out.as_deref(),
                json,
            )
        }
        Commands::Pins { file, json } => cmd_pins(&file, json),
        Commands::CheckConfig { file } => cmd_check_config(&file),
    }
}

fn load_settings_or_default(path: Option<&Path>) -> Result<StabilizerSettings> {
    match path {
        Some(path) => dl_store::load_settings(path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => Ok(StabilizerSettings::default()),
    }
}

fn cmd_simulate(
    settings: StabilizerSettings,
    options: SimOptions,
    pins_out: Option<&Path>,
    json: bool,
) -> Result<()> {
    let run = run_simulation(settings, &options).context("simulation failed")?;

    if let Some(path) = pins_out {
        dl_store::save_pins(path, &run.pins)
            .with_context(|| format!("failed to write pins to {}", path.display()))?;
    }

    let summary = &run.summary;
    if json {
        let out = serde_json::to_string_pretty(summary).context("failed to serialize summary")?;
        println!("{out}");
    } else {
        println!("ticks:       {} ({} tracked)", summary.ticks, summary.tracked_ticks);
        println!("anchors:     {}", summary.anchors);
        println!("edges:       {}", summary.edges);
        println!("fragments:   {}", summary.fragments);
        println!("merges:      {}", summary.merges);
        println!("refreezes:   {}", summary.refreezes);
        println!(
            "pins:        {} ({} restored)",
            summary.pins, summary.restored_pins
        );
        println!(
            "marker:      {} after {} adjustments",
            summary.marker_state, summary.marker_adjustments
        );
        if let Some(last) = &summary.last {
            let p = last.pinned_from_spongy;
            println!(
                "correction:  t=({:.4}, {:.4}, {:.4}) q=({:.4}, {:.4}, {:.4}, {:.4})",
                p[0], p[1], p[2], p[3], p[4], p[5], p[6]
            );
        }
    }
    if let Some(path) = pins_out {
        println!("saved {} pins to {}", run.pins.len(), path.display());
    }
    Ok(())
}

fn cmd_pins(path: &Path, json: bool) -> Result<()> {
    let records = dl_store::load_pins(path)
        .with_context(|| format!("failed to read pins from {}", path.display()))?;

    if json {
        let out = serde_json::to_string_pretty(&records).context("failed to serialize pins")?;
        println!("{out}");
        return Ok(());
    }

    println!("{} pins in {}", records.len(), path.display());
    for record in &records {
        let v = record.virtual_pose.position;
        let l = record.locked_pose.position;
        println!(
            "{:<16} virtual=({:.3}, {:.3}, {:.3}) locked=({:.3}, {:.3}, {:.3})",
            record.name, v.x, v.y, v.z, l.x, l.y, l.z
        );
    }
    Ok(())
}

fn cmd_check_config(path: &Path) -> Result<()> {
    let settings = dl_store::load_settings(path)
        .with_context(|| format!("invalid settings file {}", path.display()))?;
    let out = serde_json::to_string_pretty(&settings).context("failed to serialize settings")?;
    println!("ok: {}", path.display());
    println!("{out}");
    Ok(())
}

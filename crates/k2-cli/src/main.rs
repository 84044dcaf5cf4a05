//! K2 CLI - Command-line tool for K2/TimeProvider timing appliances
//!
//! Upgrades firmware, switches timing references and runs the setup steps
//! test benches need before a run.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use k2_core::{ApiGeneration, ProductType};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::NtpArgs;
use crate::config::{Config, DeviceArgs};
use crate::output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "k2-cli")]
#[command(author, version, about = "K2/TimeProvider test harness CLI")]
#[command(propagate_version = true)]
struct Cli {
    /// Device address
    #[arg(long, env = "K2_HOST")]
    host: Option<String>,

    /// REST API generation: v1 (4.x firmware) or v2 (5.x firmware)
    #[arg(long, env = "K2_API")]
    api: Option<ApiGeneration>,

    /// REST API user
    #[arg(long, env = "K2_USER")]
    user: Option<String>,

    /// REST API password
    #[arg(long, env = "K2_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Harness configuration file (YAML)
    #[arg(short, long, env = "K2_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum)]
    output: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync state, reference and software version
    State,

    /// Show the PTP clock class
    ClockClass,

    /// Upgrade to the newest release on the build server
    Upgrade {
        /// Product image to install: k2 or tp4100
        #[arg(long)]
        product: Option<ProductType>,

        /// Where to download the image before uploading it
        #[arg(long)]
        download_dir: Option<PathBuf>,
    },

    /// Wait for a rebooted device to answer again
    AwaitReboot {
        /// Seconds to wait before the first poll
        #[arg(long)]
        settle: Option<u64>,
    },

    /// Give a timing reference top priority
    SwitchRef {
        /// GNSS, PTP, "Slot A J1 Timecode" or "Slot B J1 Timecode"
        reference: String,

        /// Return after writing the priority list without waiting for lock
        #[arg(long)]
        no_wait: bool,
    },

    /// Wait until the device is locked to a reference
    AwaitLock {
        /// GNSS, PTP, "Slot A J1 Timecode" or "Slot B J1 Timecode"
        reference: String,
    },

    /// Enable or disable every reference input
    Inputs {
        /// Enable all inputs
        #[arg(long, conflicts_with = "disable", required_unless_present = "disable")]
        enable: bool,

        /// Disable all inputs
        #[arg(long)]
        disable: bool,
    },

    /// Enable only the given GNSS constellations
    Gnss {
        /// Constellations to keep enabled (e.g. GPS GLONASS)
        #[arg(required = true)]
        constellations: Vec<String>,

        /// Enable SBAS
        #[arg(long)]
        sbas: bool,
    },

    /// Reconfigure NTP servers
    Ntp {
        /// Delete every configured server first
        #[arg(long)]
        clear: bool,

        /// Server address to add (repeatable)
        #[arg(long)]
        add: Vec<String>,

        /// Mark this server as preferred
        #[arg(long)]
        prefer: Option<String>,

        /// Prefer the hardware reference clock (true or false)
        #[arg(long)]
        gnss_prefer: Option<bool>,

        /// Restart ntpd afterwards
        #[arg(long)]
        restart: bool,
    },

    /// List active alarms (over ssh)
    Alarms,

    /// Show GNSS receiver status and tracked satellites (over ssh)
    GnssStatus,

    /// Ping the subnet gateway from the device (over ssh)
    PingGateway,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Merge CLI args over the defaults file
    let defaults = Config::load().unwrap_or_default();
    let merged = defaults.merge_with_args(
        DeviceArgs {
            host: cli.host.as_deref(),
            api: cli.api,
            user: cli.user.as_deref(),
            password: cli.password.as_deref(),
        },
        cli.output.map(OutputFormat::as_str),
        cli.no_color,
    );

    let format = cli
        .output
        .or_else(|| <OutputFormat as clap::ValueEnum>::from_str(&merged.output, true).ok())
        .unwrap_or_default();
    let out = Output::new(format, merged.no_color, cli.quiet);

    let harness = merged.harness(cli.config.as_deref())?;

    // Execute command
    match &cli.command {
        Commands::State => commands::state(&harness, &out).await?,

        Commands::ClockClass => commands::clock_class(&harness, &out).await?,

        Commands::Upgrade {
            product,
            download_dir,
        } => commands::upgrade(&harness, *product, download_dir.as_deref(), &out).await?,

        Commands::AwaitReboot { settle } => commands::await_reboot(&harness, *settle, &out).await?,

        Commands::SwitchRef { reference, no_wait } => {
            commands::switch_ref(&harness, reference, !no_wait, &out).await?
        }

        Commands::AwaitLock { reference } => commands::await_lock(&harness, reference, &out).await?,

        Commands::Inputs { enable, .. } => commands::inputs(&harness, *enable, &out).await?,

        Commands::Gnss {
            constellations,
            sbas,
        } => commands::gnss(&harness, constellations, *sbas, &out).await?,

        Commands::Ntp {
            clear,
            add,
            prefer,
            gnss_prefer,
            restart,
        } => {
            let args = NtpArgs {
                clear: *clear,
                add: add.clone(),
                prefer: prefer.clone(),
                gnss_prefer: *gnss_prefer,
                restart: *restart,
            };
            commands::ntp(&harness, &args, &out).await?
        }

        Commands::Alarms => commands::alarms(&harness, &out).await?,

        Commands::GnssStatus => commands::gnss_status(&harness, &out).await?,

        Commands::PingGateway => commands::ping_gateway(&harness, &out).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_switch_ref() {
        let cli = Cli::try_parse_from([
            "k2-cli",
            "--host",
            "10.241.54.221",
            "--api",
            "v1",
            "switch-ref",
            "Slot A J1 Timecode",
            "--no-wait",
        ])
        .unwrap();
        assert_eq!(cli.api, Some(ApiGeneration::V1));
        match cli.command {
            Commands::SwitchRef { reference, no_wait } => {
                assert_eq!(reference, "Slot A J1 Timecode");
                assert!(no_wait);
            }
            _ => panic!("expected switch-ref"),
        }
    }

    #[test]
    fn test_parse_upgrade_product() {
        let cli = Cli::try_parse_from(["k2-cli", "upgrade", "--product", "tp4100"]).unwrap();
        match cli.command {
            Commands::Upgrade { product, .. } => assert_eq!(product, Some(ProductType::Tp4100)),
            _ => panic!("expected upgrade"),
        }
        assert!(Cli::try_parse_from(["k2-cli", "upgrade", "--product", "tp5000"]).is_err());
    }

    #[test]
    fn test_parse_gnss_status() {
        let cli = Cli::try_parse_from(["k2-cli", "-o", "csv", "gnss-status"]).unwrap();
        assert!(matches!(cli.command, Commands::GnssStatus));
        assert_eq!(cli.output, Some(OutputFormat::Csv));
    }

    #[test]
    fn test_inputs_needs_a_direction() {
        assert!(Cli::try_parse_from(["k2-cli", "inputs"]).is_err());
        assert!(Cli::try_parse_from(["k2-cli", "inputs", "--enable", "--disable"]).is_err());
    }
}

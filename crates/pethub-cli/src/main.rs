//! pethub command line
//!
//! Offline tools around the hub's data directory: meal-plan encoding, the
//! configured appliances, known lamps and the lamp blacklist. With the
//! `hardware-btleplug` feature, `lamps scan` runs one discovery pass against
//! the local Bluetooth adapter.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use pethub_core::LampConfig;
use pethub_protocol::classify_config;
use pethub_protocol::meal_plan::{self, MealPlanEntry, MealPlanEntryInput};
use pethub_storage::{
    Blacklist, HubPaths, LampConfigStore, MealPlanCache, load_device_configs, normalize_address,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pethub")]
#[command(about = "Local hub for pet appliances and BLE lamps", long_about = None)]
struct Cli {
    /// Directory holding devices.json, meal_plans.json, lamps.json and blacklist.json
    #[arg(long, global = true, default_value = "./data")]
    data_dir: PathBuf,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encode or decode feeder meal plans
    #[command(subcommand)]
    MealPlan(MealPlanCommand),
    /// Configured local-protocol appliances
    #[command(subcommand)]
    Devices(DevicesCommand),
    /// Known BLE lamps
    #[command(subcommand)]
    Lamps(LampsCommand),
    /// Addresses the lamp manager ignores
    #[command(subcommand)]
    Blacklist(BlacklistCommand),
}

#[derive(Subcommand, Debug)]
enum MealPlanCommand {
    /// Print the entries of a base64 meal plan
    Decode {
        encoded: String,
        #[command(flatten)]
        output: Output,
    },
    /// Build a base64 meal plan
    Encode {
        /// `<days> <HH:MM> <portions> [enabled|disabled]`, e.g. "Mon,Wed 07:30 2".
        /// Days may also be `daily`.
        #[arg(long = "entry", required = true, value_parser = parse_entry)]
        entries: Vec<MealPlanEntry>,
    },
}

#[derive(Subcommand, Debug)]
enum DevicesCommand {
    /// List configured appliances with their cached meal plan
    List,
}

#[derive(Subcommand, Debug)]
enum LampsCommand {
    /// List lamps recorded in lamps.json
    List {
        #[command(flatten)]
        output: Output,
    },
    /// Run one discovery pass and connect to new lamps
    #[cfg(feature = "hardware-btleplug")]
    Scan {
        /// Scan window in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
}

#[derive(Subcommand, Debug)]
enum BlacklistCommand {
    /// List blacklisted addresses
    List,
    /// Allow an address to be discovered again
    Remove { address: String },
}

#[derive(Args, Debug)]
struct Output {
    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let paths = HubPaths::new(&cli.data_dir);
    debug!(data_dir = %paths.data_dir.display(), "Using data directory");

    match cli.command {
        Commands::MealPlan(command) => meal_plan_command(command),
        Commands::Devices(DevicesCommand::List) => list_devices(&paths).await,
        Commands::Lamps(command) => lamps_command(command, &paths).await,
        Commands::Blacklist(command) => blacklist_command(command, &paths).await,
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Parse one `--entry` argument.
fn parse_entry(raw: &str) -> Result<MealPlanEntry, pethub_core::Error> {
    let mut parts = raw.split_whitespace();
    let (Some(days), Some(time), Some(portions)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(pethub_core::Error::validation(format!(
            "Expected '<days> <HH:MM> <portions> [status]', got '{raw}'"
        )));
    };
    let status = parts.next().unwrap_or("enabled");
    if parts.next().is_some() {
        return Err(pethub_core::Error::validation(format!(
            "Unexpected trailing text in '{raw}'"
        )));
    }

    let days = if days.eq_ignore_ascii_case("daily") {
        meal_plan::Weekday::ALL
            .iter()
            .map(|day| day.short_name().to_string())
            .collect()
    } else {
        days.split(',').map(str::to_string).collect()
    };
    let portions = portions.parse().map_err(|_| {
        pethub_core::Error::validation(format!("Portions must be a number, got '{portions}'"))
    })?;

    let input = MealPlanEntryInput {
        days,
        time: time.to_string(),
        portions,
        status: status.to_string(),
    };
    MealPlanEntry::try_from(&input)
}

fn meal_plan_command(command: MealPlanCommand) -> Result<()> {
    match command {
        MealPlanCommand::Decode { encoded, output } => {
            let entries = meal_plan::decode(&encoded)?;
            if output.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("Empty meal plan");
            } else {
                println!("{}", meal_plan::format(&entries));
            }
        }
        MealPlanCommand::Encode { entries } => {
            println!("{}", meal_plan::encode(&entries)?);
        }
    }
    Ok(())
}

async fn list_devices(paths: &HubPaths) -> Result<()> {
    let devices = load_device_configs(&paths.devices)
        .await
        .with_context(|| format!("Failed to load {}", paths.devices.display()))?;
    let cache = MealPlanCache::open(&paths.meal_plans).await?;

    if devices.is_empty() {
        println!("No devices configured in {}", paths.devices.display());
        return Ok(());
    }

    for device in &devices {
        println!(
            "{} ({}) {} at {}:{} v{}",
            device.display_name(),
            device.id,
            classify_config(device),
            device.ip,
            device.port,
            device.version
        );
        if let Some(encoded) = cache.get(&device.id) {
            match meal_plan::decode(&encoded) {
                Ok(entries) => {
                    for line in meal_plan::format(&entries).lines() {
                        println!("    {line}");
                    }
                }
                Err(e) => println!("    cached meal plan unreadable: {e}"),
            }
        }
    }
    Ok(())
}

async fn lamps_command(command: LampsCommand, paths: &HubPaths) -> Result<()> {
    match command {
        LampsCommand::List { output } => {
            let lamps = LampConfigStore::new(&paths.lamps).load().await?;
            if output.json {
                println!("{}", serde_json::to_string_pretty(&lamps)?);
            } else if lamps.is_empty() {
                println!("No lamps recorded in {}", paths.lamps.display());
            } else {
                for lamp in &lamps {
                    println!("{}", describe_lamp(lamp));
                }
            }
            Ok(())
        }
        #[cfg(feature = "hardware-btleplug")]
        LampsCommand::Scan { duration } => scan_lamps(paths, duration).await,
    }
}

fn describe_lamp(lamp: &LampConfig) -> String {
    let seen = lamp
        .last_seen
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    let model = lamp.model.as_deref().unwrap_or("unknown model");
    let connected = if lamp.has_connected_once {
        ""
    } else {
        " [never connected]"
    };
    format!(
        "{} ({}) {model}, last seen {seen}{connected}",
        lamp.name, lamp.address
    )
}

#[cfg(feature = "hardware-btleplug")]
async fn scan_lamps(paths: &HubPaths, duration: u64) -> Result<()> {
    use pethub_ble::{BtleplugTransport, LampManager, LampManagerConfig};
    use std::time::Duration;

    let transport = BtleplugTransport::new()
        .await
        .context("Bluetooth adapter unavailable")?;
    let config = LampManagerConfig::default()
        .scan_window(Duration::from_secs(duration))
        .scan_interval(None)
        .poll_interval(None);
    let manager = LampManager::open(transport, paths, config).await?;
    manager.initialize().await?;

    let report = manager.trigger_scan().await;
    let lamps = manager.get_all_lamps();
    manager.shutdown().await;
    let report = report?;

    println!(
        "{} advertisements, {} new lamps, {} blacklisted, {} connected",
        report.advertisements, report.new_lamps, report.ignored, report.connected
    );
    for lamp in &lamps {
        let rssi = lamp
            .rssi
            .map(|r| format!("{r} dBm"))
            .unwrap_or_else(|| "N/A".to_string());
        println!(
            "  {} ({}) {} RSSI: {rssi}",
            lamp.name, lamp.address, lamp.status
        );
    }
    Ok(())
}

async fn blacklist_command(command: BlacklistCommand, paths: &HubPaths) -> Result<()> {
    let blacklist = Blacklist::open(&paths.blacklist).await?;
    match command {
        BlacklistCommand::List => {
            if blacklist.is_empty() {
                println!("Blacklist is empty");
            }
            for address in blacklist.list() {
                println!("{address}");
            }
        }
        BlacklistCommand::Remove { address } => {
            let address = normalize_address(&address);
            if address.is_empty() {
                bail!("Address must not be empty");
            }
            if blacklist.remove(&address).await? {
                println!("Removed {address}");
            } else {
                println!("{address} was not blacklisted");
            }
        }
    }
    Ok(())
}

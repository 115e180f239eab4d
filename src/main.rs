//! Corsair Link Control CLI
//!
//! Command-line interface for monitoring and controlling Corsair coolers and
//! fan hubs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use corsair_rust_devices::config::{self, AppConfig};
use corsair_rust_devices::device::DeviceDriver;
use corsair_rust_devices::guard::{ExclusiveGuard, default_lock_path, system_lock_at};
use corsair_rust_devices::poller::Poller;
use corsair_rust_devices::registry::DeviceRegistry;
use corsair_rust_devices::utils::parsing::{parse_channel_power, parse_product_id};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Corsair cooler and fan hub control tool
#[derive(Parser, Debug)]
#[command(name = "corsair-link-cli")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log protocol traffic at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Only use devices with this USB product ID (hex, e.g. 0x0C1C)
    #[arg(short = 'P', long, global = true, value_parser = parse_product_arg)]
    product: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List supported devices without opening them
    List,

    /// Connect to every device and show its firmware version
    Info,

    /// Show one sensor reading from every device
    Status,

    /// Poll every device until Ctrl+C
    Monitor {
        /// Poll interval in milliseconds (default: from config)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Channel power to apply, as CHANNEL=PERCENT (repeatable)
        #[arg(short, long, value_parser = parse_power_arg)]
        power: Vec<(i32, i32)>,
    },
}

fn parse_power_arg(arg: &str) -> std::result::Result<(i32, i32), String> {
    parse_channel_power(arg).map_err(|e| e.to_string())
}

fn parse_product_arg(arg: &str) -> std::result::Result<u16, String> {
    parse_product_id(arg).map_err(|e| e.to_string())
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(args.config.as_ref())?;
    let registry = build_registry(&config, args.product);

    match args.command {
        Command::List => cmd_list(&registry),
        Command::Info => cmd_info(&registry),
        Command::Status => cmd_status(&registry),
        Command::Monitor { interval, power } => cmd_monitor(&registry, &config, interval, &power),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => config::load_config_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => {
            config::ensure_config_exists().context("Failed to create default config")?;
            config::load_config().context("Failed to load config")
        }
    }
}

fn build_registry(config: &AppConfig, product: Option<u16>) -> DeviceRegistry {
    let lock_path = config.lock_path.clone().unwrap_or_else(default_lock_path);
    ExclusiveGuard::init_global(system_lock_at(lock_path));
    DeviceRegistry::new(config.clone(), ExclusiveGuard::global()).with_product(product)
}

fn discover(registry: &DeviceRegistry) -> Result<Vec<Box<dyn DeviceDriver>>> {
    let drivers = registry.discover().context("Failed to enumerate devices")?;
    if drivers.is_empty() {
        anyhow::bail!("No supported Corsair devices found");
    }
    Ok(drivers)
}

// =============================================================================
// Command Implementations
// =============================================================================

fn cmd_list(registry: &DeviceRegistry) -> Result<()> {
    let candidates = registry.candidates().context("Failed to enumerate HID devices")?;

    if candidates.is_empty() {
        println!("No supported Corsair devices found.");
        return Ok(());
    }

    println!("🔍 Found {} device(s):", candidates.len());
    for (i, candidate) in candidates.iter().enumerate() {
        let serial = candidate.channel.serial_number().unwrap_or("-");
        println!(
            "  [{}] {} ({}) PID {:04X} serial {} at {}",
            i,
            candidate.model.model,
            candidate.model.family,
            candidate.model.product_id,
            serial,
            candidate.channel.path()
        );
    }
    Ok(())
}

fn cmd_info(registry: &DeviceRegistry) -> Result<()> {
    for mut driver in discover(registry)? {
        if driver.connect() {
            println!("✅ {}", driver.name());
            println!("   Path:     {}", driver.unique_id());
            println!("   Firmware: {}", driver.get_firmware_version());
            driver.disconnect();
        } else {
            println!("❌ {} failed to connect", driver.name());
        }
    }
    Ok(())
}

fn cmd_status(registry: &DeviceRegistry) -> Result<()> {
    for mut driver in discover(registry)? {
        if !driver.connect() {
            println!("❌ {} failed to connect", driver.name());
            continue;
        }
        print_device(driver.as_ref());
        driver.disconnect();
    }
    Ok(())
}

fn cmd_monitor(
    registry: &DeviceRegistry,
    config: &AppConfig,
    interval: Option<u64>,
    power: &[(i32, i32)],
) -> Result<()> {
    let interval = Duration::from_millis(interval.unwrap_or(config.poll_interval_ms).max(100));
    let mut poller = Poller::new(discover(registry)?, interval);

    let connected = poller.connect_all();
    println!("🔌 Connected {}/{} device(s)", connected, poller.drivers().len());

    for driver in poller.drivers() {
        for &(channel, percent) in power {
            if let Err(e) = driver.set_channel_power(channel, percent) {
                eprintln!("⚠️  {}: channel {}: {}", driver.name(), channel, e);
            }
        }
    }

    let running = poller.running_flag();
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    println!("🌡️  Monitoring every {} ms (Ctrl+C to stop)...\n", interval.as_millis());
    poller.run(|drivers, summary| {
        // Clear screen and move cursor to top
        print!("\x1B[2J\x1B[1;1H");
        for driver in drivers {
            print_device(driver.as_ref());
        }
        if summary.failed > 0 {
            println!("⚠️  {} device(s) failed this cycle", summary.failed);
        }
    });

    poller.shutdown();
    println!("\n👋 Monitoring stopped.");
    Ok(())
}

fn print_device(driver: &dyn DeviceDriver) {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{} [{:?}]", driver.name(), driver.state());
    for sensor in driver.speed_sensors() {
        match sensor.rpm {
            Some(rpm) => println!("  {:>3}  {:<24} {:>5} RPM", sensor.channel, sensor.name, rpm),
            None => println!("  {:>3}  {:<24}     - RPM", sensor.channel, sensor.name),
        }
    }
    for sensor in driver.temperature_sensors() {
        match sensor.celsius {
            Some(celsius) => println!("  {:>3}  {:<24} {:>5.1} °C", sensor.channel, sensor.name, celsius),
            None => println!("  {:>3}  {:<24}     - °C", sensor.channel, sensor.name),
        }
    }
}

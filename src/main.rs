//! Meditation Conductor daemon
//!
//! Listens for headset band-power datagrams and drives the meditation level.

use anyhow::Result;
use clap::{Parser, Subcommand};
use meditation_conductor::bus::publisher_from_config;
use meditation_conductor::{BusKind, Conductor, ConductorConfig, StdinKeys};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "meditation-conductor")]
#[command(about = "EEG band-power aggregator and adaptive meditation state machine", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address for band-power datagrams
    #[arg(long)]
    ip: Option<IpAddr>,

    /// Listen port for band-power datagrams
    #[arg(short, long)]
    port: Option<u16>,

    /// Outbound event bus
    #[arg(long, value_enum)]
    bus: Option<BusKind>,

    /// Destination of the UDP bus
    #[arg(long, value_name = "ADDR")]
    bus_addr: Option<SocketAddr>,

    /// Disable the stdin level override
    #[arg(long)]
    no_keyboard: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the conductor until Ctrl+C (default)
    Start,

    /// Print the effective configuration as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        log::info!("Loading config from: {}", config_path.display());
        ConductorConfig::from_toml_file(config_path)?
    } else {
        ConductorConfig::default()
    };

    // Override with CLI options
    if let Some(ip) = cli.ip {
        config.listen_addr.set_ip(ip);
    }
    if let Some(port) = cli.port {
        config.listen_addr.set_port(port);
    }
    if let Some(bus) = cli.bus {
        config.bus = bus;
    }
    if let Some(addr) = cli.bus_addr {
        config.bus_addr = addr;
    }
    if cli.no_keyboard {
        config.keyboard_override = false;
    }

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => {
            let publisher = publisher_from_config(&config)?;
            let keyboard = config.keyboard_override;
            let mut conductor = Conductor::new(config, publisher)?;
            if keyboard {
                conductor = conductor.with_control_input(StdinKeys::spawn()?);
                log::info!("Keyboard override enabled: press 1-5 then Enter");
            }
            conductor.run().await?;
        }

        Commands::PrintConfig => {
            config.validate()?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

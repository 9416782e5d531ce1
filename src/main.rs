//! RailFi - Wireless model railway control
//!
//! A control station that runs several locomotives over Wi-Fi, and the
//! firmware those locomotives run.

mod config;
mod console;
mod network;
mod protocol;
mod vehicle;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use console::ConsoleCommand;
use network::{pair_vehicle, request_session, resolve_host, Connection, Dispatcher, RosterEvent};
use vehicle::{
    Actuators, NetworkClient, NetworkHost, Pairing, Responder, SimulatedClient, SimulatedHost,
    SimulatedLights, SimulatedMotor,
};

/// RailFi - Wireless model railway control
#[derive(Parser)]
#[command(name = "railfi")]
#[command(author = "RailFi Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Control model railway locomotives over Wi-Fi", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control station (rendezvous dispatcher and console)
    Station {
        /// Rendezvous port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Print roster events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Run the locomotive firmware
    Vehicle {
        /// Use simulated lights, motor and radio
        #[arg(long)]
        simulate: bool,

        /// Skip pairing and connect to this station (host:port)
        #[arg(short, long)]
        station: Option<String>,
    },

    /// Push station network credentials to a vehicle that is pairing
    Pair {
        /// Vehicle address (host or host:port)
        #[arg(long)]
        vehicle: String,

        /// Shared secret of the vehicle (default: vehicle.secret from config)
        #[arg(short, long)]
        secret: Option<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show system information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Station { port, json } => {
            run_station(config, port, json).await?;
        }
        Commands::Vehicle { simulate, station } => {
            run_vehicle(config, simulate, station).await?;
        }
        Commands::Pair { vehicle, secret } => {
            run_pair(config, vehicle, secret).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_system_info(&config);
        }
    }

    Ok(())
}

/// Run the control station
async fn run_station(mut config: Config, port: Option<u16>, json: bool) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.station.rendezvous_port = port;
        config.station.dedicated_port_base = None;
    }
    let dispatcher_config = config.dispatcher_config()?;
    let session_config = config.session_config();

    tracing::info!(
        "Starting RailFi station '{}' on port {} ({} dialect)",
        config.general.name,
        dispatcher_config.rendezvous_port,
        session_config.dialect
    );

    let mut dispatcher = Dispatcher::new(dispatcher_config.clone(), session_config);
    let mut event_rx = dispatcher
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("event receiver already taken"))?;

    dispatcher.start().await?;

    if !json {
        println!("\n========================================");
        println!("  RailFi Station Running");
        println!("========================================");
        println!("  Name: {}", config.general.name);
        println!("  Rendezvous port: {}", dispatcher_config.rendezvous_port);
        println!("  Dedicated ports from: {}", dispatcher_config.dedicated_port_base);
        println!("  Dialect: {}", session_config.dialect);
        println!("========================================");
        println!("\nWaiting for vehicles. Type \"help\" for commands.");
        println!("Press Ctrl+C to stop.\n");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                    continue;
                }
                match event {
                    RosterEvent::VehicleConnected { id, addr, port } => {
                        tracing::info!("Vehicle {} connected from {} on port {}", id, addr, port);
                        println!("+ Vehicle connected: {} (port {})", addr, port);
                    }
                    RosterEvent::VehicleDisconnected { id, reason } => {
                        tracing::info!("Vehicle {} disconnected: {}", id, reason);
                        println!("- Vehicle disconnected: {} ({})", id, reason);
                    }
                    RosterEvent::HandoffTimedOut { port } => {
                        tracing::warn!("Vehicle never arrived on port {}", port);
                    }
                    RosterEvent::Error { message } => {
                        tracing::error!("Dispatcher error: {}", message);
                    }
                    _ => {}
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => match ConsoleCommand::parse(&line) {
                        Ok(Some(command)) => {
                            let vehicles = dispatcher.vehicles().await;
                            println!("{}", console::execute(command, &vehicles).await);
                        }
                        Ok(None) => {}
                        Err(e) => println!("{}", e),
                    },
                    None => stdin_open = false,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    dispatcher.stop().await?;
    tracing::info!("Station stopped");

    Ok(())
}

type Radio = (Box<dyn NetworkHost>, Box<dyn NetworkClient>);

/// Pick simulated or real actuators and radio
async fn build_hardware(config: &Config, simulate: bool) -> anyhow::Result<(Actuators, Radio)> {
    if simulate {
        tracing::info!("Using simulated hardware");
        let actuators = Actuators::new(
            Arc::new(SimulatedLights::new()),
            Arc::new(SimulatedMotor::new()),
        );
        let radio: Radio = (
            Box::new(SimulatedHost::new()),
            Box::new(SimulatedClient::new()),
        );
        return Ok((actuators, radio));
    }

    real_hardware(config).await
}

#[cfg(target_os = "linux")]
async fn real_hardware(config: &Config) -> anyhow::Result<(Actuators, Radio)> {
    let hw = &config.vehicle.hardware;
    let lights = vehicle::GpioLights::open(hw.headlight_gpio, hw.rear_light_gpio).await?;
    let motor =
        vehicle::PwmMotor::open(hw.pwm_chip, hw.pwm_channel, hw.pwm_period_ns, hw.direction_gpio)
            .await?;
    let radio: Radio = (
        Box::new(vehicle::NmHotspot::new(hw.wifi_interface.clone())),
        Box::new(vehicle::NmClient::new(hw.wifi_interface.clone())),
    );
    Ok((Actuators::new(Arc::new(lights), Arc::new(motor)), radio))
}

#[cfg(not(target_os = "linux"))]
async fn real_hardware(_config: &Config) -> anyhow::Result<(Actuators, Radio)> {
    anyhow::bail!("No hardware support on this platform; run with --simulate")
}

/// Run the locomotive firmware
async fn run_vehicle(
    config: Config,
    simulate: bool,
    station: Option<String>,
) -> anyhow::Result<()> {
    let simulate = simulate || config.general.simulate;
    let station = station.or_else(|| config.vehicle.station.clone());
    let session_config = config.session_config();
    let pairing_config = config.pairing_config();

    let (actuators, (host, client)) = build_hardware(&config, simulate).await?;

    let mut pairing = if station.is_none() {
        config.validate_vehicle()?;
        let secret = config.vehicle.secret.clone().unwrap_or_default();
        Some(Pairing::new(
            config.vehicle_network_name()?,
            secret,
            pairing_config.clone(),
            host,
            client,
        ))
    } else {
        None
    };

    if let Some(pairing) = &pairing {
        let mut states = pairing.subscribe();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                tracing::info!("Pairing state: {:?}", state);
            }
        });
    }

    let mut station_addr: Option<SocketAddr> = match &station {
        Some(s) => Some(resolve_host(s, protocol::DEFAULT_RENDEZVOUS_PORT).await?),
        None => None,
    };

    println!("\n========================================");
    println!("  RailFi Vehicle Running");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Hardware: {}", if simulate { "simulated" } else { "real" });
    match station_addr {
        Some(addr) => println!("  Station: {}", addr),
        None => println!("  Station: pairing"),
    }
    println!("========================================");
    println!("Press Ctrl+C to stop.\n");

    loop {
        let session = async {
            let stream = connect(&mut pairing, &mut station_addr, &pairing_config).await?;
            let conn = Connection::tcp(stream, session_config.dialect);
            let mut responder = Responder::new(conn, actuators.clone()).await?;
            responder.run().await?;
            anyhow::Ok(())
        };

        tokio::select! {
            result = session => {
                if let Err(e) = result {
                    tracing::error!("Session ended: {}", e);
                }
                // Halt while no station is in control
                if let Err(e) = actuators.motor.set(0).await {
                    tracing::warn!("Failed to stop motor: {}", e);
                }
                tokio::time::sleep(pairing_config.retry_delay).await;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    actuators.motor.set(0).await?;
    tracing::info!("Vehicle stopped");
    Ok(())
}

/// Reach a station: directly when its address is known, through pairing otherwise
async fn connect(
    pairing: &mut Option<Pairing>,
    station_addr: &mut Option<SocketAddr>,
    pairing_config: &vehicle::PairingConfig,
) -> anyhow::Result<TcpStream> {
    if let Some(addr) = *station_addr {
        tracing::info!("Requesting a session from station {}", addr);
        return Ok(request_session(addr, pairing_config.handshake_timeout).await?);
    }

    let pairing = pairing
        .as_mut()
        .ok_or_else(|| anyhow::anyhow!("no station address and pairing is not configured"))?;
    let stream = pairing.run().await?;
    *station_addr = pairing.station();
    tracing::debug!("Pairing finished in state {:?}", pairing.state());
    Ok(stream)
}

/// Push station credentials to a vehicle
async fn run_pair(config: Config, vehicle: String, secret: Option<String>) -> anyhow::Result<()> {
    let secret = secret
        .or_else(|| config.vehicle.secret.clone())
        .ok_or_else(|| anyhow::anyhow!("no secret given and vehicle.secret is not configured"))?;
    let credentials = config.station_credentials()?;
    let addr = resolve_host(&vehicle, protocol::DEFAULT_DISCOVERY_PORT).await?;

    println!("Pairing with vehicle at {}...", addr);
    pair_vehicle(
        addr,
        &secret,
        &credentials,
        Duration::from_millis(config.station.pair_timeout_ms),
    )
    .await?;
    println!(
        "Vehicle accepted credentials for \"{}\"; it will now join the station network.",
        credentials.network_name
    );
    Ok(())
}

/// Print system information
fn print_system_info(config: &Config) {
    println!("RailFi System Information");
    println!("=========================\n");

    println!("Name: {}", config.general.name);
    println!(
        "Hardware backends: {}",
        if vehicle::hardware_supported() {
            "sysfs GPIO/PWM, NetworkManager"
        } else {
            "simulated only"
        }
    );

    #[cfg(target_os = "linux")]
    {
        println!("\nLinux Requirements:");
        println!("  - Write access to /sys/class/gpio and /sys/class/pwm");
        println!("  - NetworkManager (nmcli) with an AP-capable Wi-Fi interface");
    }

    println!("\nSession dialect: {}", config.session.dialect);
    println!("Rendezvous Port: {}", protocol::DEFAULT_RENDEZVOUS_PORT);
    println!("Discovery Port: {}", protocol::DEFAULT_DISCOVERY_PORT);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["railfi", "info"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_vehicle_cli() {
        let cli = Cli::try_parse_from(["railfi", "vehicle", "--simulate", "--station", "10.0.0.1:4000"])
            .unwrap();
        match cli.command {
            Commands::Vehicle { simulate, station } => {
                assert!(simulate);
                assert_eq!(station.as_deref(), Some("10.0.0.1:4000"));
            }
            _ => panic!("Expected vehicle command"),
        }
    }

    #[test]
    fn test_pair_requires_vehicle() {
        assert!(Cli::try_parse_from(["railfi", "pair"]).is_err());
    }
}

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use rescue_link::config::{NodeConfig, Role, SerialLink};
use rescue_link::device::serial::SerialTransceiver;
use rescue_link::peripherals::{Peripherals, SerialRobot, SerialSensorBoard, UdpRadar};
use rescue_link::Node;

/// LoRa node of the rescue network, base station or robot-side.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port of the radio module.
    #[arg(short, long)]
    port: Option<String>,

    /// Address of this node.
    #[arg(short, long)]
    address: Option<u16>,

    /// Run as the base station.
    #[arg(long)]
    base: bool,

    /// Serial port of the robot controller.
    #[arg(long)]
    robot_port: Option<String>,

    /// Serial port of the sensor board.
    #[arg(long)]
    sensor_port: Option<String>,

    /// Relay frames addressed to other nodes.
    #[arg(long)]
    relay: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(address) = args.address {
        config.address = address;
    }
    if args.base {
        config.role = Role::Base;
    }
    override_port(&mut config.radio, args.port);
    override_port(&mut config.robot, args.robot_port);
    override_port(&mut config.sensors, args.sensor_port);
    config.validate()?;

    let radio = config
        .radio
        .clone()
        .ok_or_else(|| anyhow!("No radio serial port configured, use --port."))?;
    let link = open_radio(&radio, config.reconnect_backoff());
    let peripherals = attach_peripherals(&config);

    let node = Node::builder(config)
        .peripherals(peripherals)
        .build(link)
        .context("Could not set up the node")?;
    if args.relay {
        node.set_relay(true);
    }
    node.start()?;

    while node.is_running() {
        thread::sleep(Duration::from_secs(1));
    }
    info!("Stopping!");
    Ok(())
}

fn override_port(link: &mut Option<SerialLink>, port: Option<String>) {
    if let Some(port) = port {
        let baud_rate = link.as_ref().map_or(9600, |link| link.baud_rate);
        *link = Some(SerialLink { port, baud_rate });
    }
}

/// Opens the radio module, retrying until it shows up.
fn open_radio(radio: &SerialLink, backoff: Duration) -> SerialTransceiver {
    loop {
        match SerialTransceiver::open(&radio.port, radio.baud_rate) {
            Ok(link) => {
                info!("LoRa radio is ready on {}.", radio.port);
                return link;
            }
            Err(err) => {
                error!("Could not open radio on {}: {}", radio.port, err);
                thread::sleep(backoff.max(Duration::from_secs(1)));
            }
        }
    }
}

/// Devices that fail to open are left out, the node then answers their commands
/// with an error.
fn attach_peripherals(config: &NodeConfig) -> Peripherals {
    let mut peripherals = Peripherals::new();
    if let Some(link) = &config.robot {
        match SerialRobot::open(link, config.robot_timeout()) {
            Ok(robot) => peripherals = peripherals.with_robot(robot),
            Err(err) => warn!("Robot unavailable on {}: {}", link.port, err),
        }
    }
    if let Some(link) = &config.sensors {
        match SerialSensorBoard::open(link, config.robot_timeout()) {
            Ok(board) => peripherals = peripherals.with_sensors(board),
            Err(err) => warn!("Sensor board unavailable on {}: {}", link.port, err),
        }
    }
    if let Some(radar) = &config.radar {
        match UdpRadar::bind(radar) {
            Ok(radar) => peripherals = peripherals.with_radar(radar),
            Err(err) => warn!("Radar unavailable on {}: {}", radar.bind, err),
        }
    }
    peripherals
}

//! Devices a node drives on behalf of remote commands.
//!
//! The protocol only needs the narrow interfaces below. Serial implementations are
//! provided for the robot controller and the sensor board, and a UDP listener for the
//! radar. Camera capture, the media side-channel and the sync database are left to the
//! host application.
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{RadarConfig, SerialLink};
use crate::message::{Capabilities, LedMode, MessageError, SensorReading};
use crate::LoRaAddress;

/// Chassis feedback query, the answer also carries the battery voltage as `"v"`.
pub const FEEDBACK_QUERY: &str = r#"{"T":130}"#;
/// IMU sample query.
pub const IMU_QUERY: &str = r#"{"T":126}"#;
/// Turns off the unsolicited chassis feedback stream.
const FEEDBACK_OFF: &str = r#"{"T":131,"cmd":0}"#;
const LINE_END: &[u8] = b"\r\n";

/// Peripheral shared between dispatch workers and loops.
pub type Shared<T> = Arc<Mutex<T>>;

/// Robot controller speaking JSON lines.
pub trait Robot: Send {
    /// Sends one command and returns the controller's answer.
    fn send_command(&mut self, command: &str) -> Result<String, PeripheralError>;

    /// Sets wheel speeds without waiting for an answer.
    fn drive(&mut self, left: f32, right: f32) -> Result<(), PeripheralError>;
}

/// Temperature/humidity board with a controllable LED.
pub trait SensorBoard: Send {
    fn read(&mut self) -> Result<SensorReading, PeripheralError>;

    fn set_led(&mut self, mode: LedMode) -> Result<(), PeripheralError>;
}

/// Obstacle radar.
pub trait Radar: Send {
    /// Latest obstacle state reported since the last call, if any.
    fn poll_obstacle(&mut self) -> Result<Option<bool>, PeripheralError>;
}

pub trait Camera: Send {
    /// Captures a photo and returns the file it was written to.
    fn capture_photo(&mut self, quality: &str) -> Result<PathBuf, PeripheralError>;

    fn record_video(&mut self, duration: Duration, quality: &str)
        -> Result<PathBuf, PeripheralError>;
}

/// Out-of-band transfer of large media (WiFi/TCP).
pub trait MediaLink: Send {
    fn set_target(&mut self, host: &str, port: u16);

    fn send_file(&mut self, path: &Path, video: bool) -> Result<(), PeripheralError>;

    fn start_streaming(&mut self) -> Result<(), PeripheralError>;

    fn stop_streaming(&mut self) -> Result<(), PeripheralError>;
}

/// Local records waiting to be synchronised with the base station.
pub trait SyncStore: Send {
    /// Next packet of unsynced records, small enough for one frame.
    fn next_packet(&mut self) -> Result<Option<String>, PeripheralError>;

    /// Stores a packet received from `from` and returns the acknowledgement to send back.
    fn process_packet(&mut self, from: LoRaAddress, packet: &str)
        -> Result<String, PeripheralError>;

    /// Marks the records named in `ack` as synced.
    fn acknowledge(&mut self, ack: &str) -> Result<(), PeripheralError>;
}

/// Devices attached to a node. Each one is optional.
#[derive(Clone, Default)]
pub struct Peripherals {
    pub robot: Option<Shared<dyn Robot>>,
    pub sensors: Option<Shared<dyn SensorBoard>>,
    pub radar: Option<Shared<dyn Radar>>,
    pub camera: Option<Shared<dyn Camera>>,
    pub media_link: Option<Shared<dyn MediaLink>>,
    pub sync_store: Option<Shared<dyn SyncStore>>,
}

impl Peripherals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_robot(mut self, robot: impl Robot + 'static) -> Self {
        self.robot = Some(Arc::new(Mutex::new(robot)));
        self
    }

    pub fn with_sensors(mut self, sensors: impl SensorBoard + 'static) -> Self {
        self.sensors = Some(Arc::new(Mutex::new(sensors)));
        self
    }

    pub fn with_radar(mut self, radar: impl Radar + 'static) -> Self {
        self.radar = Some(Arc::new(Mutex::new(radar)));
        self
    }

    pub fn with_camera(mut self, camera: impl Camera + 'static) -> Self {
        self.camera = Some(Arc::new(Mutex::new(camera)));
        self
    }

    pub fn with_media_link(mut self, link: impl MediaLink + 'static) -> Self {
        self.media_link = Some(Arc::new(Mutex::new(link)));
        self
    }

    pub fn with_sync_store(mut self, store: impl SyncStore + 'static) -> Self {
        self.sync_store = Some(Arc::new(Mutex::new(store)));
        self
    }

    /// Bitmask answered to pings.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            robot: self.robot.is_some(),
            radar: self.radar.is_some(),
            sensors: self.sensors.is_some(),
            camera: self.camera.is_some(),
        }
    }

    pub fn robot(&self) -> Result<&Shared<dyn Robot>, PeripheralError> {
        self.robot.as_ref().ok_or(PeripheralError::Unavailable("Robot"))
    }

    pub fn sensors(&self) -> Result<&Shared<dyn SensorBoard>, PeripheralError> {
        self.sensors.as_ref().ok_or(PeripheralError::Unavailable("Sensor board"))
    }

    pub fn radar(&self) -> Result<&Shared<dyn Radar>, PeripheralError> {
        self.radar.as_ref().ok_or(PeripheralError::Unavailable("Radar"))
    }

    pub fn camera(&self) -> Result<&Shared<dyn Camera>, PeripheralError> {
        self.camera.as_ref().ok_or(PeripheralError::Unavailable("Camera"))
    }
}

/// Battery voltage from a chassis feedback answer, `"0"` when absent.
pub fn battery_level(feedback: &str) -> Result<String, PeripheralError> {
    let value: serde_json::Value = serde_json::from_str(feedback.trim())?;
    Ok(match value.get("v") {
        Some(v) if v.is_number() => v.to_string(),
        _ => "0".to_owned(),
    })
}

/// Robot controller on a serial port.
pub struct SerialRobot {
    path: String,
    port: Box<dyn SerialPort>,
    timeout: Duration,
}

impl SerialRobot {
    /// Opens the controller port and mutes its unsolicited feedback.
    pub fn open(link: &SerialLink, timeout: Duration) -> Result<Self, PeripheralError> {
        let mut port = serialport::new(&link.port, link.baud_rate)
            .timeout(Duration::from_millis(100))
            .open()?;
        port.write_request_to_send(false)?;
        port.write_data_terminal_ready(false)?;
        write_line(port.as_mut(), FEEDBACK_OFF)?;
        port.clear(serialport::ClearBuffer::Input)?;
        info!("Connected to robot on {}.", link.port);
        Ok(Self {
            path: link.port.clone(),
            port,
            timeout,
        })
    }
}

impl Robot for SerialRobot {
    fn send_command(&mut self, command: &str) -> Result<String, PeripheralError> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        write_line(self.port.as_mut(), command)?;
        trace!("Sent {} to robot on {}.", command, self.path);
        match read_line(self.port.as_mut(), self.timeout)? {
            Some(answer) => Ok(answer),
            // The controller does not answer motion commands.
            None => {
                debug!("No answer from robot within {:?}.", self.timeout);
                Ok("OK".to_owned())
            }
        }
    }

    fn drive(&mut self, left: f32, right: f32) -> Result<(), PeripheralError> {
        let command = serde_json::json!({ "T": 1, "L": left, "R": right });
        write_line(self.port.as_mut(), &command.to_string())
    }
}

/// Sensor board on a serial port, printing `Humidity:72% Temperature:21°C` lines.
pub struct SerialSensorBoard {
    port: Box<dyn SerialPort>,
    timeout: Duration,
}

impl SerialSensorBoard {
    pub fn open(link: &SerialLink, timeout: Duration) -> Result<Self, PeripheralError> {
        let port = serialport::new(&link.port, link.baud_rate)
            .timeout(Duration::from_millis(100))
            .open()?;
        info!("Connected to sensor board on {}.", link.port);
        Ok(Self { port, timeout })
    }
}

impl SensorBoard for SerialSensorBoard {
    fn read(&mut self) -> Result<SensorReading, PeripheralError> {
        let deadline = Instant::now() + self.timeout;
        while let Some(line) = read_line(self.port.as_mut(), deadline.saturating_duration_since(Instant::now()))? {
            match SensorReading::parse_board_line(&line) {
                Ok(reading) => return Ok(reading),
                Err(err) => trace!("Skipped sensor board line: {}", err),
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        Err(PeripheralError::NoReading)
    }

    fn set_led(&mut self, mode: LedMode) -> Result<(), PeripheralError> {
        self.port.write_all(mode.as_command().as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()?;
        Ok(())
    }
}

/// Radar pushing `0`/`1` datagrams to a UDP port.
pub struct UdpRadar {
    socket: UdpSocket,
}

impl UdpRadar {
    pub fn bind(config: &RadarConfig) -> Result<Self, PeripheralError> {
        let socket = UdpSocket::bind(&config.bind)?;
        socket.set_nonblocking(true)?;
        info!("Listening for radar states on {}.", config.bind);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, PeripheralError> {
        Ok(self.socket.local_addr()?)
    }
}

impl Radar for UdpRadar {
    fn poll_obstacle(&mut self) -> Result<Option<bool>, PeripheralError> {
        let mut latest = None;
        let mut buf = [0u8; 1024];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, _)) => match std::str::from_utf8(&buf[..n]).map(str::trim) {
                    Ok("0") => latest = Some(false),
                    Ok("1") => latest = Some(true),
                    _ => warn!("Ignored radar datagram ({}B).", n),
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(latest)
    }
}

fn write_line(port: &mut dyn SerialPort, line: &str) -> Result<(), PeripheralError> {
    port.write_all(line.as_bytes())?;
    port.write_all(LINE_END)?;
    port.flush()?;
    Ok(())
}

/// Reads one line, `None` when nothing complete arrives within `timeout`.
fn read_line(port: &mut dyn SerialPort, timeout: Duration) -> Result<Option<String>, PeripheralError> {
    let deadline = Instant::now() + timeout;
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while Instant::now() < deadline {
        match port.read(&mut byte) {
            Ok(0) => continue,
            Ok(_) if byte[0] == b'\n' => {
                let text = String::from_utf8_lossy(&line).trim().to_owned();
                if text.is_empty() {
                    line.clear();
                    continue;
                }
                return Ok(Some(text));
            }
            Ok(_) => line.push(byte[0]),
            Err(err) if err.kind() == ErrorKind::TimedOut => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(None)
}

#[derive(thiserror::Error, Debug)]
pub enum PeripheralError {
    #[error("{} link unavailable.", .0)]
    Unavailable(&'static str),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Underlying I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON answer: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("No sensor reading received.")]
    NoReading,
}

//! Typed view of the message type byte, and of the small text formats carried in
//! payloads.
//!
//! Types are partitioned in bands:
//!
//! | type  | band                                   |
//! |-------|----------------------------------------|
//! | 0     | data pushed without reply (see [DataId]) |
//! | 1-4   | responses                              |
//! | 5-9   | general control                        |
//! | 10-19 | robot commands                         |
//! | 20-24 | sensor board commands                  |
//! | 25-30 | camera commands                        |
//! | 31    | relay toggle                           |
use std::fmt;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Data,
    Response(ResponseKind),
    Control(ControlCommand),
    Robot(RobotCommand),
    Sensor(SensorCommand),
    Camera(CameraCommand),
    RelayToggle,
    /// Types 32 to 127, not used by the protocol.
    Unassigned(u8),
}

impl MessageKind {
    /// Whether the receiver owes a correlated reply (types 5 to 31).
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            MessageKind::Control(_)
                | MessageKind::Robot(_)
                | MessageKind::Sensor(_)
                | MessageKind::Camera(_)
                | MessageKind::RelayToggle
        )
    }

    pub fn is_response(&self) -> bool {
        matches!(self, MessageKind::Response(_))
    }
}

impl From<u8> for MessageKind {
    fn from(msg_type: u8) -> Self {
        match msg_type {
            0 => MessageKind::Data,
            1 => MessageKind::Response(ResponseKind::Error),
            2 => MessageKind::Response(ResponseKind::Standard),
            3 => MessageKind::Response(ResponseKind::Robot),
            4 => MessageKind::Response(ResponseKind::Data),
            5 => MessageKind::Control(ControlCommand::Ping),
            6 => MessageKind::Control(ControlCommand::Status),
            7 => MessageKind::Control(ControlCommand::Stop),
            8 => MessageKind::Control(ControlCommand::Rssi),
            9 => MessageKind::Control(ControlCommand::Reserved),
            10 => MessageKind::Robot(RobotCommand::Feedback),
            13 => MessageKind::Robot(RobotCommand::Imu),
            14 => MessageKind::Robot(RobotCommand::Autonomous),
            15 => MessageKind::Robot(RobotCommand::Battery),
            16 => MessageKind::Robot(RobotCommand::CollisionWatch),
            11..=19 => MessageKind::Robot(RobotCommand::Forward(msg_type)),
            20 => MessageKind::Sensor(SensorCommand::Led(LedMode::On)),
            21 => MessageKind::Sensor(SensorCommand::StartPeriodic),
            22 => MessageKind::Sensor(SensorCommand::ReadOnce),
            23 => MessageKind::Sensor(SensorCommand::Led(LedMode::Off)),
            24 => MessageKind::Sensor(SensorCommand::Led(LedMode::Auto)),
            25 => MessageKind::Camera(CameraCommand::Photo),
            26 => MessageKind::Camera(CameraCommand::Video),
            27 => MessageKind::Camera(CameraCommand::Streaming),
            28 => MessageKind::Camera(CameraCommand::SetMediaHost),
            29 => MessageKind::Camera(CameraCommand::PhotoOverRadio),
            30 => MessageKind::Camera(CameraCommand::Reserved),
            31 => MessageKind::RelayToggle,
            other => MessageKind::Unassigned(other),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Data => 0,
            MessageKind::Response(r) => r as u8,
            MessageKind::Control(c) => c as u8,
            MessageKind::Robot(r) => match r {
                RobotCommand::Feedback => 10,
                RobotCommand::Imu => 13,
                RobotCommand::Autonomous => 14,
                RobotCommand::Battery => 15,
                RobotCommand::CollisionWatch => 16,
                RobotCommand::Forward(t) => t,
            },
            MessageKind::Sensor(s) => match s {
                SensorCommand::Led(LedMode::On) => 20,
                SensorCommand::StartPeriodic => 21,
                SensorCommand::ReadOnce => 22,
                SensorCommand::Led(LedMode::Off) => 23,
                SensorCommand::Led(LedMode::Auto) => 24,
            },
            MessageKind::Camera(c) => c as u8,
            MessageKind::RelayToggle => 31,
            MessageKind::Unassigned(t) => t,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseKind {
    Error = 1,
    /// Capability bitmask or status line.
    Standard = 2,
    /// Answer of the robot to a forwarded command.
    Robot = 3,
    /// Sensor, camera or other data answer.
    Data = 4,
}

impl From<ResponseKind> for u8 {
    fn from(kind: ResponseKind) -> Self {
        kind as u8
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlCommand {
    Ping = 5,
    Status = 6,
    Stop = 7,
    Rssi = 8,
    Reserved = 9,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RobotCommand {
    /// Chassis feedback loop.
    Feedback,
    /// IMU stream loop.
    Imu,
    /// Autonomous drive with collision avoidance.
    Autonomous,
    /// Battery monitor loop.
    Battery,
    /// Collision reports without driving.
    CollisionWatch,
    /// Any other robot type: payload forwarded verbatim.
    Forward(u8),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SensorCommand {
    Led(LedMode),
    StartPeriodic,
    ReadOnce,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LedMode {
    On,
    Off,
    Auto,
}

impl LedMode {
    /// Line understood by the sensor board firmware.
    pub fn as_command(&self) -> &'static str {
        match self {
            LedMode::On => "ON",
            LedMode::Off => "OFF",
            LedMode::Auto => "AUTO",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CameraCommand {
    /// Photo delivered over the media side-channel.
    Photo = 25,
    Video = 26,
    Streaming = 27,
    SetMediaHost = 28,
    /// Photo sent back as a fragmented radio stream.
    PhotoOverRadio = 29,
    Reserved = 30,
}

/// Sub-code carried in the message id of type 0 frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataId {
    SyncPacket,
    SyncAck,
    Photo,
    SensorReading,
    Collision,
    ImuTracking,
    Battery,
    Feedback,
    RawImu,
    StreamNotice,
    Unknown(u8),
}

impl From<u8> for DataId {
    fn from(id: u8) -> Self {
        match id {
            20 => DataId::SyncPacket,
            21 => DataId::SyncAck,
            30 => DataId::Photo,
            40 => DataId::SensorReading,
            50 => DataId::Collision,
            63 => DataId::ImuTracking,
            64 => DataId::Battery,
            65 => DataId::Feedback,
            66 => DataId::RawImu,
            70 => DataId::StreamNotice,
            other => DataId::Unknown(other),
        }
    }
}

impl From<DataId> for u8 {
    fn from(id: DataId) -> Self {
        match id {
            DataId::SyncPacket => 20,
            DataId::SyncAck => 21,
            DataId::Photo => 30,
            DataId::SensorReading => 40,
            DataId::Collision => 50,
            DataId::ImuTracking => 63,
            DataId::Battery => 64,
            DataId::Feedback => 65,
            DataId::RawImu => 66,
            DataId::StreamNotice => 70,
            DataId::Unknown(id) => id,
        }
    }
}

/// Start/stop/once sub-protocol of the robot loop commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LoopCommand {
    Stop,
    Start,
    Once,
}

impl FromStr for LoopCommand {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" => Ok(LoopCommand::Stop),
            "1" => Ok(LoopCommand::Start),
            "2" => Ok(LoopCommand::Once),
            other => Err(MessageError::UnknownLoopCommand(other.to_owned())),
        }
    }
}

/// Subsystems a node reports in its answer to a ping, as a `"RDSC"` string of `0`/`1`
/// (robot, radar, sensors, camera).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Capabilities {
    pub robot: bool,
    pub radar: bool,
    pub sensors: bool,
    pub camera: bool,
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for present in [self.robot, self.radar, self.sensors, self.camera] {
            f.write_str(if present { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl FromStr for Capabilities {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bits: Vec<bool> = s
            .trim()
            .chars()
            .map(|c| match c {
                '0' => Ok(false),
                '1' => Ok(true),
                _ => Err(MessageError::InvalidCapabilities(s.to_owned())),
            })
            .collect::<Result<_, _>>()?;
        match bits.as_slice() {
            [robot, radar, sensors, camera] => Ok(Capabilities {
                robot: *robot,
                radar: *radar,
                sensors: *sensors,
                camera: *camera,
            }),
            _ => Err(MessageError::InvalidCapabilities(s.to_owned())),
        }
    }
}

/// Temperature (°C) and relative humidity (%) from the sensor board.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SensorReading {
    pub temperature: f32,
    pub humidity: f32,
}

impl SensorReading {
    /// Compact `"<temp>,<hum>"` form pushed periodically as type 0/40.
    pub fn parse_compact(s: &str) -> Result<Self, MessageError> {
        let invalid = || MessageError::InvalidReading(s.to_owned());
        let (temp, hum) = s.split_once(',').ok_or_else(invalid)?;
        Ok(Self {
            temperature: temp.trim().parse().map_err(|_| invalid())?,
            humidity: hum.trim().parse().map_err(|_| invalid())?,
        })
    }

    pub fn to_compact(&self) -> String {
        format!("{:.1},{:.1}", self.temperature, self.humidity)
    }

    /// Answer form `"Temp: 23.5°C, Hum: 58.0%"` sent as type 4.
    pub fn parse_answer(s: &str) -> Result<Self, MessageError> {
        let invalid = || MessageError::InvalidReading(s.to_owned());
        let (temp, hum) = s.split_once(',').ok_or_else(invalid)?;
        let temp = temp
            .trim()
            .strip_prefix("Temp:")
            .ok_or_else(invalid)?
            .trim()
            .trim_end_matches("°C");
        let hum = hum
            .trim()
            .strip_prefix("Hum:")
            .ok_or_else(invalid)?
            .trim()
            .trim_end_matches('%');
        Ok(Self {
            temperature: temp.parse().map_err(|_| invalid())?,
            humidity: hum.parse().map_err(|_| invalid())?,
        })
    }

    /// Line printed by the sensor board: `"Humidity:72% Temperature:21°C"`.
    pub fn parse_board_line(line: &str) -> Result<Self, MessageError> {
        let invalid = || MessageError::InvalidReading(line.to_owned());
        let mut humidity = None;
        let mut temperature = None;
        for field in line.split_whitespace() {
            match field.split_once(':') {
                Some(("Humidity", v)) => {
                    humidity = Some(v.trim_end_matches('%').parse().map_err(|_| invalid())?)
                }
                Some(("Temperature", v)) => {
                    temperature = Some(v.trim_end_matches("°C").parse().map_err(|_| invalid())?)
                }
                _ => {}
            }
        }
        Ok(Self {
            temperature: temperature.ok_or_else(invalid)?,
            humidity: humidity.ok_or_else(invalid)?,
        })
    }
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Temp: {:.1}°C, Hum: {:.1}%", self.temperature, self.humidity)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Unknown loop command {:?}, expected \"0\", \"1\" or \"2\".", .0)]
    UnknownLoopCommand(String),

    #[error("Invalid capability bitmask {:?}.", .0)]
    InvalidCapabilities(String),

    #[error("Invalid sensor reading {:?}.", .0)]
    InvalidReading(String),

    #[error("Invalid media host {:?}, expected \"host:port\".", .0)]
    InvalidHost(String),
}

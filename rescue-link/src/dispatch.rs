//! Routing and dispatch of inbound frames.
//!
//! The [Dispatcher] never performs I/O: given a frame addressed to this node it
//! returns the [Action]s to carry out, in order. The [Node](crate::node::Node)
//! executes them against the link, the tracker tables and the peripherals. This keeps
//! the protocol state machine testable without a radio.
use serde::Deserialize;
use std::time::Duration;

use crate::config::Role;
use crate::device::frame::{Frame, FrameError};
use crate::message::{
    CameraCommand, Capabilities, ControlCommand, DataId, LedMode, LoopCommand, MessageError,
    MessageKind, ResponseKind, RobotCommand, SensorCommand, SensorReading,
};
use crate::peripherals::PeripheralError;
use crate::worker::WorkerKind;
use crate::{LoRaAddress, LoRaDestination};

/// What the dispatcher needs to know about the node it runs on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodeProfile {
    pub address: LoRaAddress,
    pub role: Role,
    pub capabilities: Capabilities,
    pub frequency_mhz: u32,
    pub power_dbm: i8,
}

/// Routing decision taken before dispatch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Addressed to this node or broadcast.
    Local,
    /// For another node, and this one relays.
    Relay,
    /// For another node, and this one does not relay.
    Discard,
}

/// Destination and correlation id of a reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReplyTo {
    pub dest: LoRaAddress,
    pub msg_id: u8,
}

impl ReplyTo {
    pub fn of(frame: &Frame) -> Self {
        Self {
            dest: frame.src,
            msg_id: frame.msg_id,
        }
    }
}

/// One-shot robot queries answered as type 0 data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RobotQuery {
    /// Chassis feedback, answered as 0/65.
    Feedback,
    /// Raw IMU sample, answered as 0/66.
    Imu,
    /// Battery voltage, answered as 0/64.
    Battery,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CameraRequest {
    Photo { quality: String },
    Video { duration: Duration, quality: String },
    Streaming(bool),
    SetMediaHost { host: String, port: u16 },
    PhotoOverRadio,
}

/// Something to report to the application.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Sensor { from: LoRaAddress, reading: SensorReading },
    Battery { from: LoRaAddress, level: String },
    Feedback { from: LoRaAddress, raw: String },
    Imu { from: LoRaAddress, raw: String },
    Collision { from: LoRaAddress },
    Bytes { from: LoRaAddress, data: Vec<u8> },
    /// Error answered by a peer.
    RemoteError { from: LoRaAddress, text: String },
    Message(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Sends a text frame.
    Send {
        dest: LoRaAddress,
        msg_type: u8,
        msg_id: u8,
        text: String,
    },
    ResolvePending { from: LoRaAddress, msg_id: u8 },
    RefreshPeer {
        addr: LoRaAddress,
        capabilities: Capabilities,
    },
    Notify(Event),
    TrackImu { from: LoRaAddress, sample: String },
    StorePhoto { from: LoRaAddress, data: Vec<u8> },
    ProcessSync { from: LoRaAddress, packet: String },
    AcknowledgeSync { ack: String },
    StartLoop {
        kind: WorkerKind,
        requester: LoRaAddress,
    },
    StopLoop(WorkerKind),
    QueryRobot {
        query: RobotQuery,
        requester: LoRaAddress,
    },
    ForwardToRobot { command: String, reply: ReplyTo },
    SetLed(LedMode),
    ReadSensors { reply: ReplyTo },
    Camera {
        request: CameraRequest,
        reply: ReplyTo,
    },
    SetRelay(bool),
    ReportRssi { reply: ReplyTo },
    Shutdown,
}

/// Answer to `frame`, correlated by its message id.
pub fn reply(frame: &Frame, kind: ResponseKind, text: impl Into<String>) -> Action {
    Action::Send {
        dest: frame.src,
        msg_type: kind.into(),
        msg_id: frame.msg_id,
        text: text.into(),
    }
}

#[derive(Deserialize)]
struct CaptureOptions {
    #[serde(default = "default_quality")]
    quality: String,
    #[serde(default = "default_video_secs")]
    duration: u64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            duration: default_video_secs(),
        }
    }
}

impl CaptureOptions {
    fn parse(text: &str) -> Result<Self, HandlerError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(text)?)
    }
}

fn default_quality() -> String {
    "low".to_owned()
}

fn default_video_secs() -> u64 {
    3
}

pub struct Dispatcher {
    profile: NodeProfile,
}

impl Dispatcher {
    pub fn new(profile: NodeProfile) -> Self {
        Self { profile }
    }

    pub fn route(&self, frame: &Frame, relay_enabled: bool) -> Route {
        match frame.destination() {
            LoRaDestination::Global => Route::Local,
            LoRaDestination::Unique(addr) if addr == self.profile.address => Route::Local,
            LoRaDestination::Unique(_) if relay_enabled => Route::Relay,
            LoRaDestination::Unique(_) => Route::Discard,
        }
    }

    /// Actions handling a complete frame addressed to this node.
    pub fn dispatch(&self, frame: &Frame) -> Result<Vec<Action>, HandlerError> {
        match MessageKind::from(frame.msg_type) {
            MessageKind::Data => self.on_data(frame),
            MessageKind::Response(kind) => self.on_response(frame, kind),
            MessageKind::Control(command) => self.on_control(frame, command),
            MessageKind::Robot(command) => self.on_robot(frame, command),
            MessageKind::Sensor(command) => self.on_sensor(frame, command),
            MessageKind::Camera(command) => self.on_camera(frame, command),
            MessageKind::RelayToggle => Ok(vec![
                Action::SetRelay(frame.relay),
                reply(frame, ResponseKind::Standard, "OK"),
            ]),
            MessageKind::Unassigned(msg_type) => Err(HandlerError::Unassigned { msg_type }),
        }
    }

    fn on_data(&self, frame: &Frame) -> Result<Vec<Action>, HandlerError> {
        let from = frame.src;
        let id = DataId::from(frame.msg_id);
        if frame.is_binary() {
            return Ok(vec![match id {
                DataId::Photo => Action::StorePhoto {
                    from,
                    data: frame.payload.clone(),
                },
                _ => Action::Notify(Event::Bytes {
                    from,
                    data: frame.payload.clone(),
                }),
            }]);
        }

        let text = frame.payload_text()?.to_owned();
        let action = match id {
            DataId::SyncPacket => Action::ProcessSync { from, packet: text },
            DataId::SyncAck => Action::AcknowledgeSync { ack: text },
            DataId::SensorReading => Action::Notify(Event::Sensor {
                from,
                reading: SensorReading::parse_compact(&text)?,
            }),
            DataId::Collision => Action::Notify(Event::Collision { from }),
            DataId::ImuTracking => Action::TrackImu { from, sample: text },
            DataId::Battery => Action::Notify(Event::Battery { from, level: text }),
            DataId::Feedback => Action::Notify(Event::Feedback { from, raw: text }),
            DataId::RawImu => Action::Notify(Event::Imu { from, raw: text }),
            DataId::StreamNotice => {
                Action::Notify(Event::Message(format!("Stream from {}: {}", from, text)))
            }
            DataId::Photo | DataId::Unknown(_) => Action::Notify(Event::Bytes {
                from,
                data: frame.payload.clone(),
            }),
        };
        Ok(vec![action])
    }

    fn on_response(&self, frame: &Frame, kind: ResponseKind) -> Result<Vec<Action>, HandlerError> {
        let from = frame.src;
        let text = frame.payload_text()?;
        let mut actions = Vec::with_capacity(2);
        match kind {
            ResponseKind::Error => actions.push(Action::Notify(Event::RemoteError {
                from,
                text: text.to_owned(),
            })),
            ResponseKind::Standard if self.profile.role == Role::Base => {
                // Status lines share the type with the capability bitmask.
                if let Ok(capabilities) = text.parse::<Capabilities>() {
                    actions.push(Action::RefreshPeer {
                        addr: from,
                        capabilities,
                    });
                }
            }
            ResponseKind::Data if text.starts_with("Temp:") => {
                actions.push(Action::Notify(Event::Sensor {
                    from,
                    reading: SensorReading::parse_answer(text)?,
                }))
            }
            _ => {}
        }
        actions.push(Action::ResolvePending {
            from,
            msg_id: frame.msg_id,
        });
        Ok(actions)
    }

    fn on_control(&self, frame: &Frame, command: ControlCommand) -> Result<Vec<Action>, HandlerError> {
        let profile = &self.profile;
        match command {
            ControlCommand::Ping => Ok(vec![reply(
                frame,
                ResponseKind::Standard,
                profile.capabilities.to_string(),
            )]),
            ControlCommand::Status => Ok(vec![reply(
                frame,
                ResponseKind::Standard,
                format!(
                    "Node {} OK. Freq: {} MHz, Power: {} dBm",
                    profile.address, profile.frequency_mhz, profile.power_dbm
                ),
            )]),
            ControlCommand::Stop => Ok(vec![
                reply(frame, ResponseKind::Standard, "Node stopping..."),
                Action::Shutdown,
            ]),
            ControlCommand::Rssi => Ok(vec![Action::ReportRssi {
                reply: ReplyTo::of(frame),
            }]),
            ControlCommand::Reserved => Err(HandlerError::Reserved {
                msg_type: frame.msg_type,
            }),
        }
    }

    fn on_robot(&self, frame: &Frame, command: RobotCommand) -> Result<Vec<Action>, HandlerError> {
        let caps = self.profile.capabilities;
        if !caps.robot {
            return Ok(vec![reply(
                frame,
                ResponseKind::Robot,
                "Error: robot link unavailable",
            )]);
        }
        let text = frame.payload_text()?;
        let requester = frame.src;
        let (kind, query) = match command {
            RobotCommand::Forward(_) => {
                return Ok(vec![Action::ForwardToRobot {
                    command: text.to_owned(),
                    reply: ReplyTo::of(frame),
                }])
            }
            RobotCommand::Feedback => (WorkerKind::Feedback, Some(RobotQuery::Feedback)),
            RobotCommand::Imu => (WorkerKind::Imu, Some(RobotQuery::Imu)),
            RobotCommand::Battery => (WorkerKind::Battery, Some(RobotQuery::Battery)),
            RobotCommand::Autonomous | RobotCommand::CollisionWatch if !caps.radar => {
                return Ok(vec![reply(
                    frame,
                    ResponseKind::Robot,
                    "Error: radar link unavailable",
                )]);
            }
            RobotCommand::Autonomous => (WorkerKind::Autonomy, None),
            RobotCommand::CollisionWatch => (WorkerKind::CollisionWatch, None),
        };

        let action = match (text.parse::<LoopCommand>()?, query) {
            (LoopCommand::Start, _) => Action::StartLoop { kind, requester },
            (LoopCommand::Stop, _) => Action::StopLoop(kind),
            (LoopCommand::Once, Some(query)) => Action::QueryRobot { query, requester },
            (LoopCommand::Once, None) => {
                return Err(MessageError::UnknownLoopCommand(text.to_owned()).into())
            }
        };
        Ok(vec![action, reply(frame, ResponseKind::Robot, "OK")])
    }

    fn on_sensor(&self, frame: &Frame, command: SensorCommand) -> Result<Vec<Action>, HandlerError> {
        if !self.profile.capabilities.sensors {
            return Ok(vec![reply(
                frame,
                ResponseKind::Data,
                "Error: sensor link unavailable",
            )]);
        }
        let reply_to = ReplyTo::of(frame);
        Ok(match command {
            SensorCommand::Led(mode) => vec![
                Action::SetLed(mode),
                reply(frame, ResponseKind::Data, "OK"),
            ],
            SensorCommand::StartPeriodic => vec![
                Action::StartLoop {
                    kind: WorkerKind::SensorPush,
                    requester: frame.src,
                },
                Action::ReadSensors { reply: reply_to },
            ],
            SensorCommand::ReadOnce => vec![Action::ReadSensors { reply: reply_to }],
        })
    }

    fn on_camera(&self, frame: &Frame, command: CameraCommand) -> Result<Vec<Action>, HandlerError> {
        let text = frame.payload_text()?;
        let request = match command {
            CameraCommand::SetMediaHost => {
                let invalid = || MessageError::InvalidHost(text.to_owned());
                let (host, port) = text.trim().rsplit_once(':').ok_or_else(invalid)?;
                let port = port.parse().map_err(|_| invalid())?;
                if host.is_empty() {
                    return Err(invalid().into());
                }
                CameraRequest::SetMediaHost {
                    host: host.to_owned(),
                    port,
                }
            }
            CameraCommand::Reserved => {
                return Err(HandlerError::Reserved {
                    msg_type: frame.msg_type,
                })
            }
            _ if !self.profile.capabilities.camera => {
                return Ok(vec![reply(
                    frame,
                    ResponseKind::Data,
                    "Error: camera unavailable",
                )]);
            }
            CameraCommand::Photo => CameraRequest::Photo {
                quality: CaptureOptions::parse(text)?.quality,
            },
            CameraCommand::Video => {
                let options = CaptureOptions::parse(text)?;
                CameraRequest::Video {
                    duration: Duration::from_secs(options.duration),
                    quality: options.quality,
                }
            }
            CameraCommand::Streaming => match text.parse::<LoopCommand>()? {
                LoopCommand::Start => CameraRequest::Streaming(true),
                LoopCommand::Stop => CameraRequest::Streaming(false),
                LoopCommand::Once => {
                    return Err(MessageError::UnknownLoopCommand(text.to_owned()).into())
                }
            },
            CameraCommand::PhotoOverRadio => CameraRequest::PhotoOverRadio,
        };
        Ok(vec![Action::Camera {
            request,
            reply: ReplyTo::of(frame),
        }])
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Type {} is reserved.", .msg_type)]
    Reserved { msg_type: u8 },

    #[error("Type {} is not assigned.", .msg_type)]
    Unassigned { msg_type: u8 },

    #[error(transparent)]
    Peripheral(PeripheralError),
}

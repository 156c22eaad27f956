//! Node configuration, loaded from TOML.
//!
//! ```toml
//! address = 1
//! role = "node"
//! frequency_mhz = 433
//!
//! [radio]
//! port = "/dev/ttyS0"
//! baud_rate = 9600
//!
//! [robot]
//! port = "/dev/ttyACM0"
//! baud_rate = 115200
//!
//! [radar]
//! bind = "0.0.0.0:5005"
//! ```
//!
//! Every field has a default, an empty file describes a plain node at address 1.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::frame::{HEADER_LENGTH, MAX_FRAME_LENGTH, MAX_LORA_PAYLOAD};
use crate::error::NodeError;
use crate::fragment::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_IDLE, DEFAULT_MAX_STREAMS, DEFAULT_STREAM_LIMIT,
};
use crate::{LoRaAddress, BROADCAST};

/// Part a node plays on the network.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Base station: pings the network, tracks peers and pending requests.
    Base,
    /// Field node, usually carried by the robot.
    #[default]
    Node,
}

/// A serial device (radio module, robot controller, sensor board).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialLink {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadarConfig {
    /// UDP address the radar pushes its `0`/`1` obstacle states to.
    #[serde(default = "default_radar_bind")]
    pub bind: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub address: LoRaAddress,
    pub role: Role,
    pub frequency_mhz: u32,
    pub power_dbm: i8,

    /// Largest frame handed to the radio, header included.
    pub max_frame_len: usize,
    /// Payload bytes per fragment.
    pub chunk_size: usize,
    /// Pause between two fragments of a stream.
    pub fragment_delay_ms: u64,
    /// Largest reassembled stream, in bytes.
    pub reassembly_limit: usize,
    /// Streams reassembled concurrently.
    pub reassembly_streams: usize,
    /// Time a partial stream is kept without a new fragment.
    pub reassembly_idle_secs: u64,

    pub poll_interval_ms: u64,
    pub node_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub reconnect_backoff_secs: u64,
    pub feedback_interval_secs: u64,
    pub imu_interval_secs: u64,
    pub battery_interval_secs: u64,
    pub sensor_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub autonomy_tick_ms: u64,
    pub robot_timeout_secs: u64,
    /// Period of the side-channel retry of pending media.
    pub media_retry_ms: u64,
    /// Pause between two streamed clips.
    pub stream_interval_ms: u64,
    pub stream_clip_secs: u64,

    pub radio: Option<SerialLink>,
    pub robot: Option<SerialLink>,
    pub sensors: Option<SerialLink>,
    pub radar: Option<RadarConfig>,

    /// Where reassembled photos are written. Without it they are handed over as bytes.
    pub media_dir: Option<PathBuf>,
    /// JSON list of captured media still waiting for the side-channel.
    pub pending_media_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: 1,
            role: Role::Node,
            frequency_mhz: 433,
            power_dbm: 0,
            max_frame_len: MAX_FRAME_LENGTH,
            chunk_size: DEFAULT_CHUNK_SIZE,
            fragment_delay_ms: 2_000,
            reassembly_limit: DEFAULT_STREAM_LIMIT,
            reassembly_streams: DEFAULT_MAX_STREAMS,
            reassembly_idle_secs: DEFAULT_MAX_IDLE.as_secs(),
            poll_interval_ms: 50,
            node_timeout_secs: 60,
            ping_interval_secs: 40,
            reconnect_backoff_secs: 10,
            feedback_interval_secs: 5,
            imu_interval_secs: 10,
            battery_interval_secs: 60,
            sensor_interval_secs: 30,
            sync_interval_secs: 20,
            autonomy_tick_ms: 150,
            robot_timeout_secs: 5,
            media_retry_ms: 70_000,
            stream_interval_ms: 1_000,
            stream_clip_secs: 3,
            radio: None,
            robot: None,
            sensors: None,
            radar: None,
            media_dir: None,
            pending_media_file: None,
        }
    }
}

impl NodeConfig {
    /// Defaults for a node at `address`.
    pub fn new(address: LoRaAddress, role: Role) -> Self {
        Self {
            address,
            role,
            ..Self::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|err| NodeError::Config(format!("{}: {}", path.display(), err)))
    }

    pub fn from_toml(text: &str) -> Result<Self, NodeError> {
        let config: Self =
            toml::from_str(text).map_err(|err| NodeError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.address == BROADCAST {
            return Err(NodeError::Config(format!(
                "address {:#06x} is reserved for broadcast",
                BROADCAST
            )));
        }
        if self.max_frame_len > MAX_LORA_PAYLOAD {
            return Err(NodeError::Config(format!(
                "max_frame_len {} exceeds the radio limit of {}B",
                self.max_frame_len, MAX_LORA_PAYLOAD
            )));
        }
        if self.chunk_size == 0 || self.chunk_size + HEADER_LENGTH > self.max_frame_len {
            return Err(NodeError::Config(format!(
                "chunk_size {} does not fit in a {}B frame",
                self.chunk_size, self.max_frame_len
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(NodeError::Config("poll_interval_ms must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn is_base(&self) -> bool {
        self.role == Role::Base
    }

    pub fn fragment_delay(&self) -> Duration {
        Duration::from_millis(self.fragment_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn feedback_interval(&self) -> Duration {
        Duration::from_secs(self.feedback_interval_secs)
    }

    pub fn imu_interval(&self) -> Duration {
        Duration::from_secs(self.imu_interval_secs)
    }

    pub fn battery_interval(&self) -> Duration {
        Duration::from_secs(self.battery_interval_secs)
    }

    pub fn sensor_interval(&self) -> Duration {
        Duration::from_secs(self.sensor_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn autonomy_tick(&self) -> Duration {
        Duration::from_millis(self.autonomy_tick_ms)
    }

    pub fn robot_timeout(&self) -> Duration {
        Duration::from_secs(self.robot_timeout_secs)
    }

    pub fn reassembly_idle(&self) -> Duration {
        Duration::from_secs(self.reassembly_idle_secs)
    }

    pub fn media_retry_interval(&self) -> Duration {
        Duration::from_millis(self.media_retry_ms)
    }

    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }

    pub fn stream_clip(&self) -> Duration {
        Duration::from_secs(self.stream_clip_secs)
    }
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_radar_bind() -> String {
    "0.0.0.0:5005".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config = NodeConfig::from_toml("").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.chunk_size, 200);
        assert_eq!(config.max_frame_len, 242);
        assert_eq!(config.fragment_delay(), Duration::from_secs(2));
        assert_eq!(config.node_timeout(), Duration::from_secs(60));
        assert_eq!(config.reassembly_idle(), Duration::from_secs(60));
        assert_eq!(config.media_retry_interval(), Duration::from_secs(70));
    }

    #[test]
    fn full_file_is_parsed() {
        let config = NodeConfig::from_toml(
            r#"
            address = 2
            role = "base"
            power_dbm = 22
            fragment_delay_ms = 500

            [radio]
            port = "/dev/ttyS0"

            [robot]
            port = "/dev/ttyACM0"
            baud_rate = 115200

            [radar]
            "#,
        )
        .unwrap();
        assert!(config.is_base());
        assert_eq!(config.address, 2);
        assert_eq!(config.power_dbm, 22);
        assert_eq!(config.radio.as_ref().unwrap().baud_rate, 9600);
        assert_eq!(config.robot.as_ref().unwrap().baud_rate, 115200);
        assert_eq!(config.radar.as_ref().unwrap().bind, "0.0.0.0:5005");
        assert!(config.sensors.is_none());
    }

    #[test]
    fn invalid_values_are_refused() {
        assert!(matches!(
            NodeConfig::from_toml("address = 65535"),
            Err(NodeError::Config(_))
        ));
        assert!(NodeConfig::from_toml("chunk_size = 240").is_err());
        assert!(NodeConfig::from_toml("max_frame_len = 300").is_err());
        assert!(NodeConfig::from_toml("role = \"relay\"").is_err());
        assert!(NodeConfig::from_toml("chunk_size = 235").is_ok());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "address = 7").unwrap();
        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.address, 7);
        assert!(NodeConfig::load("/nonexistent/rescue.toml").is_err());
    }
}

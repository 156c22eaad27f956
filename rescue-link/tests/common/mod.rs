#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rescue_link::config::{NodeConfig, Role};
use rescue_link::media::Photo;
use rescue_link::message::{LedMode, SensorReading};
use rescue_link::observer::NodeObserver;
use rescue_link::peripherals::{
    Camera, MediaLink, PeripheralError, Radar, Robot, SensorBoard, SyncStore,
};
use rescue_link::telemetry::{Attitude, Position};
use rescue_link::{LoRaAddress, Node};

pub const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0];

/// Config without pauses, so tests run fast.
pub fn config(address: LoRaAddress, role: Role) -> NodeConfig {
    NodeConfig {
        fragment_delay_ms: 0,
        poll_interval_ms: 5,
        autonomy_tick_ms: 10,
        reconnect_backoff_secs: 0,
        media_retry_ms: 10,
        stream_interval_ms: 10,
        ..NodeConfig::new(address, role)
    }
}

/// Polls until the inbox is empty, returns the number of packets handled.
pub fn drain(node: &Node) -> usize {
    let mut handled = 0;
    while node.poll().unwrap() {
        handled += 1;
    }
    handled
}

/// Polls `node` until `done` holds or a few seconds elapsed.
pub fn poll_until(node: &Node, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let _ = node.poll();
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

pub fn wait_until(done: impl FnMut() -> bool) -> bool {
    let mut done = done;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[derive(Default)]
pub struct RecordingObserver {
    pub messages: Mutex<Vec<String>>,
    pub alerts: Mutex<Vec<String>>,
    pub sensors: Mutex<Vec<(LoRaAddress, SensorReading)>>,
    pub feedback: Mutex<Vec<(LoRaAddress, String)>>,
    pub battery: Mutex<Vec<(LoRaAddress, String)>>,
    pub photos: Mutex<Vec<(LoRaAddress, Photo)>>,
    pub collisions: Mutex<Vec<LoRaAddress>>,
    pub bytes: Mutex<Vec<(LoRaAddress, Vec<u8>)>>,
    pub positions: Mutex<Vec<(LoRaAddress, Position)>>,
    pub attitudes: Mutex<Vec<(LoRaAddress, Attitude)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn alerted(&self, needle: &str) -> bool {
        self.alerts.lock().iter().any(|a| a.contains(needle))
    }
}

impl NodeObserver for RecordingObserver {
    fn on_message(&self, text: &str) {
        self.messages.lock().push(text.to_owned());
    }

    fn on_alert(&self, text: &str) {
        self.alerts.lock().push(text.to_owned());
    }

    fn on_bytes(&self, from: LoRaAddress, data: &[u8]) {
        self.bytes.lock().push((from, data.to_vec()));
    }

    fn on_sensor(&self, from: LoRaAddress, reading: SensorReading) {
        self.sensors.lock().push((from, reading));
    }

    fn on_battery(&self, from: LoRaAddress, level: &str) {
        self.battery.lock().push((from, level.to_owned()));
    }

    fn on_feedback(&self, from: LoRaAddress, raw: &str) {
        self.feedback.lock().push((from, raw.to_owned()));
    }

    fn on_photo(&self, from: LoRaAddress, photo: Photo) {
        self.photos.lock().push((from, photo));
    }

    fn on_collision(&self, from: LoRaAddress) {
        self.collisions.lock().push(from);
    }

    fn on_position(&self, from: LoRaAddress, position: Position) {
        self.positions.lock().push((from, position));
    }

    fn on_overturn(&self, from: LoRaAddress, attitude: Attitude) {
        self.attitudes.lock().push((from, attitude));
    }
}

/// Robot answering every query with a fixed feedback line and recording drives.
#[derive(Clone, Default)]
pub struct MockRobot {
    pub commands: Arc<Mutex<Vec<String>>>,
    pub drives: Arc<Mutex<Vec<(f32, f32)>>>,
}

pub const FEEDBACK: &str = r#"{"T":1001,"L":0,"R":0,"v":11.8}"#;

impl Robot for MockRobot {
    fn send_command(&mut self, command: &str) -> Result<String, PeripheralError> {
        self.commands.lock().push(command.to_owned());
        Ok(FEEDBACK.to_owned())
    }

    fn drive(&mut self, left: f32, right: f32) -> Result<(), PeripheralError> {
        self.drives.lock().push((left, right));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockSensors {
    pub leds: Arc<Mutex<Vec<LedMode>>>,
}

impl SensorBoard for MockSensors {
    fn read(&mut self) -> Result<SensorReading, PeripheralError> {
        Ok(SensorReading {
            temperature: 21.5,
            humidity: 40.0,
        })
    }

    fn set_led(&mut self, mode: LedMode) -> Result<(), PeripheralError> {
        self.leds.lock().push(mode);
        Ok(())
    }
}

/// Radar replaying scripted obstacle states.
#[derive(Clone, Default)]
pub struct MockRadar {
    pub states: Arc<Mutex<VecDeque<bool>>>,
}

impl Radar for MockRadar {
    fn poll_obstacle(&mut self) -> Result<Option<bool>, PeripheralError> {
        Ok(self.states.lock().pop_front())
    }
}

/// Camera writing `size` bytes of a fake JPEG per capture.
pub struct MockCamera {
    pub dir: PathBuf,
    pub size: usize,
}

impl MockCamera {
    pub fn image(size: usize) -> Vec<u8> {
        let mut image = JPEG.to_vec();
        image.extend((0..size.saturating_sub(JPEG.len())).map(|i| (i % 251) as u8));
        image
    }
}

impl Camera for MockCamera {
    fn capture_photo(&mut self, _quality: &str) -> Result<PathBuf, PeripheralError> {
        let path = self.dir.join("capture.jpg");
        std::fs::write(&path, Self::image(self.size))?;
        Ok(path)
    }

    fn record_video(&mut self, _duration: Duration, _quality: &str) -> Result<PathBuf, PeripheralError> {
        let path = self.dir.join("capture.mp4");
        std::fs::write(&path, b"video")?;
        Ok(path)
    }
}

/// Side-channel refusing the first `failures` transfers.
#[derive(Clone, Default)]
pub struct MockMediaLink {
    pub failures: Arc<Mutex<usize>>,
    pub sent: Arc<Mutex<Vec<(PathBuf, bool)>>>,
    pub streaming: Arc<Mutex<bool>>,
}

impl MockMediaLink {
    pub fn failing(failures: usize) -> Self {
        let link = Self::default();
        *link.failures.lock() = failures;
        link
    }
}

impl MediaLink for MockMediaLink {
    fn set_target(&mut self, _host: &str, _port: u16) {}

    fn send_file(&mut self, path: &Path, video: bool) -> Result<(), PeripheralError> {
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
        }
        self.sent.lock().push((path.to_path_buf(), video));
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<(), PeripheralError> {
        *self.streaming.lock() = true;
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), PeripheralError> {
        *self.streaming.lock() = false;
        Ok(())
    }
}

/// Sync store with a queue of outgoing packets, recording what it receives.
#[derive(Clone, Default)]
pub struct MockSync {
    pub outgoing: Arc<Mutex<VecDeque<String>>>,
    pub received: Arc<Mutex<Vec<(LoRaAddress, String)>>>,
    pub acks: Arc<Mutex<Vec<String>>>,
}

impl SyncStore for MockSync {
    fn next_packet(&mut self) -> Result<Option<String>, PeripheralError> {
        Ok(self.outgoing.lock().pop_front())
    }

    fn process_packet(&mut self, from: LoRaAddress, packet: &str) -> Result<String, PeripheralError> {
        self.received.lock().push((from, packet.to_owned()));
        Ok(format!("ack:{}", packet))
    }

    fn acknowledge(&mut self, ack: &str) -> Result<(), PeripheralError> {
        self.acks.lock().push(ack.to_owned());
        Ok(())
    }
}

pub fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

//! Events delivered to the application embedding a node.
use log::{info, warn};

use crate::media::Photo;
use crate::message::SensorReading;
use crate::telemetry::{Attitude, Position};
use crate::LoRaAddress;

/// Callbacks invoked by a running node.
///
/// They are called from the receive and dispatch threads, implementations must hand
/// off to their own thread (UI, storage) for anything slow. Every method has a
/// default body that logs the event.
pub trait NodeObserver: Send + Sync {
    /// Human readable trace of a received message.
    fn on_message(&self, text: &str) {
        info!("{}", text);
    }

    /// Dropped frames, failed handlers, evicted peers.
    fn on_alert(&self, text: &str) {
        warn!("{}", text);
    }

    /// Binary payload without a dedicated handler.
    fn on_bytes(&self, from: LoRaAddress, data: &[u8]) {
        info!("Received {}B from {}.", data.len(), from);
    }

    fn on_position(&self, from: LoRaAddress, position: Position) {
        info!(
            "Node {} position: x={:.2} y={:.2} z={:.2}",
            from, position.x, position.y, position.z
        );
    }

    fn on_sensor(&self, from: LoRaAddress, reading: SensorReading) {
        info!("Sensor data from {}: {}", from, reading);
    }

    fn on_battery(&self, from: LoRaAddress, level: &str) {
        info!("Battery of {}: {}", from, level);
    }

    fn on_feedback(&self, from: LoRaAddress, raw: &str) {
        info!("Feedback from {}: {}", from, raw);
    }

    fn on_imu(&self, from: LoRaAddress, raw: &str) {
        info!("IMU from {}: {}", from, raw);
    }

    fn on_photo(&self, from: LoRaAddress, photo: Photo) {
        match photo {
            Photo::Saved(path) => info!("Photo from {} saved in {}.", from, path.display()),
            Photo::Bytes(bytes) => info!("Photo from {} ({}B).", from, bytes.len()),
        }
    }

    fn on_collision(&self, from: LoRaAddress) {
        warn!("Obstacle detected by {}.", from);
    }

    /// Called with every tracked IMU sample, `stable` is false past the overturn angle.
    fn on_overturn(&self, from: LoRaAddress, attitude: Attitude) {
        if !attitude.stable {
            warn!(
                "Node {} may have overturned! Roll: {:.1}°, Pitch: {:.1}°",
                from, attitude.roll, attitude.pitch
            );
        }
    }
}

/// Observer logging every event.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogObserver;

impl NodeObserver for LogObserver {}

//! Carries out the dispatcher's actions.
use log::{debug, info, warn};
use std::fs;
use std::path::Path;
use std::time::{Instant, SystemTime};

use super::Node;
use crate::device::frame::Frame;
use crate::dispatch::{Action, CameraRequest, Event, HandlerError, ReplyTo, RobotQuery};
use crate::error::NodeError;
use crate::media::{ImageFormat, Photo};
use crate::message::{DataId, ResponseKind};
use crate::peripherals::{
    battery_level, MediaLink, PeripheralError, Shared, FEEDBACK_QUERY, IMU_QUERY,
};
use crate::telemetry::{ImuSample, ImuTracker};
use crate::worker::WorkerKind;
use crate::LoRaAddress;

impl Node {
    pub(super) fn execute(&self, frame: &Frame, action: Action) -> Result<(), NodeError> {
        match action {
            Action::Send {
                dest,
                msg_type,
                msg_id,
                text,
            } => self.send(dest, msg_type, msg_id, &text, false),
            Action::ResolvePending { from, msg_id } => {
                if !self.inner.pending.lock().remove(from, msg_id) {
                    debug!("Response {} from {} matched no pending request.", msg_id, from);
                }
                Ok(())
            }
            Action::RefreshPeer { addr, capabilities } => {
                let new = self
                    .inner
                    .peers
                    .lock()
                    .refresh(addr, capabilities, Instant::now());
                if new {
                    self.inner.observer.on_message(&format!(
                        "Node {} connected (capabilities {}).",
                        addr, capabilities
                    ));
                }
                Ok(())
            }
            Action::Notify(event) => {
                self.notify(event);
                Ok(())
            }
            Action::TrackImu { from, sample } => self.track_imu(from, &sample),
            Action::StorePhoto { from, data } => self.store_photo(from, frame.msg_id, data),
            Action::ProcessSync { from, packet } => {
                let store = self
                    .inner
                    .peripherals
                    .sync_store
                    .as_ref()
                    .ok_or(PeripheralError::Unavailable("Sync store"))?;
                let ack = store.lock().process_packet(from, &packet)?;
                self.send(from, 0, DataId::SyncAck.into(), &ack, false)
            }
            Action::AcknowledgeSync { ack } => {
                let store = self
                    .inner
                    .peripherals
                    .sync_store
                    .as_ref()
                    .ok_or(PeripheralError::Unavailable("Sync store"))?;
                store.lock().acknowledge(&ack)?;
                Ok(())
            }
            Action::StartLoop { kind, requester } => self.start_loop(kind, requester),
            Action::StopLoop(kind) => {
                if !self.inner.workers.lock().stop(kind) {
                    debug!("{:?} loop was not running.", kind);
                }
                Ok(())
            }
            Action::QueryRobot { query, requester } => {
                let data_id = match query {
                    RobotQuery::Feedback => DataId::Feedback,
                    RobotQuery::Imu => DataId::RawImu,
                    RobotQuery::Battery => DataId::Battery,
                };
                self.push_robot_data(query, data_id, requester)
            }
            Action::ForwardToRobot { command, reply } => {
                let answer = self.inner.peripherals.robot()?.lock().send_command(&command)?;
                self.answer(reply, ResponseKind::Robot, &answer)
            }
            Action::SetLed(mode) => {
                self.inner.peripherals.sensors()?.lock().set_led(mode)?;
                Ok(())
            }
            Action::ReadSensors { reply } => {
                let reading = self.inner.peripherals.sensors()?.lock().read()?;
                self.answer(reply, ResponseKind::Data, &reading.to_string())
            }
            Action::Camera { request, reply } => self.camera(request, reply),
            Action::SetRelay(enabled) => {
                self.set_relay(enabled);
                Ok(())
            }
            Action::ReportRssi { reply } => {
                let rssi = self.inner.link.lock().last_rssi();
                let text = match rssi {
                    Some(rssi) => format!("RSSI: {} dBm", rssi),
                    None => "RSSI: unavailable".to_owned(),
                };
                self.answer(reply, ResponseKind::Standard, &text)
            }
            Action::Shutdown => {
                info!("Stop requested by {}.", frame.src);
                self.stop();
                Ok(())
            }
        }
    }

    fn answer(&self, reply: ReplyTo, kind: ResponseKind, text: &str) -> Result<(), NodeError> {
        self.send(reply.dest, kind.into(), reply.msg_id, text, false)
    }

    fn notify(&self, event: Event) {
        let observer = &self.inner.observer;
        match event {
            Event::Sensor { from, reading } => observer.on_sensor(from, reading),
            Event::Battery { from, level } => observer.on_battery(from, &level),
            Event::Feedback { from, raw } => observer.on_feedback(from, &raw),
            Event::Imu { from, raw } => observer.on_imu(from, &raw),
            Event::Collision { from } => observer.on_collision(from),
            Event::Bytes { from, data } => observer.on_bytes(from, &data),
            Event::RemoteError { from, text } => {
                observer.on_alert(&format!("Node {} answered: {}", from, text))
            }
            Event::Message(text) => observer.on_message(&text),
        }
    }

    fn track_imu(&self, from: LoRaAddress, sample: &str) -> Result<(), NodeError> {
        let sample = ImuSample::from_json(sample).map_err(HandlerError::from)?;
        let (position, attitude) = self
            .inner
            .trackers
            .lock()
            .entry(from)
            .or_insert_with(ImuTracker::new)
            .update(&sample, Instant::now());
        let observer = &self.inner.observer;
        observer.on_position(from, position);
        observer.on_overturn(from, attitude);
        Ok(())
    }

    fn store_photo(&self, from: LoRaAddress, msg_id: u8, data: Vec<u8>) -> Result<(), NodeError> {
        let Some(format) = ImageFormat::detect(&data) else {
            return Err(NodeError::ReassemblyAbandoned {
                sender: from,
                msg_id,
                reason: format!("{}B received, not a JPEG or PNG image", data.len()),
            });
        };
        let photo = match &self.inner.media {
            Some(store) => Photo::Saved(store.save_photo(from, format, &data, SystemTime::now())?),
            None => Photo::Bytes(data),
        };
        self.inner.observer.on_photo(from, photo);
        Ok(())
    }

    /// Queries the robot and sends the answer to `requester` as data `data_id`.
    pub(super) fn push_robot_data(
        &self,
        query: RobotQuery,
        data_id: DataId,
        requester: LoRaAddress,
    ) -> Result<(), NodeError> {
        let command = match query {
            RobotQuery::Imu => IMU_QUERY,
            RobotQuery::Feedback | RobotQuery::Battery => FEEDBACK_QUERY,
        };
        let answer = self.inner.peripherals.robot()?.lock().send_command(command)?;
        let text = match query {
            RobotQuery::Battery => battery_level(&answer)?,
            _ => answer,
        };
        self.send(requester, 0, data_id.into(), &text, false)
    }

    fn camera(&self, request: CameraRequest, reply: ReplyTo) -> Result<(), NodeError> {
        let peripherals = &self.inner.peripherals;
        let text = match request {
            CameraRequest::Photo { quality } => {
                let path = peripherals.camera()?.lock().capture_photo(&quality)?;
                if self.deliver_media(&path, false) {
                    "Photo taken and sent."
                } else {
                    "Photo taken and stored."
                }
            }
            CameraRequest::Video { duration, quality } => {
                let path = peripherals.camera()?.lock().record_video(duration, &quality)?;
                if self.deliver_media(&path, true) {
                    "Video taken and sent."
                } else {
                    "Video taken and stored."
                }
            }
            CameraRequest::Streaming(true) => {
                self.media_link()?.lock().start_streaming()?;
                self.start_loop(WorkerKind::Streaming, reply.dest)?;
                "OK"
            }
            CameraRequest::Streaming(false) => {
                self.inner.workers.lock().stop(WorkerKind::Streaming);
                match self.media_link()?.lock().stop_streaming() {
                    Ok(()) => "OK",
                    Err(err) => {
                        warn!("Could not stop streaming: {}", err);
                        "Error"
                    }
                }
            }
            CameraRequest::SetMediaHost { host, port } => {
                self.media_link()?.lock().set_target(&host, port);
                info!("Media side-channel target set to {}:{}.", host, port);
                "OK"
            }
            CameraRequest::PhotoOverRadio => {
                let path = peripherals.camera()?.lock().capture_photo("low")?;
                self.answer(reply, ResponseKind::Data, "OK")?;
                let bytes = fs::read(&path)?;
                info!(
                    "Sending photo {} ({}B) to {} over the radio.",
                    path.display(),
                    bytes.len(),
                    reply.dest
                );
                return self.send_fragmented(reply.dest, 0, DataId::Photo.into(), &bytes, false);
            }
        };
        self.answer(reply, ResponseKind::Data, text)
    }

    pub(super) fn media_link(&self) -> Result<&Shared<dyn MediaLink>, PeripheralError> {
        self.inner
            .peripherals
            .media_link
            .as_ref()
            .ok_or(PeripheralError::Unavailable("Media side-channel"))
    }

    /// Sends a capture over the side-channel, or lists it as pending. Returns whether
    /// it was delivered.
    fn deliver_media(&self, path: &Path, video: bool) -> bool {
        if let Ok(link) = self.media_link() {
            match link.lock().send_file(path, video) {
                Ok(()) => return true,
                Err(err) => warn!("Could not send {}: {}", path.display(), err),
            }
        }
        if let Some(pending) = &self.inner.pending_media {
            if let Err(err) = pending.lock().mark(path, video) {
                self.alert(&format!("Could not mark {} as pending: {}", path.display(), err));
            }
        }
        false
    }
}

//! Periodic tasks started by remote commands.
use log::{debug, info, warn};
use std::time::Duration;

use super::Node;
use crate::dispatch::RobotQuery;
use crate::error::NodeError;
use crate::message::DataId;
use crate::peripherals::{Camera, MediaLink, PeripheralError, Radar, Robot, Shared};
use crate::worker::{StopToken, WorkerKind};
use crate::LoRaAddress;

/// Wheel speeds while the way is clear.
const FORWARD: (f32, f32) = (0.1, 0.1);
/// Wheel speeds turning away from an obstacle.
const TURN: (f32, f32) = (0.1, -0.1);
const HALT: (f32, f32) = (0.0, 0.0);
const BRAKE_TIME: Duration = Duration::from_millis(500);
const TURN_TIME: Duration = Duration::from_secs(1);

impl Node {
    /// Starts the loop `kind` on behalf of `requester`. Starting a running loop is a
    /// no-op.
    pub(super) fn start_loop(&self, kind: WorkerKind, requester: LoRaAddress) -> Result<(), NodeError> {
        let config = &self.inner.config;
        let peripherals = &self.inner.peripherals;
        let node = self.clone();
        let mut workers = self.inner.workers.lock();
        let started = match kind {
            WorkerKind::Feedback | WorkerKind::Imu | WorkerKind::Battery => {
                peripherals.robot()?;
                let (query, data_id, period) = match kind {
                    WorkerKind::Feedback => {
                        (RobotQuery::Feedback, DataId::Feedback, config.feedback_interval())
                    }
                    WorkerKind::Imu => (RobotQuery::Imu, DataId::ImuTracking, config.imu_interval()),
                    _ => (RobotQuery::Battery, DataId::Battery, config.battery_interval()),
                };
                workers.start(kind, move |token| {
                    loop {
                        if let Err(err) = node.push_robot_data(query, data_id, requester) {
                            node.alert(&format!("{:?} loop: {}", kind, err));
                        }
                        if token.wait(period) {
                            break;
                        }
                    }
                    debug!("{:?} loop finished.", kind);
                })
            }
            WorkerKind::Autonomy | WorkerKind::CollisionWatch => {
                let robot = peripherals.robot()?.clone();
                let radar = peripherals.radar()?.clone();
                let driving = kind == WorkerKind::Autonomy;
                if driving {
                    workers.stop(WorkerKind::CollisionWatch);
                } else if workers.is_running(WorkerKind::Autonomy) {
                    debug!("Autonomous mode already watches for collisions.");
                    return Ok(());
                }
                workers.start(kind, move |token| {
                    node.motion_loop(token, &robot, &radar, driving, requester)
                })
            }
            WorkerKind::SensorPush => {
                peripherals.sensors()?;
                let period = config.sensor_interval();
                workers.start(kind, move |token| {
                    while !token.wait(period) {
                        if let Err(err) = node.push_reading(requester) {
                            node.alert(&format!("Sensor loop: {}", err));
                        }
                    }
                    debug!("Sensor loop finished.");
                })
            }
            WorkerKind::Streaming => {
                let camera = peripherals.camera()?.clone();
                let link = self.media_link()?.clone();
                let period = config.stream_interval();
                let clip = config.stream_clip();
                workers.start(kind, move |token| {
                    loop {
                        if let Err(err) = node.stream_clip(&camera, &link, clip, requester) {
                            warn!("Streaming clip failed: {}", err);
                        }
                        if token.wait(period) {
                            break;
                        }
                    }
                    debug!("Streaming loop finished.");
                })
            }
            WorkerKind::Receive
            | WorkerKind::Watchdog
            | WorkerKind::Ping
            | WorkerKind::SyncPush
            | WorkerKind::MediaRetry => {
                warn!("{:?} worker cannot be started remotely.", kind);
                return Ok(());
            }
        };
        if started {
            info!("{:?} loop started for {}.", kind, requester);
        }
        Ok(())
    }

    fn push_reading(&self, requester: LoRaAddress) -> Result<(), NodeError> {
        let reading = self.inner.peripherals.sensors()?.lock().read()?;
        self.send(requester, 0, DataId::SensorReading.into(), &reading.to_compact(), false)
    }

    /// Records a short clip, sends it over the side-channel and notifies `requester`.
    fn stream_clip(
        &self,
        camera: &Shared<dyn Camera>,
        link: &Shared<dyn MediaLink>,
        clip: Duration,
        requester: LoRaAddress,
    ) -> Result<(), NodeError> {
        let path = camera.lock().record_video(clip, "low")?;
        link.lock().send_file(&path, true)?;
        self.send(requester, 0, DataId::StreamNotice.into(), "Frame sent.", false)
    }

    /// Watches the radar every tick and reports new obstacles to `requester`. When
    /// `driving`, also moves forward and steers around obstacles, and halts the robot
    /// once stopped.
    fn motion_loop(
        &self,
        token: StopToken,
        robot: &Shared<dyn Robot>,
        radar: &Shared<dyn Radar>,
        driving: bool,
        requester: LoRaAddress,
    ) {
        let tick = self.inner.config.autonomy_tick();
        let mut blocked = false;
        let mut command = None;
        loop {
            match radar.lock().poll_obstacle() {
                Ok(Some(obstacle)) => {
                    if obstacle && !blocked {
                        self.report_collision(requester);
                    }
                    blocked = obstacle;
                }
                Ok(None) => {}
                Err(err) => warn!("Radar poll failed: {}", err),
            }

            if driving {
                let result = if blocked {
                    command = None;
                    self.avoid_obstacle(robot, &token)
                } else {
                    drive_once(robot, &mut command, FORWARD).map(|()| false)
                };
                match result {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(err) => self.alert(&format!("Autonomous drive failed: {}", err)),
                }
            }

            if token.wait(tick) {
                break;
            }
        }
        if driving {
            if let Err(err) = robot.lock().drive(HALT.0, HALT.1) {
                self.alert(&format!("Could not halt the robot: {}", err));
            }
        }
        debug!("Motion loop finished.");
    }

    fn report_collision(&self, requester: LoRaAddress) {
        warn!("Obstacle detected.");
        if let Err(err) = self.send(requester, 0, DataId::Collision.into(), "1", false) {
            self.alert(&format!("Collision report failed: {}", err));
        }
    }

    /// Brakes then turns in place. Returns true when stopped meanwhile.
    fn avoid_obstacle(&self, robot: &Shared<dyn Robot>, token: &StopToken) -> Result<bool, PeripheralError> {
        robot.lock().drive(HALT.0, HALT.1)?;
        if token.wait(BRAKE_TIME) {
            return Ok(true);
        }
        robot.lock().drive(TURN.0, TURN.1)?;
        Ok(token.wait(TURN_TIME))
    }
}

/// Sends `wanted` unless it is already the last command sent.
fn drive_once(
    robot: &Shared<dyn Robot>,
    last: &mut Option<(f32, f32)>,
    wanted: (f32, f32),
) -> Result<(), PeripheralError> {
    if *last != Some(wanted) {
        robot.lock().drive(wanted.0, wanted.1)?;
        *last = Some(wanted);
    }
    Ok(())
}

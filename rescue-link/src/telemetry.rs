//! Position and attitude estimates from the robot's IMU samples.
use serde::Deserialize;
use std::time::Instant;

/// Standard gravity (m/s²).
const GRAVITY: f64 = 9.81;
/// Roll or pitch (degrees) beyond which the robot is considered overturned.
pub const OVERTURN_THRESHOLD: f64 = 60.0;

/// One IMU answer of the robot controller. Missing fields read as zero.
///
/// `{"T":1002,"r":-89.04,"p":-0.89,"ax":-0.15,"ay":-9.98,"az":0.16,"gx":0.007,...}`
#[derive(Copy, Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ImuSample {
    #[serde(rename = "r")]
    pub roll: f64,
    #[serde(rename = "p")]
    pub pitch: f64,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
}

impl ImuSample {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text.trim())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Orientation reported with each sample.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    /// False when the robot is likely overturned.
    pub stable: bool,
}

/// Dead reckoning by double integration of the accelerations.
///
/// Drift is unbounded: the estimate is only meaningful over short runs between
/// resets.
#[derive(Clone, Debug, Default)]
pub struct ImuTracker {
    last: Option<Instant>,
    velocity: [f64; 3],
    position: [f64; 3],
}

impl ImuTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrates one sample received at `now`. The first sample only sets the clock.
    pub fn update(&mut self, sample: &ImuSample, now: Instant) -> (Position, Attitude) {
        let dt = self
            .last
            .map_or(0.0, |last| now.saturating_duration_since(last).as_secs_f64());
        self.last = Some(now);

        let (ax, ay, az) = (sample.ax, sample.ay, sample.az);
        // Y is taken as the vertical axis when it dominates.
        let ay = if ay.abs() > ax.abs() && ay.abs() > az.abs() {
            ay + GRAVITY
        } else {
            ay
        };
        for (axis, accel) in [ax, ay, az].into_iter().enumerate() {
            self.velocity[axis] += accel * dt;
            self.position[axis] += self.velocity[axis] * dt;
        }

        (self.position(), attitude(sample))
    }

    pub fn position(&self) -> Position {
        Position {
            x: self.position[0],
            y: self.position[1],
            z: self.position[2],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub fn attitude(sample: &ImuSample) -> Attitude {
    Attitude {
        roll: sample.roll,
        pitch: sample.pitch,
        stable: sample.roll.abs() <= OVERTURN_THRESHOLD && sample.pitch.abs() <= OVERTURN_THRESHOLD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sample_parses_controller_answer() {
        let sample = ImuSample::from_json(
            r#"{"T":1002,"r":-89.0,"p":-0.5,"ax":-0.15,"ay":-9.98,"az":0.16,"gx":0.007,"temp":30.2}"#,
        )
        .unwrap();
        assert_eq!(sample.roll, -89.0);
        assert_eq!(sample.ay, -9.98);
        assert_eq!(sample.gz, 0.0);
        assert!(ImuSample::from_json("OK").is_err());
    }

    #[test]
    fn gravity_is_compensated_on_dominant_y() {
        let start = Instant::now();
        let mut tracker = ImuTracker::new();
        let resting = ImuSample {
            ay: -GRAVITY,
            ..ImuSample::default()
        };
        tracker.update(&resting, start);
        let (position, _) = tracker.update(&resting, start + Duration::from_secs(1));
        assert_eq!(position, Position::default());
    }

    #[test]
    fn constant_acceleration_is_integrated() {
        let start = Instant::now();
        let mut tracker = ImuTracker::new();
        let sample = ImuSample {
            ax: 2.0,
            ..ImuSample::default()
        };
        tracker.update(&sample, start);
        let (position, _) = tracker.update(&sample, start + Duration::from_secs(1));
        assert!((position.x - 2.0).abs() < 1e-9);
        let (position, _) = tracker.update(&sample, start + Duration::from_secs(2));
        assert!((position.x - 6.0).abs() < 1e-9);
        tracker.reset();
        assert_eq!(tracker.position(), Position::default());
    }

    #[test]
    fn overturn_above_threshold() {
        let tilted = |roll, pitch| ImuSample {
            roll,
            pitch,
            ..ImuSample::default()
        };
        assert!(attitude(&tilted(10.0, -20.0)).stable);
        assert!(attitude(&tilted(60.0, 0.0)).stable);
        assert!(!attitude(&tilted(-89.0, 0.0)).stable);
        assert!(!attitude(&tilted(0.0, 61.0)).stable);
    }
}

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use air_brakes_flight_core::AirbrakeActuator;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActuatorError {
    #[error("extension {0} is outside 0-1")]
    OutOfRange(f32),
    #[error("servo did not acknowledge write #{0}")]
    NoAck(u32),
}

/// Maps normalized extension onto servo angles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoCalibration {
    /// deg, airbrakes fully retracted
    pub closed_angle: f32,
    /// deg, airbrakes fully deployed
    pub open_angle: f32,
}

impl Default for ServoCalibration {
    fn default() -> Self {
        Self {
            closed_angle: -23.33,
            open_angle: 23.33,
        }
    }
}

impl ServoCalibration {
    pub fn angle_for(&self, extension: f32) -> f32 {
        self.closed_angle + (self.open_angle - self.closed_angle) * extension
    }
}

/// Extension shared between a mock servo and the simulated flight, stored as
/// f32 bits.
#[derive(Debug, Clone, Default)]
pub struct SharedExtension(Arc<AtomicU32>);

impl SharedExtension {
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, extension: f32) {
        self.0.store(extension.to_bits(), Ordering::Release);
    }
}

/// In-process servo used for simulation and replay.
pub struct MockServo {
    calibration: ServoCalibration,
    extension: SharedExtension,
    angle: f32,
    writes: u32,
    /// 1-based write numbers that fail
    fail_writes: Vec<u32>,
}

impl MockServo {
    pub fn new(calibration: ServoCalibration, extension: SharedExtension) -> Self {
        Self {
            angle: calibration.closed_angle,
            calibration,
            extension,
            writes: 0,
            fail_writes: Vec::new(),
        }
    }

    pub fn fail_on_writes(mut self, writes: impl IntoIterator<Item = u32>) -> Self {
        self.fail_writes.extend(writes);
        self
    }

    pub fn angle(&self) -> f32 {
        self.angle
    }

    pub fn writes(&self) -> u32 {
        self.writes
    }

    pub fn extension(&self) -> SharedExtension {
        self.extension.clone()
    }
}

impl AirbrakeActuator for MockServo {
    type Error = ActuatorError;

    fn set_extension(&mut self, extension: f32) -> Result<(), Self::Error> {
        self.writes += 1;
        if !(0.0..=1.0).contains(&extension) {
            return Err(ActuatorError::OutOfRange(extension));
        }
        if self.fail_writes.contains(&self.writes) {
            return Err(ActuatorError::NoAck(self.writes));
        }
        self.angle = self.calibration.angle_for(extension);
        self.extension.set(extension);
        Ok(())
    }
}

/// Owns the actuator for the lifetime of the flight and drives it to the
/// retracted position when dropped, whatever path the program exits by.
pub struct ActuatorHandle<A: AirbrakeActuator> {
    actuator: A,
    retracted_extension: f32,
    last_extension: Option<f32>,
    failures: u32,
}

impl<A> ActuatorHandle<A>
where
    A: AirbrakeActuator,
    A::Error: std::fmt::Display,
{
    pub fn new(actuator: A, retracted_extension: f32) -> Self {
        Self {
            actuator,
            retracted_extension,
            last_extension: None,
            failures: 0,
        }
    }

    pub fn retract(&mut self) -> Result<(), A::Error> {
        self.set_extension(self.retracted_extension)
    }

    pub fn last_extension(&self) -> Option<f32> {
        self.last_extension
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn inner(&self) -> &A {
        &self.actuator
    }
}

impl<A> AirbrakeActuator for ActuatorHandle<A>
where
    A: AirbrakeActuator,
    A::Error: std::fmt::Display,
{
    type Error = A::Error;

    fn set_extension(&mut self, extension: f32) -> Result<(), Self::Error> {
        match self.actuator.set_extension(extension) {
            Ok(()) => {
                self.last_extension = Some(extension);
                Ok(())
            }
            Err(e) => {
                self.failures += 1;
                warn!("actuator write of {} failed: {}", extension, e);
                Err(e)
            }
        }
    }
}

impl<A: AirbrakeActuator> Drop for ActuatorHandle<A> {
    fn drop(&mut self) {
        match self.actuator.set_extension(self.retracted_extension) {
            Ok(()) => info!("airbrakes retracted on release"),
            Err(_) => warn!("failed to retract airbrakes on release"),
        }
    }
}

use std::{
    io,
    path::Path,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use air_brakes_flight_core::{EstimatedSample, RawSample, SensorSample};
use log::{debug, info};
use nalgebra::{Quaternion, Vector3};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::queue::PacketQueue;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read replay file: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: unknown sample kind {kind:?}")]
    UnknownKind { line: u64, kind: String },
    #[error("replay file contains no samples")]
    Empty,
}

impl From<io::Error> for ReplayError {
    fn from(value: io::Error) -> Self {
        Self::Csv(value.into())
    }
}

/// One line of a recorded sensor stream. Columns that do not apply to the
/// line's kind are left empty; missing readings replay as NaN.
#[derive(Debug, Deserialize)]
struct ReplayRecord {
    kind: String,
    timestamp_ns: u64,
    acceleration_x: Option<f32>,
    acceleration_y: Option<f32>,
    acceleration_z: Option<f32>,
    angular_velocity_x: Option<f32>,
    angular_velocity_y: Option<f32>,
    angular_velocity_z: Option<f32>,
    gps_time_of_week: Option<f64>,
    gps_week: Option<u16>,
    gps_correlation_flags: Option<u16>,
    orientation_w: Option<f32>,
    orientation_x: Option<f32>,
    orientation_y: Option<f32>,
    orientation_z: Option<f32>,
    compensated_acceleration_x: Option<f32>,
    compensated_acceleration_y: Option<f32>,
    compensated_acceleration_z: Option<f32>,
    pressure_altitude: Option<f32>,
    filter_status: Option<u16>,
    attitude_uncertainty_w: Option<f32>,
    attitude_uncertainty_x: Option<f32>,
    attitude_uncertainty_y: Option<f32>,
    attitude_uncertainty_z: Option<f32>,
}

fn reading(value: Option<f32>) -> f32 {
    value.unwrap_or(f32::NAN)
}

impl ReplayRecord {
    fn angular_velocity(&self) -> Vector3<f32> {
        Vector3::new(
            reading(self.angular_velocity_x),
            reading(self.angular_velocity_y),
            reading(self.angular_velocity_z),
        )
    }

    fn into_sample(self, line: u64) -> Result<SensorSample, ReplayError> {
        let sample = match self.kind.trim().to_ascii_lowercase().as_str() {
            "raw" => RawSample {
                timestamp_ns: self.timestamp_ns,
                acceleration: Vector3::new(
                    reading(self.acceleration_x),
                    reading(self.acceleration_y),
                    reading(self.acceleration_z),
                ),
                angular_velocity: self.angular_velocity(),
                gps_time_of_week: self.gps_time_of_week,
                gps_week: self.gps_week,
                gps_correlation_flags: self.gps_correlation_flags.unwrap_or(0),
            }
            .into(),
            "estimated" => EstimatedSample {
                timestamp_ns: self.timestamp_ns,
                orientation: Quaternion::new(
                    reading(self.orientation_w),
                    reading(self.orientation_x),
                    reading(self.orientation_y),
                    reading(self.orientation_z),
                ),
                angular_velocity: self.angular_velocity(),
                compensated_acceleration: Vector3::new(
                    reading(self.compensated_acceleration_x),
                    reading(self.compensated_acceleration_y),
                    reading(self.compensated_acceleration_z),
                ),
                pressure_altitude: reading(self.pressure_altitude),
                filter_status: self.filter_status.unwrap_or(0),
                attitude_uncertainty: Quaternion::new(
                    self.attitude_uncertainty_w.unwrap_or(0.0),
                    self.attitude_uncertainty_x.unwrap_or(0.0),
                    self.attitude_uncertainty_y.unwrap_or(0.0),
                    self.attitude_uncertainty_z.unwrap_or(0.0),
                ),
            }
            .into(),
            _ => {
                return Err(ReplayError::UnknownKind {
                    line,
                    kind: self.kind,
                });
            }
        };
        Ok(sample)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplayPacing {
    /// follow the recorded timestamps, `speed` times faster
    Recorded { speed: f32 },
    /// push without sleeping, holding back only while the queue is half full
    AsFastAsPossible,
}

pub struct ReplaySummary {
    pub samples: u64,
}

/// A recorded sensor stream, fully parsed up front so a malformed file is
/// reported before the flight loop starts.
pub struct Replay {
    samples: Vec<SensorSample>,
}

impl Replay {
    pub fn open(path: &Path) -> Result<Self, ReplayError> {
        Self::from_reader(std::fs::File::open(path)?)
    }

    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, ReplayError> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut samples = Vec::new();
        for (i, record) in reader.deserialize::<ReplayRecord>().enumerate() {
            // header is line 1
            samples.push(record?.into_sample(i as u64 + 2)?);
        }
        if samples.is_empty() {
            return Err(ReplayError::Empty);
        }
        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[SensorSample] {
        &self.samples
    }

    /// Push the stream into `queue` from a dedicated thread and close the
    /// queue once the stream ends or `cancel` fires.
    pub fn spawn(
        self,
        queue: Arc<PacketQueue>,
        pacing: ReplayPacing,
        cancel: CancellationToken,
    ) -> JoinHandle<ReplaySummary> {
        thread::spawn(move || {
            let samples = self.run(&queue, pacing, &cancel);
            queue.close();
            info!("replay finished after {} samples", samples);
            ReplaySummary { samples }
        })
    }

    fn run(self, queue: &PacketQueue, pacing: ReplayPacing, cancel: &CancellationToken) -> u64 {
        let first_timestamp_ns = self.samples[0].timestamp_ns();
        let started = Instant::now();
        let mut pushed = 0u64;

        for sample in self.samples {
            if cancel.is_cancelled() {
                debug!("replay cancelled after {} samples", pushed);
                break;
            }

            match pacing {
                ReplayPacing::Recorded { speed } => {
                    let offset_ns = sample.timestamp_ns().saturating_sub(first_timestamp_ns);
                    let offset = Duration::from_nanos(offset_ns).div_f32(speed.max(f32::EPSILON));
                    if let Some(remaining) =
                        (started + offset).checked_duration_since(Instant::now())
                    {
                        thread::sleep(remaining);
                    }
                }
                ReplayPacing::AsFastAsPossible => {
                    while queue.depth() >= queue.capacity() / 2 && !cancel.is_cancelled() {
                        thread::sleep(Duration::from_micros(200));
                    }
                }
            }

            queue.push(sample);
            pushed += 1;
        }
        pushed
    }
}

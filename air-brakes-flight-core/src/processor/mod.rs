use heapless::Deque;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::sample::{
    EstimatedSample, NS_PER_S, RawSample, SensorSample, TimestampNs, quaternion_is_finite,
    vector_is_finite,
};

mod fields;
mod welford;

pub use fields::{InvalidFields, SampleField};
use welford::Welford;

pub const MAX_VELOCITY_WINDOW: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub gravity: f32,
    /// forward timestamp jumps larger than this are treated as a sensor fault
    pub max_timestamp_gap_s: f32,
    /// oldest raw accelerometer reading that may stand in for a missing
    /// compensated acceleration
    pub max_raw_age_s: f32,
    /// number of valid pressure altitudes averaged into the pad zero offset
    pub pad_zero_samples: u32,
    pub min_pressure_altitude: f32,
    pub max_pressure_altitude: f32,
    /// rolling window (samples) for the baro derived velocity, at most 64
    pub velocity_window: usize,
    /// altitude change below which dh/dt is not recomputed
    pub altitude_deadband: f32,
    /// complementary gain pulling the integrated velocity toward the baro velocity
    pub velocity_blend: f32,
    /// m/s between integrated and baro velocity before the cross check trips
    pub divergence_bound: f32,
    pub divergence_ticks: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            gravity: 9.80665,
            max_timestamp_gap_s: 5.0,
            max_raw_age_s: 0.02,
            pad_zero_samples: 50,
            min_pressure_altitude: -500.0,
            max_pressure_altitude: 40_000.0,
            velocity_window: 10,
            altitude_deadband: 0.05,
            velocity_blend: 0.02,
            divergence_bound: 25.0,
            divergence_ticks: 20,
        }
    }
}

/// Motion estimate for one tick.
///
/// Every field always holds a number. A field listed in `invalid_fields` holds
/// the last valid value instead of this tick's measurement.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedSample {
    pub timestamp_ns: TimestampNs,
    /// m above the pad
    pub current_altitude: f32,
    /// m/s, up positive
    pub vertical_velocity: f32,
    /// m/s^2, gravity removed, up positive
    pub vertical_acceleration: f32,
    pub invalid_fields: InvalidFields,
}

impl ProcessedSample {
    pub fn is_valid(&self, field: SampleField) -> bool {
        !self.invalid_fields.contains(field)
    }

    pub fn altitude(&self) -> Option<f32> {
        self.is_valid(SampleField::Altitude)
            .then_some(self.current_altitude)
    }

    pub fn velocity(&self) -> Option<f32> {
        self.is_valid(SampleField::VerticalVelocity)
            .then_some(self.vertical_velocity)
    }

    pub fn acceleration(&self) -> Option<f32> {
        self.is_valid(SampleField::VerticalAcceleration)
            .then_some(self.vertical_acceleration)
    }
}

enum TimestampCheck {
    Accepted,
    Regressed { last: TimestampNs },
    Jumped { last: TimestampNs },
}

/// Fuses the raw and estimated IMU streams into a [`ProcessedSample`] per tick.
pub struct DataProcessor {
    config: ProcessorConfig,

    pad_zero: Welford,
    orientation: UnitQuaternion<f32>,

    last_timestamp_ns: Option<TimestampNs>,
    last_estimated_ns: Option<TimestampNs>,
    last_raw_acceleration: Option<(TimestampNs, Vector3<f32>)>,

    // (timestamp, altitude) of the last point used for dh/dt
    last_baro_point: Option<(TimestampNs, f32)>,
    last_baro_slope: f32,
    baro_velocities: Deque<f32, MAX_VELOCITY_WINDOW>,
    integrated_velocity: f32,
    divergence_count: u32,
    divergence_events: u32,

    last_output: ProcessedSample,
    tick_raw: Option<RawSample>,
    tick_estimated: Option<EstimatedSample>,

    max_altitude: f32,
    max_velocity: f32,
    fault_count: u32,
}

impl DataProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            pad_zero: Welford::new(),
            orientation: UnitQuaternion::identity(),
            last_timestamp_ns: None,
            last_estimated_ns: None,
            last_raw_acceleration: None,
            last_baro_point: None,
            last_baro_slope: 0.0,
            baro_velocities: Deque::new(),
            integrated_velocity: 0.0,
            divergence_count: 0,
            divergence_events: 0,
            last_output: ProcessedSample {
                timestamp_ns: 0,
                current_altitude: 0.0,
                vertical_velocity: 0.0,
                vertical_acceleration: 0.0,
                invalid_fields: InvalidFields::all_derived(),
            },
            tick_raw: None,
            tick_estimated: None,
            max_altitude: 0.0,
            max_velocity: 0.0,
            fault_count: 0,
        }
    }

    /// Consume every sample drained this tick, oldest first.
    ///
    /// Never fails: faulty samples are dropped and reported through
    /// `invalid_fields`, and missing values hold their last valid value.
    pub fn update(&mut self, samples: &[SensorSample]) -> ProcessedSample {
        let mut invalid = InvalidFields::empty();
        let mut tick_valid = InvalidFields::empty();
        let mut saw_estimated = false;
        let previous = self.last_output.clone();
        self.tick_raw = None;
        self.tick_estimated = None;

        for sample in samples {
            let timestamp_ns = sample.timestamp_ns();
            match self.check_timestamp(timestamp_ns) {
                TimestampCheck::Accepted => {}
                TimestampCheck::Regressed { last } => {
                    self.fault_count = self.fault_count.wrapping_add(1);
                    log_warn_every!(
                        self.fault_count,
                        100,
                        "timestamp regressed from {} to {}, sample dropped",
                        last,
                        timestamp_ns
                    );
                    invalid.insert(SampleField::Timestamp);
                    continue;
                }
                TimestampCheck::Jumped { last } => {
                    self.fault_count = self.fault_count.wrapping_add(1);
                    log_warn!(
                        "timestamp jumped from {} to {}, re-anchoring",
                        last,
                        timestamp_ns
                    );
                    invalid.insert(SampleField::Timestamp);
                    continue;
                }
            }

            match sample {
                SensorSample::Raw(raw) => {
                    if vector_is_finite(&raw.acceleration) {
                        self.last_raw_acceleration = Some((raw.timestamp_ns, raw.acceleration));
                    } else {
                        invalid.insert(SampleField::RawAcceleration);
                    }
                    self.tick_raw = Some(raw.clone());
                }
                SensorSample::Estimated(estimated) => {
                    saw_estimated = true;
                    self.ingest_estimated(estimated, &mut invalid, &mut tick_valid);
                    self.tick_estimated = Some(estimated.clone());
                }
            }
        }

        // a derived field is reported valid when at least one sample this tick
        // produced it; a later bad sample does not erase an earlier good one
        for field in SampleField::DERIVED {
            if !tick_valid.contains(field) {
                invalid.insert(field);
            }
        }

        if saw_estimated {
            self.cross_check(&mut invalid);
        }

        let output = ProcessedSample {
            timestamp_ns: self.last_estimated_ns.unwrap_or(self.last_output.timestamp_ns),
            current_altitude: self.last_output.current_altitude,
            vertical_velocity: self.integrated_velocity,
            vertical_acceleration: self.last_output.vertical_acceleration,
            invalid_fields: invalid,
        };
        let output = hold_invalid(&previous, output);

        if let Some(altitude) = output.altitude() {
            self.max_altitude = self.max_altitude.max(altitude);
        }
        if let Some(velocity) = output.velocity() {
            self.max_velocity = self.max_velocity.max(velocity);
        }

        self.last_output = output.clone();
        output
    }

    fn check_timestamp(&mut self, timestamp_ns: TimestampNs) -> TimestampCheck {
        let Some(last) = self.last_timestamp_ns else {
            self.last_timestamp_ns = Some(timestamp_ns);
            return TimestampCheck::Accepted;
        };

        if timestamp_ns < last {
            return TimestampCheck::Regressed { last };
        }

        let gap_s = (timestamp_ns - last) as f32 / NS_PER_S;
        if gap_s > self.config.max_timestamp_gap_s {
            // start a new time base, nothing is integrated across the gap
            self.last_timestamp_ns = Some(timestamp_ns);
            self.last_estimated_ns = None;
            self.last_raw_acceleration = None;
            self.last_baro_point = None;
            return TimestampCheck::Jumped { last };
        }

        self.last_timestamp_ns = Some(timestamp_ns);
        TimestampCheck::Accepted
    }

    fn ingest_estimated(
        &mut self,
        sample: &EstimatedSample,
        invalid: &mut InvalidFields,
        tick_valid: &mut InvalidFields,
    ) {
        let dt = self
            .last_estimated_ns
            .map(|last| sample.timestamp_ns.saturating_sub(last) as f32 / NS_PER_S)
            .filter(|dt| *dt > 0.0);
        self.last_estimated_ns = Some(sample.timestamp_ns);

        // orientation, held on failure
        match self.validate_orientation(sample) {
            Some(orientation) => self.orientation = orientation,
            None => invalid.insert(SampleField::Orientation),
        }

        // velocity is only reported when integration or the baro blend fed it
        let mut velocity_updated = false;

        // acceleration, falling back to a recent raw accelerometer reading
        let body_acceleration = if vector_is_finite(&sample.compensated_acceleration) {
            Some(sample.compensated_acceleration)
        } else {
            invalid.insert(SampleField::CompensatedAcceleration);
            self.recent_raw_acceleration(sample.timestamp_ns)
        };
        if let Some(body_acceleration) = body_acceleration {
            let world = self.orientation.transform_vector(&body_acceleration);
            let vertical_acceleration = world.z - self.config.gravity;
            if vertical_acceleration.is_finite() {
                self.last_output.vertical_acceleration = vertical_acceleration;
                tick_valid.insert(SampleField::VerticalAcceleration);
                if let Some(dt) = dt {
                    self.integrated_velocity += vertical_acceleration * dt;
                    velocity_updated = true;
                }
            }
        }

        // altitude and baro velocity
        let pressure_altitude = sample.pressure_altitude;
        if pressure_altitude.is_finite()
            && pressure_altitude >= self.config.min_pressure_altitude
            && pressure_altitude <= self.config.max_pressure_altitude
        {
            if self.pad_zero.count() < self.config.pad_zero_samples {
                self.pad_zero.update(pressure_altitude);
                if self.pad_zero.count() == self.config.pad_zero_samples {
                    log_info!(
                        "pad zero captured: {} m asl, variance {}",
                        self.pad_zero.mean().unwrap_or(0.0),
                        self.pad_zero.variance().unwrap_or(0.0)
                    );
                }
            }
            let altitude = pressure_altitude - self.pad_zero.mean().unwrap_or(pressure_altitude);
            self.last_output.current_altitude = altitude;
            tick_valid.insert(SampleField::Altitude);

            if let Some(baro_velocity) = self.update_baro_velocity(sample.timestamp_ns, altitude) {
                let blend = self.config.velocity_blend.clamp(0.0, 1.0);
                self.integrated_velocity += blend * (baro_velocity - self.integrated_velocity);
                velocity_updated = true;
            }
        } else {
            self.fault_count = self.fault_count.wrapping_add(1);
            log_warn_every!(
                self.fault_count,
                100,
                "invalid pressure altitude {} at {}",
                pressure_altitude,
                sample.timestamp_ns
            );
        }

        if !self.integrated_velocity.is_finite() {
            // never let a poisoned integrator leak out
            self.integrated_velocity = self.last_output.vertical_velocity;
        } else if velocity_updated {
            tick_valid.insert(SampleField::VerticalVelocity);
        }
    }

    fn recent_raw_acceleration(&self, timestamp_ns: TimestampNs) -> Option<Vector3<f32>> {
        let (raw_ns, acceleration) = self.last_raw_acceleration?;
        let age_s = timestamp_ns.saturating_sub(raw_ns) as f32 / NS_PER_S;
        if age_s <= self.config.max_raw_age_s {
            Some(acceleration)
        } else {
            log_trace!(
                "raw acceleration is {} s old at {}, not used as a fallback",
                age_s,
                timestamp_ns
            );
            None
        }
    }

    fn validate_orientation(&self, sample: &EstimatedSample) -> Option<UnitQuaternion<f32>> {
        if !quaternion_is_finite(&sample.orientation) {
            return None;
        }
        let norm = sample.orientation.norm();
        if !(0.5..=1.5).contains(&norm) {
            return None;
        }
        Some(UnitQuaternion::from_quaternion(sample.orientation))
    }

    /// Rolling mean of dh/dt. The anchor point only moves once the altitude
    /// moved by more than the deadband, so slow climbs are measured over a
    /// longer baseline instead of quantization noise.
    fn update_baro_velocity(&mut self, timestamp_ns: TimestampNs, altitude: f32) -> Option<f32> {
        let Some((last_ns, last_altitude)) = self.last_baro_point else {
            self.last_baro_point = Some((timestamp_ns, altitude));
            return None;
        };

        let delta_altitude = altitude - last_altitude;
        let dt = timestamp_ns.saturating_sub(last_ns) as f32 / NS_PER_S;
        if dt > 0.0 {
            self.last_baro_slope = delta_altitude / dt;
            if delta_altitude.abs() > self.config.altitude_deadband {
                self.last_baro_point = Some((timestamp_ns, altitude));
            }
        }

        let window = self.config.velocity_window.clamp(1, MAX_VELOCITY_WINDOW);
        while self.baro_velocities.len() >= window {
            self.baro_velocities.pop_front();
        }
        self.baro_velocities.push_back(self.last_baro_slope).ok();

        Some(self.baro_velocity())
    }

    fn baro_velocity(&self) -> f32 {
        if self.baro_velocities.is_empty() {
            return 0.0;
        }
        self.baro_velocities.iter().sum::<f32>() / self.baro_velocities.len() as f32
    }

    fn cross_check(&mut self, invalid: &mut InvalidFields) {
        if self.baro_velocities.is_empty() {
            return;
        }

        let baro_velocity = self.baro_velocity();
        if (self.integrated_velocity - baro_velocity).abs() > self.config.divergence_bound {
            self.divergence_count += 1;
        } else {
            self.divergence_count = 0;
        }

        if self.divergence_count >= self.config.divergence_ticks {
            self.divergence_events += 1;
            log_warn!(
                "integrated velocity {} diverged from baro velocity {}, re-syncing",
                self.integrated_velocity,
                baro_velocity
            );
            invalid.insert(SampleField::VerticalVelocity);
            invalid.insert(SampleField::VerticalAcceleration);
            self.integrated_velocity = baro_velocity;
            self.divergence_count = 0;
        }
    }

    pub fn pad_altitude_asl(&self) -> Option<f32> {
        self.pad_zero.mean()
    }

    pub fn is_pad_zero_locked(&self) -> bool {
        self.pad_zero.count() >= self.config.pad_zero_samples
    }

    pub fn max_altitude(&self) -> f32 {
        self.max_altitude
    }

    pub fn max_velocity(&self) -> f32 {
        self.max_velocity
    }

    pub fn divergence_events(&self) -> u32 {
        self.divergence_events
    }

    /// latest raw sample accepted during the last `update`
    pub fn tick_raw(&self) -> Option<&RawSample> {
        self.tick_raw.as_ref()
    }

    /// latest estimated sample accepted during the last `update`
    pub fn tick_estimated(&self) -> Option<&EstimatedSample> {
        self.tick_estimated.as_ref()
    }

    pub fn last_output(&self) -> &ProcessedSample {
        &self.last_output
    }
}

/// Invalid fields carry the value from before this tick, including values a
/// sample wrote before the cross check rejected them.
fn hold_invalid(previous: &ProcessedSample, mut output: ProcessedSample) -> ProcessedSample {
    if output.invalid_fields.contains(SampleField::Altitude) {
        output.current_altitude = previous.current_altitude;
    }
    if output.invalid_fields.contains(SampleField::VerticalVelocity) {
        output.vertical_velocity = previous.vertical_velocity;
    }
    if output.invalid_fields.contains(SampleField::VerticalAcceleration) {
        output.vertical_acceleration = previous.vertical_acceleration;
    }
    output
}

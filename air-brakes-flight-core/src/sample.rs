use nalgebra::{Quaternion, Vector3};

/// Nanoseconds on the sensor's monotonic clock.
pub type TimestampNs = u64;

pub const NS_PER_S: f32 = 1_000_000_000.0;

/// Un-filtered IMU output.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub timestamp_ns: TimestampNs,
    /// specific force in the body frame, m/s^2
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    pub acceleration: Vector3<f32>,
    /// rad/s
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    pub angular_velocity: Vector3<f32>,
    /// GPS time of week in seconds, if the IMU has a GPS correlation lock
    pub gps_time_of_week: Option<f64>,
    pub gps_week: Option<u16>,
    pub gps_correlation_flags: u16,
}

/// Output of the IMU's onboard estimation filter.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatedSample {
    pub timestamp_ns: TimestampNs,
    /// rotation from body frame to world frame (z up)
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    pub orientation: Quaternion<f32>,
    /// rad/s, body frame
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    pub angular_velocity: Vector3<f32>,
    /// bias compensated specific force, body frame, m/s^2. Reads +1g up at rest.
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    pub compensated_acceleration: Vector3<f32>,
    /// m above sea level
    pub pressure_altitude: f32,
    pub filter_status: u16,
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    pub attitude_uncertainty: Quaternion<f32>,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq)]
pub enum SensorSample {
    Raw(RawSample),
    Estimated(EstimatedSample),
}

impl SensorSample {
    pub fn timestamp_ns(&self) -> TimestampNs {
        match self {
            Self::Raw(raw) => raw.timestamp_ns,
            Self::Estimated(estimated) => estimated.timestamp_ns,
        }
    }

    pub fn is_estimated(&self) -> bool {
        matches!(self, Self::Estimated(_))
    }
}

impl From<RawSample> for SensorSample {
    fn from(value: RawSample) -> Self {
        Self::Raw(value)
    }
}

impl From<EstimatedSample> for SensorSample {
    fn from(value: EstimatedSample) -> Self {
        Self::Estimated(value)
    }
}

pub(crate) fn vector_is_finite(v: &Vector3<f32>) -> bool {
    v.iter().all(|x| x.is_finite())
}

pub(crate) fn quaternion_is_finite(q: &Quaternion<f32>) -> bool {
    q.coords.iter().all(|x| x.is_finite())
}

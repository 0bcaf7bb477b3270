use serde::{Deserialize, Serialize};

use crate::{
    controller::AirbrakeCommand,
    predictor::{ApogeePrediction, FitModel},
    processor::{InvalidFields, ProcessedSample},
    sample::{EstimatedSample, RawSample, TimestampNs},
    state_machine::FlightPhase,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// attach fit, uncertainty and queue diagnostics to every row instead of
    /// only the first row of each phase
    pub diagnostics_every_tick: bool,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub depth: u32,
    pub dropped: u64,
}

/// What the loop around the pipeline knows about the tick.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickContext {
    pub samples_fetched: u32,
    pub queue: QueueMetrics,
    pub loop_overruns: u32,
    /// time spent on the previous tick, us
    pub previous_tick_cost_us: u64,
}

/// One flattened log line. Raw and estimated columns are only present on ticks
/// that received such a sample, diagnostics only on the first tick of a phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogRow {
    pub tick: u64,
    pub timestamp_ns: TimestampNs,
    pub phase: char,
    pub extension: f32,
    pub fail_safe: Option<&'static str>,

    pub current_altitude: f32,
    pub vertical_velocity: f32,
    pub vertical_acceleration: f32,
    pub invalid_fields: InvalidFields,

    pub raw_timestamp_ns: Option<TimestampNs>,
    pub raw_acceleration_x: Option<f32>,
    pub raw_acceleration_y: Option<f32>,
    pub raw_acceleration_z: Option<f32>,
    pub raw_angular_velocity_x: Option<f32>,
    pub raw_angular_velocity_y: Option<f32>,
    pub raw_angular_velocity_z: Option<f32>,
    pub gps_time_of_week: Option<f64>,
    pub gps_week: Option<u16>,
    pub gps_correlation_flags: Option<u16>,

    pub estimated_timestamp_ns: Option<TimestampNs>,
    pub orientation_w: Option<f32>,
    pub orientation_x: Option<f32>,
    pub orientation_y: Option<f32>,
    pub orientation_z: Option<f32>,
    pub estimated_angular_velocity_x: Option<f32>,
    pub estimated_angular_velocity_y: Option<f32>,
    pub estimated_angular_velocity_z: Option<f32>,
    pub compensated_acceleration_x: Option<f32>,
    pub compensated_acceleration_y: Option<f32>,
    pub compensated_acceleration_z: Option<f32>,
    pub pressure_altitude: Option<f32>,
    pub filter_status: Option<u16>,

    pub predicted_apogee: Option<f32>,
    pub fit_valid: Option<bool>,

    pub samples_fetched: u32,
    pub actuator_fault: bool,
    pub loop_overruns: u32,
    pub previous_tick_cost_us: u64,

    pub fit_model: Option<&'static str>,
    pub uncertainty_threshold_1: Option<f32>,
    pub uncertainty_threshold_2: Option<f32>,
    pub fit_coefficient_0: Option<f32>,
    pub fit_coefficient_1: Option<f32>,
    pub fit_coefficient_2: Option<f32>,
    pub fit_samples_used: Option<u16>,
    pub queue_depth: Option<u32>,
    pub queue_dropped: Option<u64>,
}

/// Read-only view of the latest tick for debug consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugSnapshot {
    pub tick: u64,
    pub phase: FlightPhase,
    pub command: AirbrakeCommand,
    pub processed: ProcessedSample,
    pub prediction: Option<ApogeePrediction>,
    pub queue: QueueMetrics,
    pub loop_overruns: u32,
    pub actuator_fault: bool,
    pub max_altitude: f32,
    pub max_velocity: f32,
}

/// Everything produced during one tick, borrowed for row assembly.
pub struct TickFrame<'a> {
    pub tick: u64,
    pub phase: FlightPhase,
    pub phase_changed: bool,
    pub command: &'a AirbrakeCommand,
    pub processed: &'a ProcessedSample,
    pub raw: Option<&'a RawSample>,
    pub estimated: Option<&'a EstimatedSample>,
    pub prediction: Option<&'a ApogeePrediction>,
    pub context: &'a TickContext,
    pub actuator_fault: bool,
    pub max_altitude: f32,
    pub max_velocity: f32,
}

pub struct TelemetryRecorder {
    config: TelemetryConfig,
    rows: u64,
}

impl TelemetryRecorder {
    pub fn new(config: TelemetryConfig) -> Self {
        Self { config, rows: 0 }
    }

    pub fn row(&mut self, frame: &TickFrame<'_>) -> LogRow {
        self.rows += 1;

        let mut row = LogRow {
            tick: frame.tick,
            timestamp_ns: frame.processed.timestamp_ns,
            phase: frame.phase.code(),
            extension: frame.command.extension,
            fail_safe: frame.command.fail_safe.map(|reason| reason.as_str()),
            current_altitude: frame.processed.current_altitude,
            vertical_velocity: frame.processed.vertical_velocity,
            vertical_acceleration: frame.processed.vertical_acceleration,
            invalid_fields: frame.processed.invalid_fields,
            predicted_apogee: frame.prediction.map(|p| p.predicted_apogee),
            fit_valid: frame.prediction.map(|p| p.fit_valid),
            samples_fetched: frame.context.samples_fetched,
            actuator_fault: frame.actuator_fault,
            loop_overruns: frame.context.loop_overruns,
            previous_tick_cost_us: frame.context.previous_tick_cost_us,
            ..Default::default()
        };

        if let Some(raw) = frame.raw {
            row.raw_timestamp_ns = Some(raw.timestamp_ns);
            row.raw_acceleration_x = Some(raw.acceleration.x);
            row.raw_acceleration_y = Some(raw.acceleration.y);
            row.raw_acceleration_z = Some(raw.acceleration.z);
            row.raw_angular_velocity_x = Some(raw.angular_velocity.x);
            row.raw_angular_velocity_y = Some(raw.angular_velocity.y);
            row.raw_angular_velocity_z = Some(raw.angular_velocity.z);
            row.gps_time_of_week = raw.gps_time_of_week;
            row.gps_week = raw.gps_week;
            row.gps_correlation_flags = Some(raw.gps_correlation_flags);
        }

        if let Some(estimated) = frame.estimated {
            row.estimated_timestamp_ns = Some(estimated.timestamp_ns);
            row.orientation_w = Some(estimated.orientation.w);
            row.orientation_x = Some(estimated.orientation.i);
            row.orientation_y = Some(estimated.orientation.j);
            row.orientation_z = Some(estimated.orientation.k);
            row.estimated_angular_velocity_x = Some(estimated.angular_velocity.x);
            row.estimated_angular_velocity_y = Some(estimated.angular_velocity.y);
            row.estimated_angular_velocity_z = Some(estimated.angular_velocity.z);
            row.compensated_acceleration_x = Some(estimated.compensated_acceleration.x);
            row.compensated_acceleration_y = Some(estimated.compensated_acceleration.y);
            row.compensated_acceleration_z = Some(estimated.compensated_acceleration.z);
            row.pressure_altitude = Some(estimated.pressure_altitude);
            row.filter_status = Some(estimated.filter_status);
        }

        if frame.phase_changed || self.config.diagnostics_every_tick {
            if let Some(prediction) = frame.prediction {
                row.fit_model = Some(match prediction.model {
                    FitModel::Drag => "drag",
                    FitModel::Quadratic => "quadratic",
                });
                row.uncertainty_threshold_1 = Some(prediction.uncertainty_threshold_1);
                row.uncertainty_threshold_2 = Some(prediction.uncertainty_threshold_2);
                row.fit_coefficient_0 = Some(prediction.coefficients[0]);
                row.fit_coefficient_1 = Some(prediction.coefficients[1]);
                row.fit_coefficient_2 = Some(prediction.coefficients[2]);
                row.fit_samples_used = Some(prediction.samples_used);
            }
            row.queue_depth = Some(frame.context.queue.depth);
            row.queue_dropped = Some(frame.context.queue.dropped);
        }

        row
    }

    pub fn snapshot(&self, frame: &TickFrame<'_>) -> DebugSnapshot {
        DebugSnapshot {
            tick: frame.tick,
            phase: frame.phase,
            command: *frame.command,
            processed: frame.processed.clone(),
            prediction: frame.prediction.cloned(),
            queue: frame.context.queue,
            loop_overruns: frame.context.loop_overruns,
            actuator_fault: frame.actuator_fault,
            max_altitude: frame.max_altitude,
            max_velocity: frame.max_velocity,
        }
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }
}

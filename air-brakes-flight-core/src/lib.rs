// only use std when feature = "std" is enabled or during testing
#![cfg_attr(not(any(test, feature = "std")), no_std)]

mod fmt;

pub mod controller;
pub mod pipeline;
pub mod predictor;
pub mod processor;
pub mod sample;
pub mod state_machine;
pub mod telemetry;
mod utils;

pub use controller::{
    AirbrakeCommand, AirbrakeController, ControlLaw, ControllerConfig, FailSafeReason, Stage,
};
pub use pipeline::{AirbrakeActuator, FlightPipeline, PipelineConfig, TickOutput};
pub use predictor::{
    ApogeePrediction, ApogeePredictor, FitModel, MAX_PREDICTOR_WINDOW, PredictorConfig,
};
pub use processor::{DataProcessor, InvalidFields, ProcessedSample, ProcessorConfig, SampleField};
pub use sample::{EstimatedSample, RawSample, SensorSample, TimestampNs};
pub use state_machine::{ActuationMode, FlightPhase, FlightStateMachine, StateMachineConfig};
pub use telemetry::{DebugSnapshot, LogRow, QueueMetrics, TelemetryConfig, TickContext};
pub use utils::{approximate_air_density, lerp};

#[cfg(test)]
mod tests;

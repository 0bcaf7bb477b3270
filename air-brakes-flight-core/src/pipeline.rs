use serde::{Deserialize, Serialize};

use crate::{
    controller::{AirbrakeCommand, AirbrakeController, ControllerConfig},
    predictor::{ApogeePredictor, PredictorConfig},
    processor::{DataProcessor, ProcessorConfig},
    sample::SensorSample,
    state_machine::{FlightPhase, FlightStateMachine, StateMachineConfig},
    telemetry::{DebugSnapshot, LogRow, TelemetryConfig, TelemetryRecorder, TickContext, TickFrame},
};

/// Servo or any other device that can position the airbrakes.
pub trait AirbrakeActuator {
    type Error;

    /// `extension` is normalized, 0 retracted and 1 fully deployed.
    fn set_extension(&mut self, extension: f32) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub processor: ProcessorConfig,
    pub state_machine: StateMachineConfig,
    pub predictor: PredictorConfig,
    pub controller: ControllerConfig,
    pub telemetry: TelemetryConfig,
}

pub struct TickOutput {
    pub command: AirbrakeCommand,
    pub row: LogRow,
    pub snapshot: DebugSnapshot,
}

/// Runs one control tick: process, classify, predict, command, record.
pub struct FlightPipeline {
    processor: DataProcessor,
    state_machine: FlightStateMachine,
    predictor: ApogeePredictor,
    controller: AirbrakeController,
    telemetry: TelemetryRecorder,
    tick: u64,
}

impl FlightPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            processor: DataProcessor::new(config.processor),
            state_machine: FlightStateMachine::new(config.state_machine),
            predictor: ApogeePredictor::new(config.predictor),
            controller: AirbrakeController::new(config.controller),
            telemetry: TelemetryRecorder::new(config.telemetry),
            tick: 0,
        }
    }

    pub fn tick<A: AirbrakeActuator>(
        &mut self,
        actuator: &mut A,
        samples: &[SensorSample],
        context: &TickContext,
    ) -> TickOutput {
        self.tick += 1;

        let processed = self.processor.update(samples);
        // the phase decision sees the prediction of the previous tick
        let phase = self
            .state_machine
            .update(&processed, self.predictor.prediction());
        let prediction = self.predictor.update(phase, &processed).cloned();

        let command = self.controller.update(phase, prediction.as_ref());
        let written = actuator.set_extension(command.extension).is_ok();
        self.controller.report_actuator_result(&command, written);

        let frame = TickFrame {
            tick: self.tick,
            phase,
            phase_changed: self.state_machine.phase_changed(),
            command: &command,
            processed: &processed,
            raw: self.processor.tick_raw(),
            estimated: self.processor.tick_estimated(),
            prediction: prediction.as_ref(),
            context,
            actuator_fault: self.controller.actuator_fault(),
            max_altitude: self.processor.max_altitude(),
            max_velocity: self.processor.max_velocity(),
        };
        let row = self.telemetry.row(&frame);
        let snapshot = self.telemetry.snapshot(&frame);

        TickOutput {
            command,
            row,
            snapshot,
        }
    }

    /// Drive the airbrakes to the retracted position outside of a tick.
    pub fn retract<A: AirbrakeActuator>(&mut self, actuator: &mut A) -> Result<(), A::Error> {
        let command = AirbrakeCommand {
            extension: self.controller.retracted_extension(),
            mode: self.phase().actuation_mode(),
            fail_safe: None,
        };
        let result = actuator.set_extension(command.extension);
        self.controller
            .report_actuator_result(&command, result.is_ok());
        result
    }

    pub fn phase(&self) -> FlightPhase {
        self.state_machine.phase()
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    pub fn processor(&self) -> &DataProcessor {
        &self.processor
    }

    pub fn state_machine(&self) -> &FlightStateMachine {
        &self.state_machine
    }

    pub fn predictor(&self) -> &ApogeePredictor {
        &self.predictor
    }

    pub fn controller(&self) -> &AirbrakeController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut AirbrakeController {
        &mut self.controller
    }
}

#[cfg(test)]
mod tests;

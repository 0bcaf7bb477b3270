use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::{
    predictor::ApogeePrediction,
    state_machine::{ActuationMode, FlightPhase},
};

pub const MAX_STAGES: usize = 8;

/// One step of the staged bang-bang law.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// m of predicted overshoot above which this stage applies
    pub error_threshold: f32,
    pub extension: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlLaw {
    /// extension = gain * (predicted - target)
    Proportional { gain: f32 },
    /// stages are checked in order, the first one whose threshold the error
    /// exceeds wins
    StagedBangBang { stages: Vec<Stage, MAX_STAGES> },
}

impl ControlLaw {
    fn extension_for(&self, error: f32) -> Option<f32> {
        match self {
            Self::Proportional { gain } => Some(gain * error),
            Self::StagedBangBang { stages } => stages
                .iter()
                .find(|stage| error > stage.error_threshold)
                .map(|stage| stage.extension),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// m above the pad
    pub target_apogee: f32,
    pub min_extension: f32,
    pub max_extension: f32,
    pub retracted_extension: f32,
    /// commands between retracted and this value are snapped to retracted so
    /// the servo does not chatter around zero
    pub no_buzz_extension: f32,
    pub law: ControlLaw,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            target_apogee: 300.0,
            min_extension: 0.0,
            max_extension: 1.0,
            retracted_extension: 0.0,
            no_buzz_extension: 0.05,
            law: ControlLaw::Proportional { gain: 0.02 },
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailSafeReason {
    NoPrediction,
    DegeneratePrediction,
    ActuatorFault,
}

impl FailSafeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoPrediction => "no_prediction",
            Self::DegeneratePrediction => "degenerate_prediction",
            Self::ActuatorFault => "actuator_fault",
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AirbrakeCommand {
    /// normalized, within [min_extension, max_extension]
    pub extension: f32,
    pub mode: ActuationMode,
    pub fail_safe: Option<FailSafeReason>,
}

/// Turns the apogee prediction into an airbrake extension.
///
/// Fails closed: anything short of a valid prediction in Coast retracts.
pub struct AirbrakeController {
    config: ControllerConfig,
    actuator_fault: bool,
    actuator_failures: u32,
}

impl AirbrakeController {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            actuator_fault: false,
            actuator_failures: 0,
        }
    }

    pub fn update(
        &mut self,
        phase: FlightPhase,
        prediction: Option<&ApogeePrediction>,
    ) -> AirbrakeCommand {
        let mode = phase.actuation_mode();

        if self.actuator_fault {
            return self.retract(mode, Some(FailSafeReason::ActuatorFault));
        }
        if mode != ActuationMode::ActiveControl {
            return self.retract(mode, None);
        }

        let Some(prediction) = prediction else {
            return self.retract(mode, Some(FailSafeReason::NoPrediction));
        };
        if !prediction.fit_valid || !prediction.predicted_apogee.is_finite() {
            return self.retract(mode, Some(FailSafeReason::DegeneratePrediction));
        }

        let error = prediction.predicted_apogee - self.config.target_apogee;
        let extension = match self.config.law.extension_for(error) {
            Some(extension) => self.shape(extension),
            None => self.retracted_extension(),
        };

        AirbrakeCommand {
            extension,
            mode,
            fail_safe: None,
        }
    }

    /// Tell the controller whether the last command reached the actuator.
    ///
    /// A failure forces every following command to retracted until a retract
    /// is written successfully.
    pub fn report_actuator_result(&mut self, command: &AirbrakeCommand, succeeded: bool) {
        if !succeeded {
            self.actuator_failures += 1;
            if !self.actuator_fault {
                log_warn!(
                    "actuator write of {} failed, retracting ({} failures so far)",
                    command.extension,
                    self.actuator_failures
                );
            }
            self.actuator_fault = true;
        } else if self.actuator_fault && command.extension == self.retracted_extension() {
            log_info!("actuator recovered after retract");
            self.actuator_fault = false;
        }
    }

    pub fn set_target_apogee(&mut self, target_apogee: f32) {
        self.config.target_apogee = target_apogee;
    }

    pub fn target_apogee(&self) -> f32 {
        self.config.target_apogee
    }

    pub fn actuator_fault(&self) -> bool {
        self.actuator_fault
    }

    pub fn actuator_failures(&self) -> u32 {
        self.actuator_failures
    }

    pub fn retracted_extension(&self) -> f32 {
        self.clamp(self.config.retracted_extension)
    }

    fn retract(&self, mode: ActuationMode, fail_safe: Option<FailSafeReason>) -> AirbrakeCommand {
        AirbrakeCommand {
            extension: self.retracted_extension(),
            mode,
            fail_safe,
        }
    }

    fn shape(&self, extension: f32) -> f32 {
        let retracted = self.retracted_extension();
        if !extension.is_finite() {
            return retracted;
        }
        if extension > retracted && extension < self.config.no_buzz_extension {
            return retracted;
        }
        self.clamp(extension)
    }

    // f32::clamp panics on a misordered range
    fn clamp(&self, extension: f32) -> f32 {
        let clamped = extension
            .max(self.config.min_extension)
            .min(self.config.max_extension);
        if clamped.is_finite() { clamped } else { 0.0 }
    }
}

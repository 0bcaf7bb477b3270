use serde::{Deserialize, Serialize};

use crate::{predictor::ApogeePrediction, processor::ProcessedSample};

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum FlightPhase {
    Standby = 0,
    MotorBurn = 1,
    Coast = 2,
    Freefall = 3,
    Landed = 4,
}

impl FlightPhase {
    pub const COUNT: usize = 5;

    /// single letter used in the flight log
    pub fn code(self) -> char {
        match self {
            Self::Standby => 'S',
            Self::MotorBurn => 'M',
            Self::Coast => 'C',
            Self::Freefall => 'F',
            Self::Landed => 'L',
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Standby => Some(Self::MotorBurn),
            Self::MotorBurn => Some(Self::Coast),
            Self::Coast => Some(Self::Freefall),
            Self::Freefall => Some(Self::Landed),
            Self::Landed => None,
        }
    }

    pub fn actuation_mode(self) -> ActuationMode {
        match self {
            Self::Standby | Self::MotorBurn | Self::Landed => ActuationMode::LockedRetracted,
            Self::Coast => ActuationMode::ActiveControl,
            Self::Freefall => ActuationMode::ForcedRetract,
        }
    }
}

/// What the airbrakes are allowed to do in a phase.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActuationMode {
    LockedRetracted,
    ActiveControl,
    ForcedRetract,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMachineConfig {
    /// m/s^2, gravity removed
    pub launch_acceleration: f32,
    pub launch_debounce_ticks: u32,
    /// m/s^2, gravity removed. Below this the motor is considered burnt out.
    pub burnout_acceleration: f32,
    pub burnout_debounce_ticks: u32,
    pub apogee_debounce_ticks: u32,
    /// a prediction counts as confident once its 1 sigma band is below this (m)
    pub apogee_confidence_band: f32,
    pub landing_velocity: f32,
    /// m from the pad reference
    pub landing_altitude: f32,
    pub landing_debounce_ticks: u32,
    /// give up waiting for touchdown after this many freefall ticks, 0 disables
    pub max_freefall_ticks: u32,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            launch_acceleration: 3.0 * 9.80665,
            launch_debounce_ticks: 10,
            burnout_acceleration: 0.0,
            burnout_debounce_ticks: 10,
            apogee_debounce_ticks: 1,
            apogee_confidence_band: 2.0,
            landing_velocity: 1.0,
            landing_altitude: 20.0,
            landing_debounce_ticks: 200,
            max_freefall_ticks: 30_000,
        }
    }
}

/// Result of evaluating one debounced condition.
enum Condition {
    Holds,
    Fails,
    /// required input is invalid this tick, counter is left alone
    Unknown,
}

impl From<Option<bool>> for Condition {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => Self::Holds,
            Some(false) => Self::Fails,
            None => Self::Unknown,
        }
    }
}

/// Classifies the flight phase once per tick.
///
/// Transitions only ever move one step forward along
/// Standby -> MotorBurn -> Coast -> Freefall -> Landed.
pub struct FlightStateMachine {
    config: StateMachineConfig,
    phase: FlightPhase,
    tick: u64,
    debounce: u32,
    ticks_in_phase: u32,
    was_ascending: bool,
    phase_changed: bool,
    entry_ticks: [Option<u64>; FlightPhase::COUNT],
}

impl FlightStateMachine {
    pub fn new(config: StateMachineConfig) -> Self {
        let mut entry_ticks = [None; FlightPhase::COUNT];
        entry_ticks[FlightPhase::Standby as usize] = Some(0);
        Self {
            config,
            phase: FlightPhase::Standby,
            tick: 0,
            debounce: 0,
            ticks_in_phase: 0,
            was_ascending: false,
            // the first tick is the first tick of Standby
            phase_changed: true,
            entry_ticks,
        }
    }

    pub fn update(
        &mut self,
        sample: &ProcessedSample,
        prediction: Option<&ApogeePrediction>,
    ) -> FlightPhase {
        if self.tick > 0 {
            self.phase_changed = false;
        }
        self.tick += 1;
        self.ticks_in_phase = self.ticks_in_phase.saturating_add(1);

        let transition = match self.phase {
            FlightPhase::Standby => {
                let launching = sample
                    .acceleration()
                    .map(|a| a > self.config.launch_acceleration);
                self.debounced(launching.into(), self.config.launch_debounce_ticks)
            }
            FlightPhase::MotorBurn => {
                let burnt_out = sample
                    .acceleration()
                    .map(|a| a < self.config.burnout_acceleration);
                self.debounced(burnt_out.into(), self.config.burnout_debounce_ticks)
            }
            FlightPhase::Coast => {
                self.apogee_confidently_reached(sample, prediction) || self.velocity_crossed(sample)
            }
            FlightPhase::Freefall => {
                let near_ground = match (sample.velocity(), sample.altitude()) {
                    (Some(v), Some(h)) => Some(
                        v.abs() < self.config.landing_velocity
                            && h.abs() < self.config.landing_altitude,
                    ),
                    _ => None,
                };
                let landed = self.debounced(near_ground.into(), self.config.landing_debounce_ticks);
                let timed_out = self.config.max_freefall_ticks > 0
                    && self.ticks_in_phase >= self.config.max_freefall_ticks;
                if timed_out && !landed {
                    log_warn!(
                        "no touchdown after {} freefall ticks, assuming landed",
                        self.ticks_in_phase
                    );
                }
                landed || timed_out
            }
            FlightPhase::Landed => false,
        };

        if transition && let Some(next) = self.phase.next() {
            self.enter(next, sample);
        }

        self.phase
    }

    fn debounced(&mut self, condition: Condition, ticks: u32) -> bool {
        match condition {
            Condition::Holds => self.debounce += 1,
            Condition::Fails => self.debounce = 0,
            Condition::Unknown => {}
        }
        self.debounce >= ticks.max(1)
    }

    /// velocity went from positive to negative, held for the apogee debounce
    fn velocity_crossed(&mut self, sample: &ProcessedSample) -> bool {
        let Some(velocity) = sample.velocity() else {
            return false;
        };

        if velocity > 0.0 {
            self.was_ascending = true;
            self.debounce = 0;
            return false;
        }

        let descending = self.was_ascending && velocity < 0.0;
        self.debounced(Some(descending).into(), self.config.apogee_debounce_ticks)
    }

    fn apogee_confidently_reached(
        &self,
        sample: &ProcessedSample,
        prediction: Option<&ApogeePrediction>,
    ) -> bool {
        match (prediction, sample.altitude()) {
            (Some(prediction), Some(altitude)) => {
                prediction.fit_valid
                    && prediction.uncertainty_threshold_1 <= self.config.apogee_confidence_band
                    && altitude >= prediction.predicted_apogee
            }
            _ => false,
        }
    }

    fn enter(&mut self, next: FlightPhase, sample: &ProcessedSample) {
        log_info!(
            "[tick {}] {:?} -> {:?} at altitude {} m, velocity {} m/s, acceleration {} m/s^2",
            self.tick,
            self.phase,
            next,
            sample.current_altitude,
            sample.vertical_velocity,
            sample.vertical_acceleration
        );
        self.phase = next;
        self.phase_changed = true;
        self.debounce = 0;
        self.ticks_in_phase = 0;
        self.was_ascending = false;
        self.entry_ticks[next as usize] = Some(self.tick);
    }

    pub fn phase(&self) -> FlightPhase {
        self.phase
    }

    /// true on the first tick of a phase, including the very first tick
    pub fn phase_changed(&self) -> bool {
        self.phase_changed
    }

    /// tick number (1-based) on which `phase` was entered
    pub fn entry_tick(&self, phase: FlightPhase) -> Option<u64> {
        self.entry_ticks[phase as usize]
    }

    pub fn ticks_in_phase(&self) -> u32 {
        self.ticks_in_phase
    }
}

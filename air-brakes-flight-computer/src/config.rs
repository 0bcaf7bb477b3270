use std::{fs, path::Path, time::Duration};

use air_brakes_flight_core::{
    ControlLaw, ControllerConfig, MAX_PREDICTOR_WINDOW, PipelineConfig, PredictorConfig,
    ProcessorConfig, StateMachineConfig, TelemetryConfig,
};
use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    actuator::ServoCalibration, queue::QueueConfig, recorder::RecorderConfig,
    source::SimulationConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub frequency_hz: f32,
    /// how long a tick may wait for samples once the queue is empty
    pub drain_budget_ms: u64,
    /// keep logging this long after touchdown before shutting down
    pub linger_after_landing_s: f32,
    pub max_duration_s: Option<f32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 100.0,
            drain_budget_ms: 2,
            linger_after_landing_s: 1.0,
            max_duration_s: None,
        }
    }
}

impl LoopConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frequency_hz as f64)
    }

    pub fn drain_budget(&self) -> Duration {
        Duration::from_millis(self.drain_budget_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    #[serde(rename = "loop")]
    pub control_loop: LoopConfig,
    pub queue: QueueConfig,
    pub processor: ProcessorConfig,
    pub state_machine: StateMachineConfig,
    pub predictor: PredictorConfig,
    pub controller: ControllerConfig,
    pub servo: ServoCalibration,
    pub recorder: RecorderConfig,
    pub simulation: SimulationConfig,
}

impl FlightConfig {
    /// Defaults when no path is given. Any section or key may be left out.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_toml(&text).with_context(|| format!("in config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        let control_loop = &self.control_loop;
        ensure!(
            control_loop.frequency_hz.is_finite() && control_loop.frequency_hz > 0.0,
            "loop.frequency_hz must be positive, got {}",
            control_loop.frequency_hz
        );
        if let Some(max_duration_s) = control_loop.max_duration_s {
            ensure!(max_duration_s > 0.0, "loop.max_duration_s must be positive");
        }
        ensure!(self.queue.capacity > 0, "queue.capacity must be at least 1");
        ensure!(
            self.recorder.channel_capacity > 0,
            "recorder.channel_capacity must be at least 1"
        );

        let processor = &self.processor;
        ensure!(
            processor.min_pressure_altitude < processor.max_pressure_altitude,
            "processor pressure altitude bounds are inverted"
        );
        ensure!(
            (1..=64).contains(&processor.velocity_window),
            "processor.velocity_window must be between 1 and 64"
        );

        let predictor = &self.predictor;
        ensure!(
            predictor.window <= MAX_PREDICTOR_WINDOW,
            "predictor.window must be at most {}",
            MAX_PREDICTOR_WINDOW
        );
        ensure!(
            predictor.min_samples <= predictor.window,
            "predictor.min_samples ({}) exceeds predictor.window ({})",
            predictor.min_samples,
            predictor.window
        );

        self.validate_controller()?;

        let simulation = &self.simulation;
        ensure!(
            !simulation.drag_coefficients.is_empty(),
            "simulation.drag_coefficients is empty"
        );
        ensure!(simulation.mass > 0.0, "simulation.mass must be positive");
        ensure!(
            simulation.time_scale > 0.0,
            "simulation.time_scale must be positive"
        );
        ensure!(
            simulation.estimated_rate_hz > 0
                && simulation.raw_rate_hz % simulation.estimated_rate_hz == 0,
            "simulation.estimated_rate_hz must divide simulation.raw_rate_hz"
        );
        Ok(())
    }

    fn validate_controller(&self) -> Result<()> {
        let controller = &self.controller;
        ensure!(
            controller.target_apogee.is_finite(),
            "controller.target_apogee must be finite"
        );
        ensure!(
            0.0 <= controller.min_extension
                && controller.min_extension <= controller.max_extension
                && controller.max_extension <= 1.0,
            "controller extension bounds must satisfy 0 <= min <= max <= 1"
        );
        ensure!(
            (controller.min_extension..=controller.max_extension)
                .contains(&controller.retracted_extension),
            "controller.retracted_extension is outside the extension bounds"
        );
        ensure!(
            controller.no_buzz_extension.is_finite()
                && controller.no_buzz_extension <= controller.max_extension,
            "controller.no_buzz_extension ({}) exceeds controller.max_extension ({})",
            controller.no_buzz_extension,
            controller.max_extension
        );

        match &controller.law {
            ControlLaw::Proportional { gain } => {
                ensure!(
                    gain.is_finite() && *gain >= 0.0,
                    "controller gain must be non-negative"
                );
            }
            ControlLaw::StagedBangBang { stages } => {
                if stages.is_empty() {
                    bail!("staged controller needs at least one stage");
                }
                // first match wins, so thresholds must be listed from high to low
                if stages
                    .windows(2)
                    .any(|pair| pair[0].error_threshold < pair[1].error_threshold)
                {
                    bail!("controller stages must be ordered by descending error_threshold");
                }
            }
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            processor: self.processor.clone(),
            state_machine: self.state_machine.clone(),
            predictor: self.predictor.clone(),
            controller: self.controller.clone(),
            telemetry: TelemetryConfig {
                diagnostics_every_tick: self.recorder.diagnostics_every_tick,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = FlightConfig::load(None).unwrap();
        assert_relative_eq!(config.control_loop.frequency_hz, 100.0);
        assert_eq!(config.control_loop.period(), Duration::from_millis(10));
        assert_eq!(config.queue.capacity, 1024);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = FlightConfig::from_toml(
            r#"
            [loop]
            frequency_hz = 50.0
            max_duration_s = 120.0

            [controller]
            target_apogee = 450.0

            [controller.law.proportional]
            gain = 0.05

            [recorder]
            diagnostics_every_tick = true
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_relative_eq!(config.control_loop.frequency_hz, 50.0);
        assert_eq!(config.control_loop.max_duration_s, Some(120.0));
        assert_eq!(config.control_loop.drain_budget_ms, 2);
        assert_relative_eq!(config.controller.target_apogee, 450.0);
        assert_eq!(config.controller.law, ControlLaw::Proportional { gain: 0.05 });
        assert_eq!(config.predictor.window, 100);

        let pipeline = config.pipeline_config();
        assert!(pipeline.telemetry.diagnostics_every_tick);
        assert_relative_eq!(pipeline.controller.target_apogee, 450.0);
    }

    #[test]
    fn staged_law_from_toml() {
        let config = FlightConfig::from_toml(
            r#"
            [controller.law.staged_bang_bang]
            stages = [
                { error_threshold = 30.0, extension = 1.0 },
                { error_threshold = 5.0, extension = 0.5 },
            ]
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        let ControlLaw::StagedBangBang { stages } = &config.controller.law else {
            panic!("expected the staged law");
        };
        assert_eq!(stages.len(), 2);
        assert_relative_eq!(stages[1].extension, 0.5);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            "[loop]\nfrequency_hz = 0.0",
            "[queue]\ncapacity = 0",
            "[controller]\nmin_extension = 0.8\nmax_extension = 0.2",
            "[controller]\nretracted_extension = 0.5\nmin_extension = 0.0\nmax_extension = 0.4",
            "[controller]\nmax_extension = 0.6\nno_buzz_extension = 0.8",
            "[recorder]\nchannel_capacity = 0",
            "[predictor]\nwindow = 5\nmin_samples = 10",
            "[predictor]\nwindow = 1000",
            "[controller.law.staged_bang_bang]\nstages = [{ error_threshold = 5.0, extension = 0.5 }, { error_threshold = 30.0, extension = 1.0 }]",
            "[simulation]\nraw_rate_hz = 200\nestimated_rate_hz = 30",
        ];
        for case in cases {
            let config = FlightConfig::from_toml(case).unwrap();
            assert!(config.validate().is_err(), "accepted:\n{}", case);
        }
    }

    #[test]
    fn unreadable_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let error = FlightConfig::load(Some(&missing)).unwrap_err();
        assert!(format!("{:#}", error).contains("missing.toml"));

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "[loop\nfrequency_hz = ").unwrap();
        assert!(FlightConfig::load(Some(&broken)).is_err());
    }
}

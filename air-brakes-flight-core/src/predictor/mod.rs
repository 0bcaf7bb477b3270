use heapless::Deque;
use serde::{Deserialize, Serialize};

use crate::{
    processor::ProcessedSample,
    sample::{NS_PER_S, TimestampNs},
    state_machine::FlightPhase,
};

mod regression;

pub use regression::{Degenerate, drag_coast_apogee};
use regression::{Fit, fit_drag, fit_quadratic};

pub const MAX_PREDICTOR_WINDOW: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// number of most recent coast samples fitted, at most 256
    pub window: usize,
    /// fewer points than this and no fit is attempted
    pub min_samples: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            window: 100,
            min_samples: 10,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitModel {
    /// deceleration = c0 + k v|v|, coefficients [c0, k, 0]
    Drag,
    /// altitude = c0 + c1 t + c2 t^2, coefficients [c0, c1, c2]
    Quadratic,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApogeePrediction {
    /// m above the pad
    pub predicted_apogee: f32,
    /// 1 sigma band, m
    pub uncertainty_threshold_1: f32,
    /// 2 sigma band, m
    pub uncertainty_threshold_2: f32,
    /// false when the latest fit was degenerate and this value is held
    pub fit_valid: bool,
    pub model: FitModel,
    pub coefficients: [f32; 3],
    pub samples_used: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WindowPoint {
    /// s since coast entry
    pub t: f32,
    pub altitude: f32,
    pub velocity: f32,
    pub acceleration: Option<f32>,
}

/// Extrapolates apogee from the processed samples of the current coast.
pub struct ApogeePredictor {
    config: PredictorConfig,
    window: Deque<WindowPoint, MAX_PREDICTOR_WINDOW>,
    coast_start_ns: Option<TimestampNs>,
    in_coast: bool,
    prediction: Option<ApogeePrediction>,
    degenerate_count: u32,
    last_degenerate: Option<Degenerate>,
}

impl ApogeePredictor {
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            config,
            window: Deque::new(),
            coast_start_ns: None,
            in_coast: false,
            prediction: None,
            degenerate_count: 0,
            last_degenerate: None,
        }
    }

    /// Feed one processed sample. Outside of Coast the last prediction is
    /// returned unchanged.
    pub fn update(
        &mut self,
        phase: FlightPhase,
        sample: &ProcessedSample,
    ) -> Option<&ApogeePrediction> {
        if phase != FlightPhase::Coast {
            self.in_coast = false;
            return self.prediction.as_ref();
        }

        if !self.in_coast {
            self.in_coast = true;
            self.window.clear();
            self.coast_start_ns = Some(sample.timestamp_ns);
            log_debug!("coast started, apogee window cleared");
        }

        self.push(sample);

        if self.window.len() < self.config.min_samples.max(4) {
            return self.prediction.as_ref();
        }

        match self.fit() {
            Ok(fit) => {
                self.last_degenerate = None;
                self.prediction = Some(self.to_prediction(fit));
            }
            Err(reason) => {
                self.degenerate_count += 1;
                self.last_degenerate = Some(reason);
                log_warn_every!(
                    self.degenerate_count - 1,
                    100,
                    "degenerate apogee fit: {:?} ({} so far)",
                    reason,
                    self.degenerate_count
                );
                if let Some(prediction) = self.prediction.as_mut() {
                    prediction.fit_valid = false;
                }
            }
        }

        self.prediction.as_ref()
    }

    fn push(&mut self, sample: &ProcessedSample) {
        let (Some(altitude), Some(velocity)) = (sample.altitude(), sample.velocity()) else {
            return;
        };
        if !altitude.is_finite() || !velocity.is_finite() {
            return;
        }

        let start = self.coast_start_ns.unwrap_or(sample.timestamp_ns);
        let t = sample.timestamp_ns.saturating_sub(start) as f32 / NS_PER_S;
        // a repeated timestamp is the same measurement held over
        if let Some(last) = self.window.back()
            && last.t >= t
        {
            return;
        }

        let capacity = self.config.window.clamp(4, MAX_PREDICTOR_WINDOW);
        while self.window.len() >= capacity {
            self.window.pop_front();
        }
        let point = WindowPoint {
            t,
            altitude,
            velocity,
            acceleration: sample.acceleration().filter(|a| a.is_finite()),
        };
        // capacity was made above
        let _ = self.window.push_back(point);
    }

    fn fit(&self) -> Result<Fit, Degenerate> {
        let newest = self.window.back().ok_or(Degenerate::NotEnoughSamples)?;

        let with_acceleration = self
            .window
            .iter()
            .filter(|p| p.acceleration.is_some())
            .count();

        if with_acceleration >= self.config.min_samples
            && let Ok(fit) = fit_drag(self.window.iter(), newest)
        {
            return Ok(fit);
        }
        fit_quadratic(self.window.iter(), newest)
    }

    fn to_prediction(&self, fit: Fit) -> ApogeePrediction {
        let newest_altitude = self.window.back().map(|p| p.altitude).unwrap_or_default();
        let samples_used = match fit.model {
            FitModel::Drag => self
                .window
                .iter()
                .filter(|p| p.acceleration.is_some())
                .count(),
            FitModel::Quadratic => self.window.len(),
        };
        let sigma = fit.sigma as f32;
        ApogeePrediction {
            predicted_apogee: newest_altitude + fit.apogee_offset as f32,
            uncertainty_threshold_1: sigma,
            uncertainty_threshold_2: 2.0 * sigma,
            fit_valid: true,
            model: fit.model,
            coefficients: fit.coefficients.map(|c| c as f32),
            samples_used: samples_used as u16,
        }
    }

    pub fn prediction(&self) -> Option<&ApogeePrediction> {
        self.prediction.as_ref()
    }

    pub fn samples_in_window(&self) -> usize {
        self.window.len()
    }

    pub fn degenerate_count(&self) -> u32 {
        self.degenerate_count
    }

    pub fn last_degenerate(&self) -> Option<Degenerate> {
        self.last_degenerate
    }
}

#[cfg(test)]
mod tests;

use approx::assert_relative_eq;

use super::*;
use crate::{
    processor::{InvalidFields, SampleField},
    tests::init_logger,
};

const G: f64 = 9.80665;
/// 1/m, drag acceleration = K v^2
const K: f64 = 0.002;
const BURNOUT_ALTITUDE: f64 = 60.0;
const APOGEE: f64 = 300.0;

/// Exact vertical coast under gravity and quadratic drag, reaching `APOGEE`.
struct Coast {
    theta0: f64,
    omega: f64,
    terminal: f64,
}

impl Coast {
    fn new() -> Self {
        let v0 = (((2.0 * K * (APOGEE - BURNOUT_ALTITUDE)).exp() - 1.0) * G / K).sqrt();
        let terminal = (G / K).sqrt();
        Self {
            theta0: (v0 / terminal).atan(),
            omega: (G * K).sqrt(),
            terminal,
        }
    }

    /// (altitude, velocity, acceleration) at `t` s after burnout
    fn at(&self, t: f64) -> (f64, f64, f64) {
        let theta = self.theta0 - self.omega * t;
        let v = self.terminal * theta.tan();
        let h = BURNOUT_ALTITUDE + (theta.cos() / self.theta0.cos()).ln() / K;
        (h, v, -G - K * v * v)
    }
}

/// deterministic noise in [-1, 1]
struct Noise(u32);

impl Noise {
    fn next(&mut self) -> f32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        (self.0 as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

fn processed(t: f64, altitude: f32, velocity: f32, acceleration: Option<f32>) -> ProcessedSample {
    let mut invalid_fields = InvalidFields::empty();
    if acceleration.is_none() {
        invalid_fields.insert(SampleField::VerticalAcceleration);
    }
    ProcessedSample {
        timestamp_ns: (t * 1e9) as u64,
        current_altitude: altitude,
        vertical_velocity: velocity,
        vertical_acceleration: acceleration.unwrap_or(0.0),
        invalid_fields,
    }
}

#[test]
fn inactive_outside_coast() {
    let mut predictor = ApogeePredictor::new(PredictorConfig::default());
    for i in 0..50 {
        let sample = processed(i as f64 * 0.01, 10.0 + i as f32, 50.0, Some(-G as f32));
        assert!(predictor.update(FlightPhase::MotorBurn, &sample).is_none());
    }
    assert_eq!(predictor.samples_in_window(), 0);
}

#[test]
fn converges_on_noisy_drag_coast() {
    init_logger();

    let coast = Coast::new();
    let mut noise = Noise(0x1234_5678);
    let mut predictor = ApogeePredictor::new(PredictorConfig::default());

    let mut errors = Vec::new();
    for tick in 0..=300 {
        let t = tick as f64 * 0.01;
        let (h, v, a) = coast.at(t);
        let sample = processed(
            t,
            h as f32 + 0.2 * noise.next(),
            v as f32 + 0.1 * noise.next(),
            Some(a as f32 + 0.5 * noise.next()),
        );
        let error = predictor
            .update(FlightPhase::Coast, &sample)
            .map(|p| (p.predicted_apogee - APOGEE as f32).abs());
        errors.push(error);
    }

    let mean = |range: core::ops::Range<usize>| {
        let len = range.len() as f32;
        range.map(|i| errors[i].unwrap()).sum::<f32>() / len
    };
    let early = mean(10..30);
    let late = mean(250..301);
    assert!(late < early, "late {} early {}", late, early);

    let prediction = predictor.prediction().unwrap();
    assert!(prediction.fit_valid);
    assert_eq!(prediction.model, FitModel::Drag);
    assert_relative_eq!(prediction.predicted_apogee, APOGEE as f32, max_relative = 0.02);
    assert!(prediction.uncertainty_threshold_1 < 5.0);
    assert_relative_eq!(
        prediction.uncertainty_threshold_2,
        2.0 * prediction.uncertainty_threshold_1
    );
    assert_relative_eq!(prediction.coefficients[0], G as f32, max_relative = 0.1);
    assert_eq!(prediction.samples_used, 100);
}

#[test]
fn falls_back_to_quadratic_without_acceleration() {
    init_logger();

    let mut predictor = ApogeePredictor::new(PredictorConfig::default());
    // h = 50 + 40 t - g/2 t^2, apogee 50 + 40^2 / 2g
    for tick in 0..100 {
        let t = tick as f64 * 0.01;
        let h = 50.0 + 40.0 * t - 0.5 * G * t * t;
        let v = 40.0 - G * t;
        predictor.update(FlightPhase::Coast, &processed(t, h as f32, v as f32, None));
    }

    let prediction = predictor.prediction().unwrap();
    assert_eq!(prediction.model, FitModel::Quadratic);
    assert!(prediction.fit_valid);
    assert_relative_eq!(
        prediction.predicted_apogee,
        (50.0 + 1600.0 / (2.0 * G)) as f32,
        max_relative = 1e-3
    );
}

#[test]
fn degenerate_fit_holds_previous_prediction() {
    init_logger();

    let config = PredictorConfig {
        window: 10,
        min_samples: 10,
    };
    let mut predictor = ApogeePredictor::new(config);

    let mut t = 0.0;
    for _ in 0..20 {
        let h = 50.0 + 40.0 * t - 0.5 * G * t * t;
        let v = 40.0 - G * t;
        predictor.update(
            FlightPhase::Coast,
            &processed(t, h as f32, v as f32, Some(-G as f32)),
        );
        t += 0.01;
    }
    let held = predictor.prediction().unwrap().clone();
    assert!(held.fit_valid);

    // constant velocity with a convex altitude: neither model can be fitted
    let start = t;
    for _ in 0..20 {
        let dt = t - start;
        let h = 100.0 + dt * dt;
        predictor.update(FlightPhase::Coast, &processed(t, h as f32, 5.0, Some(-5.0)));
        t += 0.01;
    }

    let degenerate = predictor.prediction().unwrap().clone();
    assert!(!degenerate.fit_valid);
    assert!(predictor.degenerate_count() > 0);
    assert_eq!(predictor.last_degenerate(), Some(Degenerate::NonPhysical));

    // still degenerate: the value does not move
    let h = 100.0 + (t - start) * (t - start);
    predictor.update(FlightPhase::Coast, &processed(t, h as f32, 5.0, Some(-5.0)));
    t += 0.01;
    assert_eq!(predictor.prediction(), Some(&degenerate));

    // non-finite input never reaches the window
    let before = predictor.samples_in_window();
    predictor.update(
        FlightPhase::Coast,
        &processed(t, f32::INFINITY, f32::NAN, Some(-G as f32)),
    );
    assert_eq!(predictor.samples_in_window(), before);
    assert!(predictor.prediction().unwrap().predicted_apogee.is_finite());
}

#[test]
fn held_after_coast_and_window_reset_on_entry() {
    let coast = Coast::new();
    let mut predictor = ApogeePredictor::new(PredictorConfig::default());

    for tick in 0..50 {
        let t = tick as f64 * 0.01;
        let (h, v, a) = coast.at(t);
        predictor.update(
            FlightPhase::Coast,
            &processed(t, h as f32, v as f32, Some(a as f32)),
        );
    }
    let held = predictor.prediction().unwrap().clone();

    let late = processed(5.0, 10.0, -30.0, Some(0.0));
    assert_eq!(predictor.update(FlightPhase::Freefall, &late), Some(&held));
    assert_eq!(predictor.samples_in_window(), 50);

    predictor.update(FlightPhase::Coast, &processed(6.0, 290.0, 5.0, Some(-G as f32)));
    assert_eq!(predictor.samples_in_window(), 1);
}

#[test]
fn repeated_timestamp_is_not_counted_twice() {
    let mut predictor = ApogeePredictor::new(PredictorConfig::default());
    let sample = processed(1.0, 100.0, 30.0, Some(-12.0));
    predictor.update(FlightPhase::Coast, &sample);
    predictor.update(FlightPhase::Coast, &sample);
    assert_eq!(predictor.samples_in_window(), 1);
}

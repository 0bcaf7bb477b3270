use nalgebra::{Quaternion, Vector3};

use super::*;
use crate::{
    processor::SampleField,
    sample::{EstimatedSample, NS_PER_S},
    tests::init_logger,
};

const G: f64 = 9.80665;
const PAD_ASL: f32 = 250.0;
/// 1/m, coast drag
const K_COAST: f64 = 0.002;
/// 1/m, parachute drag, ~10 m/s terminal
const K_CHUTE: f64 = 0.098;
const DT: f64 = 0.01;

#[derive(Debug, Clone, Copy)]
struct TruthPoint {
    t: f64,
    altitude: f64,
    acceleration: f64,
}

/// Open loop vertical flight at 100 Hz: 1 s on the pad, 1.5 s burn, coast,
/// descent under canopy and 6 s on the ground.
fn fly() -> Vec<TruthPoint> {
    let (mut t, mut h, mut v) = (0.0f64, 0.0f64, 0.0f64);
    let mut landed_at = None;
    let mut points = Vec::new();

    let acceleration = |t: f64, v: f64| {
        if t < 1.0 {
            0.0
        } else if t < 2.5 {
            50.0
        } else if v > 0.0 {
            -G - K_COAST * v * v
        } else {
            -G + K_CHUTE * v * v
        }
    };

    loop {
        let a = if landed_at.is_some() {
            0.0
        } else {
            acceleration(t, v)
        };
        points.push(TruthPoint {
            t,
            altitude: h,
            acceleration: a,
        });

        if let Some(landed_at) = landed_at {
            if t - landed_at > 6.0 {
                return points;
            }
        } else {
            // midpoint step, 10 substeps per tick
            for _ in 0..10 {
                let step = DT / 10.0;
                let a1 = acceleration(t, v);
                let v_mid = v + a1 * step / 2.0;
                let a2 = acceleration(t, v_mid);
                h += v_mid * step;
                v += a2 * step;
            }
            if t > 3.0 && h <= 0.0 {
                h = 0.0;
                v = 0.0;
                landed_at = Some(t);
            }
        }
        t += DT;
    }
}

fn estimated(point: &TruthPoint) -> SensorSample {
    EstimatedSample {
        timestamp_ns: (point.t * NS_PER_S as f64) as u64,
        orientation: Quaternion::identity(),
        angular_velocity: Vector3::zeros(),
        compensated_acceleration: Vector3::new(0.0, 0.0, (point.acceleration + G) as f32),
        pressure_altitude: PAD_ASL + point.altitude as f32,
        filter_status: 0,
        attitude_uncertainty: Quaternion::new(0.0, 0.0, 0.0, 0.0),
    }
    .into()
}

#[derive(Default)]
struct MockActuator {
    writes: Vec<f32>,
    fail_writes: Vec<usize>,
}

impl AirbrakeActuator for MockActuator {
    type Error = ();

    fn set_extension(&mut self, extension: f32) -> Result<(), Self::Error> {
        let index = self.writes.len();
        self.writes.push(extension);
        if self.fail_writes.contains(&index) {
            Err(())
        } else {
            Ok(())
        }
    }
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.controller.target_apogee = 200.0;
    config
}

fn context() -> TickContext {
    TickContext {
        samples_fetched: 1,
        ..Default::default()
    }
}

fn run(
    pipeline: &mut FlightPipeline,
    actuator: &mut MockActuator,
    truth: &[TruthPoint],
    mut corrupt: impl FnMut(usize, &mut SensorSample),
) -> Vec<LogRow> {
    truth
        .iter()
        .enumerate()
        .map(|(i, point)| {
            let mut sample = estimated(point);
            corrupt(i, &mut sample);
            pipeline.tick(actuator, &[sample], &context()).row
        })
        .collect()
}

#[test]
fn full_flight_walks_every_phase() {
    init_logger();

    let truth = fly();
    let true_apogee = truth.iter().map(|p| p.altitude).fold(0.0, f64::max) as f32;
    let mut pipeline = FlightPipeline::new(config());
    let mut actuator = MockActuator::default();
    let rows = run(&mut pipeline, &mut actuator, &truth, |_, _| {});

    let mut phases = Vec::new();
    for row in &rows {
        if phases.last() != Some(&row.phase) {
            phases.push(row.phase);
        }
    }
    assert_eq!(phases, vec!['S', 'M', 'C', 'F', 'L']);
    assert_eq!(pipeline.phase(), FlightPhase::Landed);

    // launch within the debounce window of ignition at t = 1 s
    let launch = rows.iter().position(|r| r.phase == 'M').unwrap();
    assert!((100..=112).contains(&launch), "launch at {}", launch);

    let freefall = rows.iter().find(|r| r.phase == 'F').unwrap();
    assert!(
        (freefall.current_altitude - true_apogee).abs() < 10.0,
        "freefall at {} m, apogee {} m",
        freefall.current_altitude,
        true_apogee
    );

    for row in &rows {
        assert!((0.0..=1.0).contains(&row.extension));
        if row.phase != 'C' {
            assert_eq!(row.extension, 0.0, "tick {}", row.tick);
        }
    }
    // natural apogee is above the 200 m target
    assert!(rows.iter().any(|r| r.phase == 'C' && r.extension > 0.5));
    assert_eq!(actuator.writes.len(), rows.len());

    // diagnostics on the first row of each phase only
    for pair in rows.windows(2) {
        let changed = pair[0].phase != pair[1].phase;
        assert_eq!(pair[1].queue_depth.is_some(), changed, "tick {}", pair[1].tick);
    }

    let last = rows.last().unwrap();
    assert!(last.predicted_apogee.is_some());
    assert!(pipeline.processor().max_altitude() > 200.0);
}

#[test]
fn nan_altitude_in_coast_is_held() {
    init_logger();

    let truth = fly();
    let coast_tick = 400;
    let mut pipeline = FlightPipeline::new(config());
    let mut actuator = MockActuator::default();
    let rows = run(&mut pipeline, &mut actuator, &truth[..coast_tick + 5], |i, sample| {
        if i == coast_tick
            && let SensorSample::Estimated(estimated) = sample
        {
            estimated.pressure_altitude = f32::NAN;
        }
    });

    let before = &rows[coast_tick - 1];
    let bad = &rows[coast_tick];
    assert_eq!(before.phase, 'C');
    assert_eq!(bad.phase, 'C');
    assert!(bad.invalid_fields.contains(SampleField::Altitude));
    assert!(!bad.invalid_fields.contains(SampleField::VerticalVelocity));
    assert_eq!(bad.current_altitude, before.current_altitude);
    assert_eq!(bad.pressure_altitude.map(f32::is_nan), Some(true));
    assert!((0.0..=1.0).contains(&bad.extension));
    // the sample never reaches the fit, so the command repeats
    assert!(before.predicted_apogee.is_some());
    assert_eq!(bad.predicted_apogee, before.predicted_apogee);
    assert_eq!(bad.extension, before.extension);
    assert_eq!(bad.fail_safe, before.fail_safe);
    assert_eq!(actuator.writes[coast_tick], actuator.writes[coast_tick - 1]);

    let after = &rows[coast_tick + 1];
    assert!(after.invalid_fields.is_empty());
    assert!(after.current_altitude > bad.current_altitude);
}

#[test]
fn actuator_failure_retracts_and_is_recorded() {
    init_logger();

    let truth = fly();
    let failing_tick = 420;
    let mut pipeline = FlightPipeline::new(config());
    let mut actuator = MockActuator {
        fail_writes: vec![failing_tick],
        ..Default::default()
    };
    let rows = run(&mut pipeline, &mut actuator, &truth[..failing_tick + 5], |_, _| {});

    let failed = &rows[failing_tick];
    assert_eq!(failed.phase, 'C');
    assert!(failed.extension > 0.0);
    assert!(failed.actuator_fault);

    // next command retracts and succeeds, which clears the fault
    let retract = &rows[failing_tick + 1];
    assert_eq!(retract.extension, 0.0);
    assert_eq!(retract.fail_safe, Some("actuator_fault"));
    assert!(!retract.actuator_fault);
    assert_eq!(actuator.writes[failing_tick + 1], 0.0);

    let resumed = &rows[failing_tick + 2];
    assert!(resumed.extension > 0.0);
    assert_eq!(resumed.fail_safe, None);
}

#[test]
fn empty_ticks_keep_the_airbrakes_retracted() {
    let mut pipeline = FlightPipeline::new(config());
    let mut actuator = MockActuator::default();
    for _ in 0..20 {
        let output = pipeline.tick(&mut actuator, &[], &TickContext::default());
        assert_eq!(output.command.extension, 0.0);
        assert_eq!(output.snapshot.phase, FlightPhase::Standby);
        for field in SampleField::DERIVED {
            assert!(output.row.invalid_fields.contains(field));
        }
    }
    assert_eq!(pipeline.ticks(), 20);
}

#[test]
fn explicit_retract_reports_driver_errors() {
    let mut pipeline = FlightPipeline::new(config());
    let mut actuator = MockActuator {
        fail_writes: vec![0],
        ..Default::default()
    };
    assert!(pipeline.retract(&mut actuator).is_err());
    assert!(pipeline.controller().actuator_fault());
    assert!(pipeline.retract(&mut actuator).is_ok());
    assert!(!pipeline.controller().actuator_fault());
}

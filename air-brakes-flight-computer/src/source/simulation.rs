use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use air_brakes_flight_core::{EstimatedSample, RawSample, approximate_air_density, lerp};
use log::{debug, info};
use nalgebra::{Quaternion, Vector3};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{actuator::SharedExtension, queue::PacketQueue};

const G: f32 = 9.80665;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    pub pad_time_s: f32,
    /// m above sea level
    pub pad_altitude: f32,
    /// kg
    pub mass: f32,
    /// N
    pub thrust: f32,
    pub burn_time_s: f32,
    /// m^2
    pub reference_area: f32,
    /// drag coefficient at evenly spaced extensions from 0 to 1
    pub drag_coefficients: Vec<f32>,
    /// m^2, drag coefficient times area of the deployed parachute
    pub parachute_drag_area: f32,
    pub ground_time_s: f32,
    pub raw_rate_hz: u32,
    /// must divide `raw_rate_hz`
    pub estimated_rate_hz: u32,
    /// m, uniform
    pub altitude_noise: f32,
    /// m/s^2, uniform
    pub acceleration_noise: f32,
    /// 1 is real time, 2 runs the flight twice as fast
    pub time_scale: f32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            pad_time_s: 2.0,
            pad_altitude: 250.0,
            mass: 4.5,
            thrust: 300.0,
            burn_time_s: 1.4,
            reference_area: 0.01,
            drag_coefficients: vec![0.45, 0.6, 0.8, 1.05, 1.3],
            parachute_drag_area: 0.4,
            ground_time_s: 4.0,
            raw_rate_hz: 200,
            estimated_rate_hz: 100,
            altitude_noise: 0.05,
            acceleration_noise: 0.2,
            time_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlightState {
    pub t: f32,
    /// m above the pad
    pub altitude: f32,
    pub velocity: f32,
    pub acceleration: f32,
}

/// Vertical point-mass flight with extension dependent drag, integrated with
/// the midpoint method.
pub struct SimulatedFlight {
    config: SimulationConfig,
    state: FlightState,
    apogee: f32,
    landed_at: Option<f32>,
}

impl SimulatedFlight {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            state: FlightState::default(),
            apogee: 0.0,
            landed_at: None,
        }
    }

    pub fn state(&self) -> FlightState {
        self.state
    }

    pub fn apogee(&self) -> f32 {
        self.apogee
    }

    pub fn landed(&self) -> bool {
        self.landed_at.is_some()
    }

    /// Landed and the configured ground time has passed.
    pub fn finished(&self) -> bool {
        self.landed_at
            .is_some_and(|landed_at| self.state.t - landed_at >= self.config.ground_time_s)
    }

    fn burning(&self, t: f32) -> bool {
        let ignition = self.config.pad_time_s;
        t >= ignition && t < ignition + self.config.burn_time_s
    }

    fn acceleration(&self, t: f32, altitude: f32, velocity: f32, extension: f32) -> f32 {
        if t < self.config.pad_time_s {
            return 0.0;
        }

        let density = approximate_air_density(self.config.pad_altitude + altitude);
        let drag_area = if velocity >= 0.0 || self.burning(t) {
            let extension = if self.burning(t) { 0.0 } else { extension };
            lerp(extension.clamp(0.0, 1.0), &self.config.drag_coefficients)
                * self.config.reference_area
        } else {
            self.config.parachute_drag_area
        };
        let drag = 0.5 * density * drag_area * velocity * velocity / self.config.mass;

        let thrust = if self.burning(t) {
            self.config.thrust / self.config.mass
        } else {
            0.0
        };
        thrust - G - drag.copysign(velocity)
    }

    /// Advance by `dt` seconds with the airbrakes at `extension`.
    pub fn step(&mut self, dt: f32, extension: f32) -> FlightState {
        let FlightState {
            t,
            altitude,
            velocity,
            ..
        } = self.state;

        if self.landed_at.is_some() {
            self.state = FlightState {
                t: t + dt,
                altitude: 0.0,
                velocity: 0.0,
                acceleration: 0.0,
            };
            return self.state;
        }

        // RK2 (midpoint) integration
        let a1 = self.acceleration(t, altitude, velocity, extension);
        let mid_altitude = altitude + velocity * (0.5 * dt);
        let mid_velocity = velocity + a1 * (0.5 * dt);
        let a2 = self.acceleration(t + 0.5 * dt, mid_altitude, mid_velocity, extension);

        let mut next = FlightState {
            t: t + dt,
            altitude: altitude + mid_velocity * dt,
            velocity: velocity + a2 * dt,
            acceleration: a2,
        };

        if next.t < self.config.pad_time_s || (next.altitude <= 0.0 && next.velocity <= 0.0) {
            if self.apogee > 1.0 {
                info!("simulated touchdown at t={:.2}s", next.t);
                self.landed_at = Some(next.t);
            }
            next.altitude = 0.0;
            next.velocity = 0.0;
            next.acceleration = 0.0;
        }

        self.apogee = self.apogee.max(next.altitude);
        self.state = next;
        next
    }
}

/// Turns the true flight state into noisy IMU output.
pub struct SensorModel {
    rng: StdRng,
    pad_altitude: f32,
    altitude_noise: f32,
    acceleration_noise: f32,
}

impl SensorModel {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            pad_altitude: config.pad_altitude,
            altitude_noise: config.altitude_noise,
            acceleration_noise: config.acceleration_noise,
        }
    }

    fn noise(&mut self, amplitude: f32) -> f32 {
        if amplitude > 0.0 {
            self.rng.random_range(-amplitude..=amplitude)
        } else {
            0.0
        }
    }

    fn specific_force(&mut self, state: &FlightState) -> Vector3<f32> {
        Vector3::new(
            self.noise(self.acceleration_noise),
            self.noise(self.acceleration_noise),
            state.acceleration + G + self.noise(self.acceleration_noise),
        )
    }

    pub fn raw(&mut self, state: &FlightState, timestamp_ns: u64) -> RawSample {
        RawSample {
            timestamp_ns,
            acceleration: self.specific_force(state),
            angular_velocity: Vector3::new(
                self.noise(0.01),
                self.noise(0.01),
                self.noise(0.01),
            ),
            gps_time_of_week: None,
            gps_week: None,
            gps_correlation_flags: 0,
        }
    }

    pub fn estimated(&mut self, state: &FlightState, timestamp_ns: u64) -> EstimatedSample {
        // the onboard filter is quieter than the raw channel
        let acceleration_noise = self.acceleration_noise * 0.5;
        EstimatedSample {
            timestamp_ns,
            orientation: Quaternion::identity(),
            angular_velocity: Vector3::zeros(),
            compensated_acceleration: Vector3::new(
                0.0,
                0.0,
                state.acceleration + G + self.noise(acceleration_noise),
            ),
            pressure_altitude: self.pad_altitude
                + state.altitude
                + self.noise(self.altitude_noise),
            filter_status: 0,
            attitude_uncertainty: Quaternion::new(0.0, 0.001, 0.001, 0.001),
        }
    }
}

pub struct SimulationSummary {
    pub apogee: f32,
    pub samples: u64,
    pub flight_time_s: f32,
}

/// Fly the simulation on its own thread, pushing samples into `queue` at the
/// configured rates and reading the airbrake extension back from `extension`.
/// The queue is closed when the flight finishes or `cancel` fires.
pub fn spawn(
    config: SimulationConfig,
    queue: Arc<PacketQueue>,
    extension: SharedExtension,
    cancel: CancellationToken,
) -> JoinHandle<SimulationSummary> {
    thread::spawn(move || {
        let summary = run(&config, &queue, &extension, &cancel);
        queue.close();
        info!(
            "simulation finished, apogee {:.1} m after {:.1} s, {} samples",
            summary.apogee, summary.flight_time_s, summary.samples
        );
        summary
    })
}

fn run(
    config: &SimulationConfig,
    queue: &PacketQueue,
    extension: &SharedExtension,
    cancel: &CancellationToken,
) -> SimulationSummary {
    let raw_rate_hz = config.raw_rate_hz.max(1);
    let estimated_every = (raw_rate_hz / config.estimated_rate_hz.max(1)).max(1);
    let dt = 1.0 / raw_rate_hz as f32;
    let time_scale = if config.time_scale > 0.0 {
        config.time_scale
    } else {
        1.0
    };
    let period = Duration::from_secs_f32(dt / time_scale);

    let mut flight = SimulatedFlight::new(config.clone());
    let mut sensors = SensorModel::new(config);
    let mut samples = 0u64;
    let mut step = 0u32;
    let started = Instant::now();

    while !flight.finished() && !cancel.is_cancelled() {
        let state = flight.step(dt, extension.get());
        let timestamp_ns = (state.t as f64 * 1e9) as u64;

        queue.push(sensors.raw(&state, timestamp_ns).into());
        samples += 1;
        if step % estimated_every == 0 {
            queue.push(sensors.estimated(&state, timestamp_ns).into());
            samples += 1;
        }
        step += 1;

        let deadline = started + period * step;
        if let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            thread::sleep(remaining);
        }
    }

    if cancel.is_cancelled() {
        debug!("simulation cancelled at t={:.2}s", flight.state().t);
    }

    SimulationSummary {
        apogee: flight.apogee(),
        samples,
        flight_time_s: flight.state().t,
    }
}

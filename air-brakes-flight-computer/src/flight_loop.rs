use std::{fmt::Display, sync::Arc, time::Duration};

use air_brakes_flight_core::{AirbrakeActuator, FlightPhase, FlightPipeline, TickContext};
use log::{info, warn};
use tokio::{
    task,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    actuator::ActuatorHandle,
    config::LoopConfig,
    queue::PacketQueue,
    recorder::{CsvRecorder, RecorderError, SnapshotPublisher},
};

/// Fixed rate tick source on the monotonic clock.
///
/// A tick that finishes late does not sleep at all, the overrun is counted and
/// the schedule is re-anchored on the current time so the loop never tries to
/// catch up with a burst of ticks.
pub struct Scheduler {
    period: Duration,
    next: Instant,
    overruns: u32,
}

impl Scheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
            overruns: 0,
        }
    }

    pub async fn wait(&mut self) {
        let now = Instant::now();
        if now > self.next {
            self.overruns += 1;
            if self.overruns == 1 || self.overruns % 100 == 0 {
                warn!(
                    "control tick overran by {:?}, {} overruns so far",
                    now - self.next,
                    self.overruns
                );
            }
            self.next = now + self.period;
        } else {
            time::sleep_until(self.next).await;
            self.next += self.period;
        }
    }

    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    MaxDuration,
    Landed,
    /// the sample source closed the queue and everything was consumed
    SourceExhausted,
}

#[derive(Debug)]
pub struct LoopReport {
    pub stop: StopReason,
    pub ticks: u64,
    pub overruns: u32,
    pub final_phase: FlightPhase,
    pub max_altitude: f32,
    pub queue_dropped: u64,
    pub actuator_failures: u32,
    pub rows_written: u64,
}

pub struct FlightLoop<A: AirbrakeActuator> {
    config: LoopConfig,
    pipeline: FlightPipeline,
    actuator: ActuatorHandle<A>,
    queue: Arc<PacketQueue>,
    recorder: CsvRecorder,
    snapshots: SnapshotPublisher,
}

impl<A> FlightLoop<A>
where
    A: AirbrakeActuator,
    A::Error: Display,
{
    pub fn new(
        config: LoopConfig,
        pipeline: FlightPipeline,
        actuator: ActuatorHandle<A>,
        queue: Arc<PacketQueue>,
        recorder: CsvRecorder,
        snapshots: SnapshotPublisher,
    ) -> Self {
        Self {
            config,
            pipeline,
            actuator,
            queue,
            recorder,
            snapshots,
        }
    }

    /// Run until cancelled, out of time, landed or out of samples. The
    /// airbrakes are retracted and the log flushed before returning.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<LoopReport, RecorderError> {
        let started = Instant::now();
        let max_duration = self
            .config
            .max_duration_s
            .map(|seconds| Duration::from_secs_f32(seconds.max(0.0)));
        let linger = Duration::from_secs_f32(self.config.linger_after_landing_s.max(0.0));
        let mut scheduler = Scheduler::new(self.config.period());
        let mut previous_tick_cost = Duration::ZERO;
        let mut landed_at: Option<Instant> = None;

        info!("control loop running at {:?} per tick", scheduler.period());

        let stop = loop {
            let tick_started = Instant::now();
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if let Some(max_duration) = max_duration
                && tick_started - started >= max_duration
            {
                break StopReason::MaxDuration;
            }

            let mut samples = self.queue.drain(false).await;
            if samples.is_empty() && !self.queue.is_closed() {
                let budget = self.config.drain_budget().min(scheduler.period());
                samples = tokio::select! {
                    batch = self.queue.drain_within(budget) => batch,
                    _ = cancel.cancelled() => break StopReason::Cancelled,
                };
            }
            if samples.is_empty() && self.queue.is_closed() && self.queue.depth() == 0 {
                break StopReason::SourceExhausted;
            }

            let context = TickContext {
                samples_fetched: samples.len() as u32,
                queue: self.queue.metrics(),
                loop_overruns: scheduler.overruns(),
                previous_tick_cost_us: previous_tick_cost.as_micros() as u64,
            };
            let output = self.pipeline.tick(&mut self.actuator, &samples, &context);
            self.recorder.record(output.row);
            self.snapshots.publish(output.snapshot);

            if self.pipeline.phase() == FlightPhase::Landed {
                let landed_at = *landed_at.get_or_insert(tick_started);
                if tick_started - landed_at >= linger {
                    break StopReason::Landed;
                }
            }

            previous_tick_cost = tick_started.elapsed();
            tokio::select! {
                _ = scheduler.wait() => {}
                _ = cancel.cancelled() => break StopReason::Cancelled,
            }
        };

        info!("control loop stopping: {:?}", stop);
        if let Err(e) = self.pipeline.retract(&mut self.actuator) {
            warn!("failed to retract airbrakes at shutdown: {}", e);
        }

        let report = LoopReport {
            stop,
            ticks: self.pipeline.ticks(),
            overruns: scheduler.overruns(),
            final_phase: self.pipeline.phase(),
            max_altitude: self.pipeline.processor().max_altitude(),
            queue_dropped: self.queue.dropped(),
            actuator_failures: self.actuator.failures(),
            rows_written: 0,
        };

        let recorder = self.recorder;
        let rows_written = task::spawn_blocking(move || recorder.finish())
            .await
            .map_err(|_| RecorderError::WriterGone)??;

        Ok(LoopReport {
            rows_written,
            ..report
        })
    }
}

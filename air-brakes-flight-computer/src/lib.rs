pub mod actuator;
pub mod config;
pub mod flight_loop;
pub mod queue;
pub mod recorder;
pub mod source;

pub use actuator::{ActuatorError, ActuatorHandle, MockServo, ServoCalibration, SharedExtension};
pub use config::{FlightConfig, LoopConfig};
pub use flight_loop::{FlightLoop, LoopReport, Scheduler, StopReason};
pub use queue::{PacketQueue, QueueConfig};
pub use recorder::{CsvRecorder, RecorderConfig, RecorderError, SnapshotPublisher};

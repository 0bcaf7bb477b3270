//! Producers that feed the packet queue from their own threads.

pub mod replay;
pub mod simulation;

pub use replay::{Replay, ReplayError, ReplayPacing, ReplaySummary};
pub use simulation::{SimulatedFlight, SimulationConfig, SimulationSummary};

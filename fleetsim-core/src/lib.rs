//! Simulation engine: device state machine, worker pools, wave scheduling,
//! provisioning and fleet management.

pub mod context;
pub mod controller;
pub mod device;
pub mod generator;
pub mod pool;
pub mod provisioner;
pub mod simulator;

pub use context::{EngineContext, RunContext};
pub use controller::{FleetOutcome, SimulationController};
pub use device::{BusyGuard, Device, SimulatedModel};
pub use generator::DataGenerator;
pub use pool::{WorkHandler, WorkerPool};
pub use provisioner::{Provisioner, Registration};
pub use simulator::{partition, Simulator};

pub mod constants;
pub mod device_model;
pub mod schema;
pub mod settings;
pub mod simulation;
pub mod target;

use async_trait::async_trait;
use fleetsim_error::StorageResult;

pub use device_model::DeviceModel;
pub use schema::{CapabilitySchema, Command, Component, Property, Telemetry, ValueType};
pub use settings::Settings;
pub use simulation::{
    DisconnectBehavior, Simulation, SimulationDeviceConfig, SimulationStatus,
    SimulationTargetDevice, TelemetryFormat,
};
pub use target::SimulationTarget;

/// Key addressed object store used for every persisted record.
///
/// Values are opaque bytes; typed access is layered on top by the storage crate.
/// Implementations must be safe to share across worker tasks. Writes are
/// last-writer-wins and there is no transactional grouping between keys.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch a single value, `None` when the key is absent.
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// List every `(key, value)` whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Insert or overwrite a value.
    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Remove a value. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;
}

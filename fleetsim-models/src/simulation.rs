use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Lifecycle status of a simulation.
///
/// A run walks `Ready -> Starting -> Running -> Stopping -> Stopped`; the fleet
/// controller uses `Provisioning` and `Deleting` while it resizes the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationStatus {
    #[default]
    #[serde(alias = "created")]
    Ready,
    Starting,
    Running,
    Stopping,
    Stopped,
    Provisioning,
    Deleting,
}

impl SimulationStatus {
    /// Whether a simulator may be started from this status.
    #[inline]
    pub fn can_start(&self) -> bool {
        matches!(self, SimulationStatus::Ready | SimulationStatus::Stopped)
    }
}

impl fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SimulationStatus::Ready => "ready",
            SimulationStatus::Starting => "starting",
            SimulationStatus::Running => "running",
            SimulationStatus::Stopping => "stopping",
            SimulationStatus::Stopped => "stopped",
            SimulationStatus::Provisioning => "provisioning",
            SimulationStatus::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

/// What a device does with its connection after a telemetry batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectBehavior {
    #[default]
    Never,
    /// Disconnect right after every telemetry batch
    Telemetry,
}

/// Wire shape of telemetry payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryFormat {
    #[default]
    Default,
    /// Batched envelope with per-field timestamps and a sequence number
    Opcua,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Simulation {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub target_id: String,
    #[serde(default)]
    pub status: SimulationStatus,
    /// Number of wave groups the population is split into
    #[serde(default = "Simulation::default_wave_group_count")]
    pub wave_group_count: usize,
    /// Seconds between two wave groups of one cycle
    #[serde(default)]
    pub wave_group_interval: u64,
    #[serde(default = "Simulation::default_telemetry_batch_size")]
    pub telemetry_batch_size: usize,
    /// Seconds between telemetry cycles
    #[serde(default = "Simulation::default_telemetry_interval")]
    pub telemetry_interval: u64,
    /// Seconds between reported property cycles
    #[serde(default = "Simulation::default_reported_property_interval")]
    pub reported_property_interval: u64,
    #[serde(default)]
    pub disconnect_behavior: DisconnectBehavior,
    #[serde(default)]
    pub telemetry_format: TelemetryFormat,
    #[serde(default = "Utc::now")]
    pub last_updated_time: DateTime<Utc>,
}

impl Simulation {
    fn default_wave_group_count() -> usize {
        1
    }

    fn default_telemetry_batch_size() -> usize {
        1
    }

    fn default_telemetry_interval() -> u64 {
        60
    }

    fn default_reported_property_interval() -> u64 {
        300
    }

    #[inline]
    pub fn wave_group_interval(&self) -> Duration {
        Duration::from_secs(self.wave_group_interval)
    }

    #[inline]
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval)
    }

    #[inline]
    pub fn reported_property_interval(&self) -> Duration {
        Duration::from_secs(self.reported_property_interval)
    }

    /// Returns a copy carrying `status` and a fresh update time.
    pub fn with_status(&self, status: SimulationStatus) -> Self {
        Self {
            status,
            last_updated_time: Utc::now(),
            ..self.clone()
        }
    }
}

/// Requested population of one device model inside a simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationDeviceConfig {
    pub id: String,
    #[serde(default)]
    pub simulation_id: String,
    pub model_id: String,
    pub device_count: usize,
}

/// Cached connection string of a provisioned device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationTargetDevice {
    pub target_id: String,
    pub device_id: String,
    pub connection_string: String,
}

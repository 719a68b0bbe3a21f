//! Network clients for the cloud side of a simulation: the device MQTT
//! protocol, the provisioning service and the application management API.

pub mod dps;
pub mod management;
pub mod mqtt;
pub mod topics;

pub use dps::DpsClient;
pub use management::ManagementClient;
pub use mqtt::{MqttDeviceClient, MqttTransport};

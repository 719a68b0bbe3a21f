// Constants shared by the fleetsim crates

/// The default configuration file name, looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE_NAME: &str = "fleetsim.toml";

/// Environment variable prefix for configuration overrides (`FLEETSIM__SIMULATION__...`).
pub const ENV_PREFIX: &str = "FLEETSIM";

pub const SIMULATION_PREFIX: &str = "simulation-";
pub const DEVICE_MODEL_PREFIX: &str = "deviceModel-";
pub const TARGET_PREFIX: &str = "target-";
pub const TARGET_DEVICES_PREFIX: &str = "targetDevices-";
pub const DEVICE_CONFIG_PREFIX: &str = "deviceConfig-";

/// Version marker key inside a desired property document.
pub const TWIN_VERSION_KEY: &str = "$version";
/// Marker key tagging a property sub-document as a component.
pub const COMPONENT_MARKER_KEY: &str = "__t";
pub const COMPONENT_MARKER_VALUE: &str = "c";

#[inline]
pub fn simulation_key(id: &str) -> String {
    format!("{SIMULATION_PREFIX}{id}")
}

#[inline]
pub fn device_model_key(id: &str) -> String {
    format!("{DEVICE_MODEL_PREFIX}{id}")
}

#[inline]
pub fn target_key(id: &str) -> String {
    format!("{TARGET_PREFIX}{id}")
}

#[inline]
pub fn target_device_key(target_id: &str, device_id: &str) -> String {
    format!("{TARGET_DEVICES_PREFIX}{target_id}-{device_id}")
}

#[inline]
pub fn target_devices_prefix(target_id: &str) -> String {
    format!("{TARGET_DEVICES_PREFIX}{target_id}-")
}

#[inline]
pub fn device_config_key(sim_id: &str, config_id: &str) -> String {
    format!("{DEVICE_CONFIG_PREFIX}{sim_id}-{config_id}")
}

#[inline]
pub fn device_configs_prefix(sim_id: &str) -> String {
    format!("{DEVICE_CONFIG_PREFIX}{sim_id}-")
}

/// Deterministic identity of a simulated device.
///
/// The same `(simulation, target, config or model, ordinal)` tuple always yields
/// the same id, which lets a restarted run find its cached connection.
#[inline]
pub fn device_id(sim_id: &str, target_id: &str, scope_id: &str, ordinal: usize) -> String {
    format!("{sim_id}-{target_id}-{scope_id}-{ordinal}")
}

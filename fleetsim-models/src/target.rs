use serde::{Deserialize, Serialize};

/// Cloud application the simulated fleet is pointed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationTarget {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Host of the registration service, e.g. `global.azure-devices-provisioning.net`
    pub provisioning_url: String,
    pub id_scope: String,
    /// Base64 group enrollment key
    pub master_key: String,
    /// Host of the device management API
    #[serde(default)]
    pub app_url: String,
    #[serde(default)]
    pub app_token: String,
}

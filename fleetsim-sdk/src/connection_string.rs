use fleetsim_error::transport::TransportError;
use std::{fmt, str::FromStr};

/// Hub label used when the host name does not follow the cloud naming scheme.
pub const UNKNOWN_HUB: &str = "unknown";

const HUB_DOMAIN: &str = ".azure-devices.net";

/// Device connection descriptor `HostName={hub};DeviceId={id};SharedAccessKey={key}`.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub shared_access_key: String,
}

impl ConnectionString {
    pub fn new(
        host_name: impl Into<String>,
        device_id: impl Into<String>,
        shared_access_key: impl Into<String>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            shared_access_key: shared_access_key.into(),
        }
    }

    /// Short hub name used as a metrics label.
    pub fn hub_name(&self) -> &str {
        match self.host_name.find(HUB_DOMAIN) {
            Some(idx) if idx > 0 => &self.host_name[..idx],
            _ => UNKNOWN_HUB,
        }
    }
}

impl FromStr for ConnectionString {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut device_id = None;
        let mut key = None;
        for pair in s.split(';').filter(|p| !p.trim().is_empty()) {
            // keys are base64 and may end with '='
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                TransportError::InvalidConnectionString(format!("malformed segment `{pair}`"))
            })?;
            match name.trim().to_ascii_lowercase().as_str() {
                "hostname" => host_name = Some(value.trim().to_string()),
                "deviceid" => device_id = Some(value.trim().to_string()),
                "sharedaccesskey" => key = Some(value.trim().to_string()),
                _ => {}
            }
        }
        let require = |v: Option<String>, field: &str| {
            v.filter(|v| !v.is_empty()).ok_or_else(|| {
                TransportError::InvalidConnectionString(format!("missing {field}"))
            })
        };
        Ok(Self {
            host_name: require(host_name, "HostName")?,
            device_id: require(device_id, "DeviceId")?,
            shared_access_key: require(key, "SharedAccessKey")?,
        })
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HostName={};DeviceId={};SharedAccessKey={}",
            self.host_name, self.device_id, self.shared_access_key
        )
    }
}

// keep the key out of logs
impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

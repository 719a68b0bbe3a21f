use async_trait::async_trait;
use fleetsim_error::{FSError, FSResult};
use fleetsim_sdk::ManagementApi;
use fleetsim_utils::url_encoder::encode_url_component;
use reqwest::{header, Client};
use std::time::Duration;
use tracing::debug;

pub const MANAGEMENT_API_VERSION: &str = "1.0";

/// Application device management over HTTPS.
#[derive(Debug, Clone)]
pub struct ManagementClient {
    http: Client,
}

impl ManagementClient {
    pub fn new(timeout: Duration) -> FSResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FSError::InitializationError(e.to_string()))?;
        Ok(Self { http })
    }
}

pub(crate) fn device_url(app_url: &str, device_id: &str) -> String {
    format!(
        "https://{}/api/devices/{}?api-version={MANAGEMENT_API_VERSION}",
        app_url.trim_end_matches('/'),
        encode_url_component(device_id)
    )
}

#[async_trait]
impl ManagementApi for ManagementClient {
    async fn delete_device(&self, app_url: &str, app_token: &str, device_id: &str) -> FSResult<()> {
        let response = self
            .http
            .delete(device_url(app_url, device_id))
            .header(header::AUTHORIZATION, app_token)
            .send()
            .await
            .map_err(|e| FSError::Msg(e.to_string()))?;
        let status = response.status();
        debug!(device_id, status = status.as_u16(), "device delete answered");
        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else {
            Err(FSError::Msg(format!(
                "delete of device {device_id} failed with status {status}"
            )))
        }
    }
}

use async_trait::async_trait;
use fleetsim_error::FSResult;

/// Device management API of the target application.
#[async_trait]
pub trait ManagementApi: Send + Sync + 'static {
    /// Removes a device identity from the application.
    async fn delete_device(&self, app_url: &str, app_token: &str, device_id: &str) -> FSResult<()>;
}

use crate::ConnectionString;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetsim_error::TransportResult;
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::mpsc;

/// Twin property document (desired or reported).
pub type TwinDocument = Map<String, Value>;

/// Synchronous command handler: receives the invocation payload and returns the reply body.
pub type MethodHandler = Arc<dyn Fn(Value) -> TransportResult<Value> + Send + Sync>;

/// One telemetry message ready for transmission.
#[derive(Debug, Clone)]
pub struct TelemetryMessage {
    pub body: Vec<u8>,
    pub message_id: String,
    pub correlation_id: String,
    /// Back-dated creation time carried as a message property
    pub creation_time: DateTime<Utc>,
    pub content_type: String,
    pub content_encoding: String,
    pub properties: HashMap<String, String>,
    /// Number of telemetry values carried in the body
    pub data_point_count: usize,
}

/// Cloud-to-device message delivered on the asynchronous command channel.
#[derive(Debug, Clone)]
pub struct C2dMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub properties: HashMap<String, String>,
}

impl C2dMessage {
    /// Command name carried by the `method-name` property, if any.
    pub fn method_name(&self) -> Option<&str> {
        self.properties.get("method-name").map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub connection: ConnectionString,
    /// Model id announced on connect
    pub model_id: String,
    /// Bound on the connection handshake
    pub timeout: Duration,
}

/// Factory for device connections.
#[async_trait]
pub trait DeviceTransport: Send + Sync + 'static {
    /// Opens a connection and waits until the service accepted it.
    async fn connect(&self, params: ConnectParams) -> TransportResult<Arc<dyn DeviceClient>>;
}

/// A live device connection.
///
/// Methods never apply their own timeouts; callers bound each operation.
#[async_trait]
pub trait DeviceClient: Send + Sync + 'static {
    async fn send_event(&self, message: TelemetryMessage) -> TransportResult<()>;

    /// Patches the reported half of the device twin.
    async fn update_reported(&self, patch: TwinDocument) -> TransportResult<()>;

    /// Starts delivery of desired property pushes.
    async fn subscribe_desired(&self) -> TransportResult<mpsc::Receiver<TwinDocument>>;

    async fn unsubscribe_desired(&self) -> TransportResult<()>;

    async fn register_method(&self, name: &str, handler: MethodHandler) -> TransportResult<()>;

    async fn unregister_method(&self, name: &str) -> TransportResult<()>;

    async fn subscribe_c2d(&self) -> TransportResult<mpsc::Receiver<C2dMessage>>;

    async fn unsubscribe_c2d(&self) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;
}

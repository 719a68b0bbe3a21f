use crate::topics::{self, Topics};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use fleetsim_error::{transport::TransportError, TransportResult};
use fleetsim_sdk::{
    C2dMessage, ConnectParams, DeviceClient, DeviceTransport, MethodHandler, TelemetryMessage,
    TwinDocument,
};
use fleetsim_utils::sas::{create_sas_token, expiry_after};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet,
    Publish, QoS, Transport,
};
use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

/// Secure MQTT port of the hub
pub const MQTT_TLS_PORT: u16 = 8883;
const TOKEN_TTL: Duration = Duration::from_secs(3600);
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 64;
const DELIVERY_CAPACITY: usize = 32;
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// MQTT-over-TLS device transport speaking the hub's device protocol.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    port: u16,
    tls: bool,
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self {
            port: MQTT_TLS_PORT,
            tls: true,
        }
    }
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain TCP variant, used against local brokers.
    pub fn plaintext(port: u16) -> Self {
        Self { port, tls: false }
    }

    fn options(&self, params: &ConnectParams) -> TransportResult<MqttOptions> {
        let conn = &params.connection;
        let password = create_sas_token(
            &conn.shared_access_key,
            &format!("{}/devices/{}", conn.host_name, conn.device_id),
            None,
            expiry_after(TOKEN_TTL),
        )
        .map_err(|e| TransportError::Unauthorized(e.to_string()))?;

        let mut options = MqttOptions::new(conn.device_id.clone(), conn.host_name.clone(), self.port);
        options.set_credentials(
            Topics::user_name(&conn.host_name, &conn.device_id, &params.model_id),
            password,
        );
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if self.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        Ok(options)
    }
}

#[async_trait]
impl DeviceTransport for MqttTransport {
    #[instrument(skip_all, fields(device_id = %params.connection.device_id))]
    async fn connect(&self, params: ConnectParams) -> TransportResult<Arc<dyn DeviceClient>> {
        let options = self.options(&params)?;
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let handshake = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return match ack.code {
                            ConnectReturnCode::Success => Ok(()),
                            code => Err(map_refusal(code)),
                        };
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(map_connection_error(e)),
                }
            }
        };
        match tokio::time::timeout(params.timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::Timeout {
                    timeout_ms: params.timeout.as_millis() as u64,
                    operation: "connect".to_string(),
                })
            }
        }

        let shared = Arc::new(Shared::new(params.connection.device_id.clone()));
        client
            .subscribe(topics::TWIN_RESPONSE_SUB, QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::SubscriptionFailed {
                channel: "twin responses".to_string(),
                reason: e.to_string(),
            })?;

        tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            Arc::clone(&shared),
        ));
        debug!("device connected");

        Ok(Arc::new(MqttDeviceClient { client, shared }))
    }
}

/// State shared between a client handle and its event loop task.
struct Shared {
    device_id: String,
    pending_twin: DashMap<String, oneshot::Sender<u16>>,
    desired: ArcSwapOption<mpsc::Sender<TwinDocument>>,
    c2d: ArcSwapOption<mpsc::Sender<C2dMessage>>,
    methods: DashMap<String, MethodHandler>,
    methods_subscribed: AtomicBool,
    next_rid: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Shared {
    fn new(device_id: String) -> Self {
        Self {
            device_id,
            pending_twin: DashMap::new(),
            desired: ArcSwapOption::empty(),
            c2d: ArcSwapOption::empty(),
            methods: DashMap::new(),
            methods_subscribed: AtomicBool::new(false),
            next_rid: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::NotConnected)
        } else {
            Ok(())
        }
    }
}

/// Removes a pending twin request when its waiter goes away.
struct PendingGuard<'a> {
    shared: &'a Shared,
    rid: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending_twin.remove(&self.rid);
    }
}

async fn run_event_loop(mut event_loop: EventLoop, client: AsyncClient, shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            polled = event_loop.poll() => match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => route(&client, &shared, publish),
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    debug!(device_id = %shared.device_id, "server closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if !shared.cancel.is_cancelled() {
                        warn!(device_id = %shared.device_id, error = %e, "device connection lost");
                    }
                    break;
                }
            }
        }
    }
    shared.closed.store(true, Ordering::Release);
    // wake every waiter; dropping the senders resolves them as closed
    shared.pending_twin.clear();
    shared.desired.store(None);
    shared.c2d.store(None);
}

fn route(client: &AsyncClient, shared: &Shared, publish: Publish) {
    let topic = publish.topic.as_str();
    trace!(device_id = %shared.device_id, topic, "incoming publish");

    if let Some((status, rid)) = topics::parse_twin_response(topic) {
        if let Some((_, tx)) = shared.pending_twin.remove(&rid) {
            let _ = tx.send(status);
        }
        return;
    }

    if topic.starts_with(topics::TWIN_DESIRED_PREFIX) {
        let Some(tx) = shared.desired.load_full() else {
            return;
        };
        match serde_json::from_slice::<TwinDocument>(&publish.payload) {
            Ok(doc) => {
                if tx.try_send(doc).is_err() {
                    warn!(device_id = %shared.device_id, "desired property update dropped");
                }
            }
            Err(e) => warn!(device_id = %shared.device_id, error = %e, "malformed desired patch"),
        }
        return;
    }

    if let Some((name, rid)) = topics::parse_method_request(topic) {
        let (status, body) = match shared.methods.get(&name) {
            Some(handler) => {
                let payload = serde_json::from_slice::<Value>(&publish.payload).unwrap_or(Value::Null);
                match (handler.value())(payload) {
                    Ok(reply) => (200, reply),
                    Err(e) => (500, Value::String(e.to_string())),
                }
            }
            None => (404, Value::Null),
        };
        let body = serde_json::to_vec(&body).unwrap_or_default();
        if let Err(e) = client.try_publish(
            Topics::method_response(status, &rid),
            QoS::AtMostOnce,
            false,
            body,
        ) {
            warn!(device_id = %shared.device_id, method = %name, error = %e, "method response not sent");
        }
        return;
    }

    let c2d_prefix = Topics::c2d_prefix(&shared.device_id);
    if let Some(tail) = topic.strip_prefix(c2d_prefix.as_str()) {
        let Some(tx) = shared.c2d.load_full() else {
            return;
        };
        let message = C2dMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
            properties: topics::decode_properties(tail),
        };
        if tx.try_send(message).is_err() {
            warn!(device_id = %shared.device_id, "cloud-to-device message dropped");
        }
    }
}

fn map_refusal(code: ConnectReturnCode) -> TransportError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            TransportError::Unauthorized(format!("{code:?}"))
        }
        ConnectReturnCode::ServiceUnavailable => {
            TransportError::ServerUnavailable(format!("{code:?}"))
        }
        code => TransportError::Other(format!("connection refused: {code:?}")),
    }
}

fn map_connection_error(e: ConnectionError) -> TransportError {
    match e {
        ConnectionError::ConnectionRefused(code) => map_refusal(code),
        ConnectionError::Io(e) => TransportError::Network(e.to_string()),
        ConnectionError::Tls(e) => TransportError::Network(e.to_string()),
        ConnectionError::NetworkTimeout => TransportError::Network("network timeout".to_string()),
        other => TransportError::Other(other.to_string()),
    }
}

fn client_error(e: rumqttc::ClientError) -> TransportError {
    TransportError::ConnectionClosed(e.to_string())
}

/// Live MQTT device connection.
pub struct MqttDeviceClient {
    client: AsyncClient,
    shared: Arc<Shared>,
}

impl Drop for MqttDeviceClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl MqttDeviceClient {
    async fn subscribe(&self, topic: &str, channel: &str) -> TransportResult<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::SubscriptionFailed {
                channel: channel.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl DeviceClient for MqttDeviceClient {
    async fn send_event(&self, message: TelemetryMessage) -> TransportResult<()> {
        self.shared.ensure_open()?;
        let creation_time = message.creation_time.to_rfc3339();
        let mut properties: Vec<(&str, &str)> = vec![
            ("$.mid", message.message_id.as_str()),
            ("$.cid", message.correlation_id.as_str()),
            ("$.ct", message.content_type.as_str()),
            ("$.ce", message.content_encoding.as_str()),
            ("iothub-creation-time-utc", creation_time.as_str()),
        ];
        properties.extend(message.properties.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let topic = Topics::telemetry(&self.shared.device_id, &properties);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, message.body)
            .await
            .map_err(client_error)
    }

    async fn update_reported(&self, patch: TwinDocument) -> TransportResult<()> {
        self.shared.ensure_open()?;
        let rid = self.shared.next_rid.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_vec(&patch).map_err(|e| TransportError::Other(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let guard = PendingGuard {
            shared: &self.shared,
            rid: rid.to_string(),
        };
        self.shared.pending_twin.insert(guard.rid.clone(), tx);
        self.client
            .publish(Topics::twin_reported(rid), QoS::AtMostOnce, false, payload)
            .await
            .map_err(client_error)?;

        let status = rx
            .await
            .map_err(|_| TransportError::ConnectionClosed("twin response never arrived".into()))?;
        drop(guard);
        match status {
            200..=299 => Ok(()),
            429 => Err(TransportError::Throttled(format!("reported properties rid {rid}"))),
            401 | 403 => Err(TransportError::Unauthorized(format!("twin status {status}"))),
            503 => Err(TransportError::ServerUnavailable(format!("twin status {status}"))),
            _ => Err(TransportError::Other(format!("twin update failed with status {status}"))),
        }
    }

    async fn subscribe_desired(&self) -> TransportResult<mpsc::Receiver<TwinDocument>> {
        self.shared.ensure_open()?;
        let (tx, rx) = mpsc::channel(DELIVERY_CAPACITY);
        self.shared.desired.store(Some(Arc::new(tx)));
        if let Err(e) = self.subscribe(topics::TWIN_DESIRED_SUB, "desired properties").await {
            self.shared.desired.store(None);
            return Err(e);
        }
        Ok(rx)
    }

    async fn unsubscribe_desired(&self) -> TransportResult<()> {
        self.shared.desired.store(None);
        if self.shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.client
            .unsubscribe(topics::TWIN_DESIRED_SUB)
            .await
            .map_err(client_error)
    }

    async fn register_method(&self, name: &str, handler: MethodHandler) -> TransportResult<()> {
        self.shared.ensure_open()?;
        self.shared.methods.insert(name.to_string(), handler);
        if !self.shared.methods_subscribed.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.subscribe(topics::METHOD_REQUEST_SUB, "direct methods").await {
                self.shared.methods_subscribed.store(false, Ordering::Release);
                self.shared.methods.remove(name);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn unregister_method(&self, name: &str) -> TransportResult<()> {
        self.shared.methods.remove(name);
        if self.shared.methods.is_empty()
            && self.shared.methods_subscribed.swap(false, Ordering::AcqRel)
            && !self.shared.closed.load(Ordering::Acquire)
        {
            self.client
                .unsubscribe(topics::METHOD_REQUEST_SUB)
                .await
                .map_err(client_error)?;
        }
        Ok(())
    }

    async fn subscribe_c2d(&self) -> TransportResult<mpsc::Receiver<C2dMessage>> {
        self.shared.ensure_open()?;
        let (tx, rx) = mpsc::channel(DELIVERY_CAPACITY);
        self.shared.c2d.store(Some(Arc::new(tx)));
        let topic = Topics::c2d_sub(&self.shared.device_id);
        if let Err(e) = self.subscribe(&topic, "cloud-to-device").await {
            self.shared.c2d.store(None);
            return Err(e);
        }
        Ok(rx)
    }

    async fn unsubscribe_c2d(&self) -> TransportResult<()> {
        self.shared.c2d.store(None);
        if self.shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.client
            .unsubscribe(Topics::c2d_sub(&self.shared.device_id))
            .await
            .map_err(client_error)
    }

    async fn close(&self) -> TransportResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // the event loop has to flush the DISCONNECT before it is cancelled
        let result = self.client.disconnect().await.map_err(client_error);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.shared.cancel.cancel();
        result
    }
}

//! Runtime device: identity, connection handle and per-operation flags.

use crate::{
    context::{bounded, RunContext},
    generator::{batch_timestamps, property_ack, DataGenerator},
    provisioner::Registration,
};
use arc_swap::ArcSwapOption;
use chrono::Utc;
use fleetsim_error::{transport::TransportError, FSError, FSResult, TransportResult};
use fleetsim_models::{CapabilitySchema, DisconnectBehavior};
use fleetsim_sdk::{
    ConnectParams, ConnectionString, DeviceClient, ErrorKind, MethodHandler, MetricLabels,
    TelemetryMessage,
};
use futures::future::join_all;
use serde_json::json;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
        Arc,
    },
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const CONTENT_TYPE: &str = "application/json";
const CONTENT_ENCODING: &str = "utf-8";

/// A device model as seen by a running simulation.
#[derive(Debug)]
pub struct SimulatedModel {
    /// Id of the stored device model
    pub id: String,
    /// Model id announced to the service
    pub model_id: String,
    pub schema: CapabilitySchema,
    pub labels: MetricLabels,
}

/// Exclusive claim on one operation class of a device, released on drop.
pub struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    /// Claims `flag`, or returns `None` when another operation holds it.
    pub fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// A live connection and the token scoping its subscription tasks.
struct Link {
    client: Arc<dyn DeviceClient>,
    hub: String,
    cancel: CancellationToken,
}

pub struct Device {
    id: String,
    model: Arc<SimulatedModel>,
    generator: DataGenerator,
    connection_string: ArcSwapOption<String>,
    link: ArcSwapOption<Link>,
    connected: AtomicBool,
    connecting: AtomicBool,
    sending_telemetry: AtomicBool,
    sending_reported: AtomicBool,
    retry_count: AtomicU32,
    /// Unix millis of the last completed telemetry batch, 0 before the first
    last_telemetry_ms: AtomicI64,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("model", &self.model.id)
            .field("connected", &self.is_connected())
            .field("retry_count", &self.retry_count())
            .finish()
    }
}

impl Device {
    pub fn new(id: impl Into<String>, model: Arc<SimulatedModel>) -> Self {
        Self {
            id: id.into(),
            model,
            generator: DataGenerator::new(),
            connection_string: ArcSwapOption::empty(),
            link: ArcSwapOption::empty(),
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            sending_telemetry: AtomicBool::new(false),
            sending_reported: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            last_telemetry_ms: AtomicI64::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn model(&self) -> &Arc<SimulatedModel> {
        &self.model
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    #[inline]
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Acquire)
    }

    pub fn connection_string(&self) -> Option<String> {
        self.connection_string.load_full().map(|s| s.as_ref().clone())
    }

    pub fn last_telemetry_ms(&self) -> i64 {
        self.last_telemetry_ms.load(Ordering::Relaxed)
    }

    fn registration<'a>(&'a self, ctx: &'a RunContext) -> Registration<'a> {
        Registration {
            target: &ctx.target,
            device_id: &self.id,
            model_id: &self.model.model_id,
            labels: &self.model.labels,
        }
    }

    fn client(&self) -> FSResult<Arc<dyn DeviceClient>> {
        self.link
            .load_full()
            .map(|link| Arc::clone(&link.client))
            .ok_or(FSError::Transport(TransportError::NotConnected))
    }

    /// Sends one telemetry batch, connecting (and failing over) first when needed.
    pub async fn send_telemetry(&self, ctx: &RunContext) {
        let Some(_busy) = BusyGuard::try_acquire(&self.sending_telemetry) else {
            trace!(device_id = %self.id, "Telemetry already in flight, request skipped");
            ctx.metrics().telemetry_batch_skipped(&self.model.labels);
            return;
        };
        let batch_size = ctx.simulation.telemetry_batch_size;
        if batch_size == 0 {
            return;
        }

        let retries = self.retry_count();
        let failing_over = retries > 1;
        if failing_over {
            debug!(device_id = %self.id, retries, "Device might have moved, re-provisioning");
            self.disconnect(ctx).await;
            self.connection_string.store(None);
            if let Err(e) = ctx.engine.cache().invalidate(&ctx.target.id, &self.id).await {
                warn!(device_id = %self.id, error = %e, "Failed to invalidate cached connection");
            }
        }

        if !self.is_connected() {
            match self.establish(ctx).await {
                Ok(moved) => {
                    if moved || failing_over {
                        ctx.metrics().failover(&self.model.labels);
                    }
                }
                Err(e) => {
                    debug!(device_id = %self.id, error = %e, "Connect failed, telemetry request dropped");
                    return;
                }
            }
        }
        let client = match self.client() {
            Ok(client) => client,
            Err(_) => return,
        };

        let timestamps = batch_timestamps(
            Utc::now(),
            batch_size,
            ctx.simulation.telemetry_interval,
        );
        let mut messages = Vec::with_capacity(batch_size);
        for creation_time in timestamps {
            let generated = match self.generator.telemetry(
                &self.model.schema,
                ctx.simulation.telemetry_format,
                &self.id,
            ) {
                Ok(generated) => generated,
                Err(e) => {
                    warn!(device_id = %self.id, error = %e, "Failed to generate telemetry");
                    return;
                }
            };
            messages.push(TelemetryMessage {
                body: generated.body,
                message_id: uuid::Uuid::new_v4().to_string(),
                correlation_id: uuid::Uuid::new_v4().to_string(),
                creation_time,
                content_type: CONTENT_TYPE.to_string(),
                content_encoding: CONTENT_ENCODING.to_string(),
                properties: HashMap::new(),
                data_point_count: generated.data_point_count,
            });
        }

        let timeout = ctx.config().telemetry_timeout();
        let labels = &self.model.labels;
        let started = Instant::now();
        let sends = messages.into_iter().map(|message| {
            let client = Arc::clone(&client);
            async move {
                let bytes = message.body.len();
                let points = message.data_point_count;
                let sent_at = Instant::now();
                let result = bounded(timeout, "send telemetry", client.send_event(message)).await;
                (result, sent_at.elapsed(), bytes, points)
            }
        });
        for (result, latency, bytes, points) in join_all(sends).await {
            match result {
                Ok(()) => {
                    self.retry_count.store(0, Ordering::Release);
                    ctx.metrics()
                        .telemetry_message_success(labels, latency, bytes, points);
                }
                Err(e) => {
                    self.retry_count.fetch_add(1, Ordering::AcqRel);
                    debug!(device_id = %self.id, error = %e, "Telemetry message failed");
                    ctx.metrics()
                        .telemetry_message_failure(labels, ErrorKind::from_transport(&e));
                }
            }
        }
        ctx.metrics().telemetry_batch_success(labels, started.elapsed());
        self.last_telemetry_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        if ctx.simulation.disconnect_behavior == DisconnectBehavior::Telemetry {
            self.disconnect(ctx).await;
        }
    }

    /// Sends one reported property document.
    pub async fn send_reported_properties(&self, ctx: &RunContext) {
        let Some(_busy) = BusyGuard::try_acquire(&self.sending_reported) else {
            trace!(device_id = %self.id, "Reported properties already in flight, request skipped");
            ctx.metrics().reported_props_skipped(&self.model.labels);
            return;
        };
        if !self.is_connected() {
            if let Err(e) = self.connect(ctx).await {
                debug!(device_id = %self.id, error = %e, "Connect failed, reported properties dropped");
                return;
            }
        }
        let Ok(client) = self.client() else {
            return;
        };

        let document = self.generator.reported_properties(&self.model.schema);
        let started = Instant::now();
        let result = bounded(
            ctx.config().twin_update_timeout(),
            "update reported properties",
            client.update_reported(document),
        )
        .await;
        match result {
            Ok(()) => {
                self.retry_count.store(0, Ordering::Release);
                ctx.metrics()
                    .reported_props_success(&self.model.labels, started.elapsed());
            }
            Err(e) => {
                self.retry_count.fetch_add(1, Ordering::AcqRel);
                debug!(device_id = %self.id, error = %e, "Reported properties update failed");
                ctx.metrics()
                    .reported_props_failure(&self.model.labels, ErrorKind::from_transport(&e));
            }
        }
    }

    /// Opens the device connection, provisioning first when no connection string is known.
    ///
    /// A rejected or unreachable endpoint triggers one re-registration and
    /// reconnect. Subscriptions are part of the connect: if one fails the
    /// connection is closed again.
    pub async fn connect(&self, ctx: &RunContext) -> FSResult<()> {
        if self.establish(ctx).await? {
            ctx.metrics().failover(&self.model.labels);
        }
        Ok(())
    }

    /// Connects and reports whether the endpoint rejected the device and it was moved.
    async fn establish(&self, ctx: &RunContext) -> FSResult<bool> {
        if self.is_connected() {
            return Ok(false);
        }
        let Some(_connecting) = BusyGuard::try_acquire(&self.connecting) else {
            return Err(FSError::InvalidStateError(format!(
                "device {} is already connecting",
                self.id
            )));
        };

        let started = Instant::now();
        let connection = match self.connection_string.load_full() {
            Some(connection) => connection.as_ref().clone(),
            None => {
                let connection = ctx
                    .engine
                    .provisioner
                    .provision_cached(self.registration(ctx), &ctx.cancel)
                    .await?;
                self.connection_string.store(Some(Arc::new(connection.clone())));
                connection
            }
        };

        let ((client, hub), moved) = match self.open(ctx, &connection).await {
            Ok(opened) => (opened, false),
            Err(e) if e.indicates_failover() => {
                info!(device_id = %self.id, error = %e, "Endpoint rejected device, failing over");
                let connection = self.reprovision(ctx).await?;
                let opened = self.open(ctx, &connection).await.map_err(|e| {
                    ctx.metrics()
                        .connect_failure(&self.model.labels, ErrorKind::from_transport(&e));
                    e
                })?;
                (opened, true)
            }
            Err(e) => {
                ctx.metrics()
                    .connect_failure(&self.model.labels, ErrorKind::from_transport(&e));
                return Err(e.into());
            }
        };

        let link = Link {
            client,
            hub,
            cancel: ctx.cancel.child_token(),
        };
        if let Err(e) = self.subscribe(ctx, &link).await {
            link.cancel.cancel();
            let _ = bounded(ctx.config().command_timeout(), "close", link.client.close()).await;
            ctx.metrics()
                .connect_failure(&self.model.labels, ErrorKind::from_transport(&e));
            return Err(e.into());
        }

        ctx.metrics()
            .connect_latency(&self.model.labels, started.elapsed());
        ctx.metrics().device_connected(&self.model.labels, &link.hub);
        self.link.store(Some(Arc::new(link)));
        self.connected.store(true, Ordering::Release);
        debug!(device_id = %self.id, elapsed = ?started.elapsed(), "Device connected");
        Ok(moved)
    }

    async fn open(
        &self,
        ctx: &RunContext,
        connection: &str,
    ) -> TransportResult<(Arc<dyn DeviceClient>, String)> {
        let connection: ConnectionString = connection.parse()?;
        let hub = connection.hub_name().to_string();
        let timeout = ctx.config().connection_timeout();
        let params = ConnectParams {
            connection,
            model_id: self.model.model_id.clone(),
            timeout,
        };
        let client = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Err(TransportError::Other("simulation cancelled".to_string()))
            }
            client = bounded(timeout, "connect", ctx.engine.transport.connect(params)) => client?,
        };
        Ok((client, hub))
    }

    /// Registers again without the cache and stores the fresh connection string.
    async fn reprovision(&self, ctx: &RunContext) -> FSResult<String> {
        self.connection_string.store(None);
        let connection = ctx
            .engine
            .provisioner
            .provision(self.registration(ctx), &ctx.cancel)
            .await?;
        if let Err(e) = ctx
            .engine
            .cache()
            .set(&ctx.target.id, &self.id, &connection)
            .await
        {
            warn!(device_id = %self.id, error = %e, "Connection cache write failed");
        }
        self.connection_string.store(Some(Arc::new(connection.clone())));
        Ok(connection)
    }

    async fn subscribe(&self, ctx: &RunContext, link: &Link) -> TransportResult<()> {
        let config = ctx.config();
        let timeout = config.command_timeout();

        if config.enable_twin_update_acks {
            let mut desired = bounded(timeout, "subscribe desired", link.client.subscribe_desired()).await?;
            let client = Arc::clone(&link.client);
            let cancel = link.cancel.clone();
            let metrics = Arc::clone(&ctx.engine.metrics);
            let labels = self.model.labels.clone();
            let device_id = self.id.clone();
            let ack_timeout = config.twin_update_timeout();
            ctx.tracker.spawn(async move {
                loop {
                    let patch = tokio::select! {
                        _ = cancel.cancelled() => break,
                        patch = desired.recv() => match patch {
                            Some(patch) => patch,
                            None => break,
                        },
                    };
                    let ack = property_ack(&patch);
                    let started = Instant::now();
                    let result = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = bounded(ack_timeout, "twin update ack", client.update_reported(ack)) => result,
                    };
                    match result {
                        Ok(()) => metrics.twin_update_success(&labels, started.elapsed()),
                        Err(e) => {
                            debug!(device_id = %device_id, error = %e, "Twin update ack failed");
                            metrics.twin_update_failure(&labels, ErrorKind::from_transport(&e));
                        }
                    }
                }
            });
        }

        if config.enable_command_acks {
            for command in self.model.schema.commands().filter(|c| c.is_sync) {
                let metrics = Arc::clone(&ctx.engine.metrics);
                let labels = self.model.labels.clone();
                let handler: MethodHandler = Arc::new(move |_payload| {
                    metrics.command_success(&labels);
                    Ok(json!({}))
                });
                bounded(
                    timeout,
                    "register command",
                    link.client.register_method(&command.name, handler),
                )
                .await?;
            }

            if self.model.schema.has_async_commands() {
                let mut messages = bounded(timeout, "subscribe commands", link.client.subscribe_c2d()).await?;
                let cancel = link.cancel.clone();
                let metrics = Arc::clone(&ctx.engine.metrics);
                let labels = self.model.labels.clone();
                ctx.tracker.spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            message = messages.recv() => match message {
                                Some(message) => {
                                    trace!(command = ?message.method_name(), "Command received");
                                    metrics.command_success(&labels);
                                }
                                None => break,
                            },
                        }
                    }
                });
            }
        }
        Ok(())
    }

    /// Best-effort teardown; the connection string is kept for the next connect.
    pub async fn disconnect(&self, ctx: &RunContext) {
        let Some(link) = self.link.swap(None) else {
            self.connected.store(false, Ordering::Release);
            return;
        };
        link.cancel.cancel();

        let config = ctx.config();
        let timeout = config.command_timeout();
        if config.enable_twin_update_acks {
            if let Err(e) = bounded(timeout, "unsubscribe desired", link.client.unsubscribe_desired()).await {
                trace!(device_id = %self.id, error = %e, "Unsubscribe desired failed");
            }
        }
        if config.enable_command_acks {
            for command in self.model.schema.commands().filter(|c| c.is_sync) {
                if let Err(e) = bounded(
                    timeout,
                    "unregister command",
                    link.client.unregister_method(&command.name),
                )
                .await
                {
                    trace!(device_id = %self.id, error = %e, "Unregister command failed");
                }
            }
            if self.model.schema.has_async_commands() {
                if let Err(e) = bounded(timeout, "unsubscribe commands", link.client.unsubscribe_c2d()).await {
                    trace!(device_id = %self.id, error = %e, "Unsubscribe commands failed");
                }
            }
        }
        if let Err(e) = bounded(timeout, "close", link.client.close()).await {
            debug!(device_id = %self.id, error = %e, "Closing device connection failed");
        }

        if self.connected.swap(false, Ordering::AcqRel) {
            ctx.metrics().device_disconnected(&self.model.labels, &link.hub);
        }
    }
}

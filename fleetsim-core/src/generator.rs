//! Synthetic payloads derived from a capability schema.

use chrono::{DateTime, SecondsFormat, Utc};
use fleetsim_error::FSResult;
use fleetsim_models::{
    constants::{COMPONENT_MARKER_KEY, COMPONENT_MARKER_VALUE, TWIN_VERSION_KEY},
    CapabilitySchema, TelemetryFormat, ValueType,
};
use fleetsim_sdk::TwinDocument;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const STRING_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzACBDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const PUBLISHER_ID: &str = "fleetsim-opc-publisher";

/// Closed route the simulated geopoint telemetry walks along.
pub const GEOPOINT_ROUTE: [(f64, f64); 21] = [
    (47.645804, -122.132337),
    (47.644799, -122.132291),
    (47.643975, -122.132302),
    (47.642746, -122.132366),
    (47.641264, -122.132409),
    (47.639768, -122.132430),
    (47.637844, -122.132393),
    (47.635111, -122.132479),
    (47.633202, -122.132382),
    (47.633354, -122.131191),
    (47.634540, -122.129163),
    (47.636325, -122.126081),
    (47.638046, -122.123120),
    (47.641111, -122.119204),
    (47.644017, -122.115642),
    (47.645990, -122.114258),
    (47.646069, -122.117938),
    (47.646069, -122.120921),
    (47.646105, -122.125888),
    (47.646047, -122.129568),
    (47.646069, -122.132164),
];

/// One generated telemetry body.
#[derive(Debug, Clone)]
pub struct GeneratedTelemetry {
    pub body: Vec<u8>,
    pub data_point_count: usize,
}

/// Per-device value synthesizer.
///
/// The only state is the position on the geopoint route and the envelope
/// sequence number; both advance on every call.
#[derive(Debug, Default)]
pub struct DataGenerator {
    next_geopoint: AtomicUsize,
    sequence: AtomicU64,
}

impl DataGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Builds one telemetry body in the requested wire shape.
    pub fn telemetry(
        &self,
        schema: &CapabilitySchema,
        format: TelemetryFormat,
        device_id: &str,
    ) -> FSResult<GeneratedTelemetry> {
        let mut values = Map::new();
        for field in schema.telemetry() {
            if let Some(value) = self.value(field.value_type) {
                values.insert(field.name.clone(), value);
            }
        }
        let data_point_count = values.len();

        let document = match format {
            TelemetryFormat::Default => Value::Object(values),
            TelemetryFormat::Opcua => self.opcua_envelope(device_id, values),
        };
        Ok(GeneratedTelemetry {
            body: serde_json::to_vec(&document)?,
            data_point_count,
        })
    }

    fn opcua_envelope(&self, device_id: &str, values: Map<String, Value>) -> Value {
        let now = now_rfc3339();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        let mut payload = Map::new();
        for value in values.values() {
            let node_id = format!("nsu={};s={}", random_string(20), random_string(20));
            payload.insert(
                node_id,
                json!({
                    "ServerTimestamp": now,
                    "SourceTimestamp": now,
                    "StatusCode": null,
                    "Value": value,
                }),
            );
        }

        let mut envelope = Map::new();
        envelope.insert("DataSetClassId".into(), Value::Null);
        envelope.insert("DataSetWriterGroup".into(), json!(device_id));
        envelope.insert("EventId".into(), json!(uuid::Uuid::new_v4().to_string()));
        envelope.insert("MessageId".into(), json!(random_string(5)));
        envelope.insert("MessageType".into(), json!("ua-data"));
        envelope.insert("PublisherId".into(), json!(PUBLISHER_ID));
        envelope.insert(
            "Messages".into(),
            json!([{
                "DataSetWriterId": format!("{device_id}-{}", uuid::Uuid::new_v4()),
                "MetaDataVersion": { "MajorVersion": 1, "MinorVersion": 0 },
                "SequenceNumber": sequence,
                "Status": null,
                "Timestamp": now,
                "Payload": payload,
            }]),
        );
        // flat values ride along at the top level
        envelope.extend(values);
        Value::Object(envelope)
    }

    /// One random value for every read-only property of the model.
    pub fn reported_properties(&self, schema: &CapabilitySchema) -> TwinDocument {
        schema
            .properties()
            .filter(|p| !p.writable)
            .filter_map(|p| self.value(p.value_type).map(|v| (p.name.clone(), v)))
            .collect()
    }

    /// Random value of `value_type`, `None` for schemas without a synthesizer.
    pub fn value(&self, value_type: ValueType) -> Option<Value> {
        let mut rng = rand::thread_rng();
        let value = match value_type {
            ValueType::Boolean => json!(rng.gen_bool(0.5)),
            ValueType::Date => json!(Utc::now().format("%Y-%m-%d").to_string()),
            ValueType::DateTime | ValueType::Time => json!(now_rfc3339()),
            ValueType::Double => json!(rng.gen::<f64>() * 100.0),
            ValueType::Float => json!(rng.gen::<f32>() * 100.0),
            ValueType::Duration => json!(format!(
                "P0Y0M0DT{}H{}M{}S",
                rng.gen_range(0..12),
                rng.gen_range(0..60),
                rng.gen_range(0..60)
            )),
            ValueType::Integer => json!(rng.gen_range(0..100)),
            ValueType::Long => json!(rng.gen_range(0..1000i64)),
            ValueType::String => json!(random_string(10)),
            ValueType::Geopoint => {
                let idx = self.next_geopoint.fetch_add(1, Ordering::Relaxed) % GEOPOINT_ROUTE.len();
                let (lat, lon) = GEOPOINT_ROUTE[idx];
                json!({ "lat": lat, "lon": lon, "alt": 0 })
            }
            ValueType::Unsupported => return None,
        };
        Some(value)
    }
}

/// Acknowledges every key of a desired property push.
///
/// Component sub-documents (tagged with `"__t": "c"`) get one acknowledgement
/// per inner key and keep their tag.
pub fn property_ack(desired: &TwinDocument) -> TwinDocument {
    let version = desired.get(TWIN_VERSION_KEY).cloned().unwrap_or(Value::Null);
    let ack = |value: &Value| {
        json!({
            "value": value,
            "ac": 200,
            "ad": "completed",
            "av": version,
        })
    };

    let mut reported = TwinDocument::new();
    for (key, value) in desired {
        if key == TWIN_VERSION_KEY {
            continue;
        }
        let entry = match value.as_object() {
            Some(inner) if inner.contains_key(COMPONENT_MARKER_KEY) => {
                let mut component = Map::new();
                component.insert(COMPONENT_MARKER_KEY.into(), json!(COMPONENT_MARKER_VALUE));
                for (inner_key, inner_value) in inner {
                    if inner_key != COMPONENT_MARKER_KEY {
                        component.insert(inner_key.clone(), ack(inner_value));
                    }
                }
                Value::Object(component)
            }
            _ => ack(value),
        };
        reported.insert(key.clone(), entry);
    }
    reported
}

/// Creation times of a batch, newest first, spread over one telemetry interval.
pub fn batch_timestamps(now: DateTime<Utc>, batch_size: usize, interval_secs: u64) -> Vec<DateTime<Utc>> {
    let step_ms = if batch_size > 1 {
        (interval_secs.saturating_sub(1) * 1000) / batch_size as u64
    } else {
        0
    };
    (0..batch_size)
        .map(|i| now - chrono::Duration::milliseconds((i as u64 * step_ms) as i64))
        .collect()
}

fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| STRING_ALPHABET[rng.gen_range(0..STRING_ALPHABET.len())] as char)
        .collect()
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

//! Device-side MQTT topics of the hub.
//!
//! Request ids (`$rid`) correlate twin patches and direct method calls with
//! their responses; message properties travel url-encoded in the topic tail.

use fleetsim_utils::url_encoder::encode_url_component;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;

pub const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
pub const TWIN_RESPONSE_SUB: &str = "$iothub/twin/res/#";
pub const TWIN_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
pub const TWIN_DESIRED_SUB: &str = "$iothub/twin/PATCH/properties/desired/#";
pub const TWIN_REPORTED_PREFIX: &str = "$iothub/twin/PATCH/properties/reported/";
pub const METHOD_REQUEST_PREFIX: &str = "$iothub/methods/POST/";
pub const METHOD_REQUEST_SUB: &str = "$iothub/methods/POST/#";
pub const METHOD_RESPONSE_PREFIX: &str = "$iothub/methods/res/";

/// API version announced in the MQTT user name
pub const API_VERSION: &str = "2021-04-12";

/// Topic builder for a single device
pub struct Topics;

impl Topics {
    pub fn telemetry(device_id: &str, properties: &[(&str, &str)]) -> String {
        let mut topic = format!("devices/{device_id}/messages/events/");
        topic.push_str(&encode_properties(properties));
        topic
    }

    pub fn c2d_prefix(device_id: &str) -> String {
        format!("devices/{device_id}/messages/devicebound/")
    }

    pub fn c2d_sub(device_id: &str) -> String {
        format!("devices/{device_id}/messages/devicebound/#")
    }

    pub fn twin_reported(rid: u64) -> String {
        format!("{TWIN_REPORTED_PREFIX}?$rid={rid}")
    }

    pub fn method_response(status: u16, rid: &str) -> String {
        format!("{METHOD_RESPONSE_PREFIX}{status}/?$rid={rid}")
    }

    pub fn user_name(host: &str, device_id: &str, model_id: &str) -> String {
        let mut user = format!("{host}/{device_id}/?api-version={API_VERSION}");
        if !model_id.is_empty() {
            user.push_str("&model-id=");
            user.push_str(&encode_url_component(model_id));
        }
        user
    }
}

/// `a=1&b=2` with each key and value url-encoded.
pub fn encode_properties(properties: &[(&str, &str)]) -> String {
    properties
        .iter()
        .map(|(k, v)| format!("{}={}", encode_url_component(k), encode_url_component(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Parses the url-encoded property bag at the end of a topic.
pub fn decode_properties(raw: &str) -> HashMap<String, String> {
    let raw = raw.trim_start_matches('?');
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (
                percent_decode_str(k).decode_utf8_lossy().into_owned(),
                percent_decode_str(v).decode_utf8_lossy().into_owned(),
            )
        })
        .collect()
}

/// `$iothub/twin/res/{status}/?$rid={rid}` -> (status, rid)
pub fn parse_twin_response(topic: &str) -> Option<(u16, String)> {
    let rest = topic.strip_prefix(TWIN_RESPONSE_PREFIX)?;
    let (status, query) = rest.split_once('/')?;
    let status = status.parse().ok()?;
    let rid = decode_properties(query).remove("$rid")?;
    Some((status, rid))
}

/// `$iothub/twin/PATCH/properties/desired/?$version={v}` -> version
pub fn parse_desired_version(topic: &str) -> Option<i64> {
    let rest = topic.strip_prefix(TWIN_DESIRED_PREFIX)?;
    decode_properties(rest).get("$version")?.parse().ok()
}

/// `$iothub/methods/POST/{name}/?$rid={rid}` -> (name, rid)
pub fn parse_method_request(topic: &str) -> Option<(String, String)> {
    let rest = topic.strip_prefix(METHOD_REQUEST_PREFIX)?;
    let (name, query) = rest.split_once('/')?;
    let rid = decode_properties(query).remove("$rid")?;
    Some((name.to_string(), rid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_topic() {
        let topic = Topics::telemetry(
            "dev-1",
            &[("$.ct", "application/json"), ("iothub-creation-time-utc", "2024-01-01T00:00:00Z")],
        );
        assert_eq!(
            topic,
            "devices/dev-1/messages/events/%24.ct=application%2Fjson&iothub-creation-time-utc=2024-01-01T00%3A00%3A00Z"
        );
    }

    #[test]
    fn test_twin_response() {
        assert_eq!(
            parse_twin_response("$iothub/twin/res/204/?$rid=7&$version=3"),
            Some((204, "7".to_string()))
        );
        assert_eq!(parse_twin_response("$iothub/twin/res/abc/?$rid=7"), None);
        assert_eq!(parse_twin_response("devices/x"), None);
    }

    #[test]
    fn test_method_request() {
        assert_eq!(
            parse_method_request("$iothub/methods/POST/reboot/?$rid=1a"),
            Some(("reboot".to_string(), "1a".to_string()))
        );
        assert_eq!(Topics::method_response(200, "1a"), "$iothub/methods/res/200/?$rid=1a");
    }

    #[test]
    fn test_desired_version() {
        assert_eq!(parse_desired_version("$iothub/twin/PATCH/properties/desired/?$version=12"), Some(12));
    }

    #[test]
    fn test_decode_properties() {
        let props = decode_properties("method-name=setLevel&%24.to=%2Fdevices%2Fd");
        assert_eq!(props.get("method-name").map(String::as_str), Some("setLevel"));
        assert_eq!(props.get("$.to").map(String::as_str), Some("/devices/d"));
    }

    #[test]
    fn test_user_name() {
        assert_eq!(
            Topics::user_name("h.azure-devices.net", "d", "dtmi:com:x;1"),
            "h.azure-devices.net/d/?api-version=2021-04-12&model-id=dtmi%3Acom%3Ax%3B1"
        );
    }
}

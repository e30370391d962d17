//! IoT hub MQTT topic conventions.
//!
//! Outgoing topics are built here, incoming ones are classified by `classify`.
//! Property bags and request ids travel as form-urlencoded query strings.

use std::collections::BTreeMap;

use url::form_urlencoded;

use crate::session::{EventMessage, SendOptions};

pub const METHODS_SUBSCRIBE: &str = "$iothub/methods/POST/#";
pub const TWIN_RESPONSES_SUBSCRIBE: &str = "$iothub/twin/res/#";
pub const TWIN_DESIRED_SUBSCRIBE: &str = "$iothub/twin/PATCH/properties/desired/#";

const METHODS_PREFIX: &str = "$iothub/methods/POST/";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const TWIN_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

/// Classification of an incoming publish.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming<'a> {
    /// Cloud-to-device message; carries the raw property bag.
    CloudToDevice(&'a str),
    /// Direct method call.
    Method { name: &'a str, rid: String },
    /// Answer to a twin GET / PATCH request.
    TwinResponse(TwinResponse),
    /// Desired properties patch.
    DesiredUpdate,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwinResponse {
    pub status: u16,
    pub rid: String,
    pub version: Option<i64>,
}

fn encode(s: &str) -> String {
    form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn query(s: &str) -> BTreeMap<String, String> {
    form_urlencoded::parse(s.as_bytes()).into_owned().collect()
}

/// `devices/<id>/messages/events/<property bag>`
pub fn events(device_id: &str, opts: &SendOptions) -> String {
    let mut pairs: Vec<String> = opts
        .properties
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect();
    // System properties keep their literal `$.` prefix.
    if !opts.message_id.is_empty() {
        pairs.push(format!("$.mid={}", encode(&opts.message_id)));
    }
    if !opts.correlation_id.is_empty() {
        pairs.push(format!("$.cid={}", encode(&opts.correlation_id)));
    }
    format!("devices/{device_id}/messages/events/{}", pairs.join("&"))
}

pub fn cloud_to_device_subscribe(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

pub fn method_response(status: u16, rid: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={}", encode(rid))
}

pub fn twin_get(rid: &str) -> String {
    format!("$iothub/twin/GET/?$rid={}", encode(rid))
}

pub fn twin_patch_reported(rid: &str) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={}", encode(rid))
}

/// Split `<head>/?<query>` (the `/` before `?` is optional).
fn split_query(rest: &str) -> (&str, &str) {
    match rest.split_once('?') {
        Some((head, q)) => (head.trim_end_matches('/'), q),
        None => (rest.trim_end_matches('/'), ""),
    }
}

pub fn classify<'a>(device_id: &str, topic: &'a str) -> Incoming<'a> {
    let c2d_prefix = format!("devices/{device_id}/messages/devicebound/");
    if let Some(props) = topic.strip_prefix(c2d_prefix.as_str()) {
        return Incoming::CloudToDevice(props);
    }
    if let Some(rest) = topic.strip_prefix(METHODS_PREFIX) {
        let (name, q) = split_query(rest);
        return match query(q).remove("$rid") {
            Some(rid) if !name.is_empty() => Incoming::Method { name, rid },
            _ => Incoming::Unknown,
        };
    }
    if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
        let (status, q) = split_query(rest);
        let mut q = query(q);
        return match (status.parse::<u16>(), q.remove("$rid")) {
            (Ok(status), Some(rid)) => Incoming::TwinResponse(TwinResponse {
                status,
                rid,
                version: q.get("$version").and_then(|v| v.parse().ok()),
            }),
            _ => Incoming::Unknown,
        };
    }
    if topic.starts_with(TWIN_DESIRED_PREFIX) {
        return Incoming::DesiredUpdate;
    }
    Incoming::Unknown
}

/// Build a cloud-to-device message from its property bag and body.
pub fn decode_cloud_to_device(props: &str, payload: &[u8]) -> EventMessage {
    let mut msg = EventMessage {
        payload: String::from_utf8_lossy(payload).into_owned(),
        ..EventMessage::default()
    };
    for (k, v) in form_urlencoded::parse(props.as_bytes()).into_owned() {
        match k.as_str() {
            "$.mid" => msg.message_id = v,
            "$.cid" => msg.correlation_id = v,
            "$.to" => msg.to = v,
            "$.uid" => msg.user_id = v,
            "$.exp" => msg.expiry_time = v,
            "$.ct" => msg.content_type = v,
            "$.ce" => msg.content_encoding = v,
            _ => {
                msg.properties.insert(k, v);
            }
        }
    }
    msg
}

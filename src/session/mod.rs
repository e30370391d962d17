//! Device session abstraction.
//!
//! A `Session` is one authenticated, connected device identity. Commands only talk to
//! it through the trait below; the concrete MQTT-backed implementation lives in
//! `mqtt`, the credential and transport plumbing in `auth` / `transport` / `bootstrap`.
//!
//! Payload model: method payloads and twin properties are a closed set of value kinds
//! (string, number, boolean, null, nested map). `Value::Null` doubles as the twin
//! delete marker.
//!
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

pub mod auth;
pub mod bootstrap;
pub mod mqtt;
mod subscription;
#[cfg(test)]
pub mod testing;
pub mod transport;

pub use subscription::{Subscription, SubscriptionSender, channel as subscription_channel};

/// Key/value document used for method payloads and twin state.
///
/// A `BTreeMap` keeps keys sorted, so encoding a payload is canonical.
pub type Payload = BTreeMap<String, Value>;

/// Twin state document (desired or reported side).
pub type TwinState = Payload;

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// JSON `null`; in a twin update it removes the key.
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Map(Payload),
}

impl Value {
    /// The value that deletes a key when submitted in a twin update.
    pub const fn delete_marker() -> Self {
        Value::Null
    }

    pub fn is_delete_marker(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

/// Delivery guarantee for device-to-cloud events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
}

/// Options attached to a device-to-cloud event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub properties: BTreeMap<String, String>,
    pub message_id: String,
    pub correlation_id: String,
    pub qos: QoS,
}

/// A cloud-to-device message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub message_id: String,
    pub correlation_id: String,
    pub to: String,
    pub user_id: String,
    pub expiry_time: String,
    pub content_type: String,
    pub content_encoding: String,
    pub payload: String,
    pub properties: BTreeMap<String, String>,
}

/// Error returned to the remote caller of a direct method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct InvocationError {
    message: String,
}

impl InvocationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Handler for one direct method. May be called concurrently for overlapping
/// invocations; every call must resolve to exactly one payload or error.
pub type MethodHandler =
    Arc<dyn Fn(Payload) -> BoxFuture<'static, Result<Payload, InvocationError>> + Send + Sync>;

/// Failures reported by a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid credentials: {0}")]
    Credentials(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("session closed")]
    Closed,

    #[error("mqtt client: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("request rejected with status {status}")]
    Rejected { status: u16 },

    #[error("request timed out")]
    Timeout,

    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("method {0:?} is already registered")]
    DuplicateMethod(String),
}

/// Operations available on a connected device session.
#[async_trait]
pub trait Session: Send + Sync {
    /// Send a device-to-cloud event.
    async fn send_event(&self, payload: Vec<u8>, opts: SendOptions) -> Result<(), SessionError>;

    /// Subscribe to cloud-to-device messages.
    async fn subscribe_events(&self) -> Result<Subscription<EventMessage>, SessionError>;

    /// Subscribe to desired twin state updates.
    async fn subscribe_twin_updates(&self) -> Result<Subscription<TwinState>, SessionError>;

    /// Register the handler for the named direct method.
    async fn register_method(&self, name: &str, handler: MethodHandler)
    -> Result<(), SessionError>;

    /// Fetch the current `(desired, reported)` twin state.
    async fn retrieve_twin_state(&self) -> Result<(TwinState, TwinState), SessionError>;

    /// Patch the reported twin state, returning the new version.
    async fn update_twin_state(&self, state: TwinState) -> Result<i64, SessionError>;

    /// Resolves once the session is gone for good, with the reason.
    async fn closed(&self) -> SessionError;
}

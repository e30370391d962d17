//! Transport selection.
//!
//! TransportKind::from_name -> { Mqtt | Amqp | Http }
//! TransportKind::build     -> Transport (implemented kinds only)
//!
//! The registry is a static table. Kinds that are recognized but not built yet fail
//! with `TransportNotImplemented`, unknown names with `UnsupportedTransport`.
//!
use std::fmt;
use std::path::PathBuf;

use super::auth::AuthMode;
use super::mqtt::MqttTransport;
use super::{Session, SessionError};
use crate::error::{Error, Result};

/// Transports known to the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Mqtt,
    Amqp,
    Http,
}

const REGISTRY: &[(&str, TransportKind)] = &[
    ("mqtt", TransportKind::Mqtt),
    ("amqp", TransportKind::Amqp),
    ("http", TransportKind::Http),
];

/// Settings shared by all transport constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// PEM bundle used to verify the hub's certificate.
    pub ca_file: PathBuf,
}

impl TransportKind {
    /// Exact-match lookup.
    pub fn from_name(name: &str) -> Result<Self> {
        REGISTRY
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| Error::UnsupportedTransport(name.to_string()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Mqtt => "mqtt",
            TransportKind::Amqp => "amqp",
            TransportKind::Http => "http",
        }
    }

    /// Construct the transport for this kind.
    pub fn build(self, opts: &TransportOptions) -> Result<Transport> {
        match self {
            TransportKind::Mqtt => Ok(Transport::Mqtt(MqttTransport::new(opts.ca_file.clone()))),
            TransportKind::Amqp | TransportKind::Http => Err(Error::TransportNotImplemented(self)),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A constructed transport, ready to open a session.
#[derive(Debug)]
pub enum Transport {
    Mqtt(MqttTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Mqtt(_) => TransportKind::Mqtt,
        }
    }

    /// Open and connect a session over this transport.
    pub async fn connect(self, auth: &AuthMode) -> Result<Box<dyn Session>, SessionError> {
        match self {
            Transport::Mqtt(t) => Ok(Box::new(t.connect(auth).await?)),
        }
    }
}

/// Resolve `name` against the registry and construct the transport.
pub fn select(name: &str, opts: &TransportOptions) -> Result<Transport> {
    TransportKind::from_name(name)?.build(opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> TransportOptions {
        TransportOptions {
            ca_file: PathBuf::from("/nonexistent/ca.pem"),
        }
    }

    #[test]
    fn mqtt_is_built() {
        let t = select("mqtt", &opts()).unwrap();
        assert_eq!(t.kind(), TransportKind::Mqtt);
    }

    #[test]
    fn unknown_names_are_named_in_error() {
        for name in ["ws", "MQTT", "", " mqtt"] {
            let err = select(name, &opts()).unwrap_err();
            assert!(matches!(err, Error::UnsupportedTransport(ref n) if n == name));
            assert!(err.to_string().contains(&format!("{name:?}")));
        }
    }

    #[test]
    fn recognized_but_unimplemented_is_distinct() {
        for name in ["amqp", "http"] {
            let err = select(name, &opts()).unwrap_err();
            assert!(matches!(err, Error::TransportNotImplemented(_)), "got {err:?}");
            assert!(err.to_string().contains("not implemented"));
            assert!(!err.to_string().contains("unsupported"));
        }
    }
}

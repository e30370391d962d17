//! Authentication mode resolution.
//!
//! resolve(inputs, connection_string) -> AuthMode { ConnectionString | X509 }
//!
//! X509 is chosen when both a certificate and a key path are given; otherwise the
//! connection string (environment only, never a flag) is required.
//!
use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Environment variable holding the device connection string.
pub const CONNECTION_STRING_ENV: &str = "DEVICE_CONNECTION_STRING";

/// Raw X509 inputs as collected from flags / config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthInputs {
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub device_id: Option<String>,
    pub hostname: Option<String>,
}

/// How the session authenticates. Fixed for the lifetime of the process.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    ConnectionString(String),
    X509 {
        device_id: String,
        hostname: String,
        cert_path: PathBuf,
        key_path: PathBuf,
    },
}

// Connection strings embed the shared access key.
impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::ConnectionString(_) => f.write_str("ConnectionString(<redacted>)"),
            AuthMode::X509 {
                device_id,
                hostname,
                cert_path,
                key_path,
            } => f
                .debug_struct("X509")
                .field("device_id", device_id)
                .field("hostname", hostname)
                .field("cert_path", cert_path)
                .field("key_path", key_path)
                .finish(),
        }
    }
}

fn non_empty(v: Option<&String>) -> Option<&str> {
    v.map(|s| s.trim()).filter(|s| !s.is_empty())
}

/// Pick the authentication mode from the X509 inputs and the connection string source.
pub fn resolve(inputs: &AuthInputs, connection_string: Option<&str>) -> Result<AuthMode> {
    let cert = non_empty(inputs.tls_cert.as_ref());
    let key = non_empty(inputs.tls_key.as_ref());

    match (cert, key) {
        (Some(cert), Some(key)) => {
            let hostname = non_empty(inputs.hostname.as_ref())
                .ok_or_else(|| Error::config("hostname is required for x509 authentication"))?;
            let device_id = non_empty(inputs.device_id.as_ref())
                .ok_or_else(|| Error::config("device-id is required for x509 authentication"))?;
            Ok(AuthMode::X509 {
                device_id: device_id.to_string(),
                hostname: hostname.to_string(),
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            })
        }
        (Some(_), None) => Err(Error::config(
            "tls-key is required when tls-cert is given for x509 authentication",
        )),
        (None, Some(_)) => Err(Error::config(
            "tls-cert is required when tls-key is given for x509 authentication",
        )),
        (None, None) => match connection_string.map(str::trim).filter(|s| !s.is_empty()) {
            Some(cs) => Ok(AuthMode::ConnectionString(cs.to_string())),
            None => Err(Error::config(format!("${CONNECTION_STRING_ENV} is empty"))),
        },
    }
}

/// `resolve` with the connection string read from `DEVICE_CONNECTION_STRING`.
pub fn resolve_from_env(inputs: &AuthInputs) -> Result<AuthMode> {
    let cs = std::env::var(CONNECTION_STRING_ENV).ok();
    resolve(inputs, cs.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x509(cert: &str, key: &str, id: &str, host: &str) -> AuthInputs {
        let opt = |s: &str| Some(s.to_string());
        AuthInputs {
            tls_cert: opt(cert),
            tls_key: opt(key),
            device_id: opt(id),
            hostname: opt(host),
        }
    }

    #[test]
    fn full_x509_inputs_select_x509() {
        let mode = resolve(&x509("c.pem", "k.pem", "dev", "hub.example"), None).unwrap();
        assert_eq!(
            mode,
            AuthMode::X509 {
                device_id: "dev".into(),
                hostname: "hub.example".into(),
                cert_path: "c.pem".into(),
                key_path: "k.pem".into(),
            }
        );
    }

    #[test]
    fn x509_ignores_connection_string() {
        let mode = resolve(&x509("c", "k", "d", "h"), Some("HostName=x")).unwrap();
        assert!(matches!(mode, AuthMode::X509 { .. }));
    }

    #[test]
    fn x509_missing_hostname_is_named() {
        let err = resolve(&x509("c", "k", "d", ""), None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("hostname"));
    }

    #[test]
    fn x509_missing_device_id_is_named() {
        let err = resolve(&x509("c", "k", "", "h"), None).unwrap_err();
        assert!(err.to_string().contains("device-id"));
    }

    #[test]
    fn half_x509_never_falls_back() {
        let cs = Some("HostName=h;DeviceId=d;SharedAccessKey=a2V5");
        let only_cert = AuthInputs {
            tls_cert: Some("c.pem".into()),
            ..Default::default()
        };
        let only_key = AuthInputs {
            tls_key: Some("k.pem".into()),
            ..Default::default()
        };
        for inputs in [only_cert, only_key] {
            let err = resolve(&inputs, cs).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "got {err:?}");
        }
    }

    #[test]
    fn connection_string_mode() {
        let mode = resolve(&AuthInputs::default(), Some("HostName=h;DeviceId=d")).unwrap();
        assert_eq!(mode, AuthMode::ConnectionString("HostName=h;DeviceId=d".into()));
    }

    #[test]
    fn empty_connection_string_rejected() {
        for cs in [None, Some(""), Some("   ")] {
            let err = resolve(&AuthInputs::default(), cs).unwrap_err();
            assert!(err.to_string().contains(CONNECTION_STRING_ENV));
        }
    }

    #[test]
    fn debug_redacts_connection_string() {
        let mode = AuthMode::ConnectionString("SharedAccessKey=secret".into());
        assert!(!format!("{mode:?}").contains("secret"));
    }
}
